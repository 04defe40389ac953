//! Unit ownership: atomic claim, renewal heartbeat, and release.
//!
//! The claim record is the only coordination mechanism between workers, so a
//! failed renewal is a hard stop for the unit: the heartbeat trips the unit's
//! `lost` token and every consumer of that token stops pulling work.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::errors::{WorkerError, WorkerResult};
use crate::models::{ClaimRecord, ClaimStatus, UnitId};
use crate::store::DbHandle;

#[derive(Debug, Clone)]
pub enum ClaimOutcome {
    Claimed(ClaimRecord),
    AlreadyOwned { owner: String },
}

/// Tracking store for claim records. Every write is conditional on ownership.
#[async_trait]
pub trait ClaimStore: Send + Sync {
    async fn try_claim(&self, unit: &UnitId, worker_id: &str) -> Result<ClaimOutcome>;
    async fn renew(&self, unit: &UnitId, worker_id: &str) -> Result<bool>;
    async fn mark(&self, unit: &UnitId, worker_id: &str, status: ClaimStatus) -> Result<bool>;
    async fn release(&self, unit: &UnitId, worker_id: &str) -> Result<bool>;
    async fn reap_stale(&self, older_than: Duration) -> Result<usize>;
}

#[async_trait]
impl ClaimStore for DbHandle {
    async fn try_claim(&self, unit: &UnitId, worker_id: &str) -> Result<ClaimOutcome> {
        let (unit, worker_id) = (unit.clone(), worker_id.to_string());
        self.call(move |db| db.try_claim(&unit, &worker_id, Utc::now()))
            .await
    }

    async fn renew(&self, unit: &UnitId, worker_id: &str) -> Result<bool> {
        let (unit, worker_id) = (unit.clone(), worker_id.to_string());
        self.call(move |db| db.renew_claim(&unit, &worker_id, Utc::now()))
            .await
    }

    async fn mark(&self, unit: &UnitId, worker_id: &str, status: ClaimStatus) -> Result<bool> {
        let (unit, worker_id) = (unit.clone(), worker_id.to_string());
        self.call(move |db| db.mark_claim(&unit, &worker_id, status, Utc::now()))
            .await
    }

    async fn release(&self, unit: &UnitId, worker_id: &str) -> Result<bool> {
        let (unit, worker_id) = (unit.clone(), worker_id.to_string());
        self.call(move |db| db.release_claim(&unit, &worker_id))
            .await
    }

    async fn reap_stale(&self, older_than: Duration) -> Result<usize> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than)
                .map_err(|e| anyhow::anyhow!("Invalid reap age: {}", e))?;
        self.call(move |db| db.reap_stale_claims(cutoff)).await
    }
}

/// Claims, renews and releases units on behalf of one worker identity.
#[derive(Clone)]
pub struct ClaimCoordinator {
    store: Arc<dyn ClaimStore>,
    worker_id: String,
    renew_interval: Duration,
}

impl ClaimCoordinator {
    pub fn new(store: Arc<dyn ClaimStore>, worker_id: impl Into<String>, renew_interval: Duration) -> Self {
        Self {
            store,
            worker_id: worker_id.into(),
            renew_interval,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub async fn try_claim(&self, unit: &UnitId) -> WorkerResult<ClaimOutcome> {
        let outcome = self
            .store
            .try_claim(unit, &self.worker_id)
            .await
            .map_err(WorkerError::Store)?;
        match &outcome {
            ClaimOutcome::Claimed(_) => {
                info!(unit = %unit, worker_id = %self.worker_id, "Claimed unit");
            }
            ClaimOutcome::AlreadyOwned { owner } => {
                debug!(unit = %unit, owner = %owner, "Unit already owned");
            }
        }
        Ok(outcome)
    }

    /// Refresh the claim. A claim that no longer belongs to us is `ClaimLost`.
    pub async fn renew(&self, unit: &UnitId) -> WorkerResult<()> {
        let still_owned = self
            .store
            .renew(unit, &self.worker_id)
            .await
            .map_err(WorkerError::Store)?;
        if still_owned {
            Ok(())
        } else {
            Err(WorkerError::ClaimLost { unit: unit.clone() })
        }
    }

    /// Record activity and switch the claim between `active` and `idle`.
    pub async fn mark(&self, unit: &UnitId, status: ClaimStatus) -> WorkerResult<()> {
        let still_owned = self
            .store
            .mark(unit, &self.worker_id, status)
            .await
            .map_err(WorkerError::Store)?;
        if still_owned {
            Ok(())
        } else {
            Err(WorkerError::ClaimLost { unit: unit.clone() })
        }
    }

    /// Best-effort release. Failures are logged, never propagated.
    pub async fn release(&self, unit: &UnitId) {
        match self.store.release(unit, &self.worker_id).await {
            Ok(true) => info!(unit = %unit, "Released claim"),
            Ok(false) => warn!(unit = %unit, "Claim was already gone at release"),
            Err(e) => warn!(unit = %unit, error = %e, "Failed to release claim"),
        }
    }

    /// Start periodic renewal. `lost` is cancelled on the first failed renewal.
    pub fn start_heartbeat(&self, unit: UnitId, lost: CancellationToken, stop: CancellationToken) -> Heartbeat {
        let coordinator = self.clone();
        let interval = self.renew_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately; the claim was just written.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        match coordinator.renew(&unit).await {
                            Ok(()) => debug!(unit = %unit, "Renewed claim"),
                            Err(WorkerError::ClaimLost { .. }) => {
                                error!(unit = %unit, "Claim lost, halting unit");
                                lost.cancel();
                                break;
                            }
                            Err(e) => {
                                // A store we cannot reach cannot vouch for our ownership.
                                error!(unit = %unit, error = %e, "Claim renewal failed, halting unit");
                                lost.cancel();
                                break;
                            }
                        }
                    }
                }
            }
        });
        Heartbeat { handle }
    }
}

pub struct Heartbeat {
    handle: JoinHandle<()>,
}

impl Heartbeat {
    pub async fn stop(self) {
        self.handle.abort();
        let _ = self.handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::WorkerDb;
    use tempfile::tempdir;

    fn unit() -> UnitId {
        UnitId::new("proj-A", "user-1")
    }

    #[tokio::test]
    async fn test_concurrent_claims_exactly_one_wins() {
        let db = DbHandle::in_memory().unwrap();
        let mut handles = Vec::new();
        for i in 0..16 {
            let store: Arc<dyn ClaimStore> = Arc::new(db.clone());
            let coordinator =
                ClaimCoordinator::new(store, format!("worker-{}", i), Duration::from_secs(30));
            handles.push(tokio::spawn(async move {
                coordinator.try_claim(&unit()).await.unwrap()
            }));
        }
        let mut winners = 0;
        for h in handles {
            if matches!(h.await.unwrap(), ClaimOutcome::Claimed(_)) {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_concurrent_claims_across_connections() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("claims.db");
        // Create the schema once before racing.
        WorkerDb::new(&path).unwrap();

        let threads: Vec<_> = (0..8)
            .map(|i| {
                let path = path.clone();
                std::thread::spawn(move || {
                    let db = WorkerDb::new(&path).unwrap();
                    db.try_claim(&unit(), &format!("worker-{}", i), Utc::now())
                        .unwrap()
                })
            })
            .collect();
        let winners = threads
            .into_iter()
            .map(|t| t.join().unwrap())
            .filter(|o| matches!(o, ClaimOutcome::Claimed(_)))
            .count();
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_renew_after_takeover_is_claim_lost() {
        let db = DbHandle::in_memory().unwrap();
        let coordinator = ClaimCoordinator::new(Arc::new(db.clone()), "w1", Duration::from_secs(30));
        coordinator.try_claim(&unit()).await.unwrap();
        db.lock_sync().unwrap().force_release_claim(&unit()).unwrap();
        db.lock_sync()
            .unwrap()
            .try_claim(&unit(), "w2", Utc::now())
            .unwrap();
        let err = coordinator.renew(&unit()).await.unwrap_err();
        assert!(matches!(err, WorkerError::ClaimLost { .. }));
    }

    #[tokio::test]
    async fn test_heartbeat_trips_lost_token() {
        let db = DbHandle::in_memory().unwrap();
        let coordinator =
            ClaimCoordinator::new(Arc::new(db.clone()), "w1", Duration::from_millis(20));
        coordinator.try_claim(&unit()).await.unwrap();
        let lost = CancellationToken::new();
        let stop = CancellationToken::new();
        let heartbeat = coordinator.start_heartbeat(unit(), lost.clone(), stop.clone());

        db.lock_sync().unwrap().force_release_claim(&unit()).unwrap();
        tokio::time::timeout(Duration::from_secs(2), lost.cancelled())
            .await
            .expect("heartbeat should report the lost claim");
        heartbeat.stop().await;
    }

    #[tokio::test]
    async fn test_heartbeat_keeps_claim_alive() {
        let db = DbHandle::in_memory().unwrap();
        let coordinator =
            ClaimCoordinator::new(Arc::new(db.clone()), "w1", Duration::from_millis(10));
        coordinator.try_claim(&unit()).await.unwrap();
        let before = db.lock_sync().unwrap().get_claim(&unit()).unwrap().unwrap();
        let lost = CancellationToken::new();
        let stop = CancellationToken::new();
        let heartbeat = coordinator.start_heartbeat(unit(), lost.clone(), stop.clone());
        tokio::time::sleep(Duration::from_millis(60)).await;
        stop.cancel();
        heartbeat.stop().await;
        let after = db.lock_sync().unwrap().get_claim(&unit()).unwrap().unwrap();
        assert!(!lost.is_cancelled());
        assert!(after.last_activity > before.last_activity);
    }

    #[tokio::test]
    async fn test_release_then_mark_is_claim_lost() {
        let db = DbHandle::in_memory().unwrap();
        let coordinator = ClaimCoordinator::new(Arc::new(db), "w1", Duration::from_secs(30));
        coordinator.try_claim(&unit()).await.unwrap();
        coordinator.mark(&unit(), ClaimStatus::Idle).await.unwrap();
        coordinator.release(&unit()).await;
        assert!(coordinator.mark(&unit(), ClaimStatus::Active).await.is_err());
    }
}
