//! Work streams: the shared unclaimed-work stream, per-unit ordered message
//! streams, and the outbound result stream.
//!
//! The SQLite-backed implementation emulates long-polling by re-checking the
//! stream every `poll_interval` until the wait budget is spent.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::models::{ClaimRequest, ResultMessage, UnitId, WorkMessage};
use crate::store::DbHandle;

/// Name of a unit's private stream, carried as `queueRef` in claim requests.
pub fn unit_stream_ref(unit: &UnitId) -> String {
    format!("units/{}/{}", unit.project_id, unit.user_id)
}

/// A claim request handed to this worker.
#[derive(Debug, Clone)]
pub struct PendingClaimRequest {
    pub id: i64,
    pub request: ClaimRequest,
}

/// A message delivered from a unit's private stream, not yet acknowledged.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub id: i64,
    pub unit: UnitId,
    /// Delivery attempts so far, including this one.
    pub attempts: u32,
    pub message: WorkMessage,
}

#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Next request from the unclaimed-work stream, or `None` once `wait` elapses.
    async fn next_claim_request(
        &self,
        worker_id: &str,
        wait: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<PendingClaimRequest>>;

    async fn complete_claim_request(&self, id: i64) -> Result<()>;

    async fn return_claim_request(&self, id: i64) -> Result<()>;

    /// Next message of the unit in arrival order, or `None` once `wait` elapses.
    async fn receive(
        &self,
        unit: &UnitId,
        wait: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<Delivery>>;

    async fn ack(&self, delivery: &Delivery) -> Result<()>;

    async fn record_attempt(&self, delivery: &Delivery) -> Result<()>;

    async fn dead_letter(&self, delivery: &Delivery, error: &str) -> Result<()>;

    /// Put delivered-but-unacked messages of the unit back on its stream.
    async fn requeue_unacked(&self, unit: &UnitId) -> Result<usize>;

    async fn publish_result(&self, unit: &UnitId, result: &ResultMessage) -> Result<()>;

    /// Announce the unit again on the unclaimed-work stream if its stream still
    /// holds unfinished messages. Returns whether a request was issued.
    async fn reannounce_if_waiting(&self, unit: &UnitId) -> Result<bool>;
}

/// `WorkQueue` over the local SQLite store.
#[derive(Clone)]
pub struct SqliteQueue {
    db: DbHandle,
    poll_interval: Duration,
}

impl SqliteQueue {
    pub fn new(db: DbHandle, poll_interval: Duration) -> Self {
        Self { db, poll_interval }
    }

    /// Enqueue `message` on the unit's stream and announce the unit on the
    /// unclaimed-work stream. Returns the message id.
    pub async fn submit(&self, unit: &UnitId, message: &WorkMessage) -> Result<i64> {
        let request = ClaimRequest {
            project_id: unit.project_id.clone(),
            user_id: unit.user_id.clone(),
            thread_id: message.thread_id.clone(),
            queue_ref: unit_stream_ref(unit),
        };
        let (unit, message) = (unit.clone(), message.clone());
        self.db
            .call(move |db| {
                let id = db.submit_message(&unit, &message)?;
                db.submit_claim_request(&request)?;
                Ok(id)
            })
            .await
    }

    /// Poll `attempt` until it yields a value, `wait` elapses, or `cancel` fires.
    async fn long_poll<T, F, Fut>(
        &self,
        wait: Duration,
        cancel: &CancellationToken,
        mut attempt: F,
    ) -> Result<Option<T>>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<Option<T>>>,
    {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some(found) = attempt().await? {
                return Ok(Some(found));
            }
            let now = tokio::time::Instant::now();
            if now >= deadline || cancel.is_cancelled() {
                return Ok(None);
            }
            let nap = self.poll_interval.min(deadline - now);
            tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                _ = tokio::time::sleep(nap) => {}
            }
        }
    }
}

#[async_trait]
impl WorkQueue for SqliteQueue {
    async fn next_claim_request(
        &self,
        worker_id: &str,
        wait: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<PendingClaimRequest>> {
        let worker_id = worker_id.to_string();
        self.long_poll(wait, cancel, || {
            let (db, worker_id) = (self.db.clone(), worker_id.clone());
            async move { db.call(move |db| db.take_claim_request(&worker_id)).await }
        })
        .await
    }

    async fn complete_claim_request(&self, id: i64) -> Result<()> {
        self.db.call(move |db| db.complete_claim_request(id)).await
    }

    async fn return_claim_request(&self, id: i64) -> Result<()> {
        self.db.call(move |db| db.return_claim_request(id)).await
    }

    async fn receive(
        &self,
        unit: &UnitId,
        wait: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<Delivery>> {
        self.long_poll(wait, cancel, || {
            let (db, unit) = (self.db.clone(), unit.clone());
            async move { db.call(move |db| db.deliver_next_message(&unit)).await }
        })
        .await
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let id = delivery.id;
        self.db.call(move |db| db.ack_message(id)).await
    }

    async fn record_attempt(&self, delivery: &Delivery) -> Result<()> {
        let id = delivery.id;
        self.db.call(move |db| db.record_attempt(id)).await
    }

    async fn dead_letter(&self, delivery: &Delivery, error: &str) -> Result<()> {
        let (id, error) = (delivery.id, error.to_string());
        self.db
            .call(move |db| db.dead_letter_message(id, &error))
            .await
    }

    async fn requeue_unacked(&self, unit: &UnitId) -> Result<usize> {
        let unit = unit.clone();
        self.db.call(move |db| db.requeue_delivered(&unit)).await
    }

    async fn publish_result(&self, unit: &UnitId, result: &ResultMessage) -> Result<()> {
        let (unit, result) = (unit.clone(), result.clone());
        self.db
            .call(move |db| db.publish_result(&unit, &result).map(|_| ()))
            .await
    }

    async fn reannounce_if_waiting(&self, unit: &UnitId) -> Result<bool> {
        let unit = unit.clone();
        self.db
            .call(move |db| {
                let Some(thread_id) = db.oldest_unfinished_thread(&unit)? else {
                    return Ok(false);
                };
                db.submit_claim_request(&ClaimRequest {
                    project_id: unit.project_id.clone(),
                    user_id: unit.user_id.clone(),
                    thread_id,
                    queue_ref: unit_stream_ref(&unit),
                })?;
                Ok(true)
            })
            .await
    }
}
