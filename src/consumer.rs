//! Work-queue consumer: turns claim requests into per-unit sessions.
//!
//! The worker long-polls the shared unclaimed-work stream. Each request names
//! a unit; if the claim succeeds the unit gets its own session task (heartbeat
//! plus `UnitProcessor`) until it idles out, loses the claim, or the worker
//! shuts down.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::future::join_all;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::claim::{ClaimCoordinator, ClaimOutcome, ClaimStore};
use crate::config::WorkerConfig;
use crate::errors::WorkerError;
use crate::executor::{CommandExecutor, InstructionExecutor};
use crate::models::UnitId;
use crate::orchestrator::{
    BoundedRetry, Pipeline, PipelineDeps, ProcessorSettings, RetryPolicy, SessionEnd,
    UnitProcessor,
};
use crate::publish::{self, ArtifactPublisher};
use crate::queue::{PendingClaimRequest, SqliteQueue, WorkQueue};
use crate::site::SiteBuilder;
use crate::step::InterruptibleStep;
use crate::store::DbHandle;

const POLL_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// A spawned unit session. `generation` tells a finished session apart from
/// a newer one for the same unit. The task yields whether it released the claim.
struct RunningSession {
    generation: u64,
    handle: JoinHandle<bool>,
}

type Sessions = HashMap<UnitId, RunningSession>;

/// A worker process: one identity, many claimed units (up to `max_units`).
#[derive(Clone)]
pub struct Worker {
    config: WorkerConfig,
    db: DbHandle,
    queue: Arc<dyn WorkQueue>,
    claims: ClaimCoordinator,
    executor: Arc<dyn InstructionExecutor>,
    publisher: Arc<dyn ArtifactPublisher>,
    retry: Arc<dyn RetryPolicy>,
}

impl Worker {
    /// Wire a worker from configuration against the local store.
    pub fn new(config: WorkerConfig, db: DbHandle) -> Self {
        let step = InterruptibleStep::new(config.grace_period());
        let store: Arc<dyn ClaimStore> = Arc::new(db.clone());
        let claims = ClaimCoordinator::new(store, config.worker_id(), config.renew_interval());
        Self {
            queue: Arc::new(SqliteQueue::new(db.clone(), config.poll_interval())),
            claims,
            executor: Arc::new(CommandExecutor::new(&config.executor, step.clone())),
            publisher: publish::from_config(&config.deploy, step),
            retry: Arc::new(BoundedRetry {
                max_attempts: config.queue.max_attempts,
                backoff: Duration::from_millis(config.queue.retry_backoff_ms),
            }),
            config,
            db,
        }
    }

    pub fn with_executor(mut self, executor: Arc<dyn InstructionExecutor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn ArtifactPublisher>) -> Self {
        self.publisher = publisher;
        self
    }

    pub fn with_retry_policy(mut self, retry: Arc<dyn RetryPolicy>) -> Self {
        self.retry = retry;
        self
    }

    pub fn worker_id(&self) -> &str {
        self.claims.worker_id()
    }

    /// Consume claim requests until `shutdown` fires, then stop every
    /// session and release its claim.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let max_units = self.config.worker.max_units.max(1);
        let long_poll = self.config.long_poll();
        let mut sessions = Sessions::new();
        let mut generation = 0u64;
        let (done_tx, mut done_rx) = mpsc::channel::<(UnitId, u64)>(max_units * 2);
        info!(worker_id = %self.worker_id(), max_units, "Worker started");

        loop {
            while let Ok((unit, ended)) = done_rx.try_recv() {
                self.finish_session(&mut sessions, &unit, ended).await;
            }
            if shutdown.is_cancelled() {
                break;
            }

            if sessions.len() >= max_units {
                tokio::select! {
                    Some((unit, ended)) = done_rx.recv() => {
                        self.finish_session(&mut sessions, &unit, ended).await
                    }
                    _ = shutdown.cancelled() => break,
                }
                continue;
            }

            let pending = match self
                .queue
                .next_claim_request(self.worker_id(), long_poll, &shutdown)
                .await
            {
                Ok(Some(pending)) => pending,
                Ok(None) => continue,
                Err(e) => {
                    warn!(error = %e, "Polling unclaimed-work stream failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(POLL_ERROR_BACKOFF) => {}
                    }
                    continue;
                }
            };
            // Sessions may have ended while this loop sat in the long poll.
            self.reap_finished(&mut sessions).await;
            generation += 1;
            self.handle_claim_request(pending, &mut sessions, generation, &done_tx, &shutdown)
                .await;
        }

        info!(sessions = sessions.len(), "Shutting down, waiting for unit sessions");
        let (units, handles): (Vec<_>, Vec<_>) =
            sessions.drain().map(|(unit, s)| (unit, s.handle)).unzip();
        for (unit, joined) in units.iter().zip(join_all(handles).await) {
            self.after_session(unit, joined).await;
        }
        info!(worker_id = %self.worker_id(), "Worker stopped");
        Ok(())
    }

    async fn handle_claim_request(
        &self,
        pending: PendingClaimRequest,
        sessions: &mut Sessions,
        generation: u64,
        done_tx: &mpsc::Sender<(UnitId, u64)>,
        shutdown: &CancellationToken,
    ) {
        let unit = pending.request.unit();
        debug!(
            unit = %unit,
            thread_id = %pending.request.thread_id,
            queue_ref = %pending.request.queue_ref,
            "Claim request received"
        );

        if sessions.contains_key(&unit) {
            // The running session drains the stream on its own. Whatever it
            // leaves behind is announced again once it is reaped.
            self.complete_request(pending.id).await;
            return;
        }

        match self.claims.try_claim(&unit).await {
            Ok(ClaimOutcome::Claimed(_)) => {
                match self.queue.requeue_unacked(&unit).await {
                    Ok(0) => {}
                    Ok(n) => info!(unit = %unit, requeued = n, "Redelivering unacknowledged messages"),
                    Err(e) => warn!(unit = %unit, error = %e, "Failed to requeue unacknowledged messages"),
                }
                let session = UnitSession {
                    worker: self.clone(),
                    unit: unit.clone(),
                };
                let (done_tx, shutdown) = (done_tx.clone(), shutdown.clone());
                let span = info_span!("unit", project_id = %unit.project_id, user_id = %unit.user_id);
                let handle = tokio::spawn(
                    async move {
                        let unit = session.unit.clone();
                        let released = session.run(shutdown).await;
                        let _ = done_tx.send((unit, generation)).await;
                        released
                    }
                    .instrument(span),
                );
                sessions.insert(unit, RunningSession { generation, handle });
                self.complete_request(pending.id).await;
            }
            Ok(ClaimOutcome::AlreadyOwned { owner }) => {
                info!(unit = %unit, owner = %owner, "Unit owned by another worker, skipping");
                self.complete_request(pending.id).await;
            }
            Err(e) => {
                warn!(unit = %unit, error = %e, "Claim attempt failed, returning request");
                if let Err(e) = self.queue.return_claim_request(pending.id).await {
                    error!(unit = %unit, error = %e, "Failed to return claim request");
                }
            }
        }
    }

    async fn complete_request(&self, id: i64) {
        if let Err(e) = self.queue.complete_claim_request(id).await {
            warn!(request_id = id, error = %e, "Failed to complete claim request");
        }
    }

    async fn finish_session(&self, sessions: &mut Sessions, unit: &UnitId, generation: u64) {
        if sessions.get(unit).is_none_or(|s| s.generation != generation) {
            return;
        }
        if let Some(session) = sessions.remove(unit) {
            let joined = session.handle.await;
            self.after_session(unit, joined).await;
        }
    }

    /// Drop every session whose task has already returned.
    async fn reap_finished(&self, sessions: &mut Sessions) {
        let finished: Vec<UnitId> = sessions
            .iter()
            .filter(|(_, s)| s.handle.is_finished())
            .map(|(unit, _)| unit.clone())
            .collect();
        for unit in finished {
            if let Some(session) = sessions.remove(&unit) {
                let joined = session.handle.await;
                self.after_session(&unit, joined).await;
            }
        }
    }

    /// Claim requests for `unit` were completed while its session ran. If the
    /// session gave the unit up with messages still waiting, announce it again.
    async fn after_session(&self, unit: &UnitId, joined: Result<bool, JoinError>) {
        match joined {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => error!(unit = %unit, error = %e, "Unit session task failed"),
        }
        match self.queue.reannounce_if_waiting(unit).await {
            Ok(true) => info!(unit = %unit, "Messages still waiting, announced unit again"),
            Ok(false) => {}
            Err(e) => error!(unit = %unit, error = %e, "Failed to announce waiting messages"),
        }
    }
}

/// Everything one claimed unit runs: renewal heartbeat plus message loop.
pub struct UnitSession {
    worker: Worker,
    unit: UnitId,
}

impl UnitSession {
    /// Run until the session ends. Returns whether the claim was released
    /// here, as opposed to lost to another worker.
    pub async fn run(self, shutdown: CancellationToken) -> bool {
        let Self { worker, unit } = self;
        let lost = CancellationToken::new();
        let stop_heartbeat = CancellationToken::new();
        let heartbeat =
            worker
                .claims
                .start_heartbeat(unit.clone(), lost.clone(), stop_heartbeat.clone());

        let settings = worker.config.for_unit(&unit);
        let step = InterruptibleStep::new(settings.grace_period);
        let pipeline = Pipeline::new(
            settings,
            PipelineDeps {
                executor: worker.executor.clone(),
                builder: SiteBuilder::new(&worker.config.build, step),
                publisher: worker.publisher.clone(),
                db: worker.db.clone(),
            },
        );
        let processor = UnitProcessor::new(
            pipeline,
            worker.queue.clone(),
            worker.claims.clone(),
            worker.retry.clone(),
            ProcessorSettings {
                long_poll: worker.config.long_poll(),
                idle_timeout: worker.config.idle_timeout(),
            },
        );

        let outcome = processor.run(lost, shutdown).await;
        stop_heartbeat.cancel();
        heartbeat.stop().await;

        match outcome {
            Ok(SessionEnd::Idle) | Ok(SessionEnd::Shutdown) => {
                worker.claims.release(&unit).await;
                true
            }
            Ok(SessionEnd::ClaimLost) | Err(WorkerError::ClaimLost { .. }) => {
                warn!(unit = %unit, "Claim lost; leaving the unit to its new owner");
                false
            }
            Err(e) => {
                error!(unit = %unit, error = %e, "Unit halted");
                worker.claims.release(&unit).await;
                true
            }
        }
    }
}
