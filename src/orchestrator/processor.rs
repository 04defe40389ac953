//! Per-unit message loop.
//!
//! A poller task long-polls the unit's stream and forwards deliveries over a
//! channel. The processor handles them strictly in arrival order; a delivery
//! that shows up while another is running cancels the running one, so the
//! newest instruction always wins.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::pipeline::Pipeline;
use crate::claim::ClaimCoordinator;
use crate::errors::{WorkerError, WorkerResult};
use crate::models::{ClaimStatus, ResultMessage, UnitId};
use crate::queue::{Delivery, WorkQueue};

const POLL_ERROR_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { after: Duration },
    DeadLetter,
}

/// Decides what happens to a message whose pipeline could not run.
pub trait RetryPolicy: Send + Sync {
    /// `attempt` counts deliveries so far, starting at 1.
    fn decide(&self, attempt: u32, error: &WorkerError) -> RetryDecision;
}

/// Retry up to `max_attempts` deliveries with linear backoff, then dead-letter.
#[derive(Debug, Clone)]
pub struct BoundedRetry {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for BoundedRetry {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy for BoundedRetry {
    fn decide(&self, attempt: u32, error: &WorkerError) -> RetryDecision {
        if !error.is_retryable() || attempt >= self.max_attempts {
            RetryDecision::DeadLetter
        } else {
            RetryDecision::Retry {
                after: self.backoff * attempt,
            }
        }
    }
}

/// Why a unit session stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// No messages within the idle timeout; the claim should be released.
    Idle,
    /// The claim was lost; nothing may be released or processed.
    ClaimLost,
    Shutdown,
}

/// Timing knobs for one unit session.
#[derive(Debug, Clone)]
pub struct ProcessorSettings {
    pub long_poll: Duration,
    pub idle_timeout: Duration,
}

pub struct UnitProcessor {
    unit: UnitId,
    pipeline: Pipeline,
    queue: Arc<dyn WorkQueue>,
    claims: ClaimCoordinator,
    retry: Arc<dyn RetryPolicy>,
    settings: ProcessorSettings,
}

enum Handled {
    Done,
    Halt(WorkerError),
}

impl UnitProcessor {
    pub fn new(
        pipeline: Pipeline,
        queue: Arc<dyn WorkQueue>,
        claims: ClaimCoordinator,
        retry: Arc<dyn RetryPolicy>,
        settings: ProcessorSettings,
    ) -> Self {
        Self {
            unit: pipeline.settings().unit.clone(),
            pipeline,
            queue,
            claims,
            retry,
            settings,
        }
    }

    fn spawn_poller(&self, stop: CancellationToken, tx: mpsc::Sender<Delivery>) -> JoinHandle<()> {
        let (queue, unit, wait) = (self.queue.clone(), self.unit.clone(), self.settings.long_poll);
        tokio::spawn(async move {
            while !stop.is_cancelled() {
                match queue.receive(&unit, wait, &stop).await {
                    Ok(Some(delivery)) => {
                        debug!(unit = %unit, command_id = %delivery.message.command_id, "Received message");
                        if tx.send(delivery).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(unit = %unit, error = %e, "Polling unit stream failed");
                        tokio::select! {
                            _ = stop.cancelled() => break,
                            _ = tokio::time::sleep(POLL_ERROR_BACKOFF) => {}
                        }
                    }
                }
            }
            debug!(unit = %unit, "Poller stopped");
        })
    }

    /// Consume the unit's stream until idle, claim loss, or shutdown.
    ///
    /// A message already running when the claim is lost is allowed to finish;
    /// anything received after that is left unacknowledged for the next owner.
    pub async fn run(
        mut self,
        lost: CancellationToken,
        shutdown: CancellationToken,
    ) -> WorkerResult<SessionEnd> {
        let stop = CancellationToken::new();
        let watcher = {
            let (stop, lost, shutdown) = (stop.clone(), lost.clone(), shutdown.clone());
            tokio::spawn(async move {
                tokio::select! {
                    _ = lost.cancelled() => {}
                    _ = shutdown.cancelled() => {}
                    _ = stop.cancelled() => {}
                }
                stop.cancel();
            })
        };
        let (tx, mut rx) = mpsc::channel(16);
        let poller = self.spawn_poller(stop.clone(), tx);
        info!(unit = %self.unit, "Unit session started");

        let outcome = self.consume(&mut rx, &stop).await;

        stop.cancel();
        watcher.abort();
        if let Err(e) = poller.await {
            warn!(unit = %self.unit, error = %e, "Poller task failed");
        }

        let end = match outcome {
            Ok(SessionEnd::Idle) => SessionEnd::Idle,
            Ok(_) if lost.is_cancelled() => SessionEnd::ClaimLost,
            Ok(end) => end,
            Err(WorkerError::ClaimLost { .. }) => SessionEnd::ClaimLost,
            Err(e) => return Err(e),
        };
        info!(unit = %self.unit, end = ?end, "Unit session ended");
        Ok(end)
    }

    async fn consume(
        &mut self,
        rx: &mut mpsc::Receiver<Delivery>,
        stop: &CancellationToken,
    ) -> WorkerResult<SessionEnd> {
        let mut backlog: VecDeque<Delivery> = VecDeque::new();
        let mut idle = false;
        loop {
            if stop.is_cancelled() {
                return Ok(SessionEnd::Shutdown);
            }
            let delivery = match backlog.pop_front() {
                Some(d) => d,
                None => {
                    if !idle {
                        self.claims.mark(&self.unit, ClaimStatus::Idle).await?;
                        idle = true;
                    }
                    tokio::select! {
                        received = rx.recv() => match received {
                            Some(d) => d,
                            None => return Ok(SessionEnd::Shutdown),
                        },
                        _ = tokio::time::sleep(self.settings.idle_timeout) => {
                            info!(unit = %self.unit, "Idle timeout reached");
                            return Ok(SessionEnd::Idle);
                        }
                        _ = stop.cancelled() => return Ok(SessionEnd::Shutdown),
                    }
                }
            };

            self.claims.mark(&self.unit, ClaimStatus::Active).await?;
            idle = false;
            match self.handle(delivery, &mut backlog, rx, stop).await? {
                Handled::Done => {}
                Handled::Halt(e) => return Err(e),
            }
        }
    }

    /// Run one delivery to a published result, retrying per policy.
    async fn handle(
        &mut self,
        mut delivery: Delivery,
        backlog: &mut VecDeque<Delivery>,
        rx: &mut mpsc::Receiver<Delivery>,
        stop: &CancellationToken,
    ) -> WorkerResult<Handled> {
        let mut recovered = false;
        loop {
            let cancel = CancellationToken::new();
            if !backlog.is_empty() {
                cancel.cancel();
            }

            let outcome = {
                let span = info_span!(
                    "message",
                    command_id = %delivery.message.command_id,
                    thread_id = %delivery.message.thread_id,
                    attempt = delivery.attempts
                );
                let run = self
                    .pipeline
                    .process(&delivery.message, &cancel)
                    .instrument(span);
                tokio::pin!(run);
                loop {
                    tokio::select! {
                        outcome = &mut run => break outcome,
                        Some(next) = rx.recv(), if !stop.is_cancelled() => {
                            if !cancel.is_cancelled() {
                                info!(
                                    unit = %self.unit,
                                    current = %delivery.message.command_id,
                                    newer = %next.message.command_id,
                                    "Newer message arrived, interrupting"
                                );
                                cancel.cancel();
                            }
                            backlog.push_back(next);
                        }
                    }
                }
            };

            let error = match outcome {
                Ok(result) => {
                    self.complete(&delivery, &result).await?;
                    return Ok(Handled::Done);
                }
                Err(e) => e,
            };

            if error.is_unit_fatal() {
                return Err(error);
            }

            if error.is_workspace_corrupt() {
                if recovered {
                    error!(unit = %self.unit, error = %error, "Workspace still corrupt after recovery, halting unit");
                    self.dead_letter(&delivery, &error).await?;
                    return Ok(Handled::Halt(error));
                }
                warn!(unit = %self.unit, error = %error, "Workspace corrupt, recovering and retrying once");
                recovered = true;
                if let Err(e) = self.pipeline.recover().await {
                    error!(unit = %self.unit, error = %e, "Workspace recovery failed, halting unit");
                    self.dead_letter(&delivery, &e).await?;
                    return Ok(Handled::Halt(e));
                }
                continue;
            }

            match self.retry.decide(delivery.attempts, &error) {
                RetryDecision::Retry { after } => {
                    warn!(
                        unit = %self.unit,
                        command_id = %delivery.message.command_id,
                        attempt = delivery.attempts,
                        error = %error,
                        "Message failed, retrying"
                    );
                    self.queue
                        .record_attempt(&delivery)
                        .await
                        .map_err(WorkerError::Store)?;
                    delivery.attempts += 1;
                    tokio::select! {
                        _ = tokio::time::sleep(after) => {}
                        _ = stop.cancelled() => return Ok(Handled::Done),
                    }
                }
                RetryDecision::DeadLetter => {
                    self.dead_letter(&delivery, &error).await?;
                    return Ok(Handled::Done);
                }
            }
        }
    }

    /// Publish the result, then acknowledge. A crash in between redelivers
    /// the message rather than losing its result.
    async fn complete(&self, delivery: &Delivery, result: &ResultMessage) -> WorkerResult<()> {
        self.queue
            .publish_result(&self.unit, result)
            .await
            .map_err(WorkerError::Store)?;
        self.queue.ack(delivery).await.map_err(WorkerError::Store)?;
        info!(
            unit = %self.unit,
            command_id = %result.command_id,
            success = result.success,
            interrupted = result.is_interrupted(),
            "Result published"
        );
        Ok(())
    }

    async fn dead_letter(&self, delivery: &Delivery, error: &WorkerError) -> WorkerResult<()> {
        error!(
            unit = %self.unit,
            command_id = %delivery.message.command_id,
            attempts = delivery.attempts,
            error = %error,
            "Dead-lettering message"
        );
        self.queue
            .dead_letter(delivery, &error.to_string())
            .await
            .map_err(WorkerError::Store)?;
        let result = ResultMessage::failure(&delivery.message, error.to_string());
        self.queue
            .publish_result(&self.unit, &result)
            .await
            .map_err(WorkerError::Store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claim::ClaimStore;
    use crate::config::WorkerConfig;
    use crate::orchestrator::pipeline::PipelineDeps;
    use crate::orchestrator::test_support::{
        RecordingPublisher, ScriptedExecutor, git, message, seeded_remote,
    };
    use crate::queue::SqliteQueue;
    use crate::site::SiteBuilder;
    use crate::step::InterruptibleStep;
    use crate::store::DbHandle;
    use chrono::Utc;
    use std::path::{Path, PathBuf};
    use tempfile::{TempDir, tempdir};

    struct Harness {
        dir: TempDir,
        remote: PathBuf,
        db: DbHandle,
        config: WorkerConfig,
        executor: Arc<ScriptedExecutor>,
        publisher: Arc<RecordingPublisher>,
        claims: ClaimCoordinator,
    }

    fn unit() -> UnitId {
        UnitId::new("proj-A", "user-1")
    }

    async fn harness(build_command: &str) -> Harness {
        let dir = tempdir().unwrap();
        let remote = seeded_remote(&dir);
        let mut config = WorkerConfig::default();
        config.worker.workspace_root = dir.path().join("workspaces");
        config.build.command = build_command.to_string();
        config.deploy.domain = "sites.test".into();
        let db = DbHandle::in_memory().unwrap();
        let store: Arc<dyn ClaimStore> = Arc::new(db.clone());
        let claims = ClaimCoordinator::new(store, "w1", Duration::from_millis(20));
        claims.try_claim(&unit()).await.unwrap();
        Harness {
            dir,
            remote,
            db,
            config,
            executor: Arc::new(ScriptedExecutor::default()),
            publisher: Arc::new(RecordingPublisher::default()),
            claims,
        }
    }

    impl Harness {
        fn processor(&self, idle_timeout: Duration, retry: BoundedRetry) -> UnitProcessor {
            let settings = self.config.for_unit(&unit());
            let step = InterruptibleStep::new(Duration::from_millis(500));
            let pipeline = Pipeline::new(
                settings,
                PipelineDeps {
                    executor: self.executor.clone(),
                    builder: SiteBuilder::new(&self.config.build, step),
                    publisher: self.publisher.clone(),
                    db: self.db.clone(),
                },
            );
            UnitProcessor::new(
                pipeline,
                Arc::new(SqliteQueue::new(self.db.clone(), Duration::from_millis(5))),
                self.claims.clone(),
                Arc::new(retry),
                ProcessorSettings {
                    long_poll: Duration::from_millis(100),
                    idle_timeout,
                },
            )
        }

        async fn submit(&self, command_id: &str, thread: &str, instruction: &str) -> i64 {
            let repo = self.remote.clone();
            let msg = message(command_id, thread, instruction, Some(&repo));
            self.db
                .call(move |db| db.submit_message(&unit(), &msg))
                .await
                .unwrap()
        }

        async fn results(&self) -> Vec<ResultMessage> {
            self.db
                .call(|db| db.list_results(Some(&unit()), 50))
                .await
                .unwrap()
        }

        async fn wait_for_results(&self, n: usize) -> Vec<ResultMessage> {
            let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
            loop {
                let results = self.results().await;
                if results.len() >= n {
                    return results;
                }
                assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {} results", n);
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        }

        async fn wait_for_calls(&self, n: usize) {
            let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
            while self.executor.calls().len() < n {
                assert!(tokio::time::Instant::now() < deadline, "executor never called");
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }

        fn workspace(&self) -> PathBuf {
            self.config.for_unit(&unit()).workspace_path
        }
    }

    fn quick_retry() -> BoundedRetry {
        BoundedRetry {
            max_attempts: 3,
            backoff: Duration::from_millis(10),
        }
    }

    fn spawn(
        processor: UnitProcessor,
    ) -> (CancellationToken, CancellationToken, JoinHandle<WorkerResult<SessionEnd>>) {
        let (lost, shutdown) = (CancellationToken::new(), CancellationToken::new());
        let handle = tokio::spawn(processor.run(lost.clone(), shutdown.clone()));
        (lost, shutdown, handle)
    }

    const BUILD_OK: &str = "mkdir -p dist && cp index.html dist/";

    #[test]
    fn test_bounded_retry_decisions() {
        let policy = BoundedRetry {
            max_attempts: 3,
            backoff: Duration::from_millis(100),
        };
        let transient = WorkerError::Git {
            command: "fetch".into(),
            stderr: "timeout".into(),
        };
        assert_eq!(
            policy.decide(1, &transient),
            RetryDecision::Retry {
                after: Duration::from_millis(100)
            }
        );
        assert_eq!(
            policy.decide(2, &transient),
            RetryDecision::Retry {
                after: Duration::from_millis(200)
            }
        );
        assert_eq!(policy.decide(3, &transient), RetryDecision::DeadLetter);
        let fatal = WorkerError::MissingRepoUrl { unit: unit() };
        assert_eq!(policy.decide(1, &fatal), RetryDecision::DeadLetter);
    }

    #[tokio::test]
    async fn test_corrupt_workspace_is_recovered_and_retried_once() {
        let h = harness(BUILD_OK).await;
        h.submit("m1", "t1", "corrupt-once page.html").await;
        let (_lost, shutdown, handle) = spawn(h.processor(Duration::from_secs(30), quick_retry()));

        let results = h.wait_for_results(1).await;
        assert!(results[0].success, "{:?}", results[0]);
        assert_eq!(results[0].files_changed, vec!["page.html".to_string()]);
        assert_eq!(h.executor.calls().len(), 2);
        assert!(!h.workspace().join(".git/index.lock").exists());
        let tree = git(&h.remote, &["ls-tree", "--name-only", "thread-t1"]);
        assert!(tree.contains("page.html"));

        shutdown.cancel();
        assert_eq!(handle.await.unwrap().unwrap(), SessionEnd::Shutdown);
    }

    #[tokio::test]
    async fn test_workspace_corrupt_after_recovery_halts_unit() {
        let h = harness(BUILD_OK).await;
        let id = h.submit("m1", "t1", "corrupt page.html").await;
        let (_lost, _shutdown, handle) = spawn(h.processor(Duration::from_secs(30), quick_retry()));

        let err = tokio::time::timeout(Duration::from_secs(20), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert!(err.is_workspace_corrupt(), "{:?}", err);
        // One recovery, one retry, no more.
        assert_eq!(h.executor.calls().len(), 2);

        let results = h.results().await;
        assert_eq!(results.len(), 1);
        assert!(!results[0].success);
        assert!(results[0].error.as_deref().unwrap().contains("index.lock"));
        let status = h.db.call(move |db| db.message_status(id)).await.unwrap();
        assert_eq!(status.as_deref(), Some("dead"));
    }

    #[tokio::test]
    async fn test_results_follow_arrival_order() {
        let h = harness(BUILD_OK).await;
        for i in 1..=3 {
            h.submit(&format!("m{}", i), "t1", &format!("f{}.html", i)).await;
        }
        let (_lost, shutdown, handle) = spawn(h.processor(Duration::from_secs(30), quick_retry()));
        let results = h.wait_for_results(3).await;
        let order: Vec<&str> = results.iter().map(|r| r.command_id.as_str()).collect();
        assert_eq!(order, vec!["m1", "m2", "m3"]);
        // The newest message is never preempted.
        assert!(results[2].success, "{:?}", results[2]);
        shutdown.cancel();
        assert_eq!(handle.await.unwrap().unwrap(), SessionEnd::Shutdown);
    }

    #[tokio::test]
    async fn test_sequential_messages_all_succeed() {
        let h = harness(BUILD_OK).await;
        let (_lost, shutdown, handle) = spawn(h.processor(Duration::from_secs(30), quick_retry()));
        for i in 1..=2 {
            h.submit(&format!("m{}", i), "t1", &format!("f{}.html", i)).await;
            let results = h.wait_for_results(i).await;
            assert!(results[i - 1].success);
        }
        shutdown.cancel();
        handle.await.unwrap().unwrap();
        let tree = git(&h.remote, &["ls-tree", "--name-only", "thread-t1"]);
        assert!(tree.contains("f1.html") && tree.contains("f2.html"));
    }

    #[tokio::test]
    async fn test_noop_interruption_creates_no_commit() {
        let h = harness(BUILD_OK).await;
        let (_lost, shutdown, handle) = spawn(h.processor(Duration::from_secs(30), quick_retry()));
        h.submit("m1", "t1", "wait").await;
        h.wait_for_calls(1).await;
        let head_before = git(&h.workspace(), &["rev-parse", "HEAD"]);
        h.submit("m2", "t1", "noop").await;

        let results = h.wait_for_results(2).await;
        assert_eq!(results[0].command_id, "m1");
        assert!(results[0].is_interrupted());
        assert!(results[0].files_changed.is_empty());
        assert!(results[1].success);
        assert_eq!(git(&h.workspace(), &["rev-parse", "HEAD"]), head_before);
        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_interrupted_edit_keeps_partial_work() {
        let h = harness(BUILD_OK).await;
        let (_lost, shutdown, handle) = spawn(h.processor(Duration::from_secs(30), quick_retry()));
        h.submit("m1", "t1", "slow draft.html").await;
        h.wait_for_calls(1).await;
        h.submit("m2", "t1", "final.html").await;

        let results = h.wait_for_results(2).await;
        assert!(results[0].is_interrupted());
        assert_eq!(results[0].files_changed, vec!["draft.html".to_string()]);
        assert!(results[1].success);
        let log = git(&h.workspace(), &["log", "--format=%s"]);
        let subjects: Vec<&str> = log.lines().collect();
        assert!(subjects[0].starts_with("edit: final.html"));
        assert!(subjects[1].starts_with("interrupted: slow draft.html"));
        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_build_interrupted_by_newer_message() {
        let flag_dir = tempdir().unwrap();
        let flag = flag_dir.path().join("slow-build");
        std::fs::write(&flag, "").unwrap();
        let build = format!(
            "if [ -f {flag} ]; then rm {flag}; mkdir -p dist; echo partial > dist/partial.html; sleep 30; fi; {ok}",
            flag = flag.display(),
            ok = BUILD_OK
        );
        let h = harness(&build).await;
        let (_lost, shutdown, handle) = spawn(h.processor(Duration::from_secs(30), quick_retry()));

        h.submit("m1", "t1", "file.txt").await;
        // The first build consumes the flag right before it starts sleeping.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
        while flag.exists() {
            assert!(tokio::time::Instant::now() < deadline, "build never started");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        h.submit("m2", "t1", "file2.txt").await;

        let results = h.wait_for_results(2).await;
        let (m1, m2) = (&results[0], &results[1]);
        assert_eq!(m1.command_id, "m1");
        assert!(m1.is_interrupted());
        assert!(!m1.success);
        assert_eq!(m1.files_changed, vec!["file.txt".to_string()]);
        assert!(!m1.build_success);
        // Partial output of the cancelled build was still published.
        assert!(m1.deploy_success);

        assert!(m2.success, "{:?}", m2);
        assert!(m2.build_success);
        assert!(m2.push_success);

        let log = git(&h.workspace(), &["log", "--format=%s"]);
        assert!(log.contains("edit: file.txt"));
        assert!(log.lines().next().unwrap().starts_with("edit: file2.txt"));
        let tree = git(&h.remote, &["ls-tree", "--name-only", "thread-t1"]);
        assert!(tree.contains("file.txt") && tree.contains("file2.txt"));
        assert!(h.publisher.published().len() >= 2);
        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_claim_loss_stops_consumption() {
        let h = harness(BUILD_OK).await;
        let processor = h.processor(Duration::from_secs(30), quick_retry());
        let (lost, shutdown) = (CancellationToken::new(), CancellationToken::new());
        let heartbeat = h
            .claims
            .start_heartbeat(unit(), lost.clone(), shutdown.clone());
        let handle = tokio::spawn(processor.run(lost.clone(), shutdown.clone()));

        h.submit("m1", "t1", "a.html").await;
        h.wait_for_results(1).await;

        // An external reaper hands the unit to another worker.
        h.db.call(|db| {
            db.force_release_claim(&unit())?;
            db.try_claim(&unit(), "w2", Utc::now()).map(|_| ())
        })
        .await
        .unwrap();
        tokio::time::timeout(Duration::from_secs(5), lost.cancelled())
            .await
            .expect("heartbeat should detect the takeover");

        let end = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("processor should stop after claim loss")
            .unwrap()
            .unwrap();
        assert_eq!(end, SessionEnd::ClaimLost);

        let late = h.submit("m2", "t1", "b.html").await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(h.results().await.len(), 1);
        let status = h.db.call(move |db| db.message_status(late)).await.unwrap();
        assert_eq!(status.as_deref(), Some("pending"));
        heartbeat.stop().await;
    }

    #[tokio::test]
    async fn test_idle_timeout_ends_session() {
        let h = harness(BUILD_OK).await;
        let (_lost, _shutdown, handle) = spawn(h.processor(Duration::from_millis(150), quick_retry()));
        let end = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(end, SessionEnd::Idle);
        let claim = h.db.lock_sync().unwrap().get_claim(&unit()).unwrap().unwrap();
        assert_eq!(claim.status, ClaimStatus::Idle);
    }

    #[tokio::test]
    async fn test_missing_repo_url_is_dead_lettered_without_retry() {
        let h = harness(BUILD_OK).await;
        let msg = message("m1", "t1", "a.html", None);
        let id = h
            .db
            .call(move |db| db.submit_message(&unit(), &msg))
            .await
            .unwrap();
        let (_lost, shutdown, handle) = spawn(h.processor(Duration::from_secs(30), quick_retry()));
        let results = h.wait_for_results(1).await;
        assert!(!results[0].success);
        assert!(results[0].error.as_deref().unwrap().contains("repoUrl"));
        let status = h.db.call(move |db| db.message_status(id)).await.unwrap();
        assert_eq!(status.as_deref(), Some("dead"));
        assert!(h.executor.calls().is_empty());
        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_transient_failure_retries_then_dead_letters() {
        let h = harness(BUILD_OK).await;
        let bogus = h.dir.path().join("no-such-remote.git");
        let msg = message("m1", "t1", "a.html", Some(Path::new(&bogus)));
        let id = h
            .db
            .call(move |db| db.submit_message(&unit(), &msg))
            .await
            .unwrap();
        let (_lost, shutdown, handle) = spawn(h.processor(Duration::from_secs(30), quick_retry()));
        let results = h.wait_for_results(1).await;
        assert!(!results[0].success);
        assert!(results[0].error.as_deref().unwrap().contains("clone"));
        let status = h.db.call(move |db| db.message_status(id)).await.unwrap();
        assert_eq!(status.as_deref(), Some("dead"));
        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }
}
