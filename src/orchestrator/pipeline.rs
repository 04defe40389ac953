//! Per-message stage machine: edit, commit, build, deploy, push.
//!
//! Stage-local failures are folded into the `PipelineRun`; only failures that
//! keep the pipeline from running at all (workspace bootstrap, thread switch,
//! commit, store access) come back as `Err` for the processor's retry policy.

use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::UnitSettings;
use crate::errors::{WorkerError, WorkerResult};
use crate::executor::InstructionExecutor;
use crate::models::{
    HistoryEntry, InFlightOperation, OperationKind, PipelineRun, PipelineStage, ResultMessage,
    ThreadContext, WorkMessage,
};
use crate::publish::{ArtifactPublisher, PublishOutcome};
use crate::site::SiteBuilder;
use crate::step::StepOutcome;
use crate::store::{DbHandle, WorkerDb};
use crate::vcs::{CommitOutcome, GitWorkspace, PushOutcome};

const SUBJECT_MAX: usize = 72;
const DETAIL_MAX: usize = 400;

/// Collaborators one claimed unit's pipeline runs against.
pub struct PipelineDeps {
    pub executor: Arc<dyn InstructionExecutor>,
    pub builder: SiteBuilder,
    pub publisher: Arc<dyn ArtifactPublisher>,
    pub db: DbHandle,
}

/// Runs messages of one unit, one at a time, against its workspace.
pub struct Pipeline {
    settings: UnitSettings,
    workspace: GitWorkspace,
    deps: PipelineDeps,
    current: Option<ThreadContext>,
    in_flight: Option<InFlightOperation>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum CommitKind {
    Edit,
    Partial,
    Interrupted,
}

impl Pipeline {
    pub fn new(settings: UnitSettings, deps: PipelineDeps) -> Self {
        let workspace = GitWorkspace::new(&settings);
        Self {
            settings,
            workspace,
            deps,
            current: None,
            in_flight: None,
        }
    }

    pub fn workspace(&self) -> &GitWorkspace {
        &self.workspace
    }

    pub fn settings(&self) -> &UnitSettings {
        &self.settings
    }

    /// The long-running step currently executing, if any.
    pub fn in_flight(&self) -> Option<&InFlightOperation> {
        self.in_flight.as_ref()
    }

    /// Reset a broken checkout. Used by the processor before retrying a
    /// message that failed with `WorkspaceCorrupt`.
    pub async fn recover(&self) -> WorkerResult<()> {
        self.workspace.recover().await
    }

    async fn store<F, R>(&self, f: F) -> WorkerResult<R>
    where
        F: FnOnce(&WorkerDb) -> anyhow::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        self.deps.db.call(f).await.map_err(WorkerError::Store)
    }

    /// Drive one message to a terminal stage and build its result.
    pub async fn process(
        &mut self,
        message: &WorkMessage,
        cancel: &CancellationToken,
    ) -> WorkerResult<ResultMessage> {
        self.prepare_workspace(message).await?;
        let mut thread = self.enter_thread(&message.thread_id).await?;
        let mut run = PipelineRun::new(&message.command_id, &message.thread_id);
        info!(
            unit = %self.settings.unit,
            command_id = %message.command_id,
            thread_id = %message.thread_id,
            branch = %thread.branch_name,
            "Processing instruction"
        );

        if cancel.is_cancelled() {
            return self
                .interrupt(run, thread, message, None, String::new())
                .await;
        }

        // Edit
        run.advance(PipelineStage::Editing);
        let history = thread
            .recent_history(self.settings.history_limit)
            .to_vec();
        self.begin(OperationKind::Edit, cancel);
        let edit = self
            .deps
            .executor
            .execute(&message.instruction, self.workspace.root(), &history, cancel)
            .await;
        let op = self.in_flight.take();

        let (edit_ok, detail, reported) = match edit {
            StepOutcome::Completed(execution) => {
                if !execution.success {
                    run.note_error(
                        WorkerError::EditExecutionFailed(truncate(&execution.output, DETAIL_MAX))
                            .to_string(),
                    );
                }
                (execution.success, execution.output, execution.files_changed)
            }
            StepOutcome::Cancelled(partial) => {
                return self
                    .interrupt(run, thread, message, op, partial.stdout)
                    .await;
            }
            StepOutcome::Failed { error, output } => {
                let tail = output.tail(10);
                run.note_error(
                    WorkerError::EditExecutionFailed(format!("{}: {}", error, tail)).to_string(),
                );
                (false, output.stdout, Vec::new())
            }
        };
        run.files_changed = merge_files(
            self.workspace.source_paths(reported),
            self.workspace.changed_files()?,
        );
        debug!(files = ?run.files_changed, "Edit finished");

        if run.files_changed.is_empty() {
            info!(command_id = %message.command_id, "No files changed, skipping commit and build");
        } else {
            // Commit
            run.advance(PipelineStage::Committing);
            let kind = if edit_ok { CommitKind::Edit } else { CommitKind::Partial };
            self.commit(&mut run, &mut thread, message, kind).await?;

            if edit_ok {
                if cancel.is_cancelled() {
                    return self
                        .interrupt(run, thread, message, None, detail)
                        .await;
                }
                // Build
                run.advance(PipelineStage::Building);
                self.begin(OperationKind::Build, cancel);
                let build = self
                    .deps
                    .builder
                    .build(self.workspace.root(), cancel)
                    .await;
                let op = self.in_flight.take();
                match build {
                    StepOutcome::Completed(_) => run.build_success = true,
                    StepOutcome::Cancelled(_) => {
                        return self
                            .interrupt(run, thread, message, op, detail)
                            .await;
                    }
                    StepOutcome::Failed { error, output } => {
                        warn!(command_id = %message.command_id, error = %error, "Build failed, skipping deploy");
                        run.note_error(
                            WorkerError::BuildFailed(format!("{}: {}", error, output.tail(10)))
                                .to_string(),
                        );
                    }
                }

                // Deploy
                if run.build_success {
                    run.advance(PipelineStage::Deploying);
                    self.deploy(&mut run).await;
                }
            }
        }

        // Push
        run.advance(PipelineStage::Pushing);
        self.push(&mut run, &thread.branch_name).await;

        run.advance(if edit_ok {
            PipelineStage::Done
        } else {
            PipelineStage::Failed
        });
        let summary = summarize(&run, &detail);
        self.finish(thread, message, &run, &summary).await?;
        info!(
            command_id = %message.command_id,
            stage = %run.stage,
            build_success = run.build_success,
            deploy_success = run.deploy_success,
            push_success = run.push_success,
            "Pipeline finished"
        );
        Ok(ResultMessage::from_run(message, &run, summary))
    }

    fn begin(&mut self, kind: OperationKind, cancel: &CancellationToken) {
        self.in_flight = Some(InFlightOperation {
            kind,
            cancel: cancel.clone(),
            started_at: Utc::now(),
        });
    }

    /// Make sure a checkout exists and is healthy before touching it.
    async fn prepare_workspace(&self, message: &WorkMessage) -> WorkerResult<()> {
        let unit = self.settings.unit.clone();
        if !self.workspace.exists() {
            let stored = {
                let unit = unit.clone();
                self.store(move |db| db.get_repo_url(&unit)).await?
            };
            let url = message
                .repo_url
                .clone()
                .or(stored)
                .ok_or_else(|| WorkerError::MissingRepoUrl { unit: unit.clone() })?;
            info!(unit = %unit, repo_url = %url, "Bootstrapping workspace");
            self.workspace.clone_from(&url).await?;
            self.store(move |db| db.set_repo_url(&unit, &url)).await?;
        } else if let Some(url) = message.repo_url.clone() {
            self.store(move |db| db.set_repo_url(&unit, &url)).await?;
        }
        self.workspace.recover().await
    }

    /// Switch the workspace to `thread_id`, saving the previous thread's
    /// pending work on its own branch first.
    async fn enter_thread(&mut self, thread_id: &str) -> WorkerResult<ThreadContext> {
        let unit = self.settings.unit.clone();
        let previous = match &self.current {
            Some(t) => Some(t.thread_id.clone()),
            None => {
                let unit = unit.clone();
                self.store(move |db| db.get_current_thread(&unit)).await?
            }
        };

        if let Some(prev) = previous.filter(|p| p != thread_id) {
            info!(unit = %unit, from = %prev, to = %thread_id, "Switching thread");
            if self.workspace.is_dirty()? {
                let message = format!(
                    "Save pending work before switching to thread {}\n\nThread: {}",
                    thread_id, prev
                );
                if let CommitOutcome::Committed(sha) = self.workspace.commit(&message).await? {
                    let unit = unit.clone();
                    let cached = self.current.take().filter(|t| t.thread_id == prev);
                    self.store(move |db| {
                        let mut ctx = match cached {
                            Some(ctx) => ctx,
                            None => db
                                .load_thread(&unit, &prev)?
                                .unwrap_or_else(|| ThreadContext::new(&prev)),
                        };
                        ctx.last_commit = Some(sha);
                        db.save_thread(&unit, &ctx)
                    })
                    .await?;
                }
            }
        }

        let branch = self.workspace.ensure_branch(thread_id).await?;
        let loaded = match self.current.take().filter(|t| t.thread_id == thread_id) {
            Some(ctx) => Some(ctx),
            None => {
                let (unit, id) = (unit.clone(), thread_id.to_string());
                self.store(move |db| db.load_thread(&unit, &id)).await?
            }
        };
        let mut thread = loaded.unwrap_or_else(|| ThreadContext::new(thread_id));
        thread.branch_name = branch;
        let (id, ctx) = (thread_id.to_string(), thread.clone());
        self.store(move |db| {
            db.save_thread(&unit, &ctx)?;
            db.set_current_thread(&unit, &id)
        })
        .await?;
        Ok(thread)
    }

    async fn commit(
        &self,
        run: &mut PipelineRun,
        thread: &mut ThreadContext,
        message: &WorkMessage,
        kind: CommitKind,
    ) -> WorkerResult<()> {
        let text = commit_message(kind, message);
        if let CommitOutcome::Committed(sha) = self.workspace.commit(&text).await? {
            run.commit_ref = Some(sha.clone());
            thread.last_commit = Some(sha);
        }
        Ok(())
    }

    async fn deploy(&self, run: &mut PipelineRun) {
        let source = self.deps.builder.output_path(self.workspace.root());
        let target = &self.settings.deploy_target;
        match self.deps.publisher.publish(&source, target).await {
            PublishOutcome::Deployed { url } => {
                run.deploy_success = true;
                run.preview_url = Some(url);
            }
            PublishOutcome::Skipped { reason } => {
                info!(reason = %reason, "Deploy skipped");
            }
            PublishOutcome::Failed { error } => {
                warn!(bucket = %target.bucket, error = %error, "Deploy failed");
                run.note_error(WorkerError::DeployFailed(error).to_string());
            }
        }
    }

    /// Push whatever the remote has not seen. Never fails the run.
    async fn push(&self, run: &mut PipelineRun, branch: &str) {
        let ahead = match self.workspace.commits_ahead(branch) {
            Ok(n) => n,
            Err(e) => {
                run.note_error(format!("Could not compare with remote: {}", e));
                return;
            }
        };
        if ahead == 0 {
            debug!(branch, "Remote already up to date");
            run.push_success = true;
            return;
        }
        match self.workspace.push(branch).await {
            Ok(PushOutcome::Pushed { merged }) => {
                run.push_success = true;
                if merged {
                    info!(branch, "Pushed after merging remote changes");
                }
            }
            Ok(PushOutcome::Conflict { detail }) => {
                run.note_error(
                    WorkerError::PushConflict {
                        branch: branch.to_string(),
                        detail: truncate(&detail, DETAIL_MAX),
                    }
                    .to_string(),
                );
            }
            Ok(PushOutcome::Rejected { detail }) => {
                run.note_error(format!("Push failed: {}", truncate(&detail, DETAIL_MAX)));
            }
            Err(e) => {
                warn!(branch, error = %e, "Push refused");
                run.note_error(e.to_string());
            }
        }
    }

    /// A newer message won. Save what exists, salvage a partial build, and
    /// close the run as `interrupted`.
    async fn interrupt(
        &mut self,
        mut run: PipelineRun,
        mut thread: ThreadContext,
        message: &WorkMessage,
        op: Option<InFlightOperation>,
        detail: String,
    ) -> WorkerResult<ResultMessage> {
        let kind = op.as_ref().map(|op| op.kind);
        let elapsed_ms = op
            .as_ref()
            .map(|op| (Utc::now() - op.started_at).num_milliseconds())
            .unwrap_or(0);
        info!(
            command_id = %message.command_id,
            operation = kind.map(|k| k.as_str()).unwrap_or("none"),
            elapsed_ms,
            stage = %run.stage,
            "Interrupted by newer instruction"
        );

        let changed = self.workspace.changed_files()?;
        if !changed.is_empty() {
            run.files_changed = merge_files(std::mem::take(&mut run.files_changed), changed);
            self.commit(&mut run, &mut thread, message, CommitKind::Interrupted)
                .await?;
        }

        if kind == Some(OperationKind::Build) {
            self.deploy(&mut run).await;
        }

        run.advance(PipelineStage::Interrupted);
        let summary = summarize(&run, &detail);
        self.finish(thread, message, &run, &summary).await?;
        Ok(ResultMessage::from_run(message, &run, summary))
    }

    /// Persist the thread and its history entry for this run.
    async fn finish(
        &mut self,
        mut thread: ThreadContext,
        message: &WorkMessage,
        run: &PipelineRun,
        summary: &str,
    ) -> WorkerResult<()> {
        let entry = HistoryEntry {
            command_id: message.command_id.clone(),
            instruction: message.instruction.clone(),
            summary: summary.to_string(),
            success: run.stage == PipelineStage::Done && run.error.is_none(),
            interrupted: run.stage == PipelineStage::Interrupted,
            commit_ref: run.commit_ref.clone(),
            created_at: Utc::now(),
        };
        thread.history.push(entry.clone());
        let (unit, ctx) = (self.settings.unit.clone(), thread.clone());
        self.store(move |db| {
            db.append_history(&unit, &ctx.thread_id, &entry)?;
            db.save_thread(&unit, &ctx)
        })
        .await?;
        self.current = Some(thread);
        Ok(())
    }
}

fn merge_files(mut reported: Vec<String>, observed: Vec<String>) -> Vec<String> {
    reported.extend(observed);
    reported.sort();
    reported.dedup();
    reported
}

fn truncate(text: &str, max: usize) -> String {
    let text = text.trim();
    if text.len() <= max {
        text.to_string()
    } else {
        format!("{}...", &text[..text.floor_char_boundary(max)])
    }
}

fn commit_message(kind: CommitKind, message: &WorkMessage) -> String {
    let first_line = message.instruction.lines().next().unwrap_or("").trim();
    let prefix = match kind {
        CommitKind::Edit => "edit",
        CommitKind::Partial => "partial",
        CommitKind::Interrupted => "interrupted",
    };
    let subject = truncate(
        &format!("{}: {}", prefix, first_line),
        SUBJECT_MAX,
    );
    format!(
        "{}\n\nInstruction: {}\nThread: {}\nCommand: {}",
        subject,
        truncate(&message.instruction, DETAIL_MAX),
        message.thread_id,
        message.command_id
    )
}

/// Human-readable outcome for the result message.
fn summarize(run: &PipelineRun, detail: &str) -> String {
    let files = run.files_changed.len();
    let mut parts = Vec::new();
    match run.stage {
        PipelineStage::Interrupted => {
            if files == 0 {
                parts.push("Interrupted by a newer instruction before any files changed".to_string());
            } else {
                parts.push(format!(
                    "Interrupted by a newer instruction; {} changed file(s) saved",
                    files
                ));
            }
            if let Some(url) = &run.preview_url {
                parts.push(format!("partial build published to {}", url));
            }
        }
        _ if files == 0 && run.error.is_none() => {
            parts.push("No changes were needed".to_string());
        }
        _ => {
            if run.stage == PipelineStage::Failed {
                parts.push(format!("Instruction failed; {} file(s) changed", files));
            } else {
                parts.push(format!("Changed {} file(s)", files));
            }
            if files > 0 {
                parts.push(if run.build_success {
                    "build succeeded".to_string()
                } else {
                    "site not rebuilt".to_string()
                });
            }
            if let Some(url) = &run.preview_url {
                parts.push(format!("preview at {}", url));
            }
            if !run.push_success {
                parts.push("changes kept locally, push pending".to_string());
            }
        }
    }
    let mut summary = parts.join("; ");
    summary.push('.');
    let note = detail.lines().rev().find(|l| !l.trim().is_empty());
    if let Some(note) = note {
        summary.push(' ');
        summary.push_str(&truncate(note, 200));
    }
    summary
}
