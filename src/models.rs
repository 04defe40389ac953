use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// A unit of work: the `(project, user)` pair a worker owns while it holds the claim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UnitId {
    pub project_id: String,
    pub user_id: String,
}

impl UnitId {
    pub fn new(project_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            user_id: user_id.into(),
        }
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.project_id, self.user_id)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ClaimStatus {
    Active,
    Idle,
    Released,
}

impl ClaimStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Idle => "idle",
            Self::Released => "released",
        }
    }
}

impl FromStr for ClaimStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "idle" => Ok(Self::Idle),
            "released" => Ok(Self::Released),
            _ => Err(format!("Invalid claim status: {}", s)),
        }
    }
}

/// Ownership record for a unit. At most one non-released record exists per unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimRecord {
    pub unit: UnitId,
    pub worker_id: String,
    pub claimed_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub status: ClaimStatus,
}

impl ClaimRecord {
    pub fn is_owned_by(&self, worker_id: &str) -> bool {
        self.worker_id == worker_id && self.status != ClaimStatus::Released
    }
}

/// One prior instruction/result pair within a thread.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryEntry {
    pub command_id: String,
    pub instruction: String,
    pub summary: String,
    pub success: bool,
    #[serde(default)]
    pub interrupted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_ref: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A conversation thread within a claimed unit, mapped to exactly one branch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadContext {
    pub thread_id: String,
    pub branch_name: String,
    pub history: Vec<HistoryEntry>,
    pub last_commit: Option<String>,
}

impl ThreadContext {
    pub fn new(thread_id: &str) -> Self {
        Self {
            thread_id: thread_id.to_string(),
            branch_name: crate::vcs::branch_for_thread(thread_id),
            history: Vec::new(),
            last_commit: None,
        }
    }

    /// The last `limit` history entries, oldest first.
    pub fn recent_history(&self, limit: usize) -> &[HistoryEntry] {
        let start = self.history.len().saturating_sub(limit);
        &self.history[start..]
    }
}

/// Snapshot of the on-disk checkout for a claimed unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceState {
    pub root: PathBuf,
    pub branch: Option<String>,
    pub dirty: bool,
    pub pending_stash: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Editing,
    Committing,
    Building,
    Deploying,
    Pushing,
    Done,
    Interrupted,
    Failed,
}

impl PipelineStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Editing => "editing",
            Self::Committing => "committing",
            Self::Building => "building",
            Self::Deploying => "deploying",
            Self::Pushing => "pushing",
            Self::Done => "done",
            Self::Interrupted => "interrupted",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Interrupted | Self::Failed)
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One message's journey through the pipeline. Never reused across messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub message_id: String,
    pub thread_id: String,
    pub stage: PipelineStage,
    pub files_changed: Vec<String>,
    pub build_success: bool,
    pub deploy_success: bool,
    pub push_success: bool,
    pub preview_url: Option<String>,
    pub commit_ref: Option<String>,
    pub error: Option<String>,
}

impl PipelineRun {
    pub fn new(message_id: &str, thread_id: &str) -> Self {
        Self {
            message_id: message_id.to_string(),
            thread_id: thread_id.to_string(),
            stage: PipelineStage::Editing,
            files_changed: Vec::new(),
            build_success: false,
            deploy_success: false,
            push_success: false,
            preview_url: None,
            commit_ref: None,
            error: None,
        }
    }

    /// Advance to `next`. Terminal stages are sticky.
    pub fn advance(&mut self, next: PipelineStage) {
        if !self.stage.is_terminal() {
            self.stage = next;
        }
    }

    /// Record a stage-local failure without ending the run.
    pub fn note_error(&mut self, error: impl Into<String>) {
        let error = error.into();
        self.error = Some(match self.error.take() {
            Some(prev) => format!("{}; {}", prev, error),
            None => error,
        });
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Edit,
    Build,
    Deploy,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Edit => "edit",
            Self::Build => "build",
            Self::Deploy => "deploy",
        }
    }
}

/// The currently running long operation for a unit, if any.
#[derive(Debug, Clone)]
pub struct InFlightOperation {
    pub kind: OperationKind,
    pub cancel: CancellationToken,
    pub started_at: DateTime<Utc>,
}

/// Inbound message on a unit's private stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkMessage {
    pub session_id: String,
    pub command_id: String,
    pub thread_id: String,
    pub instruction: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo_url: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Inbound message on the shared unclaimed-work stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClaimRequest {
    pub project_id: String,
    pub user_id: String,
    pub thread_id: String,
    pub queue_ref: String,
}

impl ClaimRequest {
    pub fn unit(&self) -> UnitId {
        UnitId::new(&self.project_id, &self.user_id)
    }
}

/// Outbound result for one processed message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResultMessage {
    pub command_id: String,
    pub session_id: String,
    pub success: bool,
    pub summary: String,
    pub files_changed: Vec<String>,
    pub build_success: bool,
    pub deploy_success: bool,
    pub push_success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interrupted: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResultMessage {
    /// Build the outbound result from a finished run.
    pub fn from_run(message: &WorkMessage, run: &PipelineRun, summary: String) -> Self {
        let interrupted = run.stage == PipelineStage::Interrupted;
        Self {
            command_id: message.command_id.clone(),
            session_id: message.session_id.clone(),
            success: run.stage == PipelineStage::Done && run.error.is_none(),
            summary,
            files_changed: run.files_changed.clone(),
            build_success: run.build_success,
            deploy_success: run.deploy_success,
            push_success: run.push_success,
            preview_url: run.preview_url.clone(),
            interrupted: interrupted.then_some(true),
            error: run.error.clone(),
        }
    }

    /// A result for a message that never made it through the pipeline.
    pub fn failure(message: &WorkMessage, error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            command_id: message.command_id.clone(),
            session_id: message.session_id.clone(),
            success: false,
            summary: format!("Failed to process instruction: {}", error),
            files_changed: Vec::new(),
            build_success: false,
            deploy_success: false,
            push_success: false,
            preview_url: None,
            interrupted: None,
            error: Some(error),
        }
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> WorkMessage {
        WorkMessage {
            session_id: "s-1".into(),
            command_id: "c-1".into(),
            thread_id: "t-1".into(),
            instruction: "make the header blue".into(),
            repo_url: None,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_claim_status_roundtrip() {
        for status in [ClaimStatus::Active, ClaimStatus::Idle, ClaimStatus::Released] {
            assert_eq!(status.as_str().parse::<ClaimStatus>().unwrap(), status);
        }
        assert!("stolen".parse::<ClaimStatus>().is_err());
    }

    #[test]
    fn test_released_claim_is_not_owned() {
        let record = ClaimRecord {
            unit: UnitId::new("p", "u"),
            worker_id: "w1".into(),
            claimed_at: Utc::now(),
            last_activity: Utc::now(),
            status: ClaimStatus::Released,
        };
        assert!(!record.is_owned_by("w1"));
    }

    #[test]
    fn test_terminal_stage_is_sticky() {
        let mut run = PipelineRun::new("c-1", "t-1");
        run.advance(PipelineStage::Interrupted);
        run.advance(PipelineStage::Pushing);
        assert_eq!(run.stage, PipelineStage::Interrupted);
    }

    #[test]
    fn test_note_error_accumulates() {
        let mut run = PipelineRun::new("c-1", "t-1");
        run.note_error("build failed");
        run.note_error("push rejected");
        assert_eq!(run.error.as_deref(), Some("build failed; push rejected"));
    }

    #[test]
    fn test_result_from_interrupted_run() {
        let mut run = PipelineRun::new("c-1", "t-1");
        run.advance(PipelineStage::Interrupted);
        let result = ResultMessage::from_run(&message(), &run, "Interrupted".into());
        assert!(!result.success);
        assert!(result.is_interrupted());
        assert!(result.files_changed.is_empty());
    }

    #[test]
    fn test_result_serializes_camel_case() {
        let mut run = PipelineRun::new("c-1", "t-1");
        run.build_success = true;
        run.advance(PipelineStage::Done);
        let result = ResultMessage::from_run(&message(), &run, "ok".into());
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["commandId"], "c-1");
        assert_eq!(json["buildSuccess"], true);
        assert!(json.get("interrupted").is_none());
        assert!(json.get("previewUrl").is_none());
    }

    #[test]
    fn test_work_message_repo_url_optional() {
        let json = r#"{"sessionId":"s","commandId":"c","threadId":"t","instruction":"i","timestamp":"2026-01-01T00:00:00Z"}"#;
        let msg: WorkMessage = serde_json::from_str(json).unwrap();
        assert!(msg.repo_url.is_none());
    }

    #[test]
    fn test_recent_history_limits() {
        let mut ctx = ThreadContext::new("t-1");
        for i in 0..5 {
            ctx.history.push(HistoryEntry {
                command_id: format!("c-{}", i),
                instruction: "x".into(),
                summary: "y".into(),
                success: true,
                interrupted: false,
                commit_ref: None,
                created_at: Utc::now(),
            });
        }
        let recent = ctx.recent_history(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].command_id, "c-3");
    }
}
