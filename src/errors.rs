//! Typed error hierarchy for the edit worker.
//!
//! `WorkerError` mirrors the failure taxonomy of the claim-and-process
//! pipeline. Stage-local failures are folded into the result message by the
//! orchestrator; only unit-fatal errors escape the per-unit session.

use std::path::PathBuf;

use thiserror::Error;

use crate::models::UnitId;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Claim lost for unit {unit}")]
    ClaimLost { unit: UnitId },

    #[error("Workspace at {path} is corrupt: {detail}")]
    WorkspaceCorrupt { path: PathBuf, detail: String },

    #[error("Instruction execution failed: {0}")]
    EditExecutionFailed(String),

    #[error("Site build failed: {0}")]
    BuildFailed(String),

    #[error("Deploy failed: {0}")]
    DeployFailed(String),

    #[error("Push of {branch} conflicted: {detail}")]
    PushConflict { branch: String, detail: String },

    #[error("Refusing to push protected branch '{branch}'")]
    PushRejectedProtectedBranch { branch: String },

    #[error("git {command} failed: {stderr}")]
    Git { command: String, stderr: String },

    #[error("Unit {unit} has no workspace and the message carried no repoUrl")]
    MissingRepoUrl { unit: UnitId },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(#[source] anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl WorkerError {
    /// Errors that must stop all processing for the unit immediately.
    pub fn is_unit_fatal(&self) -> bool {
        matches!(self, Self::ClaimLost { .. })
    }

    /// Errors that retrying the same message can never fix.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::ClaimLost { .. }
                | Self::PushRejectedProtectedBranch { .. }
                | Self::MissingRepoUrl { .. }
                | Self::Config(_)
        )
    }

    pub fn is_workspace_corrupt(&self) -> bool {
        matches!(self, Self::WorkspaceCorrupt { .. })
    }
}

pub type WorkerResult<T> = std::result::Result<T, WorkerError>;
