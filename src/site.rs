//! Static-site build step.

use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::BuildConfig;
use crate::step::{InterruptibleStep, StepOutcome, StepOutput, shell_command};

/// Runs the configured build command at the workspace root.
#[derive(Debug, Clone)]
pub struct SiteBuilder {
    command: String,
    output_dir: PathBuf,
    step: InterruptibleStep,
}

impl SiteBuilder {
    pub fn new(config: &BuildConfig, step: InterruptibleStep) -> Self {
        Self {
            command: config.command.clone(),
            output_dir: config.output_dir.clone(),
            step,
        }
    }

    /// Where the build leaves its artifacts for a given checkout.
    pub fn output_path(&self, root: &Path) -> PathBuf {
        root.join(&self.output_dir)
    }

    /// Run the build. An empty command means the checkout is served as-is.
    pub async fn build(&self, root: &Path, cancel: &CancellationToken) -> StepOutcome {
        if self.command.trim().is_empty() {
            return StepOutcome::Completed(StepOutput::default());
        }
        info!(command = %self.command, root = %root.display(), "Building site");
        self.step
            .run(shell_command(&self.command, root), None, cancel)
            .await
    }
}
