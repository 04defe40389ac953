//! Instruction executor seam.
//!
//! The orchestrator depends only on `execute(instruction, workspace, history)`;
//! how an instruction becomes file edits is the executor's business.

use std::path::Path;

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::ExecutorConfig;
use crate::models::HistoryEntry;
use crate::step::{InterruptibleStep, StepOutcome};
use crate::vcs;

/// What an executor reports for one instruction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Execution {
    pub success: bool,
    pub output: String,
    pub files_changed: Vec<String>,
}

#[async_trait]
pub trait InstructionExecutor: Send + Sync {
    /// Apply `instruction` to the checkout at `workspace`. Cancellation must
    /// return `StepOutcome::Cancelled` with whatever output exists.
    async fn execute(
        &self,
        instruction: &str,
        workspace: &Path,
        history: &[HistoryEntry],
        cancel: &CancellationToken,
    ) -> StepOutcome<Execution>;
}

/// Runs an external agent CLI with the prompt on stdin.
pub struct CommandExecutor {
    command: String,
    args: Vec<String>,
    step: InterruptibleStep,
}

impl CommandExecutor {
    pub fn new(config: &ExecutorConfig, step: InterruptibleStep) -> Self {
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
            step,
        }
    }
}

/// Prompt handed to the agent: prior turns of the thread, then the instruction.
pub fn build_prompt(instruction: &str, history: &[HistoryEntry]) -> String {
    let mut prompt = String::new();
    if !history.is_empty() {
        prompt.push_str("## Previous instructions in this thread\n\n");
        for (i, entry) in history.iter().enumerate() {
            let outcome = if entry.interrupted {
                "interrupted"
            } else if entry.success {
                "done"
            } else {
                "failed"
            };
            prompt.push_str(&format!(
                "{}. {} ({})\n   Result: {}\n",
                i + 1,
                entry.instruction.trim(),
                outcome,
                entry.summary.trim()
            ));
        }
        prompt.push('\n');
    }
    prompt.push_str("## Instruction\n\n");
    prompt.push_str(instruction.trim());
    prompt.push('\n');
    prompt
}

#[async_trait]
impl InstructionExecutor for CommandExecutor {
    async fn execute(
        &self,
        instruction: &str,
        workspace: &Path,
        history: &[HistoryEntry],
        cancel: &CancellationToken,
    ) -> StepOutcome<Execution> {
        let prompt = build_prompt(instruction, history);
        debug!(chars = prompt.len(), history = history.len(), "Built executor prompt");

        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args).current_dir(workspace);

        match self.step.run(cmd, Some(prompt), cancel).await {
            StepOutcome::Completed(output) => {
                let files_changed = match vcs::changed_paths(workspace) {
                    Ok(files) => files,
                    Err(e) => {
                        return StepOutcome::Failed {
                            error: format!("Could not inspect workspace after edit: {:#}", e),
                            output,
                        };
                    }
                };
                info!(files = files_changed.len(), "Executor finished");
                StepOutcome::Completed(Execution {
                    success: true,
                    output: output.stdout,
                    files_changed,
                })
            }
            StepOutcome::Cancelled(partial) => StepOutcome::Cancelled(partial),
            StepOutcome::Failed { error, output } => StepOutcome::Failed { error, output },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::time::Duration;
    use tempfile::tempdir;

    fn entry(instruction: &str, success: bool, interrupted: bool) -> HistoryEntry {
        HistoryEntry {
            command_id: "c".into(),
            instruction: instruction.into(),
            summary: "ok".into(),
            success,
            interrupted,
            commit_ref: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_prompt_without_history_is_just_instruction() {
        assert_eq!(build_prompt("  make it blue ", &[]), "## Instruction\n\nmake it blue\n");
    }

    #[test]
    fn test_prompt_lists_history_in_order() {
        let history = vec![entry("add a header", true, false), entry("add footer", false, true)];
        let prompt = build_prompt("change colors", &history);
        let header = prompt.find("1. add a header (done)").unwrap();
        let footer = prompt.find("2. add footer (interrupted)").unwrap();
        assert!(header < footer);
        assert!(prompt.ends_with("change colors\n"));
    }

    #[tokio::test]
    async fn test_command_executor_reports_changed_files() {
        let dir = tempdir().unwrap();
        git2::Repository::init(dir.path()).unwrap();
        let config = ExecutorConfig {
            command: "sh".into(),
            args: vec!["-c".into(), "cat > prompt.txt; echo edited".into()],
        };
        let executor = CommandExecutor::new(&config, InterruptibleStep::new(Duration::from_secs(1)));
        let outcome = executor
            .execute("write a file", dir.path(), &[], &CancellationToken::new())
            .await;
        let StepOutcome::Completed(execution) = outcome else {
            panic!("expected completion, got {:?}", outcome);
        };
        assert!(execution.success);
        assert_eq!(execution.output, "edited\n");
        assert_eq!(execution.files_changed, vec!["prompt.txt".to_string()]);
        let written = std::fs::read_to_string(dir.path().join("prompt.txt")).unwrap();
        assert!(written.contains("write a file"));
    }

    #[tokio::test]
    async fn test_command_executor_failure_keeps_output() {
        let dir = tempdir().unwrap();
        git2::Repository::init(dir.path()).unwrap();
        let config = ExecutorConfig {
            command: "sh".into(),
            args: vec!["-c".into(), "echo 'rate limited' 1>&2; exit 2".into()],
        };
        let executor = CommandExecutor::new(&config, InterruptibleStep::new(Duration::from_secs(1)));
        let outcome = executor
            .execute("anything", dir.path(), &[], &CancellationToken::new())
            .await;
        let StepOutcome::Failed { output, .. } = outcome else {
            panic!("expected failure");
        };
        assert!(output.stderr.contains("rate limited"));
    }
}
