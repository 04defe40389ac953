//! Test doubles and git fixtures shared by the orchestrator tests.

use std::path::{Path, PathBuf};
use std::process::Command as StdCommand;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use crate::executor::{Execution, InstructionExecutor};
use crate::models::{HistoryEntry, WorkMessage};
use crate::publish::{ArtifactPublisher, DeployTarget, PublishOutcome};
use crate::step::{StepOutcome, StepOutput};

/// Interprets instructions as tiny scripts:
///
/// - `noop`: succeed without touching anything
/// - `wait`: block until cancelled, change nothing
/// - `slow NAME`: write `NAME`, then block until cancelled
/// - `fail NAME`: write `NAME`, then fail
/// - `corrupt NAME`: write `NAME` and leave a stale `.git/index.lock` behind
/// - `corrupt-once NAME`: like `corrupt` on the first call only
/// - anything else: write a file named after the instruction
#[derive(Default)]
pub struct ScriptedExecutor {
    calls: Mutex<Vec<(String, usize)>>,
}

impl ScriptedExecutor {
    /// `(instruction, history length)` per call, in call order.
    pub fn calls(&self) -> Vec<(String, usize)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl InstructionExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        instruction: &str,
        workspace: &Path,
        history: &[HistoryEntry],
        cancel: &CancellationToken,
    ) -> StepOutcome<Execution> {
        let seen = {
            let mut calls = self.calls.lock().unwrap();
            calls.push((instruction.to_string(), history.len()));
            calls.iter().filter(|(i, _)| i == instruction).count()
        };
        match instruction.split_once(' ') {
            _ if instruction == "noop" => StepOutcome::Completed(Execution {
                success: true,
                output: "nothing to do".into(),
                files_changed: vec![],
            }),
            _ if instruction == "wait" => {
                cancel.cancelled().await;
                StepOutcome::Cancelled(StepOutput::default())
            }
            Some(("slow", name)) => {
                std::fs::write(workspace.join(name), "partial").unwrap();
                cancel.cancelled().await;
                StepOutcome::Cancelled(StepOutput {
                    stdout: format!("started {}", name),
                    ..Default::default()
                })
            }
            Some((kind @ ("corrupt" | "corrupt-once"), name)) => {
                std::fs::write(workspace.join(name), instruction).unwrap();
                if kind == "corrupt" || seen == 1 {
                    std::fs::write(workspace.join(".git/index.lock"), "").unwrap();
                }
                StepOutcome::Completed(Execution {
                    success: true,
                    output: format!("wrote {}", name),
                    files_changed: vec![name.to_string()],
                })
            }
            Some(("fail", name)) => {
                std::fs::write(workspace.join(name), "half done").unwrap();
                StepOutcome::Failed {
                    error: "Process exited with code 1".into(),
                    output: StepOutput {
                        stderr: "agent crashed".into(),
                        ..Default::default()
                    },
                }
            }
            _ => {
                std::fs::write(workspace.join(instruction), instruction).unwrap();
                StepOutcome::Completed(Execution {
                    success: true,
                    output: format!("wrote {}", instruction),
                    files_changed: vec![instruction.to_string()],
                })
            }
        }
    }
}

/// Records every publish of an existing directory.
#[derive(Default)]
pub struct RecordingPublisher {
    published: Mutex<Vec<PathBuf>>,
}

impl RecordingPublisher {
    pub fn published(&self) -> Vec<PathBuf> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl ArtifactPublisher for RecordingPublisher {
    async fn publish(&self, source: &Path, target: &DeployTarget) -> PublishOutcome {
        if !source.exists() {
            return PublishOutcome::Skipped {
                reason: "missing".into(),
            };
        }
        self.published.lock().unwrap().push(source.to_path_buf());
        PublishOutcome::Deployed {
            url: target.url.clone(),
        }
    }
}

pub fn git(dir: &Path, args: &[&str]) -> String {
    let out = StdCommand::new("git")
        .args(["-c", "user.name=t", "-c", "user.email=t@localhost"])
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap();
    assert!(
        out.status.success(),
        "git {:?}: {}",
        args,
        String::from_utf8_lossy(&out.stderr)
    );
    String::from_utf8_lossy(&out.stdout).to_string()
}

/// A bare remote with one commit on `main`. Nothing is ignored, so build
/// output lands in the checkout as untracked files.
pub fn seeded_remote(dir: &TempDir) -> PathBuf {
    let remote = dir.path().join("remote.git");
    std::fs::create_dir_all(&remote).unwrap();
    git(&remote, &["init", "--bare", "-b", "main"]);
    git(dir.path(), &["clone", remote.to_str().unwrap(), "seed"]);
    let seed = dir.path().join("seed");
    git(&seed, &["symbolic-ref", "HEAD", "refs/heads/main"]);
    std::fs::write(seed.join("index.html"), "<h1>site</h1>\n").unwrap();
    git(&seed, &["add", "-A"]);
    git(&seed, &["commit", "-m", "initial"]);
    git(&seed, &["push", "origin", "main"]);
    remote
}

pub fn message(
    command_id: &str,
    thread_id: &str,
    instruction: &str,
    repo_url: Option<&Path>,
) -> WorkMessage {
    WorkMessage {
        session_id: "s-1".into(),
        command_id: command_id.into(),
        thread_id: thread_id.into(),
        instruction: instruction.into(),
        repo_url: repo_url.map(|p| p.to_string_lossy().to_string()),
        timestamp: Utc::now(),
    }
}
