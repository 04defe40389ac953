//! Artifact publishing: mirror a build output directory onto the hosting
//! target of a project.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::config::{DeployConfig, DeployMode};
use crate::step::{InterruptibleStep, StepOutcome, shell_command};

/// Hosting location for one project, derived from its id alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployTarget {
    pub bucket: String,
    pub url: String,
}

impl DeployTarget {
    pub fn for_project(project_id: &str, domain: &str) -> Self {
        let bucket = format!("edit.{}.{}", project_id, domain);
        let url = format!("https://{}", bucket);
        Self { bucket, url }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    Deployed { url: String },
    /// Nothing to publish, e.g. the build never produced its output directory.
    Skipped { reason: String },
    Failed { error: String },
}

#[async_trait]
pub trait ArtifactPublisher: Send + Sync {
    async fn publish(&self, source: &Path, target: &DeployTarget) -> PublishOutcome;
}

/// Build the publisher selected by the deploy configuration.
pub fn from_config(config: &DeployConfig, step: InterruptibleStep) -> Arc<dyn ArtifactPublisher> {
    match config.mode {
        DeployMode::Mirror => Arc::new(MirrorPublisher::new(config.mirror_root.clone())),
        DeployMode::Command => Arc::new(CommandPublisher::new(config.sync_command.clone(), step)),
    }
}

fn missing_source(source: &Path) -> Option<PublishOutcome> {
    if source.is_dir() {
        None
    } else {
        Some(PublishOutcome::Skipped {
            reason: format!("no build output at {}", source.display()),
        })
    }
}

/// Mirrors into `{root}/{bucket}` on the local filesystem.
#[derive(Debug, Clone)]
pub struct MirrorPublisher {
    root: PathBuf,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub copied: usize,
    pub unchanged: usize,
    pub removed: usize,
}

impl MirrorPublisher {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn destination(&self, target: &DeployTarget) -> PathBuf {
        self.root.join(&target.bucket)
    }
}

/// Make `dest` an exact copy of `source`, deleting anything `source` lacks.
pub fn mirror_sync(source: &Path, dest: &Path) -> Result<SyncStats> {
    let mut stats = SyncStats::default();
    std::fs::create_dir_all(dest)
        .with_context(|| format!("Failed to create {}", dest.display()))?;

    let mut keep: HashSet<PathBuf> = HashSet::new();
    for entry in WalkDir::new(source).min_depth(1) {
        let entry = entry.with_context(|| format!("Failed to walk {}", source.display()))?;
        let rel = entry.path().strip_prefix(source)?.to_path_buf();
        let target = dest.join(&rel);
        keep.insert(rel);

        if entry.file_type().is_dir() {
            if target.is_file() {
                std::fs::remove_file(&target)?;
            }
            std::fs::create_dir_all(&target)?;
            continue;
        }
        if target.is_dir() {
            std::fs::remove_dir_all(&target)?;
        }
        let data = std::fs::read(entry.path())
            .with_context(|| format!("Failed to read {}", entry.path().display()))?;
        if std::fs::read(&target).ok().as_deref() == Some(data.as_slice()) {
            stats.unchanged += 1;
            continue;
        }
        std::fs::write(&target, &data)
            .with_context(|| format!("Failed to write {}", target.display()))?;
        stats.copied += 1;
    }

    // Deepest paths first so directories are empty by the time we reach them.
    let mut stale: Vec<(PathBuf, bool)> = Vec::new();
    for entry in WalkDir::new(dest).min_depth(1).contents_first(true) {
        let entry = entry.with_context(|| format!("Failed to walk {}", dest.display()))?;
        let rel = entry.path().strip_prefix(dest)?.to_path_buf();
        if !keep.contains(&rel) {
            stale.push((entry.path().to_path_buf(), entry.file_type().is_dir()));
        }
    }
    for (path, is_dir) in stale {
        if is_dir {
            std::fs::remove_dir_all(&path).ok();
        } else {
            std::fs::remove_file(&path)
                .with_context(|| format!("Failed to remove {}", path.display()))?;
            stats.removed += 1;
        }
    }
    Ok(stats)
}

#[async_trait]
impl ArtifactPublisher for MirrorPublisher {
    async fn publish(&self, source: &Path, target: &DeployTarget) -> PublishOutcome {
        if let Some(skipped) = missing_source(source) {
            return skipped;
        }
        let (source, dest) = (source.to_path_buf(), self.destination(target));
        let result = tokio::task::spawn_blocking(move || mirror_sync(&source, &dest)).await;
        match result {
            Ok(Ok(stats)) => {
                info!(
                    bucket = %target.bucket,
                    copied = stats.copied,
                    unchanged = stats.unchanged,
                    removed = stats.removed,
                    "Published site"
                );
                PublishOutcome::Deployed {
                    url: target.url.clone(),
                }
            }
            Ok(Err(e)) => PublishOutcome::Failed {
                error: format!("{:#}", e),
            },
            Err(e) => PublishOutcome::Failed {
                error: format!("Sync task panicked: {}", e),
            },
        }
    }
}

/// Delegates the mirror-sync to an external command such as
/// `aws s3 sync {source} s3://{bucket} --delete`.
#[derive(Debug, Clone)]
pub struct CommandPublisher {
    template: String,
    step: InterruptibleStep,
}

impl CommandPublisher {
    pub fn new(template: String, step: InterruptibleStep) -> Self {
        Self { template, step }
    }

    pub fn render(&self, source: &Path, target: &DeployTarget) -> String {
        self.template
            .replace("{source}", &source.to_string_lossy())
            .replace("{bucket}", &target.bucket)
            .replace("{url}", &target.url)
    }
}

#[async_trait]
impl ArtifactPublisher for CommandPublisher {
    async fn publish(&self, source: &Path, target: &DeployTarget) -> PublishOutcome {
        if let Some(skipped) = missing_source(source) {
            return skipped;
        }
        let script = self.render(source, target);
        // Deploys are not preemptible; the token is never cancelled.
        let outcome = self
            .step
            .run(shell_command(&script, source), None, &CancellationToken::new())
            .await;
        match outcome {
            StepOutcome::Completed(_) => {
                info!(bucket = %target.bucket, "Published site");
                PublishOutcome::Deployed {
                    url: target.url.clone(),
                }
            }
            StepOutcome::Failed { error, output } => {
                warn!(bucket = %target.bucket, error = %error, "Sync command failed");
                PublishOutcome::Failed {
                    error: format!("{}: {}", error, output.tail(5)),
                }
            }
            StepOutcome::Cancelled(_) => PublishOutcome::Failed {
                error: "sync command was cancelled".to_string(),
            },
        }
    }
}
