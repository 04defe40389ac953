//! Worker configuration.
//!
//! Settings are read from `worker.toml`, then overlaid by `EDIT_WORKER_*`
//! environment variables (a `.env` file is loaded first), then by CLI flags.
//!
//! ```toml
//! [worker]
//! id = "worker-a"
//! workspace_root = "/var/lib/edit-worker/workspaces"
//! database = "/var/lib/edit-worker/worker.db"
//! max_units = 1
//!
//! [claims]
//! renew_interval_secs = 30
//! reclaim_timeout_secs = 120
//! idle_timeout_secs = 600
//!
//! [git]
//! default_branch = "main"
//! protected_branches = ["production"]
//! conflict_policy = "prefer_local"
//!
//! [build]
//! command = "npm run build"
//! output_dir = "dist"
//!
//! [deploy]
//! domain = "sites.example.com"
//! mode = "mirror"
//! mirror_root = "/var/www"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::errors::WorkerError;
use crate::models::UnitId;
use crate::publish::DeployTarget;

/// Upper bound for the cancellation grace period. Interruption has to be fast.
const MAX_GRACE_PERIOD_SECS: u64 = 60;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default)]
    pub worker: WorkerSection,
    #[serde(default)]
    pub claims: ClaimsConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub git: GitConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub build: BuildConfig,
    #[serde(default)]
    pub deploy: DeployConfig,
    #[serde(default)]
    pub steps: StepsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSection {
    /// Stable worker identity. Re-claiming with the same id after a restart is idempotent.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default = "default_workspace_root")]
    pub workspace_root: PathBuf,
    #[serde(default = "default_database")]
    pub database: PathBuf,
    /// Number of units this worker may hold at once.
    #[serde(default = "default_max_units")]
    pub max_units: usize,
    /// History entries handed to the instruction executor.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("edit-worker")
}

fn default_workspace_root() -> PathBuf {
    data_dir().join("workspaces")
}

fn default_database() -> PathBuf {
    data_dir().join("worker.db")
}

fn default_max_units() -> usize {
    1
}

fn default_history_limit() -> usize {
    10
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            id: None,
            workspace_root: default_workspace_root(),
            database: default_database(),
            max_units: default_max_units(),
            history_limit: default_history_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimsConfig {
    #[serde(default = "default_renew_interval")]
    pub renew_interval_secs: u64,
    /// Age after which an external reaper may take a claim away.
    #[serde(default = "default_reclaim_timeout")]
    pub reclaim_timeout_secs: u64,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

fn default_renew_interval() -> u64 {
    30
}

fn default_reclaim_timeout() -> u64 {
    120
}

fn default_idle_timeout() -> u64 {
    600
}

impl Default for ClaimsConfig {
    fn default() -> Self {
        Self {
            renew_interval_secs: default_renew_interval(),
            reclaim_timeout_secs: default_reclaim_timeout(),
            idle_timeout_secs: default_idle_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_long_poll_secs")]
    pub long_poll_secs: u64,
    /// Processing attempts per message before it is dead-lettered.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_long_poll_secs() -> u64 {
    20
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    2000
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            long_poll_secs: default_long_poll_secs(),
            max_attempts: default_max_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

/// How textual conflicts are resolved when merging the remote thread branch before a push retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    #[default]
    PreferLocal,
    PreferRemote,
    Manual,
}

impl ConflictPolicy {
    /// Strategy option passed to `git merge -X`, if any.
    pub fn merge_strategy_option(&self) -> Option<&'static str> {
        match self {
            Self::PreferLocal => Some("ours"),
            Self::PreferRemote => Some("theirs"),
            Self::Manual => None,
        }
    }
}

impl std::str::FromStr for ConflictPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "prefer_local" | "local" => Ok(Self::PreferLocal),
            "prefer_remote" | "remote" => Ok(Self::PreferRemote),
            "manual" => Ok(Self::Manual),
            _ => anyhow::bail!(
                "Invalid conflict policy '{}'. Valid values: prefer_local, prefer_remote, manual",
                s
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitConfig {
    #[serde(default = "default_remote")]
    pub remote: String,
    #[serde(default = "default_branch")]
    pub default_branch: String,
    /// Extra branch names that must never be pushed by the worker.
    #[serde(default = "default_protected_branches")]
    pub protected_branches: Vec<String>,
    #[serde(default)]
    pub conflict_policy: ConflictPolicy,
    #[serde(default = "default_author_name")]
    pub author_name: String,
    #[serde(default = "default_author_email")]
    pub author_email: String,
}

fn default_remote() -> String {
    "origin".to_string()
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_protected_branches() -> Vec<String> {
    vec!["production".to_string()]
}

fn default_author_name() -> String {
    "edit-worker".to_string()
}

fn default_author_email() -> String {
    "edit-worker@localhost".to_string()
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            remote: default_remote(),
            default_branch: default_branch(),
            protected_branches: default_protected_branches(),
            conflict_policy: ConflictPolicy::default(),
            author_name: default_author_name(),
            author_email: default_author_email(),
        }
    }
}

impl GitConfig {
    /// The default branch plus every configured alias.
    pub fn all_protected(&self) -> Vec<String> {
        let mut branches = vec![self.default_branch.clone()];
        for b in &self.protected_branches {
            if !branches.contains(b) {
                branches.push(b.clone());
            }
        }
        branches
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default = "default_executor_cmd")]
    pub command: String,
    #[serde(default = "default_executor_args")]
    pub args: Vec<String>,
}

fn default_executor_cmd() -> String {
    "claude".to_string()
}

fn default_executor_args() -> Vec<String> {
    vec![
        "--print".to_string(),
        "--dangerously-skip-permissions".to_string(),
    ]
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            command: default_executor_cmd(),
            args: default_executor_args(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    #[serde(default = "default_build_cmd")]
    pub command: String,
    /// Output directory, relative to the workspace root.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

fn default_build_cmd() -> String {
    "npm run build".to_string()
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("dist")
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            command: default_build_cmd(),
            output_dir: default_output_dir(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeployMode {
    #[default]
    Mirror,
    Command,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployConfig {
    #[serde(default = "default_domain")]
    pub domain: String,
    #[serde(default)]
    pub mode: DeployMode,
    /// Root directory holding one sub-directory per hosting bucket (mirror mode).
    #[serde(default = "default_mirror_root")]
    pub mirror_root: PathBuf,
    /// Sync command template (command mode). `{source}` and `{bucket}` are substituted.
    #[serde(default = "default_sync_command")]
    pub sync_command: String,
}

fn default_domain() -> String {
    "localhost".to_string()
}

fn default_mirror_root() -> PathBuf {
    data_dir().join("sites")
}

fn default_sync_command() -> String {
    "aws s3 sync {source} s3://{bucket} --delete".to_string()
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            domain: default_domain(),
            mode: DeployMode::default(),
            mirror_root: default_mirror_root(),
            sync_command: default_sync_command(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepsConfig {
    /// Time between the graceful termination signal and a forced kill.
    #[serde(default = "default_grace_period")]
    pub grace_period_secs: u64,
}

fn default_grace_period() -> u64 {
    5
}

impl Default for StepsConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: default_grace_period(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
    /// Write daily-rolling log files here in addition to stderr.
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            directory: None,
        }
    }
}

impl WorkerConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse worker.toml")
    }

    /// Load from `path` if it exists, otherwise defaults; then apply environment overrides.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        let _ = dotenvy::dotenv();
        let mut config = if path.exists() {
            Self::load(path)?
        } else {
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Overlay values from the environment. `lookup` is injectable for tests.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(id) = lookup("EDIT_WORKER_ID") {
            self.worker.id = Some(id);
        }
        if let Some(db) = lookup("EDIT_WORKER_DATABASE") {
            self.worker.database = PathBuf::from(db);
        }
        if let Some(root) = lookup("EDIT_WORKER_WORKSPACE_ROOT") {
            self.worker.workspace_root = PathBuf::from(root);
        }
        if let Some(cmd) = lookup("EDIT_WORKER_EXECUTOR_CMD") {
            self.executor.command = cmd;
        }
        if let Some(cmd) = lookup("EDIT_WORKER_BUILD_CMD") {
            self.build.command = cmd;
        }
        if let Some(domain) = lookup("EDIT_WORKER_DEPLOY_DOMAIN") {
            self.deploy.domain = domain;
        }
        if let Some(json) = lookup("EDIT_WORKER_LOG_JSON") {
            self.logging.json = json != "false" && json != "0";
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize worker.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// The worker identity: configured id, else `$HOSTNAME`, else a fresh uuid.
    pub fn worker_id(&self) -> String {
        self.worker
            .id
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok().filter(|h| !h.is_empty()))
            .unwrap_or_else(|| format!("worker-{}", uuid::Uuid::new_v4()))
    }

    pub fn renew_interval(&self) -> Duration {
        Duration::from_secs(self.claims.renew_interval_secs)
    }

    pub fn reclaim_timeout(&self) -> Duration {
        Duration::from_secs(self.claims.reclaim_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.claims.idle_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.queue.poll_interval_ms)
    }

    pub fn long_poll(&self) -> Duration {
        Duration::from_secs(self.queue.long_poll_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.steps.grace_period_secs)
    }

    /// Non-fatal problems worth surfacing to the operator.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.build.command.trim().is_empty() {
            warnings.push("build.command is empty: every build will fail".to_string());
        }
        if self.deploy.domain.trim().is_empty() {
            warnings.push("deploy.domain is empty: preview URLs will be malformed".to_string());
        }
        if self.build.output_dir.is_absolute() {
            warnings.push(format!(
                "build.output_dir '{}' is absolute; it should be relative to the workspace root",
                self.build.output_dir.display()
            ));
        }
        if self.deploy.mode == DeployMode::Command
            && !self.deploy.sync_command.contains("{source}")
        {
            warnings.push("deploy.sync_command has no {source} placeholder".to_string());
        }
        warnings
    }

    /// Hard errors: the worker must not start with these.
    pub fn ensure_valid(&self) -> Result<(), WorkerError> {
        if self.claims.renew_interval_secs == 0
            || self.claims.renew_interval_secs >= self.claims.reclaim_timeout_secs
        {
            return Err(WorkerError::Config(format!(
                "claims.renew_interval_secs ({}) must be non-zero and shorter than claims.reclaim_timeout_secs ({})",
                self.claims.renew_interval_secs, self.claims.reclaim_timeout_secs
            )));
        }
        if self.steps.grace_period_secs == 0 || self.steps.grace_period_secs > MAX_GRACE_PERIOD_SECS
        {
            return Err(WorkerError::Config(format!(
                "steps.grace_period_secs must be between 1 and {} (got {})",
                MAX_GRACE_PERIOD_SECS, self.steps.grace_period_secs
            )));
        }
        if self.queue.max_attempts == 0 {
            return Err(WorkerError::Config(
                "queue.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.worker.max_units == 0 {
            return Err(WorkerError::Config(
                "worker.max_units must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolve the per-claim settings handed to the orchestrator.
    pub fn for_unit(&self, unit: &UnitId) -> UnitSettings {
        UnitSettings {
            unit: unit.clone(),
            workspace_path: self
                .worker
                .workspace_root
                .join(&unit.project_id)
                .join(&unit.user_id),
            deploy_target: DeployTarget::for_project(&unit.project_id, &self.deploy.domain),
            remote: self.git.remote.clone(),
            default_branch: self.git.default_branch.clone(),
            protected_branches: self.git.all_protected(),
            conflict_policy: self.git.conflict_policy,
            author_name: self.git.author_name.clone(),
            author_email: self.git.author_email.clone(),
            build_output_dir: self.build.output_dir.clone(),
            history_limit: self.worker.history_limit,
            grace_period: self.grace_period(),
        }
    }
}

/// Configuration resolved once per claimed unit.
#[derive(Debug, Clone)]
pub struct UnitSettings {
    pub unit: UnitId,
    pub workspace_path: PathBuf,
    pub deploy_target: DeployTarget,
    pub remote: String,
    pub default_branch: String,
    pub protected_branches: Vec<String>,
    pub conflict_policy: ConflictPolicy,
    pub author_name: String,
    pub author_email: String,
    pub build_output_dir: PathBuf,
    pub history_limit: usize,
    pub grace_period: Duration,
}
