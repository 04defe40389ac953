use std::path::{Component, Path, PathBuf};
use std::process::Stdio;

use anyhow::Context;
use chrono::Utc;
use git2::{BranchType, Repository, RepositoryState, StatusOptions};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::branch_for_thread;
use crate::config::{ConflictPolicy, UnitSettings};
use crate::errors::{WorkerError, WorkerResult};
use crate::models::WorkspaceState;

/// Label prefix for stashes created by `safe_switch`.
pub const STASH_PREFIX: &str = "edit-worker-autostash";

/// stderr fragments that mean the checkout itself is broken, not the request.
const CORRUPTION_MARKERS: &[&str] = &[
    "not a git repository",
    "index.lock",
    "unmerged",
    "you have not concluded your merge",
    "needs merge",
    "corrupt",
    "bad object",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed(String),
    NoChanges,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    Pushed { merged: bool },
    /// The remote moved ahead and merging it back failed.
    Conflict { detail: String },
    /// The push failed for a reason merging cannot fix.
    Rejected { detail: String },
}

struct GitOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

/// One checked-out repository owned by a claimed unit.
#[derive(Debug, Clone)]
pub struct GitWorkspace {
    root: PathBuf,
    remote: String,
    default_branch: String,
    protected_branches: Vec<String>,
    conflict_policy: ConflictPolicy,
    author_name: String,
    author_email: String,
    /// Build output, relative to the root. Never reported, staged or stashed.
    output_prefix: Option<String>,
}

impl GitWorkspace {
    pub fn new(settings: &UnitSettings) -> Self {
        Self {
            root: settings.workspace_path.clone(),
            remote: settings.remote.clone(),
            default_branch: settings.default_branch.clone(),
            protected_branches: settings.protected_branches.clone(),
            conflict_policy: settings.conflict_policy,
            author_name: settings.author_name.clone(),
            author_email: settings.author_email.clone(),
            output_prefix: output_prefix(&settings.build_output_dir),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether a checkout exists at the workspace root.
    pub fn exists(&self) -> bool {
        self.root.join(".git").exists()
    }

    pub fn is_protected(&self, branch: &str) -> bool {
        self.protected_branches.iter().any(|b| b == branch)
    }

    fn repo(&self) -> WorkerResult<Repository> {
        Repository::open(&self.root).map_err(|e| WorkerError::WorkspaceCorrupt {
            path: self.root.clone(),
            detail: e.message().to_string(),
        })
    }

    fn inspect_err(&self, e: git2::Error) -> WorkerError {
        WorkerError::Git {
            command: "inspect".to_string(),
            stderr: e.message().to_string(),
        }
    }

    async fn run_in(&self, dir: &Path, args: &[&str]) -> WorkerResult<GitOutput> {
        let output = Command::new("git")
            .arg("-c")
            .arg(format!("user.name={}", self.author_name))
            .arg("-c")
            .arg(format!("user.email={}", self.author_email))
            .args(args)
            .current_dir(dir)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| WorkerError::Git {
                command: args.first().copied().unwrap_or_default().to_string(),
                stderr: format!("failed to spawn git: {}", e),
            })?;
        Ok(GitOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    async fn run(&self, args: &[&str]) -> WorkerResult<GitOutput> {
        self.run_in(&self.root, args).await
    }

    /// Run git and turn a non-zero exit into a classified error.
    async fn git(&self, args: &[&str]) -> WorkerResult<String> {
        let output = self.run(args).await?;
        if output.success {
            Ok(output.stdout)
        } else {
            Err(self.classify(args, &output.stderr))
        }
    }

    fn classify(&self, args: &[&str], stderr: &str) -> WorkerError {
        let lowered = stderr.to_lowercase();
        if CORRUPTION_MARKERS.iter().any(|m| lowered.contains(m)) {
            WorkerError::WorkspaceCorrupt {
                path: self.root.clone(),
                detail: stderr.trim().to_string(),
            }
        } else {
            WorkerError::Git {
                command: args.join(" "),
                stderr: stderr.trim().to_string(),
            }
        }
    }

    /// Clone `url` into the workspace root. First contact with a unit only.
    pub async fn clone_from(&self, url: &str) -> WorkerResult<()> {
        let parent = self.root.parent().unwrap_or(Path::new("."));
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| WorkerError::Other(e.into()))?;
        let target = self
            .root
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| WorkerError::Config(format!("bad workspace path {}", self.root.display())))?;
        let output = self
            .run_in(parent, &["clone", "--origin", &self.remote, url, &target])
            .await?;
        if !output.success {
            return Err(WorkerError::Git {
                command: "clone".to_string(),
                stderr: output.stderr.trim().to_string(),
            });
        }
        info!(root = %self.root.display(), "Cloned workspace");
        Ok(())
    }

    pub fn current_branch(&self) -> WorkerResult<Option<String>> {
        let repo = self.repo()?;
        let name = match repo.head() {
            Ok(head) if head.is_branch() => head.shorthand().map(str::to_string),
            Ok(_) => None,
            // Unborn HEAD still names a branch.
            Err(_) => repo
                .find_reference("HEAD")
                .ok()
                .and_then(|r| r.symbolic_target().map(str::to_string))
                .and_then(|t| t.strip_prefix("refs/heads/").map(str::to_string)),
        };
        Ok(name)
    }

    pub fn head_commit(&self) -> WorkerResult<Option<String>> {
        let repo = self.repo()?;
        Ok(repo
            .head()
            .ok()
            .and_then(|h| h.peel_to_commit().ok())
            .map(|c| c.id().to_string()))
    }

    /// Whether `path` lies inside the build output directory.
    pub fn is_build_output(&self, path: &str) -> bool {
        match &self.output_prefix {
            Some(prefix) => {
                path == prefix
                    || path
                        .strip_prefix(prefix.as_str())
                        .is_some_and(|rest| rest.starts_with('/'))
            }
            None => false,
        }
    }

    /// Drop build output paths from `paths`.
    pub fn source_paths(&self, mut paths: Vec<String>) -> Vec<String> {
        paths.retain(|p| !self.is_build_output(p));
        paths
    }

    /// Paths with uncommitted changes, untracked files included, sorted.
    /// Build output is not a change.
    pub fn changed_files(&self) -> WorkerResult<Vec<String>> {
        let repo = self.repo()?;
        let paths = status_paths(&repo).map_err(|e| self.inspect_err(e))?;
        Ok(self.source_paths(paths))
    }

    /// Pathspec covering the whole tree minus the build output.
    fn source_pathspec(&self) -> Vec<String> {
        let mut spec = vec![".".to_string()];
        if let Some(prefix) = &self.output_prefix {
            spec.push(format!(":(exclude){}", prefix));
        }
        spec
    }

    pub fn is_dirty(&self) -> WorkerResult<bool> {
        Ok(!self.changed_files()?.is_empty())
    }

    fn local_branch_exists(&self, branch: &str) -> WorkerResult<bool> {
        let repo = self.repo()?;
        Ok(repo.find_branch(branch, BranchType::Local).is_ok())
    }

    fn remote_ref_exists(&self, branch: &str) -> WorkerResult<bool> {
        let repo = self.repo()?;
        let name = format!("refs/remotes/{}/{}", self.remote, branch);
        Ok(repo.find_reference(&name).is_ok())
    }

    /// Fetch one branch from the remote. `false` when the remote lacks it.
    async fn fetch_branch(&self, branch: &str) -> WorkerResult<bool> {
        let output = self.run(&["fetch", &self.remote, branch]).await?;
        if !output.success {
            debug!(branch, stderr = %output.stderr.trim(), "Remote branch not fetched");
            return Ok(false);
        }
        self.remote_ref_exists(branch)
    }

    /// Stash labels for entries created when switching away from `branch`,
    /// most recent first, as `(index, message)`.
    fn autostashes_for(&self, branch: Option<&str>) -> WorkerResult<Vec<(usize, String)>> {
        let mut repo = self.repo()?;
        let needle = branch.map(|b| format!("{}:{}:", STASH_PREFIX, b));
        let mut found = Vec::new();
        repo.stash_foreach(|index, message, _oid| {
            let matches = match &needle {
                Some(n) => message.contains(n.as_str()),
                None => message.contains(STASH_PREFIX),
            };
            if matches {
                found.push((index, message.to_string()));
            }
            true
        })
        .map_err(|e| self.inspect_err(e))?;
        Ok(found)
    }

    pub fn state(&self) -> WorkerResult<WorkspaceState> {
        Ok(WorkspaceState {
            root: self.root.clone(),
            branch: self.current_branch()?,
            dirty: self.is_dirty()?,
            pending_stash: !self.autostashes_for(None)?.is_empty(),
        })
    }

    /// Check out the thread's branch, creating it if needed. Returns its name.
    pub async fn ensure_branch(&self, thread_id: &str) -> WorkerResult<String> {
        let branch = branch_for_thread(thread_id);
        self.safe_switch(&branch).await?;
        Ok(branch)
    }

    /// Switch branches without losing uncommitted work.
    ///
    /// Dirty changes are stashed under a label naming the branch they came
    /// from; a stash left behind by an earlier switch away from `target` is
    /// re-applied once `target` is checked out.
    pub async fn safe_switch(&self, target: &str) -> WorkerResult<()> {
        let from = self.current_branch()?;
        if from.as_deref() == Some(target) {
            return Ok(());
        }

        if self.is_dirty()? {
            let label = format!(
                "{}:{}:{}",
                STASH_PREFIX,
                from.as_deref().unwrap_or("detached"),
                Utc::now().format("%Y%m%dT%H%M%S%.3fZ")
            );
            let pathspec = self.source_pathspec();
            let mut args = vec!["stash", "push", "--include-untracked", "-m", label.as_str(), "--"];
            args.extend(pathspec.iter().map(String::as_str));
            self.git(&args).await?;
            info!(label = %label, "Stashed uncommitted changes before switch");
        }

        if let Err(e) = self.checkout_or_create(target).await {
            warn!(target, error = %e, "Branch switch failed, restoring stashed work");
            if let Some(from) = from.as_deref() {
                self.restore_autostash(from).await;
            }
            return Err(e);
        }

        self.restore_autostash(target).await;
        info!(from = ?from, to = target, "Switched branch");
        Ok(())
    }

    async fn checkout_or_create(&self, target: &str) -> WorkerResult<()> {
        if self.local_branch_exists(target)? {
            self.git(&["checkout", target]).await?;
            return Ok(());
        }
        if self.fetch_branch(target).await? {
            let upstream = format!("{}/{}", self.remote, target);
            self.git(&["checkout", "-b", target, "--track", &upstream])
                .await?;
            return Ok(());
        }
        match self.start_point().await? {
            Some(start) => {
                self.git(&["checkout", "--no-track", "-b", target, &start])
                    .await?;
            }
            None => {
                self.git(&["checkout", "-b", target]).await?;
            }
        }
        debug!(target, "Created branch");
        Ok(())
    }

    /// Where new thread branches start: remote default, local default, HEAD.
    async fn start_point(&self) -> WorkerResult<Option<String>> {
        if self.fetch_branch(&self.default_branch).await? {
            return Ok(Some(format!("{}/{}", self.remote, self.default_branch)));
        }
        if self.local_branch_exists(&self.default_branch)? {
            return Ok(Some(self.default_branch.clone()));
        }
        Ok(self.head_commit()?.map(|_| "HEAD".to_string()))
    }

    /// Re-apply the newest stash taken when leaving `branch`. A stash that does
    /// not apply cleanly is kept, never dropped.
    async fn restore_autostash(&self, branch: &str) {
        let stashes = match self.autostashes_for(Some(branch)) {
            Ok(s) => s,
            Err(e) => {
                warn!(branch, error = %e, "Could not list stashes");
                return;
            }
        };
        let Some((index, label)) = stashes.into_iter().next() else {
            return;
        };
        let reference = format!("stash@{{{}}}", index);
        match self.git(&["stash", "apply", &reference]).await {
            Ok(_) => {
                if let Err(e) = self.git(&["stash", "drop", &reference]).await {
                    warn!(stash = %label, error = %e, "Applied stash but could not drop it");
                } else {
                    info!(stash = %label, "Restored stashed changes");
                }
            }
            Err(e) => {
                warn!(stash = %label, error = %e, "Stash did not apply cleanly, keeping it");
                self.discard_partial_apply(&reference).await;
            }
        }
    }

    /// Undo a stash apply that stopped half way: reset tracked files and
    /// remove the untracked files it had already restored.
    async fn discard_partial_apply(&self, reference: &str) {
        if let Err(e) = self.git(&["reset", "--hard", "HEAD"]).await {
            warn!(error = %e, "Failed to reset after stash conflict");
        }
        // The third parent of a stash commit holds its untracked files.
        let untracked = format!("{}^3", reference);
        let listed = match self
            .run(&["ls-tree", "-r", "--name-only", &untracked])
            .await
        {
            Ok(output) if output.success => output.stdout,
            Ok(_) => return,
            Err(e) => {
                warn!(error = %e, "Could not list stashed untracked files");
                return;
            }
        };
        let paths: Vec<&str> = listed.lines().filter(|l| !l.is_empty()).collect();
        if paths.is_empty() {
            return;
        }
        let mut args = vec!["clean", "-f", "-d", "--"];
        args.extend(paths.iter().copied());
        match self.git(&args).await {
            Ok(_) => debug!(files = paths.len(), "Removed partially restored untracked files"),
            Err(e) => warn!(error = %e, "Failed to clean after stash conflict"),
        }
    }

    /// Stage everything and commit. `NoChanges` when the tree is clean.
    pub async fn commit(&self, message: &str) -> WorkerResult<CommitOutcome> {
        if !self.is_dirty()? {
            return Ok(CommitOutcome::NoChanges);
        }
        let pathspec = self.source_pathspec();
        let mut args = vec!["add", "-A", "--"];
        args.extend(pathspec.iter().map(String::as_str));
        self.git(&args).await?;
        self.git(&["commit", "--no-verify", "-m", message]).await?;
        let sha = self.head_commit()?.ok_or_else(|| WorkerError::Git {
            command: "commit".to_string(),
            stderr: "HEAD does not resolve after commit".to_string(),
        })?;
        info!(commit = %sha, "Committed changes");
        Ok(CommitOutcome::Committed(sha))
    }

    /// Local commits on `branch` the remote has not seen.
    pub fn commits_ahead(&self, branch: &str) -> WorkerResult<usize> {
        let repo = self.repo()?;
        let Ok(local) = repo.find_branch(branch, BranchType::Local) else {
            return Ok(0);
        };
        let Some(tip) = local.get().target() else {
            return Ok(0);
        };
        let mut walk = repo.revwalk().map_err(|e| self.inspect_err(e))?;
        walk.push(tip).map_err(|e| self.inspect_err(e))?;
        let tracking = format!("refs/remotes/{}/{}", self.remote, branch);
        if let Ok(remote) = repo.find_reference(&tracking)
            && let Some(oid) = remote.target()
        {
            walk.hide(oid).map_err(|e| self.inspect_err(e))?;
        } else {
            // Never pushed: count what no remote branch already has.
            walk.hide_glob(&format!("refs/remotes/{}/*", self.remote))
                .map_err(|e| self.inspect_err(e))?;
        }
        Ok(walk.filter(|r| r.is_ok()).count())
    }

    /// Push `branch`, merging the remote back in once if it moved ahead.
    ///
    /// Protected branches are refused outright: no push, no merge, no retry.
    pub async fn push(&self, branch: &str) -> WorkerResult<PushOutcome> {
        if self.is_protected(branch) {
            return Err(WorkerError::PushRejectedProtectedBranch {
                branch: branch.to_string(),
            });
        }

        let first = self.run(&["push", "-u", &self.remote, branch]).await?;
        if first.success {
            info!(branch, "Pushed");
            return Ok(PushOutcome::Pushed { merged: false });
        }
        if !is_remote_ahead(&first.stderr) {
            warn!(branch, stderr = %first.stderr.trim(), "Push rejected");
            return Ok(PushOutcome::Rejected {
                detail: first.stderr.trim().to_string(),
            });
        }

        info!(branch, policy = ?self.conflict_policy, "Remote is ahead, merging before retry");
        if !self.fetch_branch(branch).await? {
            return Ok(PushOutcome::Rejected {
                detail: format!("could not fetch {}/{}", self.remote, branch),
            });
        }
        if let Err(detail) = self.merge_remote(branch).await? {
            return Ok(PushOutcome::Conflict { detail });
        }

        let retry = self.run(&["push", "-u", &self.remote, branch]).await?;
        if retry.success {
            info!(branch, "Pushed after merge");
            Ok(PushOutcome::Pushed { merged: true })
        } else {
            warn!(branch, stderr = %retry.stderr.trim(), "Push failed after merge");
            Ok(PushOutcome::Conflict {
                detail: retry.stderr.trim().to_string(),
            })
        }
    }

    /// Merge the fetched remote branch. The inner `Err` carries a conflict
    /// that the configured policy could not resolve; the merge is aborted.
    async fn merge_remote(&self, branch: &str) -> WorkerResult<Result<(), String>> {
        let upstream = format!("{}/{}", self.remote, branch);
        let strategy = self
            .conflict_policy
            .merge_strategy_option()
            .map(|option| format!("-X{}", option));
        let mut args = vec!["merge", "--no-edit", "--no-verify"];
        if let Some(strategy) = &strategy {
            args.push(strategy);
        }
        args.push(&upstream);

        let output = self.run(&args).await?;
        if output.success {
            return Ok(Ok(()));
        }
        let detail = format!("{}{}", output.stdout.trim(), output.stderr.trim());
        warn!(branch, detail = %detail, "Merge failed, aborting");
        if let Err(e) = self.git(&["merge", "--abort"]).await {
            warn!(error = %e, "merge --abort failed, resetting");
            self.git(&["reset", "--hard", "HEAD"]).await?;
        }
        Ok(Err(detail))
    }

    /// Bring a broken checkout back to the last commit on the current branch.
    ///
    /// Safe to call speculatively: a healthy workspace is left untouched.
    pub async fn recover(&self) -> WorkerResult<()> {
        if !self.exists() {
            return Ok(());
        }
        let lock = self.root.join(".git").join("index.lock");
        if lock.exists() {
            warn!(path = %lock.display(), "Removing stale index lock");
            std::fs::remove_file(&lock).map_err(|e| WorkerError::WorkspaceCorrupt {
                path: self.root.clone(),
                detail: format!("cannot remove index.lock: {}", e),
            })?;
        }

        let (state, conflicted) = {
            let repo = self.repo()?;
            let conflicted = repo.index().map(|i| i.has_conflicts()).unwrap_or(true);
            (repo.state(), conflicted)
        };
        if state == RepositoryState::Clean && !conflicted {
            return Ok(());
        }

        warn!(state = ?state, conflicted, root = %self.root.display(), "Recovering workspace");
        let abort: Option<&[&str]> = match state {
            RepositoryState::Merge => Some(&["merge", "--abort"][..]),
            RepositoryState::Rebase
            | RepositoryState::RebaseInteractive
            | RepositoryState::RebaseMerge => Some(&["rebase", "--abort"][..]),
            RepositoryState::ApplyMailbox | RepositoryState::ApplyMailboxOrRebase => {
                Some(&["am", "--abort"][..])
            }
            RepositoryState::CherryPick | RepositoryState::CherryPickSequence => {
                Some(&["cherry-pick", "--abort"][..])
            }
            RepositoryState::Revert | RepositoryState::RevertSequence => {
                Some(&["revert", "--abort"][..])
            }
            _ => None,
        };
        if let Some(args) = abort
            && let Err(e) = self.git(args).await
        {
            warn!(error = %e, "Abort failed, falling back to hard reset");
        }

        if self.head_commit()?.is_some() {
            self.git(&["reset", "--hard", "HEAD"]).await?;
        }
        let repo = self.repo()?;
        repo.cleanup_state().map_err(|e| self.inspect_err(e))?;
        info!(root = %self.root.display(), "Workspace recovered");
        Ok(())
    }
}

/// `dir` as a forward-slash path relative to the root, `None` when it names
/// the root itself or escapes it.
fn output_prefix(dir: &Path) -> Option<String> {
    let mut parts = Vec::new();
    for component in dir.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().to_string()),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

fn status_paths(repo: &Repository) -> Result<Vec<String>, git2::Error> {
    let mut opts = StatusOptions::new();
    opts.include_untracked(true)
        .recurse_untracked_dirs(true)
        .include_ignored(false);
    let statuses = repo.statuses(Some(&mut opts))?;
    let mut files: Vec<String> = statuses
        .iter()
        .filter_map(|entry| entry.path().map(str::to_string))
        .collect();
    files.sort();
    files.dedup();
    Ok(files)
}

/// Uncommitted paths of the repository at `root`.
pub fn changed_paths(root: &Path) -> anyhow::Result<Vec<String>> {
    let repo = Repository::open(root)
        .with_context(|| format!("Failed to open git repository at {}", root.display()))?;
    Ok(status_paths(&repo)?)
}

fn is_remote_ahead(stderr: &str) -> bool {
    let lowered = stderr.to_lowercase();
    ["non-fast-forward", "fetch first", "[rejected]", "updates were rejected"]
        .iter()
        .any(|m| lowered.contains(m))
}
