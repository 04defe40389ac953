use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use crate::claim::ClaimOutcome;
use crate::models::{
    ClaimRecord, ClaimRequest, ClaimStatus, HistoryEntry, ResultMessage, ThreadContext, UnitId,
    WorkMessage,
};
use crate::queue::{Delivery, PendingClaimRequest};

/// How long a connection waits on a locked database before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Async-safe handle to the worker database.
///
/// Wraps `WorkerDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<WorkerDb>>,
}

impl DbHandle {
    pub fn new(db: WorkerDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Open (or create) the database file and wrap it.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create database directory {}", parent.display())
            })?;
        }
        Ok(Self::new(WorkerDb::new(path)?))
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self::new(WorkerDb::new_in_memory()?))
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&WorkerDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. Only for startup, the CLI and tests.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, WorkerDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

pub(crate) fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("Invalid timestamp in database: {}", raw))
}

struct ClaimRow {
    project_id: String,
    user_id: String,
    worker_id: String,
    claimed_at: String,
    last_activity: String,
    status: String,
}

impl ClaimRow {
    fn into_record(self) -> Result<ClaimRecord> {
        Ok(ClaimRecord {
            unit: UnitId::new(self.project_id, self.user_id),
            worker_id: self.worker_id,
            claimed_at: parse_ts(&self.claimed_at)?,
            last_activity: parse_ts(&self.last_activity)?,
            status: self
                .status
                .parse::<ClaimStatus>()
                .map_err(|e| anyhow::anyhow!(e))?,
        })
    }
}

const CLAIM_COLUMNS: &str = "project_id, user_id, worker_id, claimed_at, last_activity, status";

fn claim_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ClaimRow> {
    Ok(ClaimRow {
        project_id: row.get(0)?,
        user_id: row.get(1)?,
        worker_id: row.get(2)?,
        claimed_at: row.get(3)?,
        last_activity: row.get(4)?,
        status: row.get(5)?,
    })
}

pub struct WorkerDb {
    conn: Connection,
}

impl WorkerDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .context("Failed to set busy timeout")?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")
            .context("Failed to enable WAL")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS claims (
                    project_id TEXT NOT NULL,
                    user_id TEXT NOT NULL,
                    worker_id TEXT NOT NULL,
                    claimed_at TEXT NOT NULL,
                    last_activity TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'active',
                    PRIMARY KEY (project_id, user_id)
                );

                CREATE TABLE IF NOT EXISTS workspaces (
                    project_id TEXT NOT NULL,
                    user_id TEXT NOT NULL,
                    repo_url TEXT,
                    current_thread TEXT,
                    updated_at TEXT NOT NULL,
                    PRIMARY KEY (project_id, user_id)
                );

                CREATE TABLE IF NOT EXISTS thread_contexts (
                    project_id TEXT NOT NULL,
                    user_id TEXT NOT NULL,
                    thread_id TEXT NOT NULL,
                    branch_name TEXT NOT NULL,
                    last_commit TEXT,
                    updated_at TEXT NOT NULL,
                    PRIMARY KEY (project_id, user_id, thread_id)
                );

                CREATE TABLE IF NOT EXISTS thread_history (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    project_id TEXT NOT NULL,
                    user_id TEXT NOT NULL,
                    thread_id TEXT NOT NULL,
                    command_id TEXT NOT NULL,
                    instruction TEXT NOT NULL,
                    summary TEXT NOT NULL,
                    success INTEGER NOT NULL,
                    interrupted INTEGER NOT NULL DEFAULT 0,
                    commit_ref TEXT,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS claim_requests (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    project_id TEXT NOT NULL,
                    user_id TEXT NOT NULL,
                    thread_id TEXT NOT NULL,
                    queue_ref TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending',
                    taken_by TEXT,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS unit_messages (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    project_id TEXT NOT NULL,
                    user_id TEXT NOT NULL,
                    session_id TEXT NOT NULL,
                    command_id TEXT NOT NULL,
                    thread_id TEXT NOT NULL,
                    instruction TEXT NOT NULL,
                    repo_url TEXT,
                    sent_at TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending',
                    attempts INTEGER NOT NULL DEFAULT 0,
                    error TEXT,
                    delivered_at TEXT,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS results (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    project_id TEXT NOT NULL,
                    user_id TEXT NOT NULL,
                    command_id TEXT NOT NULL,
                    session_id TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_history_thread ON thread_history(project_id, user_id, thread_id);
                CREATE INDEX IF NOT EXISTS idx_claim_requests_status ON claim_requests(status);
                CREATE INDEX IF NOT EXISTS idx_unit_messages_unit ON unit_messages(project_id, user_id, status);
                CREATE INDEX IF NOT EXISTS idx_results_unit ON results(project_id, user_id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Claims ────────────────────────────────────────────────────────

    /// Atomic conditional write: create the claim if absent, take it over if
    /// released, refresh it if `worker_id` already owns it. Anything else is
    /// left untouched and reported as `AlreadyOwned`.
    pub fn try_claim(
        &self,
        unit: &UnitId,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome> {
        let now = format_ts(&now);
        let changed = self
            .conn
            .execute(
                "INSERT INTO claims (project_id, user_id, worker_id, claimed_at, last_activity, status)
                 VALUES (?1, ?2, ?3, ?4, ?4, 'active')
                 ON CONFLICT(project_id, user_id) DO UPDATE SET
                    claimed_at = CASE
                        WHEN claims.worker_id = excluded.worker_id AND claims.status != 'released'
                        THEN claims.claimed_at ELSE excluded.claimed_at END,
                    worker_id = excluded.worker_id,
                    last_activity = excluded.last_activity,
                    status = 'active'
                 WHERE claims.worker_id = excluded.worker_id OR claims.status = 'released'",
                params![unit.project_id, unit.user_id, worker_id, now],
            )
            .context("Failed to write claim")?;

        let record = self
            .get_claim(unit)?
            .context("Claim row missing right after upsert")?;
        if changed == 1 {
            Ok(ClaimOutcome::Claimed(record))
        } else {
            Ok(ClaimOutcome::AlreadyOwned {
                owner: record.worker_id,
            })
        }
    }

    /// Refresh `last_activity` if `worker_id` still owns the unit. False means the claim is gone.
    pub fn renew_claim(&self, unit: &UnitId, worker_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE claims SET last_activity = ?4
                 WHERE project_id = ?1 AND user_id = ?2 AND worker_id = ?3 AND status != 'released'",
                params![unit.project_id, unit.user_id, worker_id, format_ts(&now)],
            )
            .context("Failed to renew claim")?;
        Ok(changed == 1)
    }

    /// Set the claim status (and refresh activity) if `worker_id` still owns the unit.
    pub fn mark_claim(
        &self,
        unit: &UnitId,
        worker_id: &str,
        status: ClaimStatus,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE claims SET status = ?4, last_activity = ?5
                 WHERE project_id = ?1 AND user_id = ?2 AND worker_id = ?3 AND status != 'released'",
                params![
                    unit.project_id,
                    unit.user_id,
                    worker_id,
                    status.as_str(),
                    format_ts(&now)
                ],
            )
            .context("Failed to update claim status")?;
        Ok(changed == 1)
    }

    pub fn release_claim(&self, unit: &UnitId, worker_id: &str) -> Result<bool> {
        self.mark_claim(unit, worker_id, ClaimStatus::Released, Utc::now())
    }

    /// Release a claim regardless of owner (operator action).
    pub fn force_release_claim(&self, unit: &UnitId) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE claims SET status = 'released', last_activity = ?3
                 WHERE project_id = ?1 AND user_id = ?2 AND status != 'released'",
                params![unit.project_id, unit.user_id, format_ts(&Utc::now())],
            )
            .context("Failed to force-release claim")?;
        Ok(changed == 1)
    }

    /// Release every live claim whose last activity is older than `cutoff`.
    pub fn reap_stale_claims(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let changed = self
            .conn
            .execute(
                "UPDATE claims SET status = 'released'
                 WHERE status != 'released' AND last_activity < ?1",
                params![format_ts(&cutoff)],
            )
            .context("Failed to reap stale claims")?;
        Ok(changed)
    }

    pub fn get_claim(&self, unit: &UnitId) -> Result<Option<ClaimRecord>> {
        let row = self
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM claims WHERE project_id = ?1 AND user_id = ?2",
                    CLAIM_COLUMNS
                ),
                params![unit.project_id, unit.user_id],
                claim_row,
            )
            .optional()
            .context("Failed to query claim")?;
        row.map(ClaimRow::into_record).transpose()
    }

    pub fn list_claims(&self) -> Result<Vec<ClaimRecord>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM claims ORDER BY project_id, user_id",
                CLAIM_COLUMNS
            ))
            .context("Failed to prepare list_claims")?;
        let rows = stmt
            .query_map([], claim_row)
            .context("Failed to query claims")?;
        let mut claims = Vec::new();
        for row in rows {
            claims.push(row.context("Failed to read claim row")?.into_record()?);
        }
        Ok(claims)
    }

    // ── Workspaces & threads ──────────────────────────────────────────

    pub fn get_repo_url(&self, unit: &UnitId) -> Result<Option<String>> {
        let url: Option<Option<String>> = self
            .conn
            .query_row(
                "SELECT repo_url FROM workspaces WHERE project_id = ?1 AND user_id = ?2",
                params![unit.project_id, unit.user_id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query workspace")?;
        Ok(url.flatten())
    }

    pub fn set_repo_url(&self, unit: &UnitId, repo_url: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO workspaces (project_id, user_id, repo_url, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(project_id, user_id) DO UPDATE SET
                    repo_url = excluded.repo_url, updated_at = excluded.updated_at",
                params![unit.project_id, unit.user_id, repo_url, format_ts(&Utc::now())],
            )
            .context("Failed to store repo url")?;
        Ok(())
    }

    pub fn get_current_thread(&self, unit: &UnitId) -> Result<Option<String>> {
        let thread: Option<Option<String>> = self
            .conn
            .query_row(
                "SELECT current_thread FROM workspaces WHERE project_id = ?1 AND user_id = ?2",
                params![unit.project_id, unit.user_id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query current thread")?;
        Ok(thread.flatten())
    }

    pub fn set_current_thread(&self, unit: &UnitId, thread_id: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO workspaces (project_id, user_id, current_thread, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(project_id, user_id) DO UPDATE SET
                    current_thread = excluded.current_thread, updated_at = excluded.updated_at",
                params![unit.project_id, unit.user_id, thread_id, format_ts(&Utc::now())],
            )
            .context("Failed to store current thread")?;
        Ok(())
    }

    /// Load a thread and its full history, oldest entry first.
    pub fn load_thread(&self, unit: &UnitId, thread_id: &str) -> Result<Option<ThreadContext>> {
        let head: Option<(String, Option<String>)> = self
            .conn
            .query_row(
                "SELECT branch_name, last_commit FROM thread_contexts
                 WHERE project_id = ?1 AND user_id = ?2 AND thread_id = ?3",
                params![unit.project_id, unit.user_id, thread_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .context("Failed to query thread context")?;
        let Some((branch_name, last_commit)) = head else {
            return Ok(None);
        };

        let mut stmt = self
            .conn
            .prepare(
                "SELECT command_id, instruction, summary, success, interrupted, commit_ref, created_at
                 FROM thread_history
                 WHERE project_id = ?1 AND user_id = ?2 AND thread_id = ?3
                 ORDER BY id",
            )
            .context("Failed to prepare thread history query")?;
        let rows = stmt
            .query_map(params![unit.project_id, unit.user_id, thread_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, bool>(3)?,
                    row.get::<_, bool>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })
            .context("Failed to query thread history")?;
        let mut history = Vec::new();
        for row in rows {
            let (command_id, instruction, summary, success, interrupted, commit_ref, created_at) =
                row.context("Failed to read history row")?;
            history.push(HistoryEntry {
                command_id,
                instruction,
                summary,
                success,
                interrupted,
                commit_ref,
                created_at: parse_ts(&created_at)?,
            });
        }

        Ok(Some(ThreadContext {
            thread_id: thread_id.to_string(),
            branch_name,
            history,
            last_commit,
        }))
    }

    /// Upsert the thread head (branch and last commit). History is appended separately.
    pub fn save_thread(&self, unit: &UnitId, thread: &ThreadContext) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO thread_contexts (project_id, user_id, thread_id, branch_name, last_commit, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(project_id, user_id, thread_id) DO UPDATE SET
                    branch_name = excluded.branch_name,
                    last_commit = excluded.last_commit,
                    updated_at = excluded.updated_at",
                params![
                    unit.project_id,
                    unit.user_id,
                    thread.thread_id,
                    thread.branch_name,
                    thread.last_commit,
                    format_ts(&Utc::now())
                ],
            )
            .context("Failed to save thread context")?;
        Ok(())
    }

    pub fn append_history(&self, unit: &UnitId, thread_id: &str, entry: &HistoryEntry) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO thread_history
                    (project_id, user_id, thread_id, command_id, instruction, summary, success, interrupted, commit_ref, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    unit.project_id,
                    unit.user_id,
                    thread_id,
                    entry.command_id,
                    entry.instruction,
                    entry.summary,
                    entry.success,
                    entry.interrupted,
                    entry.commit_ref,
                    format_ts(&entry.created_at)
                ],
            )
            .context("Failed to append thread history")?;
        Ok(())
    }

    // ── Unclaimed-work stream ─────────────────────────────────────────

    pub fn submit_claim_request(&self, request: &ClaimRequest) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO claim_requests (project_id, user_id, thread_id, queue_ref, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    request.project_id,
                    request.user_id,
                    request.thread_id,
                    request.queue_ref,
                    format_ts(&Utc::now())
                ],
            )
            .context("Failed to insert claim request")?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Take the oldest pending claim request. Each request is handed to exactly one worker.
    pub fn take_claim_request(&self, worker_id: &str) -> Result<Option<PendingClaimRequest>> {
        self.conn
            .query_row(
                "UPDATE claim_requests SET status = 'taken', taken_by = ?1
                 WHERE id = (
                    SELECT id FROM claim_requests WHERE status = 'pending' ORDER BY id LIMIT 1
                 )
                 RETURNING id, project_id, user_id, thread_id, queue_ref",
                params![worker_id],
                |row| {
                    Ok(PendingClaimRequest {
                        id: row.get(0)?,
                        request: ClaimRequest {
                            project_id: row.get(1)?,
                            user_id: row.get(2)?,
                            thread_id: row.get(3)?,
                            queue_ref: row.get(4)?,
                        },
                    })
                },
            )
            .optional()
            .context("Failed to take claim request")
    }

    pub fn complete_claim_request(&self, id: i64) -> Result<()> {
        self.conn
            .execute(
                "UPDATE claim_requests SET status = 'done' WHERE id = ?1",
                params![id],
            )
            .context("Failed to complete claim request")?;
        Ok(())
    }

    /// Put a taken request back so another worker (or a later poll) can retry it.
    pub fn return_claim_request(&self, id: i64) -> Result<()> {
        self.conn
            .execute(
                "UPDATE claim_requests SET status = 'pending', taken_by = NULL WHERE id = ?1",
                params![id],
            )
            .context("Failed to return claim request")?;
        Ok(())
    }

    // ── Per-unit message streams ──────────────────────────────────────

    pub fn submit_message(&self, unit: &UnitId, message: &WorkMessage) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO unit_messages
                    (project_id, user_id, session_id, command_id, thread_id, instruction, repo_url, sent_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    unit.project_id,
                    unit.user_id,
                    message.session_id,
                    message.command_id,
                    message.thread_id,
                    message.instruction,
                    message.repo_url,
                    format_ts(&message.timestamp),
                    format_ts(&Utc::now())
                ],
            )
            .context("Failed to insert unit message")?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Hand out the oldest pending message of the unit, bumping its attempt counter.
    pub fn deliver_next_message(&self, unit: &UnitId) -> Result<Option<Delivery>> {
        let row = self
            .conn
            .query_row(
                "UPDATE unit_messages
                 SET status = 'delivered', attempts = attempts + 1, delivered_at = ?3
                 WHERE id = (
                    SELECT id FROM unit_messages
                    WHERE project_id = ?1 AND user_id = ?2 AND status = 'pending'
                    ORDER BY id LIMIT 1
                 )
                 RETURNING id, session_id, command_id, thread_id, instruction, repo_url, sent_at, attempts",
                params![unit.project_id, unit.user_id, format_ts(&Utc::now())],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, Option<String>>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, u32>(7)?,
                    ))
                },
            )
            .optional()
            .context("Failed to deliver unit message")?;

        let Some((id, session_id, command_id, thread_id, instruction, repo_url, sent_at, attempts)) =
            row
        else {
            return Ok(None);
        };
        Ok(Some(Delivery {
            id,
            unit: unit.clone(),
            attempts,
            message: WorkMessage {
                session_id,
                command_id,
                thread_id,
                instruction,
                repo_url,
                timestamp: parse_ts(&sent_at)?,
            },
        }))
    }

    pub fn ack_message(&self, id: i64) -> Result<()> {
        self.conn
            .execute(
                "UPDATE unit_messages SET status = 'acked' WHERE id = ?1",
                params![id],
            )
            .context("Failed to ack message")?;
        Ok(())
    }

    pub fn record_attempt(&self, id: i64) -> Result<()> {
        self.conn
            .execute(
                "UPDATE unit_messages SET attempts = attempts + 1 WHERE id = ?1",
                params![id],
            )
            .context("Failed to record attempt")?;
        Ok(())
    }

    pub fn dead_letter_message(&self, id: i64, error: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE unit_messages SET status = 'dead', error = ?2 WHERE id = ?1",
                params![id, error],
            )
            .context("Failed to dead-letter message")?;
        Ok(())
    }

    /// Return delivered-but-unacked messages of the unit to the stream, keeping their order.
    pub fn requeue_delivered(&self, unit: &UnitId) -> Result<usize> {
        let changed = self
            .conn
            .execute(
                "UPDATE unit_messages SET status = 'pending', delivered_at = NULL
                 WHERE project_id = ?1 AND user_id = ?2 AND status = 'delivered'",
                params![unit.project_id, unit.user_id],
            )
            .context("Failed to requeue delivered messages")?;
        Ok(changed)
    }

    /// Thread of the oldest message of the unit that is neither acked nor dead.
    pub fn oldest_unfinished_thread(&self, unit: &UnitId) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT thread_id FROM unit_messages
                 WHERE project_id = ?1 AND user_id = ?2 AND status IN ('pending', 'delivered')
                 ORDER BY id LIMIT 1",
                params![unit.project_id, unit.user_id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to look up unfinished messages")
    }

    pub fn message_status(&self, id: i64) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT status FROM unit_messages WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query message status")
    }

    // ── Results ───────────────────────────────────────────────────────

    pub fn publish_result(&self, unit: &UnitId, result: &ResultMessage) -> Result<i64> {
        let payload = serde_json::to_string(result).context("Failed to serialize result")?;
        self.conn
            .execute(
                "INSERT INTO results (project_id, user_id, command_id, session_id, payload, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    unit.project_id,
                    unit.user_id,
                    result.command_id,
                    result.session_id,
                    payload,
                    format_ts(&Utc::now())
                ],
            )
            .context("Failed to insert result")?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Results in publication order, optionally filtered to one unit.
    pub fn list_results(&self, unit: Option<&UnitId>, limit: usize) -> Result<Vec<ResultMessage>> {
        let (project, user) = match unit {
            Some(u) => (Some(u.project_id.as_str()), Some(u.user_id.as_str())),
            None => (None, None),
        };
        let mut stmt = self
            .conn
            .prepare(
                "SELECT payload FROM (
                    SELECT id, payload FROM results
                    WHERE (?1 IS NULL OR project_id = ?1) AND (?2 IS NULL OR user_id = ?2)
                    ORDER BY id DESC LIMIT ?3
                 ) ORDER BY id",
            )
            .context("Failed to prepare list_results")?;
        let rows = stmt
            .query_map(params![project, user, limit as i64], |row| {
                row.get::<_, String>(0)
            })
            .context("Failed to query results")?;
        let mut results = Vec::new();
        for row in rows {
            let payload = row.context("Failed to read result row")?;
            results.push(serde_json::from_str(&payload).context("Corrupt result payload")?);
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit() -> UnitId {
        UnitId::new("proj-A", "user-1")
    }

    fn message(command_id: &str) -> WorkMessage {
        WorkMessage {
            session_id: "sess".into(),
            command_id: command_id.into(),
            thread_id: "thread-x".into(),
            instruction: format!("do {}", command_id),
            repo_url: None,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_claim_is_exclusive() {
        let db = WorkerDb::new_in_memory().unwrap();
        let first = db.try_claim(&unit(), "w1", Utc::now()).unwrap();
        assert!(matches!(first, ClaimOutcome::Claimed(_)));
        let second = db.try_claim(&unit(), "w2", Utc::now()).unwrap();
        match second {
            ClaimOutcome::AlreadyOwned { owner } => assert_eq!(owner, "w1"),
            other => panic!("expected AlreadyOwned, got {:?}", other),
        }
    }

    #[test]
    fn test_reclaim_by_same_worker_is_idempotent() {
        let db = WorkerDb::new_in_memory().unwrap();
        let t0 = Utc::now();
        let ClaimOutcome::Claimed(first) = db.try_claim(&unit(), "w1", t0).unwrap() else {
            panic!("first claim failed");
        };
        let later = t0 + chrono::Duration::seconds(30);
        let ClaimOutcome::Claimed(again) = db.try_claim(&unit(), "w1", later).unwrap() else {
            panic!("re-claim by owner failed");
        };
        assert_eq!(again.claimed_at, first.claimed_at);
        assert!(again.last_activity > first.last_activity);
    }

    #[test]
    fn test_released_claim_can_be_taken_over() {
        let db = WorkerDb::new_in_memory().unwrap();
        db.try_claim(&unit(), "w1", Utc::now()).unwrap();
        assert!(db.release_claim(&unit(), "w1").unwrap());
        let outcome = db.try_claim(&unit(), "w2", Utc::now()).unwrap();
        let ClaimOutcome::Claimed(record) = outcome else {
            panic!("takeover failed");
        };
        assert_eq!(record.worker_id, "w2");
        assert_eq!(record.status, ClaimStatus::Active);
    }

    #[test]
    fn test_renew_fails_after_takeover() {
        let db = WorkerDb::new_in_memory().unwrap();
        db.try_claim(&unit(), "w1", Utc::now()).unwrap();
        db.force_release_claim(&unit()).unwrap();
        db.try_claim(&unit(), "w2", Utc::now()).unwrap();
        assert!(!db.renew_claim(&unit(), "w1", Utc::now()).unwrap());
        assert!(db.renew_claim(&unit(), "w2", Utc::now()).unwrap());
    }

    #[test]
    fn test_reap_stale_claims() {
        let db = WorkerDb::new_in_memory().unwrap();
        let old = Utc::now() - chrono::Duration::minutes(10);
        db.try_claim(&unit(), "w1", old).unwrap();
        db.try_claim(&UnitId::new("proj-B", "user-1"), "w1", Utc::now())
            .unwrap();
        let reaped = db
            .reap_stale_claims(Utc::now() - chrono::Duration::minutes(2))
            .unwrap();
        assert_eq!(reaped, 1);
        assert_eq!(
            db.get_claim(&unit()).unwrap().unwrap().status,
            ClaimStatus::Released
        );
    }

    #[test]
    fn test_messages_delivered_in_fifo_order() {
        let db = WorkerDb::new_in_memory().unwrap();
        for id in ["m1", "m2", "m3"] {
            db.submit_message(&unit(), &message(id)).unwrap();
        }
        let mut seen = Vec::new();
        while let Some(d) = db.deliver_next_message(&unit()).unwrap() {
            seen.push(d.message.command_id.clone());
            db.ack_message(d.id).unwrap();
        }
        assert_eq!(seen, vec!["m1", "m2", "m3"]);
    }

    #[test]
    fn test_messages_are_scoped_to_unit() {
        let db = WorkerDb::new_in_memory().unwrap();
        db.submit_message(&UnitId::new("other", "user-1"), &message("m1"))
            .unwrap();
        assert!(db.deliver_next_message(&unit()).unwrap().is_none());
    }

    #[test]
    fn test_requeue_preserves_order_and_counts_attempts() {
        let db = WorkerDb::new_in_memory().unwrap();
        db.submit_message(&unit(), &message("m1")).unwrap();
        db.submit_message(&unit(), &message("m2")).unwrap();
        db.deliver_next_message(&unit()).unwrap().unwrap();
        db.deliver_next_message(&unit()).unwrap().unwrap();
        assert_eq!(db.requeue_delivered(&unit()).unwrap(), 2);
        let again = db.deliver_next_message(&unit()).unwrap().unwrap();
        assert_eq!(again.message.command_id, "m1");
        assert_eq!(again.attempts, 2);
    }

    #[test]
    fn test_dead_letter_removes_from_stream() {
        let db = WorkerDb::new_in_memory().unwrap();
        let id = db.submit_message(&unit(), &message("m1")).unwrap();
        db.deliver_next_message(&unit()).unwrap().unwrap();
        db.dead_letter_message(id, "boom").unwrap();
        db.requeue_delivered(&unit()).unwrap();
        assert!(db.deliver_next_message(&unit()).unwrap().is_none());
        assert_eq!(db.message_status(id).unwrap().as_deref(), Some("dead"));
    }

    #[test]
    fn test_claim_request_taken_once() {
        let db = WorkerDb::new_in_memory().unwrap();
        db.submit_claim_request(&ClaimRequest {
            project_id: "proj-A".into(),
            user_id: "user-1".into(),
            thread_id: "t".into(),
            queue_ref: "proj-A/user-1".into(),
        })
        .unwrap();
        let taken = db.take_claim_request("w1").unwrap().unwrap();
        assert_eq!(taken.request.project_id, "proj-A");
        assert!(db.take_claim_request("w2").unwrap().is_none());
        db.return_claim_request(taken.id).unwrap();
        assert!(db.take_claim_request("w2").unwrap().is_some());
    }

    #[test]
    fn test_thread_context_roundtrip() {
        let db = WorkerDb::new_in_memory().unwrap();
        let mut thread = ThreadContext::new("abc");
        thread.last_commit = Some("deadbeef".into());
        db.save_thread(&unit(), &thread).unwrap();
        db.append_history(
            &unit(),
            "abc",
            &HistoryEntry {
                command_id: "c1".into(),
                instruction: "add a footer".into(),
                summary: "Added footer".into(),
                success: true,
                interrupted: false,
                commit_ref: Some("deadbeef".into()),
                created_at: Utc::now(),
            },
        )
        .unwrap();
        let loaded = db.load_thread(&unit(), "abc").unwrap().unwrap();
        assert_eq!(loaded.branch_name, thread.branch_name);
        assert_eq!(loaded.last_commit.as_deref(), Some("deadbeef"));
        assert_eq!(loaded.history.len(), 1);
        assert!(db.load_thread(&unit(), "missing").unwrap().is_none());
    }

    #[test]
    fn test_workspace_repo_url_and_current_thread() {
        let db = WorkerDb::new_in_memory().unwrap();
        assert!(db.get_repo_url(&unit()).unwrap().is_none());
        db.set_current_thread(&unit(), "t1").unwrap();
        db.set_repo_url(&unit(), "https://git.example/site.git").unwrap();
        assert_eq!(
            db.get_repo_url(&unit()).unwrap().as_deref(),
            Some("https://git.example/site.git")
        );
        assert_eq!(db.get_current_thread(&unit()).unwrap().as_deref(), Some("t1"));
    }

    #[test]
    fn test_results_listed_in_publication_order() {
        let db = WorkerDb::new_in_memory().unwrap();
        for id in ["m1", "m2", "m3"] {
            db.publish_result(&unit(), &ResultMessage::failure(&message(id), "x"))
                .unwrap();
        }
        let results = db.list_results(Some(&unit()), 2).unwrap();
        let ids: Vec<_> = results.iter().map(|r| r.command_id.as_str()).collect();
        assert_eq!(ids, vec!["m2", "m3"]);
        assert_eq!(db.list_results(None, 10).unwrap().len(), 3);
    }
}
