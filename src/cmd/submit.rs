//! Local stream producers and readers: `edit-worker submit` and `edit-worker results`.

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;

use edit_worker::config::WorkerConfig;
use edit_worker::models::{UnitId, WorkMessage};
use edit_worker::queue::SqliteQueue;
use edit_worker::store::DbHandle;

pub async fn cmd_submit(
    config: &WorkerConfig,
    project_id: &str,
    user_id: &str,
    thread_id: &str,
    instruction: &str,
    repo_url: Option<String>,
    session_id: Option<String>,
) -> Result<()> {
    if instruction.trim().is_empty() {
        anyhow::bail!("Instruction must not be empty");
    }
    let db = DbHandle::open(&config.worker.database)?;
    let queue = SqliteQueue::new(db, Duration::ZERO);
    let unit = UnitId::new(project_id, user_id);
    let message = WorkMessage {
        session_id: session_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        command_id: uuid::Uuid::new_v4().to_string(),
        thread_id: thread_id.to_string(),
        instruction: instruction.to_string(),
        repo_url,
        timestamp: Utc::now(),
    };
    let id = queue
        .submit(&unit, &message)
        .await
        .context("Failed to submit message")?;

    println!("Submitted {} for {} (message #{})", message.command_id, unit, id);
    Ok(())
}

pub fn cmd_results(
    config: &WorkerConfig,
    project_id: Option<&str>,
    user_id: Option<&str>,
    limit: usize,
    json: bool,
) -> Result<()> {
    let db = DbHandle::open(&config.worker.database)?;
    let unit = match (project_id, user_id) {
        (Some(p), Some(u)) => Some(UnitId::new(p, u)),
        _ => None,
    };
    let results = db.lock_sync()?.list_results(unit.as_ref(), limit)?;

    if json {
        for result in &results {
            println!("{}", serde_json::to_string(result)?);
        }
        return Ok(());
    }

    if results.is_empty() {
        println!("No results.");
        return Ok(());
    }
    println!(
        "{:<38} {:<12} {:<6} {:<7} {:<5} Summary",
        "Command", "Outcome", "Build", "Deploy", "Push"
    );
    for r in &results {
        let outcome = if r.is_interrupted() {
            "interrupted"
        } else if r.success {
            "success"
        } else {
            "failed"
        };
        println!(
            "{:<38} {:<12} {:<6} {:<7} {:<5} {}",
            r.command_id,
            outcome,
            yes_no(r.build_success),
            yes_no(r.deploy_success),
            yes_no(r.push_success),
            r.summary.lines().next().unwrap_or("")
        );
        if let Some(url) = &r.preview_url {
            println!("{:<38} preview: {}", "", url);
        }
        if let Some(error) = &r.error {
            println!("{:<38} error: {}", "", error);
        }
    }
    Ok(())
}

fn yes_no(flag: bool) -> &'static str {
    if flag { "yes" } else { "no" }
}
