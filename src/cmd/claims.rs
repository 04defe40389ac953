//! Claim inspection and operator overrides: `edit-worker claims`.

use anyhow::Result;
use chrono::Utc;

use edit_worker::config::WorkerConfig;
use edit_worker::models::UnitId;
use edit_worker::store::DbHandle;

use super::super::ClaimsCommands;

pub fn cmd_claims(config: &WorkerConfig, command: ClaimsCommands) -> Result<()> {
    let db = DbHandle::open(&config.worker.database)?;
    let db = db.lock_sync()?;

    match command {
        ClaimsCommands::List => {
            let claims = db.list_claims()?;
            if claims.is_empty() {
                println!("No claims.");
                return Ok(());
            }
            println!(
                "{:<30} {:<20} {:<9} Last activity",
                "Unit", "Worker", "Status"
            );
            for claim in claims {
                let idle_for = (Utc::now() - claim.last_activity).num_seconds();
                println!(
                    "{:<30} {:<20} {:<9} {} ({}s ago)",
                    claim.unit.to_string(),
                    claim.worker_id,
                    claim.status.as_str(),
                    claim.last_activity.format("%Y-%m-%d %H:%M:%S"),
                    idle_for
                );
            }
        }
        ClaimsCommands::Release {
            project_id,
            user_id,
        } => {
            let unit = UnitId::new(project_id, user_id);
            if db.force_release_claim(&unit)? {
                println!("Released {}", unit);
            } else {
                println!("No active claim for {}", unit);
            }
        }
        ClaimsCommands::Reap { older_than_secs } => {
            let age = older_than_secs.unwrap_or(config.claims.reclaim_timeout_secs);
            let cutoff = Utc::now() - chrono::Duration::seconds(age as i64);
            let reaped = db.reap_stale_claims(cutoff)?;
            println!("Reaped {} stale claim(s) older than {}s", reaped, age);
        }
    }
    Ok(())
}
