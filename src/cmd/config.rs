//! Configuration view and validation commands: `edit-worker config`.

use std::path::Path;

use anyhow::{Context, Result};

use edit_worker::config::WorkerConfig;

use super::super::ConfigCommands;

pub fn cmd_config(config_path: &Path, command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!(
                    "No config file at {}, using defaults",
                    config_path.display()
                );
            }
            println!("Effective values (with env overrides):");
            println!();
            let config = WorkerConfig::load_or_default(config_path)?;
            let rendered =
                toml::to_string_pretty(&config).context("Failed to render configuration")?;
            println!("{}", rendered);
            println!("worker_id (resolved) = \"{}\"", config.worker_id());
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            let config = WorkerConfig::load_or_default(config_path)?;
            config.ensure_valid()?;
            let warnings = config.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("{} already exists", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }
            if let Some(parent) = config_path.parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent)?;
            }
            WorkerConfig::default().save(config_path)?;
            println!("Created {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [worker] id, workspace_root, database, max_units");
            println!("  - [build] command, output_dir");
            println!("  - [deploy] domain, mode, mirror_root, sync_command");
            println!("  - [git] default_branch, protected_branches, conflict_policy");
            println!();
        }
    }

    Ok(())
}
