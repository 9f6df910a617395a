use std::path::Path;

use anyhow::Context;
use clap::Subcommand;

use crate::output::print_json;

#[derive(Subcommand)]
pub enum DbSubcommand {
    /// Copy the database next to itself with a timestamped name
    Backup,
    /// Report lock, pool and record counts
    Health,
    /// Delete finished records older than the retention window
    Cleanup {
        /// Age in days (default: store.retention_days)
        #[arg(long)]
        days: Option<u32>,
    },
}

pub fn run(root: &Path, subcmd: DbSubcommand, json: bool) -> anyhow::Result<()> {
    let config = super::load_config(root)?;
    let store = super::open_store(root, &config)?;

    match subcmd {
        DbSubcommand::Backup => {
            let dest = super::block_on(store.create_backup())?.context("backup failed")?;
            if json {
                print_json(&serde_json::json!({ "backup": dest }))?;
            } else {
                println!("Backup written to {}", dest.display());
            }
        }
        DbSubcommand::Health => {
            let health = super::block_on(store.health())?.context("health check failed")?;
            if json {
                print_json(&health)?;
            } else {
                println!("path:         {}", health.path);
                println!("exists:       {}", health.exists);
                println!("records:      {}", health.records);
                println!("journal mode: {}", health.journal_mode);
                println!("pool:         {}/{} idle", health.pool_idle, health.pool_size);
                println!(
                    "lock:         {} (timeout {}s)",
                    if health.lock_held { "held" } else { "free" },
                    health.lock_timeout_secs
                );
            }
        }
        DbSubcommand::Cleanup { days } => {
            let days = days.unwrap_or(config.store.retention_days);
            let removed =
                super::block_on(store.cleanup_old_records(days))?.context("cleanup failed")?;
            if json {
                print_json(&serde_json::json!({ "days": days, "removed": removed }))?;
            } else {
                println!("Removed {removed} record(s) older than {days} day(s).");
            }
        }
    }
    Ok(())
}
