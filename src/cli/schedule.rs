//! `femtobot schedule ...` subcommands.

use anyhow::Result;

use crate::config::FemtoConfig;
use crate::schedule::{CrontabScheduler, Scheduler};

pub async fn list(config: &FemtoConfig) -> Result<()> {
    let scheduler = CrontabScheduler::new(config.schedule.crontab_bin.clone());
    let entries = scheduler.list().await?;
    if entries.is_empty() {
        println!("No reminders scheduled.");
        return Ok(());
    }
    for entry in &entries {
        let id = entry.id.as_deref().unwrap_or("-");
        println!("{:<12} {}  [{id}]", entry.expression, entry.command);
    }
    Ok(())
}

pub async fn cleanup(config: &FemtoConfig) -> Result<()> {
    let scheduler = CrontabScheduler::new(config.schedule.crontab_bin.clone());
    let removed = crate::jobs::cleanup_schedule(&scheduler).await;
    println!("Removed {removed} expired reminder(s).");
    Ok(())
}
