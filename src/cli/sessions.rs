//! `femtobot sessions ...` subcommands.

use anyhow::{Context, Result};
use std::path::Path;

use crate::config::FemtoConfig;
use crate::session::persist::{export_markdown, write_export, SessionStore};

pub fn list(config: &FemtoConfig) -> Result<()> {
    let store = SessionStore::new(config.resolved_session_dir());
    let sessions = store.list()?;
    if sessions.is_empty() {
        println!("No saved sessions in {}", store.dir().display());
        return Ok(());
    }
    for info in &sessions {
        println!(
            "{:<24} {:>5} msgs  {}",
            info.name,
            info.message_count,
            info.last_saved.format("%Y-%m-%d %H:%M")
        );
    }
    Ok(())
}

/// Export a saved session as Markdown to `output`, or stdout.
pub fn export(config: &FemtoConfig, name: &str, output: Option<&Path>) -> Result<()> {
    let store = SessionStore::new(config.resolved_session_dir());
    let messages = store
        .load(name)?
        .with_context(|| format!("no saved session named {name}"))?;
    match output {
        Some(path) => {
            write_export(path, &messages)?;
            eprintln!("Exported {} messages to {}", messages.len(), path.display());
        }
        None => print!("{}", export_markdown(&messages)),
    }
    Ok(())
}
