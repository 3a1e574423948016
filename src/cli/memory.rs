//! `femtobot memory ...` subcommands.

use anyhow::{bail, Result};
use serde::Serialize;

use super::{open_store, preview};
use crate::config::FemtoConfig;
use crate::memory::types::Fact;
use crate::memory::MemoryStore;

pub async fn stats(config: &FemtoConfig) -> Result<()> {
    let store = open_store(config)?;
    let stats = store.stats().await?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

pub async fn search(config: &FemtoConfig, query: &str, limit: usize) -> Result<()> {
    let store = open_store(config)?;
    let results = store.search(query, limit).await?;

    if results.is_empty() {
        println!("No results found.");
        return Ok(());
    }

    println!("Found {} result(s)\n", results.len());
    for (i, fact) in results.iter().enumerate() {
        println!(
            "  {}. {} (score: {:.4}, {})",
            i + 1,
            fact.id,
            fact.score,
            fact.created_at
        );
        println!("     {}", preview(&fact.content, 120));
    }
    Ok(())
}

pub async fn list(config: &FemtoConfig) -> Result<()> {
    let store = open_store(config)?;
    let facts = store.list().await?;
    if facts.is_empty() {
        println!("No facts stored.");
        return Ok(());
    }
    for fact in &facts {
        println!(
            "{}  {}  (recalled {}x)",
            fact.id,
            preview(&fact.content, 80),
            fact.recall_count
        );
    }
    println!("\n{} fact(s)", facts.len());
    Ok(())
}

/// Delete by id, or by similarity using the configured delete threshold.
pub async fn forget(config: &FemtoConfig, target: &str, by_id: bool) -> Result<()> {
    let store = open_store(config)?;
    let removed = if by_id {
        store.delete_by_id(target).await?
    } else {
        match store
            .delete_by_similarity(target, config.memory.delete_threshold)
            .await?
        {
            Some(removed) => removed,
            None => bail!("no fact similar enough to \"{target}\""),
        }
    };
    match removed.similarity {
        Some(similarity) => println!(
            "Deleted {}: {} (similarity {:.2})",
            removed.id, removed.content, similarity
        ),
        None => println!("Deleted {}: {}", removed.id, removed.content),
    }
    Ok(())
}

#[derive(Serialize)]
struct ExportData {
    exported_at: String,
    facts: Vec<Fact>,
}

/// Export every fact as JSON to stdout.
pub async fn export(config: &FemtoConfig) -> Result<()> {
    let store = open_store(config)?;
    let data = ExportData {
        exported_at: chrono::Utc::now().to_rfc3339(),
        facts: store.list().await?,
    };
    println!("{}", serde_json::to_string_pretty(&data)?);
    eprintln!("Exported {} facts.", data.facts.len());
    Ok(())
}
