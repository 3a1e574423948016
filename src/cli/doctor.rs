//! CLI `doctor` command: database diagnostics and collaborator checks.

use anyhow::{Context, Result};
use std::time::Duration;

use crate::config::FemtoConfig;
use crate::db;
use crate::schedule::{CrontabScheduler, Scheduler};

/// Run diagnostics and print a health report.
pub async fn doctor(config: &FemtoConfig) -> Result<()> {
    println!("femtobot Health Report");
    println!("======================");
    println!();

    database_section(config)?;
    println!();

    println!("Model runtime:     {}", config.model.base_url);
    match runtime_models(&config.model.base_url).await {
        Ok(models) => {
            for wanted in [&config.model.name, &config.model.embedding_model] {
                let present = models.iter().any(|m| m == wanted || m.starts_with(&format!("{wanted}:")));
                println!(
                    "  {:<16} {}",
                    wanted,
                    if present { "available" } else { "MISSING (pull it first)" }
                );
            }
        }
        Err(e) => println!("  UNREACHABLE ({e:#})"),
    }
    println!();

    let scheduler = CrontabScheduler::new(config.schedule.crontab_bin.clone());
    match scheduler.list().await {
        Ok(entries) => println!("Crontab:           OK ({} entries)", entries.len()),
        Err(e) => println!("Crontab:           UNAVAILABLE ({e})"),
    }
    println!(
        "Web search:        {}",
        if config.search.api_key.is_some() { "configured" } else { "no API key" }
    );
    println!("Lights:            {} configured", config.lights.devices.len());
    match config.session.tokenizer_path.as_deref() {
        Some(path) if crate::config::expand_tilde(path).exists() => {
            println!("Tokenizer:         {path}")
        }
        Some(path) => println!("Tokenizer:         MISSING at {path}"),
        None => println!("Tokenizer:         (character estimate)"),
    }
    Ok(())
}

fn database_section(config: &FemtoConfig) -> Result<()> {
    let db_path = config.resolved_db_path();
    if !db_path.exists() {
        println!("Database: not found at {}", db_path.display());
        println!("Run `femtobot serve` or `femtobot chat` to initialize.");
        return Ok(());
    }

    let file_size = std::fs::metadata(&db_path).map(|m| m.len()).unwrap_or(0);
    let conn = db::open_database(&db_path, config.memory.embedding_dimensions)
        .context("failed to open database (may be corrupt)")?;
    let report = db::check_database_health(&conn).context("failed to run health check")?;

    println!("Database:          {}", db_path.display());
    println!("File size:         {}", format_bytes(file_size));
    println!("Schema version:    {}", report.schema_version);
    println!("sqlite-vec:        {}", report.sqlite_vec_version);
    println!(
        "Embedding model:   {} (configured: {})",
        report.embedding_model.as_deref().unwrap_or("(not set)"),
        config.model.embedding_model
    );
    if report
        .embedding_model
        .as_deref()
        .is_some_and(|stored| stored != config.model.embedding_model)
    {
        println!("  WARNING: model mismatch! Similarity against older facts is unreliable.");
    }
    println!("Facts:             {} ({} embedded)", report.fact_count, report.vector_count);
    println!("Audit log:         {}", report.log_count);
    if report.integrity_ok {
        println!("Integrity check:   PASSED");
    } else {
        println!("Integrity check:   FAILED ({})", report.integrity_details);
        println!();
        println!("Recovery steps:");
        println!("  1. Restore from a backup: cp backup.db {}", db_path.display());
        println!("  2. Or export the facts from a good copy: femtobot memory export > facts.json");
    }
    Ok(())
}

#[derive(serde::Deserialize)]
struct Tags {
    models: Vec<Tag>,
}

#[derive(serde::Deserialize)]
struct Tag {
    name: String,
}

async fn runtime_models(base_url: &str) -> Result<Vec<String>> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()?;
    let url = format!("{}/api/tags", base_url.trim_end_matches('/'));
    let tags: Tags = client
        .get(&url)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    Ok(tags.models.into_iter().map(|t| t.name).collect())
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}
