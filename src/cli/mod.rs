pub mod doctor;
pub mod memory;
pub mod schedule;
pub mod sessions;

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;

use crate::config::FemtoConfig;
use crate::embedding::{EmbeddingProvider, OllamaEmbedder};
use crate::memory::SqliteMemoryStore;

const TOKENIZER_URL: &str =
    "https://huggingface.co/Qwen/Qwen2.5-7B-Instruct/resolve/main/tokenizer.json";

/// Open the fact store the way the assistant does, for one-shot commands.
pub fn open_store(config: &FemtoConfig) -> Result<SqliteMemoryStore> {
    let db_path = config.resolved_db_path();
    let conn = crate::db::open_database(&db_path, config.memory.embedding_dimensions)?;
    let embedder: Arc<dyn EmbeddingProvider> =
        Arc::new(OllamaEmbedder::new(&config.model, &config.memory)?);
    Ok(SqliteMemoryStore::new(conn, Some(embedder), config.memory.clone()).with_db_path(db_path))
}

/// Where `tokenizer download` writes: the configured path, else
/// `~/.femtobot/tokenizer.json`.
pub fn tokenizer_destination(config: &FemtoConfig) -> PathBuf {
    match config.session.tokenizer_path.as_deref() {
        Some(path) => crate::config::expand_tilde(path),
        None => crate::config::default_femto_dir().join("tokenizer.json"),
    }
}

/// Download a `tokenizer.json` used for exact token counts.
pub async fn tokenizer_download(config: &FemtoConfig, url: Option<&str>) -> Result<()> {
    let dest = tokenizer_destination(config);
    if dest.exists() {
        println!("Tokenizer already exists at {}", dest.display());
        return Ok(());
    }
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    println!("Downloading tokenizer.json...");
    download_file(url.unwrap_or(TOKENIZER_URL), &dest).await?;
    println!("Tokenizer saved to {}", dest.display());
    if config.session.tokenizer_path.is_none() {
        println!(
            "Set session.tokenizer_path = \"{}\" in the config to use it.",
            dest.display()
        );
    }
    Ok(())
}

/// Download a file from a URL with progress bar. Uses atomic write (tmp + rename).
async fn download_file(url: &str, dest: &Path) -> Result<()> {
    let mut response = reqwest::get(url)
        .await
        .with_context(|| format!("HTTP request failed for {url}"))?;

    anyhow::ensure!(
        response.status().is_success(),
        "download failed with HTTP {}",
        response.status()
    );

    let pb = match response.content_length() {
        Some(size) => {
            let pb = ProgressBar::new(size);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("  {bar:40.cyan/blue} {bytes}/{total_bytes} ({eta})")?
                    .progress_chars("##-"),
            );
            pb
        }
        None => ProgressBar::new_spinner(),
    };

    let tmp_path = dest.with_extension("tmp");
    let mut file = tokio::fs::File::create(&tmp_path)
        .await
        .with_context(|| format!("failed to create temp file: {}", tmp_path.display()))?;

    while let Some(chunk) = response.chunk().await.context("error reading response")? {
        file.write_all(&chunk)
            .await
            .context("error writing to file")?;
        pb.inc(chunk.len() as u64);
    }

    file.flush().await?;
    drop(file);

    tokio::fs::rename(&tmp_path, dest)
        .await
        .context("failed to rename temp file")?;

    pb.finish_and_clear();
    Ok(())
}

/// Shorten `text` to `max` characters for one-line listings.
pub(crate) fn preview(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max).collect();
        format!("{cut}...")
    }
}
