//! File-backed event queue.
//!
//! Reminder payloads append their label to the events file from cron; the
//! gateway drains it so a messaging client can forward fired reminders.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, text: &str) -> Result<()>;
}

pub struct FileEventQueue {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileEventQueue {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Return every pending event and truncate the file.
    pub async fn drain(&self) -> Result<Vec<String>> {
        let _guard = self.lock.lock().await;
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", self.path.display()))
            }
        };
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        tokio::fs::write(&self.path, b"")
            .await
            .with_context(|| format!("failed to truncate {}", self.path.display()))?;

        let events: Vec<String> = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();
        tracing::debug!(count = events.len(), "events drained");
        Ok(events)
    }
}

#[async_trait]
impl EventSink for FileEventQueue {
    async fn publish(&self, text: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("failed to open {}", self.path.display()))?;
        // one event per line
        let line = format!("{}\n", text.replace('\n', " ").trim());
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_then_drain() {
        let dir = tempfile::tempdir().unwrap();
        let queue = FileEventQueue::new(dir.path().join("nested/events.txt"));

        assert!(queue.drain().await.unwrap().is_empty());

        queue.publish("Regar plantas").await.unwrap();
        queue.publish("multi\nline").await.unwrap();
        assert_eq!(queue.drain().await.unwrap(), vec!["Regar plantas", "multi line"]);
        assert!(queue.drain().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn drains_lines_written_by_cron() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.txt");
        std::fs::write(&path, "Llamar a mamá\n\nTomar agua\n").unwrap();

        let queue = FileEventQueue::new(&path);
        assert_eq!(queue.drain().await.unwrap(), vec!["Llamar a mamá", "Tomar agua"]);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");
    }
}
