use async_trait::async_trait;
use chrono::NaiveDateTime;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{is_expired, split_marker, Created, ScheduleEntry, ScheduleSpec, Scheduler, ID_MARKER};
use crate::error::DispatchError;

/// Drives the user's crontab through `crontab -l` / `crontab -`.
///
/// Every read-modify-write happens under one lock so concurrent chats cannot
/// lose each other's edits.
pub struct CrontabScheduler {
    bin: String,
    lock: Mutex<()>,
}

impl CrontabScheduler {
    pub fn new(bin: impl Into<String>) -> Self {
        Self {
            bin: bin.into(),
            lock: Mutex::new(()),
        }
    }

    async fn read_lines(&self) -> Result<Vec<String>, DispatchError> {
        let output = Command::new(&self.bin)
            .arg("-l")
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| DispatchError::Unavailable(format!("{}: {e}", self.bin)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // an empty crontab is reported as an error by most implementations
            if stderr.to_lowercase().contains("no crontab") {
                return Ok(Vec::new());
            }
            return Err(DispatchError::Unavailable(format!(
                "{} -l failed: {}",
                self.bin,
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn write_lines(&self, lines: &[String]) -> Result<(), DispatchError> {
        let mut child = Command::new(&self.bin)
            .arg("-")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| DispatchError::Unavailable(format!("{}: {e}", self.bin)))?;

        let mut content = lines.join("\n");
        content.push('\n');
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(content.as_bytes())
                .await
                .map_err(|e| DispatchError::Unknown(format!("writing crontab: {e}")))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| DispatchError::Unknown(format!("writing crontab: {e}")))?;
        if !output.status.success() {
            return Err(DispatchError::Unknown(format!(
                "{} - failed: {}",
                self.bin,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        debug!(lines = lines.len(), "crontab written");
        Ok(())
    }
}

#[async_trait]
impl Scheduler for CrontabScheduler {
    async fn create(&self, spec: &ScheduleSpec, payload: &str) -> Result<Created, DispatchError> {
        let _guard = self.lock.lock().await;
        let mut lines = self.read_lines().await?;

        let body = format!("{} {payload}", spec.expression());
        if let Some(existing) = lines.iter().find(|line| split_marker(line).0 == body) {
            let id = split_marker(existing).1.unwrap_or_default().to_string();
            info!(label = %spec.label, "reminder already scheduled");
            return Ok(Created { id, duplicate: true });
        }

        let id = uuid::Uuid::now_v7().to_string();
        lines.push(format!("{body} {ID_MARKER}{id}"));
        self.write_lines(&lines).await?;
        info!(id = %id, expression = %spec.expression(), recurring = spec.recurring, "reminder scheduled");
        Ok(Created {
            id,
            duplicate: false,
        })
    }

    async fn delete(&self, match_token: &str) -> Result<usize, DispatchError> {
        if match_token.trim().is_empty() {
            return Ok(0);
        }
        let _guard = self.lock.lock().await;
        let lines = self.read_lines().await?;
        let before = lines.len();
        let kept: Vec<String> = lines
            .into_iter()
            .filter(|line| !(line.contains(ID_MARKER) && line.contains(match_token)))
            .collect();

        let removed = before - kept.len();
        if removed > 0 {
            self.write_lines(&kept).await?;
            info!(removed, token = %match_token, "reminders deleted");
        }
        Ok(removed)
    }

    async fn list(&self) -> Result<Vec<ScheduleEntry>, DispatchError> {
        let _guard = self.lock.lock().await;
        Ok(self
            .read_lines()
            .await?
            .iter()
            .filter_map(|line| ScheduleEntry::parse(line))
            .collect())
    }

    async fn cleanup_expired(&self, now: NaiveDateTime) -> Result<usize, DispatchError> {
        let _guard = self.lock.lock().await;
        let lines = self.read_lines().await?;
        let (expired, kept): (Vec<String>, Vec<String>) =
            lines.into_iter().partition(|line| is_expired(line, now));

        for line in &expired {
            let preview: String = line.chars().take(60).collect();
            info!(entry = %preview, "removing expired reminder");
        }
        if !expired.is_empty() {
            if let Err(e) = self.write_lines(&kept).await {
                warn!(error = %e, "failed to write crontab during cleanup");
                return Err(e);
            }
        }
        Ok(expired.len())
    }
}
