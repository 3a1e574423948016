//! On-disk session files for terminal mode.
//!
//! Format: `{version, last_saved, message_count, history: [{role, content}]}`.
//! Files are written to a temporary sibling and renamed into place.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::{Message, Role};
use crate::error::PersistenceError;

pub const SESSION_FORMAT_VERSION: u32 = 1;
pub const DEFAULT_SESSION: &str = "default";

#[derive(Debug, Serialize, Deserialize)]
struct SessionFile {
    version: u32,
    last_saved: DateTime<Utc>,
    message_count: usize,
    history: Vec<HistoryEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct HistoryEntry {
    role: Role,
    content: String,
}

/// A saved session as listed by `/sessions`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionInfo {
    pub name: String,
    pub last_saved: DateTime<Utc>,
    pub message_count: usize,
}

pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, name: &str) -> Result<PathBuf, PersistenceError> {
        validate_name(name)?;
        Ok(self.dir.join(format!("{name}.json")))
    }

    pub fn save(&self, name: &str, messages: &[Message]) -> Result<PathBuf, PersistenceError> {
        let path = self.path_for(name)?;
        std::fs::create_dir_all(&self.dir).map_err(|e| io_error(&self.dir, e))?;

        let file = SessionFile {
            version: SESSION_FORMAT_VERSION,
            last_saved: Utc::now(),
            message_count: messages.len(),
            history: messages
                .iter()
                .map(|m| HistoryEntry {
                    role: m.role,
                    content: m.content.clone(),
                })
                .collect(),
        };
        let json = serde_json::to_vec_pretty(&file).map_err(|e| PersistenceError::Corrupt {
            path: path.display().to_string(),
            source: e,
        })?;

        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|e| io_error(&tmp, e))?;
        std::fs::rename(&tmp, &path).map_err(|e| io_error(&path, e))?;

        tracing::debug!(path = %path.display(), messages = messages.len(), "session saved");
        Ok(path)
    }

    /// Load a saved session. A missing file is `Ok(None)`.
    pub fn load(&self, name: &str) -> Result<Option<Vec<Message>>, PersistenceError> {
        let path = self.path_for(name)?;
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error(&path, e)),
        };
        let file: SessionFile =
            serde_json::from_slice(&bytes).map_err(|e| PersistenceError::Corrupt {
                path: path.display().to_string(),
                source: e,
            })?;

        if file.version > SESSION_FORMAT_VERSION {
            tracing::warn!(version = file.version, path = %path.display(), "session file is newer than this build");
        }

        let timestamp = file.last_saved;
        Ok(Some(
            file.history
                .into_iter()
                .map(|entry| Message {
                    role: entry.role,
                    content: entry.content,
                    timestamp,
                })
                .collect(),
        ))
    }

    /// Saved sessions, most recent first. Unreadable files are skipped.
    pub fn list(&self) -> Result<Vec<SessionInfo>, PersistenceError> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error(&self.dir, e)),
        };

        let mut sessions = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let parsed = std::fs::read(&path)
                .ok()
                .and_then(|bytes| serde_json::from_slice::<SessionFile>(&bytes).ok());
            match parsed {
                Some(file) => sessions.push(SessionInfo {
                    name: name.to_string(),
                    last_saved: file.last_saved,
                    message_count: file.message_count,
                }),
                None => tracing::warn!(path = %path.display(), "skipping unreadable session file"),
            }
        }
        sessions.sort_by(|a, b| b.last_saved.cmp(&a.last_saved));
        Ok(sessions)
    }

    pub fn delete(&self, name: &str) -> Result<bool, PersistenceError> {
        let path = self.path_for(name)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_error(&path, e)),
        }
    }
}

/// Render a conversation as Markdown, skipping the system prompt.
pub fn export_markdown(messages: &[Message]) -> String {
    let mut out = format!(
        "# Conversation\n\n_Exported {}_\n",
        Utc::now().format("%Y-%m-%d %H:%M UTC")
    );
    for message in messages {
        let heading = match message.role {
            Role::User => "You",
            Role::Assistant => "Assistant",
            Role::System => continue,
        };
        out.push_str(&format!("\n## {heading}\n\n{}\n", message.content.trim()));
    }
    out
}

/// Write a Markdown export to `path`, creating parent directories.
pub fn write_export(path: &Path, messages: &[Message]) -> Result<(), PersistenceError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| io_error(parent, e))?;
    }
    std::fs::write(path, export_markdown(messages)).map_err(|e| io_error(path, e))
}

fn validate_name(name: &str) -> Result<(), PersistenceError> {
    let ok = !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(PersistenceError::InvalidName(name.to_string()))
    }
}

fn io_error(path: &Path, source: std::io::Error) -> PersistenceError {
    PersistenceError::Io {
        path: path.display().to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<Message> {
        vec![
            Message::system("You are femtobot."),
            Message::user("¿Qué hora es?"),
            Message::assistant("Son las 10."),
        ]
    }

    #[test]
    fn save_and_load_preserve_order_role_and_content() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());

        store.save("default", &sample()).unwrap();
        let loaded = store.load("default").unwrap().unwrap();

        assert_eq!(loaded.len(), 3);
        for (a, b) in loaded.iter().zip(sample()) {
            assert_eq!(a.role, b.role);
            assert_eq!(a.content, b.content);
        }
        assert!(!dir.path().join("default.json.tmp").exists());
    }

    #[test]
    fn file_has_documented_shape() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        let path = store.save("work", &sample()).unwrap();

        let value: serde_json::Value =
            serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap();
        assert_eq!(value["version"], 1);
        assert_eq!(value["message_count"], 3);
        assert_eq!(value["history"][1]["role"], "user");
        assert!(value["last_saved"].is_string());
    }

    #[test]
    fn missing_session_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        assert!(store.load("nope").unwrap().is_none());
        assert!(!store.delete("nope").unwrap());
    }

    #[test]
    fn corrupt_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bad.json"), b"{not json").unwrap();
        let store = SessionStore::new(dir.path());

        assert!(matches!(
            store.load("bad"),
            Err(PersistenceError::Corrupt { .. })
        ));
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn path_traversal_names_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        assert!(matches!(
            store.save("../etc/passwd", &sample()),
            Err(PersistenceError::InvalidName(_))
        ));
    }

    #[test]
    fn list_reports_saved_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        store.save("a", &sample()).unwrap();
        store.save("b", &sample()[..1]).unwrap();

        let mut names: Vec<String> = store.list().unwrap().into_iter().map(|s| s.name).collect();
        names.sort();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn markdown_export_skips_system_prompt() {
        let md = export_markdown(&sample());
        assert!(!md.contains("You are femtobot."));
        assert!(md.contains("## You\n\n¿Qué hora es?"));
        assert!(md.contains("## Assistant\n\nSon las 10."));
    }
}
