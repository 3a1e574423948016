use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct FemtoConfig {
    pub server: ServerConfig,
    pub model: ModelConfig,
    pub storage: StorageConfig,
    pub memory: MemoryConfig,
    pub schedule: ScheduleConfig,
    pub dispatch: DispatchConfig,
    pub session: SessionConfig,
    pub search: SearchConfig,
    pub lights: LightsConfig,
    pub ingest: IngestConfig,
    pub assistant: AssistantConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub log_level: String,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ModelConfig {
    pub base_url: String,
    pub name: String,
    /// Token budget for a single context window.
    pub context_limit: usize,
    pub request_timeout_secs: u64,
    pub embedding_model: String,
    pub stream: bool,
    /// Minutes without activity before the model is unloaded from RAM.
    pub idle_unload_minutes: u64,
    /// Answers `:::matematicas:::` turns. Empty disables the command.
    pub math_model: String,
    /// Describes incoming images. Empty means the chat model.
    pub vision_model: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: String,
    pub events_file: String,
    pub session_dir: String,
    pub instructions_file: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MemoryConfig {
    pub dedup_threshold: f64,
    pub delete_threshold: f64,
    pub recall_k: usize,
    pub rrf_k: usize,
    pub embedding_dimensions: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ScheduleConfig {
    pub crontab_bin: String,
    pub notify_command: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DispatchConfig {
    pub handler_timeout_secs: u64,
    pub worker_threads: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SessionConfig {
    pub inactivity_hours: u64,
    pub tokenizer_path: Option<String>,
    pub persist: bool,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SearchConfig {
    pub endpoint: String,
    pub image_endpoint: String,
    pub api_key: Option<String>,
    pub result_count: usize,
    pub image_count: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LightsConfig {
    pub port: u16,
    /// Light or group name → one or more device IPs.
    pub devices: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct IngestConfig {
    pub max_document_chars: usize,
    /// `command` or `http`.
    pub transcriber: String,
    pub transcribe_command: Vec<String>,
    pub transcribe_url: String,
    pub transcribe_model: String,
    /// Upper bound for one extraction, transcription or image description.
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AssistantConfig {
    pub fallback_message: String,
    pub rate_limit_messages: usize,
    pub rate_limit_window_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            host: "127.0.0.1".into(),
            port: 8765,
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".into(),
            name: "llama3.1:8b".into(),
            context_limit: 32_000,
            request_timeout_secs: 300,
            embedding_model: "nomic-embed-text".into(),
            stream: true,
            idle_unload_minutes: 30,
            math_model: String::new(),
            vision_model: String::new(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let dir = default_femto_dir();
        Self {
            db_path: dir.join("memory.db").to_string_lossy().into_owned(),
            events_file: dir.join("events.txt").to_string_lossy().into_owned(),
            session_dir: dir.join("sessions").to_string_lossy().into_owned(),
            instructions_file: dir.join("instructions.md").to_string_lossy().into_owned(),
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            dedup_threshold: 0.92,
            delete_threshold: 0.75,
            recall_k: 3,
            rrf_k: 60,
            embedding_dimensions: 768,
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            crontab_bin: "crontab".into(),
            notify_command: "notify-send".into(),
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            handler_timeout_secs: 30,
            worker_threads: 2,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            inactivity_hours: 24,
            tokenizer_path: None,
            persist: true,
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.search.brave.com/res/v1/web/search".into(),
            image_endpoint: "https://api.search.brave.com/res/v1/images/search".into(),
            api_key: None,
            result_count: 3,
            image_count: 5,
        }
    }
}

impl Default for LightsConfig {
    fn default() -> Self {
        Self {
            port: 38899,
            devices: BTreeMap::new(),
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_document_chars: 100_000,
            transcriber: "command".into(),
            transcribe_command: vec![
                "whisper-cli".into(),
                "--no-prints".into(),
                "--no-timestamps".into(),
                "-f".into(),
                "{input}".into(),
            ],
            transcribe_url: "http://localhost:8000".into(),
            transcribe_model: "whisper-1".into(),
            timeout_secs: 180,
        }
    }
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            fallback_message:
                "Sorry, I can't reach the language model right now. Please try again in a moment."
                    .into(),
            rate_limit_messages: 10,
            rate_limit_window_secs: 60,
        }
    }
}

/// Returns `~/.femtobot/`
pub fn default_femto_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".femtobot")
}

/// Returns the default config file path: `~/.femtobot/config.toml`
pub fn default_config_path() -> PathBuf {
    default_femto_dir().join("config.toml")
}

impl FemtoConfig {
    /// Load config from TOML file (if it exists) then apply env var overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(default_config_path())
    }

    /// Load from a specific path, then apply env var overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents =
                std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str(&contents).context("failed to parse config TOML")?
        } else {
            info!("no config file at {}, using defaults", path.display());
            FemtoConfig::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("FEMTOBOT_DB") {
            self.storage.db_path = val;
        }
        if let Ok(val) = std::env::var("FEMTOBOT_MODEL") {
            self.model.name = val;
        }
        if let Ok(val) = std::env::var("FEMTOBOT_OLLAMA_URL") {
            self.model.base_url = val;
        }
        if let Ok(val) = std::env::var("FEMTOBOT_LOG_LEVEL") {
            self.server.log_level = val;
        }
        if let Ok(val) = std::env::var("BRAVE_API_KEY") {
            if !val.trim().is_empty() {
                self.search.api_key = Some(val);
            }
        }
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.model.context_limit > 0,
            "model.context_limit must be positive"
        );
        if self.model.context_limit < 1000 {
            tracing::warn!(
                context_limit = self.model.context_limit,
                "model.context_limit is very low; conversations will be pruned aggressively"
            );
        }
        for (name, value) in [
            ("memory.dedup_threshold", self.memory.dedup_threshold),
            ("memory.delete_threshold", self.memory.delete_threshold),
        ] {
            anyhow::ensure!(
                (0.0..=1.0).contains(&value),
                "{name} must be between 0.0 and 1.0"
            );
        }
        anyhow::ensure!(
            self.memory.embedding_dimensions > 0,
            "memory.embedding_dimensions must be positive"
        );
        anyhow::ensure!(self.ingest.timeout_secs > 0, "ingest.timeout_secs must be positive");
        anyhow::ensure!(
            self.dispatch.worker_threads > 0,
            "dispatch.worker_threads must be at least 1"
        );
        Ok(())
    }

    pub fn resolved_db_path(&self) -> PathBuf {
        expand_tilde(&self.storage.db_path)
    }

    pub fn resolved_session_dir(&self) -> PathBuf {
        expand_tilde(&self.storage.session_dir)
    }

    pub fn resolved_events_file(&self) -> PathBuf {
        expand_tilde(&self.storage.events_file)
    }

    pub fn handler_timeout(&self) -> Duration {
        Duration::from_secs(self.dispatch.handler_timeout_secs)
    }

    pub fn model_timeout(&self) -> Duration {
        Duration::from_secs(self.model.request_timeout_secs)
    }

    pub fn ingest_timeout(&self) -> Duration {
        Duration::from_secs(self.ingest.timeout_secs)
    }

    /// Read the system instructions file. A missing or empty file yields `None`.
    pub fn load_instructions(&self) -> Option<String> {
        let path = expand_tilde(&self.storage.instructions_file);
        match std::fs::read_to_string(&path) {
            Ok(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "instructions file not loaded");
                None
            }
        }
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}
