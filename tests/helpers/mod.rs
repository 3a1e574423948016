#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use femtobot::assistant::{Assistant, Collaborators};
use femtobot::command::{Dispatcher, Handlers};
use femtobot::config::FemtoConfig;
use femtobot::db;
use femtobot::error::{DispatchError, ModelError};
use femtobot::ingest::{LocalExtractor, Transcriber};
use femtobot::lights::{LightAction, LightController};
use femtobot::llm::{ModelOutput, ModelRuntime};
use femtobot::memory::SqliteMemoryStore;
use femtobot::schedule::{Created, ScheduleEntry, ScheduleSpec, Scheduler};
use femtobot::search::{SearchHit, SearchProvider};
use femtobot::session::{CharEstimator, Message, Role, SessionManager};
use femtobot::worker::WorkerPool;

pub const DIM: usize = 8;
pub const SYSTEM_PROMPT: &str = "You are a test assistant.";

/// Config with small vectors and no instructions file on disk.
pub fn test_config() -> FemtoConfig {
    let mut config = FemtoConfig::default();
    config.memory.embedding_dimensions = DIM;
    config.model.stream = false;
    config.storage.instructions_file = "/nonexistent/femtobot/instructions.md".into();
    config.storage.events_file = "/tmp/femtobot-test-events.txt".into();
    config
}

/// Keyword-only fact store over a fresh in-memory database.
pub fn memory_store() -> SqliteMemoryStore {
    let conn = db::open_memory_database(DIM).unwrap();
    SqliteMemoryStore::new(conn, None, test_config().memory)
}

/// When a generate call ran, keyed by the last user message it saw.
#[derive(Debug, Clone)]
pub struct Span {
    pub input: String,
    pub start: Instant,
    pub end: Instant,
}

impl Span {
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// Replays canned replies in order and records every context it was given.
pub struct ScriptedModel {
    replies: Mutex<VecDeque<Result<String, ModelError>>>,
    delay: Duration,
    description: String,
    pub contexts: Mutex<Vec<Vec<Message>>>,
    pub spans: Mutex<Vec<Span>>,
    pub image_prompts: Mutex<Vec<(Vec<u8>, String)>>,
    pub unloads: Mutex<usize>,
}

impl ScriptedModel {
    pub fn new(replies: Vec<Result<String, ModelError>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            delay: Duration::ZERO,
            description: "An empty picture.".to_string(),
            contexts: Mutex::new(Vec::new()),
            spans: Mutex::new(Vec::new()),
            image_prompts: Mutex::new(Vec::new()),
            unloads: Mutex::new(0),
        }
    }

    /// Every generate call sleeps for `delay` before replying.
    pub fn slow(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// The text `describe_image` returns.
    pub fn describing(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn unload_count(&self) -> usize {
        *self.unloads.lock().unwrap()
    }

    pub fn spans(&self) -> Vec<Span> {
        self.spans.lock().unwrap().clone()
    }

    pub fn replying(replies: &[&str]) -> Self {
        Self::new(replies.iter().map(|r| Ok(r.to_string())).collect())
    }

    pub fn calls(&self) -> usize {
        self.contexts.lock().unwrap().len()
    }

    pub fn context(&self, call: usize) -> Vec<Message> {
        self.contexts.lock().unwrap()[call].clone()
    }
}

#[async_trait]
impl ModelRuntime for ScriptedModel {
    async fn generate(&self, context: &[Message], _stream: bool) -> Result<ModelOutput, ModelError> {
        let start = Instant::now();
        self.contexts.lock().unwrap().push(context.to_vec());
        let next = self.replies.lock().unwrap().pop_front();
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let input = context
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.clone())
            .unwrap_or_default();
        self.spans.lock().unwrap().push(Span {
            input,
            start,
            end: Instant::now(),
        });
        next.unwrap_or_else(|| Ok("(no more replies)".to_string()))
            .map(ModelOutput::Text)
    }

    async fn describe_image(&self, image: &[u8], prompt: &str) -> Result<String, ModelError> {
        self.image_prompts
            .lock()
            .unwrap()
            .push((image.to_vec(), prompt.to_string()));
        Ok(self.description.clone())
    }

    async fn unload(&self) -> Result<(), ModelError> {
        *self.unloads.lock().unwrap() += 1;
        Ok(())
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}

/// In-memory crontab that logs every operation in call order.
#[derive(Default)]
pub struct FakeScheduler {
    pub entries: Mutex<Vec<ScheduleEntry>>,
    pub log: Mutex<Vec<String>>,
}

impl FakeScheduler {
    pub fn operations(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.command.clone())
            .collect()
    }
}

#[async_trait]
impl Scheduler for FakeScheduler {
    async fn create(&self, spec: &ScheduleSpec, payload: &str) -> Result<Created, DispatchError> {
        self.log.lock().unwrap().push(format!("create:{}", spec.label));
        let mut entries = self.entries.lock().unwrap();
        let expression = spec.expression();
        if let Some(existing) = entries
            .iter()
            .find(|e| e.expression == expression && e.command == payload)
        {
            return Ok(Created {
                id: existing.id.clone().unwrap_or_default(),
                duplicate: true,
            });
        }
        let id = format!("job-{}", entries.len() + 1);
        entries.push(ScheduleEntry {
            id: Some(id.clone()),
            expression,
            command: payload.to_string(),
        });
        Ok(Created {
            id,
            duplicate: false,
        })
    }

    async fn delete(&self, match_token: &str) -> Result<usize, DispatchError> {
        self.log.lock().unwrap().push(format!("delete:{match_token}"));
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|e| !e.command.contains(match_token));
        Ok(before - entries.len())
    }

    async fn list(&self) -> Result<Vec<ScheduleEntry>, DispatchError> {
        Ok(self.entries.lock().unwrap().clone())
    }

    async fn cleanup_expired(&self, _now: chrono::NaiveDateTime) -> Result<usize, DispatchError> {
        Ok(0)
    }
}

pub struct FakeSearch {
    pub hits: Vec<SearchHit>,
    pub queries: Mutex<Vec<String>>,
}

impl FakeSearch {
    pub fn with_hit(title: &str, description: &str) -> Self {
        Self {
            hits: vec![SearchHit {
                title: title.into(),
                description: description.into(),
                url: "https://example.org/result".into(),
            }],
            queries: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl SearchProvider for FakeSearch {
    async fn web(&self, query: &str) -> Result<Vec<SearchHit>, DispatchError> {
        self.queries.lock().unwrap().push(query.to_string());
        Ok(self.hits.clone())
    }

    async fn images(&self, query: &str) -> Result<Vec<String>, DispatchError> {
        self.queries.lock().unwrap().push(query.to_string());
        Ok(vec![format!("https://img.example.org/{}.jpg", query.replace(' ', "-"))])
    }
}

#[derive(Default)]
pub struct FakeLights {
    pub calls: Mutex<Vec<(String, LightAction)>>,
}

#[async_trait]
impl LightController for FakeLights {
    async fn apply(&self, target: &str, action: LightAction) -> Result<String, DispatchError> {
        self.calls.lock().unwrap().push((target.to_string(), action));
        Ok(format!("light {target}: {}", action.describe()))
    }

    fn names(&self) -> Vec<String> {
        vec!["salon".into()]
    }
}

pub struct FixedTranscriber(pub String);

#[async_trait]
impl Transcriber for FixedTranscriber {
    async fn transcribe(&self, _audio: &Path) -> anyhow::Result<String> {
        Ok(self.0.clone())
    }
}

/// Never finishes.
pub struct StuckTranscriber;

#[async_trait]
impl Transcriber for StuckTranscriber {
    async fn transcribe(&self, _audio: &Path) -> anyhow::Result<String> {
        std::future::pending().await
    }
}

/// Optional collaborators for [`harness_with`].
#[derive(Default)]
pub struct Extras {
    pub transcriber: Option<Arc<dyn Transcriber>>,
    pub math: Option<Arc<ScriptedModel>>,
    pub vision: Option<Arc<ScriptedModel>>,
}

/// A fully wired assistant over fakes.
pub struct Harness {
    pub assistant: Arc<Assistant>,
    pub model: Arc<ScriptedModel>,
    pub memory: Arc<SqliteMemoryStore>,
    pub scheduler: Arc<FakeScheduler>,
    pub search: Arc<FakeSearch>,
    pub lights: Arc<FakeLights>,
}

pub fn harness(model: ScriptedModel) -> Harness {
    harness_with_config(model, &test_config())
}

pub fn harness_with_config(model: ScriptedModel, config: &FemtoConfig) -> Harness {
    harness_with(model, config, Extras::default())
}

pub fn harness_with(model: ScriptedModel, config: &FemtoConfig, extras: Extras) -> Harness {
    let model = Arc::new(model);
    let memory = Arc::new(memory_store());
    let scheduler = Arc::new(FakeScheduler::default());
    let search = Arc::new(FakeSearch::with_hit("Weather", "Sunny, 24°C"));
    let lights = Arc::new(FakeLights::default());

    let handlers = Handlers {
        memory: memory.clone(),
        scheduler: scheduler.clone(),
        search: search.clone(),
        lights: lights.clone(),
    };
    let sessions = Arc::new(SessionManager::new(Arc::new(CharEstimator)));
    let parts = Collaborators {
        model: model.clone(),
        dispatcher: Dispatcher::new(handlers, config),
        extractor: Arc::new(LocalExtractor::new(config.ingest.max_document_chars)),
        transcriber: extras
            .transcriber
            .unwrap_or_else(|| Arc::new(FixedTranscriber("recordame regar las plantas".into()))),
        workers: WorkerPool::new(1),
    };
    let mut assistant = Assistant::new(config, sessions, parts).with_system_prompt(SYSTEM_PROMPT);
    if let Some(math) = extras.math {
        assistant = assistant.with_math_model(math);
    }
    if let Some(vision) = extras.vision {
        assistant = assistant.with_vision_model(vision);
    }

    Harness {
        assistant: Arc::new(assistant),
        model,
        memory,
        scheduler,
        search,
        lights,
    }
}
