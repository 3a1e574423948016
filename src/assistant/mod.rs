//! Conversation orchestration.
//!
//! One turn: append the user message, build a pruned context with a fresh
//! system note, call the model, strip and dispatch the command tokens in its
//! reply, and feed command results back into the history. A successful
//! `search` triggers one follow-up model call so the answer can use the
//! results, and `matematicas` hands the question to the math model.
//!
//! Documents, voice notes and images are turned into text first, within
//! `ingest.timeout_secs`.

pub mod prompt;
pub mod queue;
pub mod rate_limit;

use anyhow::{Context, Result};
use chrono::Local;
use serde::Serialize;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::command::{parse, CommandName, Dispatcher};
use crate::config::FemtoConfig;
use crate::error::ModelError;
use crate::ingest::{frame_document, DocumentExtractor, DocumentKind, Transcriber};
use crate::llm::ModelRuntime;
use crate::session::estimate::MESSAGE_OVERHEAD;
use crate::session::{Message, Role, SessionManager, TokenUsage};
use crate::worker::WorkerPool;

pub use prompt::DEFAULT_SYSTEM_PROMPT;
pub use queue::{ChatQueue, TurnRequest};
pub use rate_limit::RateLimiter;

/// Follow-up model calls allowed per user turn.
const MAX_FOLLOW_UPS: usize = 1;

/// What the user gets back for one turn.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TurnReply {
    pub reply: String,
    /// Command notices (saved facts, scheduled reminders, image URLs, ...).
    pub notices: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcript: Option<String>,
}

/// Everything the assistant calls out to.
pub struct Collaborators {
    pub model: Arc<dyn ModelRuntime>,
    pub dispatcher: Dispatcher,
    pub extractor: Arc<dyn DocumentExtractor>,
    pub transcriber: Arc<dyn Transcriber>,
    pub workers: WorkerPool,
}

pub struct Assistant {
    model: Arc<dyn ModelRuntime>,
    dispatcher: Dispatcher,
    extractor: Arc<dyn DocumentExtractor>,
    transcriber: Arc<dyn Transcriber>,
    workers: WorkerPool,
    math_model: Option<Arc<dyn ModelRuntime>>,
    vision_model: Option<Arc<dyn ModelRuntime>>,
    sessions: Arc<SessionManager>,
    system_prompt: String,
    context_limit: usize,
    ingest_timeout: Duration,
    recall_k: usize,
    stream: bool,
    fallback_message: String,
    last_model_use: Mutex<Option<Instant>>,
}

impl Assistant {
    pub fn new(config: &FemtoConfig, sessions: Arc<SessionManager>, parts: Collaborators) -> Self {
        let system_prompt = config
            .load_instructions()
            .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string());
        Self {
            model: parts.model,
            dispatcher: parts.dispatcher,
            extractor: parts.extractor,
            transcriber: parts.transcriber,
            workers: parts.workers,
            math_model: None,
            vision_model: None,
            sessions,
            system_prompt,
            context_limit: config.model.context_limit,
            ingest_timeout: config.ingest_timeout(),
            recall_k: config.memory.recall_k,
            stream: config.model.stream,
            fallback_message: config.assistant.fallback_message.clone(),
            last_model_use: Mutex::new(None),
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    /// Model that answers `:::matematicas:::` turns.
    pub fn with_math_model(mut self, model: Arc<dyn ModelRuntime>) -> Self {
        self.math_model = Some(model);
        self
    }

    /// Model that describes images. Without one the chat model is asked.
    pub fn with_vision_model(mut self, model: Arc<dyn ModelRuntime>) -> Self {
        self.vision_model = Some(model);
        self
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    pub fn model_name(&self) -> &str {
        self.model.model_name()
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Route one queued request. Called by [`ChatQueue`] workers.
    pub async fn process(&self, chat_id: &str, request: TurnRequest) -> Result<TurnReply> {
        match request {
            TurnRequest::Message(text) => Ok(self.handle_message(chat_id, &text).await),
            TurnRequest::Document {
                path,
                file_name,
                caption,
            } => self
                .handle_document(chat_id, path, &file_name, caption.as_deref())
                .await,
            TurnRequest::Audio { path } => self.handle_audio(chat_id, &path).await,
            TurnRequest::Image { path, caption } => {
                self.handle_image(chat_id, &path, caption.as_deref()).await
            }
            TurnRequest::Reset => {
                self.reset(chat_id).await;
                Ok(TurnReply::default())
            }
        }
    }

    pub async fn handle_message(&self, chat_id: &str, text: &str) -> TurnReply {
        info!(chat_id = %chat_id, chars = text.len(), "user message");
        self.sessions.ensure(chat_id, &self.system_prompt).await;
        self.sessions.append(chat_id, Message::user(text)).await;
        self.respond(chat_id, text).await
    }

    pub async fn handle_document(
        &self,
        chat_id: &str,
        path: PathBuf,
        file_name: &str,
        caption: Option<&str>,
    ) -> Result<TurnReply> {
        DocumentKind::from_file_name(file_name)?;

        let extractor = Arc::clone(&self.extractor);
        let name = file_name.to_string();
        let extraction = self.workers.submit(move || extractor.extract(&path, &name));
        let Some(document) = self
            .within_ingest_limit(chat_id, "document", async move {
                extraction.await.and_then(|extracted| extracted)
            })
            .await
        else {
            return Ok(too_slow("Reading the document"));
        };
        let document = document?;
        info!(chat_id = %chat_id, file = %file_name, kind = document.kind.label(), truncated = document.truncated, "document received");

        let framed = frame_document(file_name, &document, caption);
        let query = caption.unwrap_or(file_name);
        self.sessions.ensure(chat_id, &self.system_prompt).await;
        self.sessions.append(chat_id, Message::user(framed)).await;
        Ok(self.respond(chat_id, query).await)
    }

    pub async fn handle_audio(&self, chat_id: &str, path: &Path) -> Result<TurnReply> {
        let Some(transcript) = self
            .within_ingest_limit(chat_id, "audio", self.transcriber.transcribe(path))
            .await
        else {
            return Ok(too_slow("Transcribing the audio"));
        };
        let transcript = transcript.context("transcription failed")?;
        let mut reply = self.handle_message(chat_id, &transcript).await;
        reply.transcript = Some(transcript);
        Ok(reply)
    }

    /// Describe the image with the vision model, then answer the description
    /// like a user message.
    pub async fn handle_image(
        &self,
        chat_id: &str,
        path: &Path,
        caption: Option<&str>,
    ) -> Result<TurnReply> {
        let caption = caption.map(str::trim).filter(|c| !c.is_empty());
        let vision = self.vision_model.as_ref().unwrap_or(&self.model);
        let prompt = match caption {
            Some(caption) => format!(
                "The user sent this image with the message: '{caption}'. Describe the image in detail."
            ),
            None => "Describe this image in detail: objects, people, colours, visible text and \
                     anything else relevant."
                .to_string(),
        };

        let describe = async {
            let image = tokio::fs::read(path)
                .await
                .with_context(|| format!("failed to read {}", path.display()))?;
            vision
                .describe_image(&image, &prompt)
                .await
                .context("image description failed")
        };
        let described = self.within_ingest_limit(chat_id, "image", describe).await;
        if self.vision_model.is_some() {
            release(vision.as_ref()).await;
        }
        let Some(description) = described else {
            return Ok(too_slow("Looking at the image"));
        };
        let description = description?;
        info!(chat_id = %chat_id, model = %vision.model_name(), chars = description.len(), "image described");

        let framed = match caption {
            Some(caption) => format!(
                "[The user sent an image with the message: '{caption}']\n\n\
                 [Image description: {description}]\n\n\
                 Respond taking into account the image and the user's message."
            ),
            None => format!(
                "[The user sent an image]\n\n\
                 [Image description: {description}]\n\n\
                 Comment on the image in a helpful way."
            ),
        };
        self.sessions.ensure(chat_id, &self.system_prompt).await;
        self.sessions.append(chat_id, Message::user(framed)).await;
        Ok(self.respond(chat_id, caption.unwrap_or(&description)).await)
    }

    pub async fn reset(&self, chat_id: &str) {
        self.sessions.reset(chat_id, &self.system_prompt).await;
    }

    pub async fn usage(&self, chat_id: &str) -> TokenUsage {
        self.sessions.usage(chat_id).await
    }

    /// Unload the chat model, and the vision and math models when they are
    /// separate ones.
    pub async fn unload_model(&self) -> Result<(), ModelError> {
        for extra in [&self.vision_model, &self.math_model].into_iter().flatten() {
            release(extra.as_ref()).await;
        }
        self.model.unload().await?;
        *self.lock_last_use() = None;
        info!(model = %self.model.model_name(), "model unloaded");
        Ok(())
    }

    /// Unload the model if it was used and has been idle for `threshold`.
    pub async fn unload_if_idle(&self, threshold: Duration) -> bool {
        let idle = self.lock_last_use().is_some_and(|t| t.elapsed() >= threshold);
        if !idle {
            return false;
        }
        match self.unload_model().await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "idle unload failed");
                false
            }
        }
    }

    fn lock_last_use(&self) -> std::sync::MutexGuard<'_, Option<Instant>> {
        self.last_model_use.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// `None` when `work` outlives the ingest bound.
    async fn within_ingest_limit<T>(
        &self,
        chat_id: &str,
        what: &'static str,
        work: impl Future<Output = Result<T>>,
    ) -> Option<Result<T>> {
        match tokio::time::timeout(self.ingest_timeout, work).await {
            Ok(result) => Some(result),
            Err(_) => {
                warn!(chat_id = %chat_id, input = what, timeout_secs = self.ingest_timeout.as_secs(), "ingestion timed out");
                None
            }
        }
    }

    /// Ask the math model, with the conversation minus system messages.
    async fn solve_math(&self, chat_id: &str) -> Option<String> {
        let Some(math) = &self.math_model else {
            warn!(chat_id = %chat_id, "matematicas requested but model.math_model is not set");
            return None;
        };
        let messages: Vec<Message> = self
            .sessions
            .get_context(chat_id, self.context_limit)
            .await
            .into_iter()
            .filter(|m| m.role != Role::System)
            .collect();
        info!(chat_id = %chat_id, model = %math.model_name(), "question routed to the math model");

        let answer = generate_with(math.as_ref(), &messages, self.stream).await;
        release(math.as_ref()).await;
        match answer {
            Ok(answer) => Some(answer),
            Err(e) => {
                warn!(chat_id = %chat_id, error = %e, "math model failed; keeping the chat reply");
                None
            }
        }
    }

    async fn respond(&self, chat_id: &str, query: &str) -> TurnReply {
        let mut replies: Vec<String> = Vec::new();
        let mut notices = Vec::new();
        let mut follow_ups = 0;
        let mut math_answered = false;

        loop {
            let context = self.build_context(chat_id, query).await;
            *self.lock_last_use() = Some(Instant::now());

            let raw = match self.generate(&context).await {
                Ok(raw) => raw,
                Err(e) => {
                    replies.push(self.model_failure_message(chat_id, &e));
                    break;
                }
            };

            let mut parsed = parse(&raw);
            let wants_math = parsed
                .invocations
                .iter()
                .any(|i| CommandName::from_name(&i.name) == CommandName::Math);
            if wants_math && !math_answered {
                math_answered = true;
                if let Some(answer) = self.solve_math(chat_id).await {
                    parsed = parse(&answer);
                }
            }
            if !parsed.display_text.is_empty() {
                self.sessions
                    .append(chat_id, Message::assistant(parsed.display_text.clone()))
                    .await;
                replies.push(parsed.display_text);
            }

            let outcomes = self.dispatcher.dispatch_all(chat_id, &parsed.invocations).await;
            let mut feedback = Vec::new();
            let mut results = Vec::new();
            for outcome in &outcomes {
                let result = &outcome.result;
                if let Some(notice) = &result.user_visible_text {
                    notices.push(notice.clone());
                }
                match (&result.context_append_text, result.success) {
                    (Some(text), true) => results.push(text.clone()),
                    (Some(text), false) => feedback.push(text.clone()),
                    (None, _) => {}
                }
            }

            if !feedback.is_empty() {
                self.sessions
                    .append(chat_id, Message::system(feedback.join("\n")))
                    .await;
            }

            if results.is_empty() || follow_ups >= MAX_FOLLOW_UPS {
                break;
            }
            follow_ups += 1;
            debug!(chat_id = %chat_id, "follow-up turn with command results");
            self.sessions
                .append(chat_id, Message::user(results.join("\n\n")))
                .await;
        }

        TurnReply {
            reply: replies.join("\n\n"),
            notices,
            transcript: None,
        }
    }

    async fn generate(&self, context: &[Message]) -> Result<String, ModelError> {
        generate_with(self.model.as_ref(), context, self.stream).await
    }

    /// Pruned history plus the system note, all within the token budget.
    async fn build_context(&self, chat_id: &str, query: &str) -> Vec<Message> {
        let handlers = self.dispatcher.handlers();

        let facts = if self.recall_k > 0 {
            handlers
                .memory
                .search(query, self.recall_k)
                .await
                .unwrap_or_else(|e| {
                    warn!(error = %e, "memory recall failed");
                    Vec::new()
                })
        } else {
            Vec::new()
        };
        let schedule = handlers.scheduler.list().await.unwrap_or_else(|e| {
            debug!(error = %e, "schedule unavailable for context");
            Vec::new()
        });

        let note = prompt::context_note(Local::now().naive_local(), &facts, &schedule);
        let note_cost = self.sessions.estimator().count_text(&note) + MESSAGE_OVERHEAD;
        let budget = self.context_limit.saturating_sub(note_cost);

        let mut context = self.sessions.get_context(chat_id, budget).await;
        context.push(Message::system(note));
        context
    }

    fn model_failure_message(&self, chat_id: &str, err: &ModelError) -> String {
        error!(chat_id = %chat_id, error = %err, "model call failed");
        match err {
            e if e.is_transient() => self.fallback_message.clone(),
            ModelError::ModelNotLoaded(name) => format!(
                "The model {name} is not available on the model runtime. Pull it first, then try again."
            ),
            _ => "Something went wrong while generating a reply. Please try again.".to_string(),
        }
    }
}

async fn generate_with(
    model: &dyn ModelRuntime,
    context: &[Message],
    stream: bool,
) -> Result<String, ModelError> {
    model.generate(context, stream).await?.collect().await
}

/// Unload a helper model, logging rather than returning failures.
async fn release(model: &dyn ModelRuntime) {
    match model.unload().await {
        Ok(()) => debug!(model = %model.model_name(), "helper model unloaded"),
        Err(e) => warn!(model = %model.model_name(), error = %e, "helper model unload failed"),
    }
}

fn too_slow(step: &str) -> TurnReply {
    TurnReply {
        reply: format!("{step} took too long, so I stopped. Please try again with something smaller."),
        ..TurnReply::default()
    }
}
