//! HTTP gateway for messaging clients.
//!
//! Provides [`setup_shared_state`], which wires configuration into a ready
//! [`Assistant`], and [`serve`], which exposes it over HTTP together with the
//! background jobs. Sessions are never persisted in this mode.

use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::assistant::{Assistant, ChatQueue, Collaborators, RateLimiter, TurnReply, TurnRequest};
use crate::command::{Dispatcher, Handlers};
use crate::config::FemtoConfig;
use crate::db;
use crate::embedding::{EmbeddingProvider, OllamaEmbedder};
use crate::error::ValidationError;
use crate::events::FileEventQueue;
use crate::ingest::{build_transcriber, LocalExtractor};
use crate::jobs;
use crate::lights::WizController;
use crate::llm::{ModelRuntime, OllamaClient};
use crate::memory::SqliteMemoryStore;
use crate::schedule::{CrontabScheduler, Scheduler};
use crate::search::BraveSearch;
use crate::session::{CharEstimator, SessionManager, TokenEstimator, TokenizerEstimator};
use crate::worker::WorkerPool;

/// Long-lived components shared by the gateway, the terminal chat and the jobs.
pub struct SharedState {
    pub assistant: Arc<Assistant>,
    pub memory: Arc<SqliteMemoryStore>,
    pub scheduler: Arc<dyn Scheduler>,
}

/// Open the database, build every collaborator and assemble the assistant.
pub async fn setup_shared_state(config: &FemtoConfig) -> Result<SharedState> {
    let db_path = config.resolved_db_path();
    let conn = db::open_database(&db_path, config.memory.embedding_dimensions)?;
    tracing::info!(db = %db_path.display(), "database ready");

    let embedder: Arc<dyn EmbeddingProvider> =
        Arc::new(OllamaEmbedder::new(&config.model, &config.memory)?);
    let memory = Arc::new(
        SqliteMemoryStore::new(conn, Some(embedder), config.memory.clone()).with_db_path(db_path),
    );
    memory.check_embedding_model().await?;

    let scheduler: Arc<dyn Scheduler> =
        Arc::new(CrontabScheduler::new(config.schedule.crontab_bin.clone()));
    let handlers = Handlers {
        memory: memory.clone(),
        scheduler: scheduler.clone(),
        search: Arc::new(BraveSearch::new(&config.search)?),
        lights: Arc::new(WizController::new(&config.lights)),
    };

    let sessions = Arc::new(SessionManager::new(token_estimator(config)));
    let parts = Collaborators {
        model: Arc::new(OllamaClient::new(&config.model)?),
        dispatcher: Dispatcher::new(handlers, config),
        extractor: Arc::new(LocalExtractor::new(config.ingest.max_document_chars)),
        transcriber: build_transcriber(&config.ingest)?,
        workers: WorkerPool::new(config.dispatch.worker_threads),
    };
    let mut assistant = Assistant::new(config, sessions, parts);
    if let Some(math) = helper_model(config, &config.model.math_model)? {
        assistant = assistant.with_math_model(math);
    }
    if let Some(vision) = helper_model(config, &config.model.vision_model)? {
        assistant = assistant.with_vision_model(vision);
    }
    let assistant = Arc::new(assistant);
    tracing::info!(model = %assistant.model_name(), "assistant ready");

    Ok(SharedState {
        assistant,
        memory,
        scheduler,
    })
}

/// A separate model on the same runtime, unless `name` is empty or the chat model.
fn helper_model(config: &FemtoConfig, name: &str) -> Result<Option<Arc<dyn ModelRuntime>>> {
    let name = name.trim();
    if name.is_empty() || name == config.model.name {
        return Ok(None);
    }
    tracing::info!(model = %name, "helper model configured");
    Ok(Some(Arc::new(OllamaClient::for_model(&config.model, name)?)))
}

fn token_estimator(config: &FemtoConfig) -> Arc<dyn TokenEstimator> {
    let Some(path) = config.session.tokenizer_path.as_deref() else {
        return Arc::new(CharEstimator);
    };
    match TokenizerEstimator::from_file(crate::config::expand_tilde(path)) {
        Ok(estimator) => {
            tracing::info!(path = %path, "using tokenizer for token estimates");
            Arc::new(estimator)
        }
        Err(e) => {
            tracing::warn!(error = %e, "tokenizer unavailable, using character estimate");
            Arc::new(CharEstimator)
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub queue: Arc<ChatQueue>,
    pub limiter: Arc<RateLimiter>,
    pub events: Arc<FileEventQueue>,
    pub context_limit: usize,
}

impl AppState {
    pub fn new(assistant: Arc<Assistant>, config: &FemtoConfig) -> Self {
        Self {
            queue: Arc::new(ChatQueue::new(assistant)),
            limiter: Arc::new(RateLimiter::new(
                config.assistant.rate_limit_messages,
                Duration::from_secs(config.assistant.rate_limit_window_secs),
            )),
            events: Arc::new(FileEventQueue::new(config.resolved_events_file())),
            context_limit: config.model.context_limit,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/events", get(drain_events))
        .route("/chats/{chat_id}/messages", post(post_message))
        .route("/chats/{chat_id}/documents", post(post_document))
        .route("/chats/{chat_id}/audio", post(post_audio))
        .route("/chats/{chat_id}/images", post(post_image))
        .route("/chats/{chat_id}/reset", post(reset_chat))
        .route("/chats/{chat_id}/status", get(chat_status))
        .with_state(state)
}

/// Run the gateway until ctrl-c.
pub async fn serve(config: FemtoConfig) -> Result<()> {
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let shared = setup_shared_state(&config).await?;
    let state = AppState::new(shared.assistant.clone(), &config);

    let mut background = jobs::spawn_all(
        &config,
        shared.assistant.clone(),
        shared.scheduler.clone(),
        Some(state.queue.clone()),
    );

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    tracing::info!(addr = %bind_addr, "gateway listening at http://{bind_addr}");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for ctrl-c");
            }
            tracing::info!("shutting down gateway");
        })
        .await?;

    background.abort_all();
    Ok(())
}

#[derive(Deserialize)]
struct MessageBody {
    text: String,
}

#[derive(Deserialize)]
struct DocumentBody {
    file_name: String,
    #[serde(default)]
    caption: Option<String>,
    path: PathBuf,
}

#[derive(Deserialize)]
struct AudioBody {
    path: PathBuf,
}

#[derive(Deserialize)]
struct ImageBody {
    path: PathBuf,
    #[serde(default)]
    caption: Option<String>,
}

#[derive(Serialize)]
struct StatusBody {
    chat_id: String,
    messages: usize,
    tokens: usize,
    context_limit: usize,
    model: String,
}

#[derive(Serialize)]
struct EventsBody {
    events: Vec<String>,
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "model": state.queue.assistant().model_name(),
    }))
}

async fn drain_events(State(state): State<AppState>) -> Result<Json<EventsBody>, AppError> {
    let events = state.events.drain().await?;
    Ok(Json(EventsBody { events }))
}

async fn post_message(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
    Json(body): Json<MessageBody>,
) -> Result<Json<TurnReply>, AppError> {
    if body.text.trim().is_empty() {
        return Err(AppError::BadRequest("text must not be empty".into()));
    }
    state.limiter.check(&chat_id).map_err(AppError::RateLimited)?;
    let reply = state
        .queue
        .submit(&chat_id, TurnRequest::Message(body.text))
        .await?;
    Ok(Json(reply))
}

async fn post_document(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
    Json(body): Json<DocumentBody>,
) -> Result<Json<TurnReply>, AppError> {
    state.limiter.check(&chat_id).map_err(AppError::RateLimited)?;
    let request = TurnRequest::Document {
        path: body.path,
        file_name: body.file_name,
        caption: body.caption,
    };
    Ok(Json(state.queue.submit(&chat_id, request).await?))
}

async fn post_audio(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
    Json(body): Json<AudioBody>,
) -> Result<Json<TurnReply>, AppError> {
    state.limiter.check(&chat_id).map_err(AppError::RateLimited)?;
    let request = TurnRequest::Audio { path: body.path };
    Ok(Json(state.queue.submit(&chat_id, request).await?))
}

async fn post_image(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
    Json(body): Json<ImageBody>,
) -> Result<Json<TurnReply>, AppError> {
    state.limiter.check(&chat_id).map_err(AppError::RateLimited)?;
    let request = TurnRequest::Image {
        path: body.path,
        caption: body.caption,
    };
    Ok(Json(state.queue.submit(&chat_id, request).await?))
}

async fn reset_chat(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
) -> Result<StatusCode, AppError> {
    state.queue.submit(&chat_id, TurnRequest::Reset).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn chat_status(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
) -> Json<StatusBody> {
    let assistant = state.queue.assistant();
    let usage = assistant.usage(&chat_id).await;
    Json(StatusBody {
        chat_id,
        messages: usage.messages,
        tokens: usage.tokens,
        context_limit: state.context_limit,
        model: assistant.model_name().to_string(),
    })
}

/// Body of every 500; the details stay in the log.
const INTERNAL_ERROR_MESSAGE: &str = "Something went wrong while handling this request. Please try again.";

/// Gateway error responses. Bodies are `{"error": ...}`.
#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    UnsupportedMedia(String),
    RateLimited(Duration),
    Internal(anyhow::Error),
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast_ref::<ValidationError>() {
            Some(ValidationError::UnsupportedDocument(name)) => {
                Self::UnsupportedMedia(format!("unsupported document type: {name}"))
            }
            Some(other) => Self::BadRequest(other.to_string()),
            None => Self::Internal(err),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            Self::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, Json(serde_json::json!({ "error": message }))).into_response()
            }
            Self::UnsupportedMedia(message) => (
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                Json(serde_json::json!({ "error": message })),
            )
                .into_response(),
            Self::RateLimited(retry_after) => {
                let secs = retry_after.as_secs().max(1);
                let mut response = (
                    StatusCode::TOO_MANY_REQUESTS,
                    Json(serde_json::json!({
                        "error": "rate limit exceeded",
                        "retry_after_secs": secs,
                    })),
                )
                    .into_response();
                response
                    .headers_mut()
                    .insert(header::RETRY_AFTER, HeaderValue::from(secs));
                response
            }
            Self::Internal(err) => {
                tracing::error!(error = %format!("{err:#}"), "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(serde_json::json!({ "error": INTERNAL_ERROR_MESSAGE })),
                )
                    .into_response()
            }
        }
    }
}
