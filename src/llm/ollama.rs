use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{ModelOutput, ModelRuntime};
use crate::config::ModelConfig;
use crate::error::ModelError;
use crate::session::Message;

/// Client for the Ollama `/api/chat` endpoint.
pub struct OllamaClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
    timeout: Duration,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    stream: bool,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
    /// Base64-encoded images, for vision models.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    images: Vec<String>,
}

#[derive(Deserialize)]
struct ChatChunk {
    #[serde(default)]
    message: Option<ChunkMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct ChunkMessage {
    #[serde(default)]
    content: String,
}

#[derive(Serialize)]
struct UnloadRequest<'a> {
    model: &'a str,
    keep_alive: u32,
}

impl OllamaClient {
    pub fn new(config: &ModelConfig) -> Result<Self> {
        Self::for_model(config, &config.name)
    }

    /// A client for another model on the same runtime (math, vision).
    pub fn for_model(config: &ModelConfig, model: &str) -> Result<Self> {
        // no whole-request timeout: streamed replies can legitimately run long
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            timeout: Duration::from_secs(config.request_timeout_secs),
        })
    }

    fn map_send_error(&self, err: reqwest::Error) -> ModelError {
        if err.is_timeout() {
            ModelError::Timeout
        } else {
            ModelError::Unavailable(format!("{}: {err}", self.base_url))
        }
    }

    async fn check_status(&self, response: reqwest::Response) -> Result<reqwest::Response, ModelError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        if status == reqwest::StatusCode::NOT_FOUND && body.contains("not found") {
            return Err(ModelError::ModelNotLoaded(self.model.clone()));
        }
        Err(ModelError::Protocol(format!("HTTP {status}: {}", body.trim())))
    }

    async fn send_chat(&self, request: &ChatRequest<'_>) -> Result<reqwest::Response, ModelError> {
        let url = format!("{}/api/chat", self.base_url);
        let send = self.client.post(&url).json(request).send();
        let response = tokio::time::timeout(self.timeout, send)
            .await
            .map_err(|_| ModelError::Timeout)?
            .map_err(|e| self.map_send_error(e))?;
        self.check_status(response).await
    }

    /// Read a non-streamed reply body.
    async fn read_reply(&self, response: reqwest::Response) -> Result<String, ModelError> {
        let body = tokio::time::timeout(self.timeout, response.bytes())
            .await
            .map_err(|_| ModelError::Timeout)?
            .map_err(|e| self.map_send_error(e))?;
        let (content, _) = parse_chunk(&body)?
            .ok_or_else(|| ModelError::Protocol("empty response body".into()))?;
        Ok(content)
    }
}

/// Parse one NDJSON line. Blank lines yield `None`.
fn parse_chunk(line: &[u8]) -> Result<Option<(String, bool)>, ModelError> {
    let line = String::from_utf8_lossy(line);
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let chunk: ChatChunk = serde_json::from_str(line)
        .map_err(|e| ModelError::Protocol(format!("invalid chunk: {e}")))?;
    if let Some(error) = chunk.error {
        return Err(ModelError::Protocol(error));
    }
    let content = chunk.message.map(|m| m.content).unwrap_or_default();
    Ok(Some((content, chunk.done)))
}

#[async_trait]
impl ModelRuntime for OllamaClient {
    async fn generate(&self, context: &[Message], stream: bool) -> Result<ModelOutput, ModelError> {
        let request = ChatRequest {
            model: &self.model,
            messages: context
                .iter()
                .map(|m| WireMessage {
                    role: m.role.as_str(),
                    content: &m.content,
                    images: Vec::new(),
                })
                .collect(),
            stream,
        };
        debug!(model = %self.model, messages = context.len(), stream, "chat request");

        let response = self.send_chat(&request).await?;
        if !stream {
            return self.read_reply(response).await.map(ModelOutput::Text);
        }

        let idle = self.timeout;
        let (tx, rx) = mpsc::channel::<Result<String, ModelError>>(32);
        tokio::spawn(async move {
            let mut body = response.bytes_stream();
            let mut buf: Vec<u8> = Vec::new();
            loop {
                let bytes = match tokio::time::timeout(idle, body.next()).await {
                    Err(_) => {
                        let _ = tx.send(Err(ModelError::Timeout)).await;
                        return;
                    }
                    Ok(None) => break,
                    Ok(Some(Err(e))) => {
                        let _ = tx.send(Err(ModelError::Unavailable(e.to_string()))).await;
                        return;
                    }
                    Ok(Some(Ok(bytes))) => bytes,
                };
                buf.extend_from_slice(&bytes);

                while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buf.drain(..=pos).collect();
                    match parse_chunk(&line) {
                        Ok(Some((content, done))) => {
                            if !content.is_empty() && tx.send(Ok(content)).await.is_err() {
                                return;
                            }
                            if done {
                                return;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            let _ = tx.send(Err(e)).await;
                            return;
                        }
                    }
                }
            }
            // final line without a trailing newline
            match parse_chunk(&buf) {
                Ok(Some((content, _))) if !content.is_empty() => {
                    let _ = tx.send(Ok(content)).await;
                }
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                }
                _ => {}
            }
        });

        let chunks = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(ModelOutput::Stream(Box::pin(chunks)))
    }

    async fn unload(&self) -> Result<(), ModelError> {
        let url = format!("{}/api/generate", self.base_url);
        let send = self
            .client
            .post(&url)
            .json(&UnloadRequest {
                model: &self.model,
                keep_alive: 0,
            })
            .send();
        let response = tokio::time::timeout(Duration::from_secs(30), send)
            .await
            .map_err(|_| ModelError::Timeout)?
            .map_err(|e| self.map_send_error(e))?;
        match self.check_status(response).await {
            Ok(_) => {
                debug!(model = %self.model, "model unloaded");
                Ok(())
            }
            Err(e) => {
                warn!(model = %self.model, error = %e, "unload failed");
                Err(e)
            }
        }
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn describe_image(&self, image: &[u8], prompt: &str) -> Result<String, ModelError> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![WireMessage {
                role: "user",
                content: prompt,
                images: vec![BASE64.encode(image)],
            }],
            stream: false,
        };
        debug!(model = %self.model, bytes = image.len(), "image description request");
        let response = self.send_chat(&request).await?;
        self.read_reply(response).await
    }
}
