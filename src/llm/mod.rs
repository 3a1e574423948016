//! Model runtime abstraction.
//!
//! The assistant talks to the language model only through [`ModelRuntime`].
//! [`OllamaClient`] implements it over the Ollama chat API.

pub mod ollama;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use std::pin::Pin;

use crate::error::ModelError;
use crate::session::Message;

pub use ollama::OllamaClient;

/// Incremental text chunks of one reply.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<String, ModelError>> + Send>>;

pub enum ModelOutput {
    Text(String),
    Stream(ChunkStream),
}

impl ModelOutput {
    /// Wait for the complete reply. A failing chunk fails the whole reply.
    pub async fn collect(self) -> Result<String, ModelError> {
        match self {
            Self::Text(text) => Ok(text),
            Self::Stream(mut chunks) => {
                let mut text = String::new();
                while let Some(chunk) = chunks.next().await {
                    text.push_str(&chunk?);
                }
                Ok(text)
            }
        }
    }
}

impl std::fmt::Debug for ModelOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text(text) => f.debug_tuple("Text").field(text).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

#[async_trait]
pub trait ModelRuntime: Send + Sync {
    async fn generate(&self, context: &[Message], stream: bool) -> Result<ModelOutput, ModelError>;

    /// Release the model's memory on the runtime host.
    async fn unload(&self) -> Result<(), ModelError>;

    fn model_name(&self) -> &str;

    /// Describe an image in text. Runtimes without vision support refuse.
    async fn describe_image(&self, _image: &[u8], _prompt: &str) -> Result<String, ModelError> {
        Err(ModelError::Protocol(format!(
            "{} cannot describe images",
            self.model_name()
        )))
    }
}
