use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{l2_normalize, EmbeddingProvider};
use crate::config::{MemoryConfig, ModelConfig};

/// Embeddings from an Ollama-compatible `/api/embeddings` endpoint.
pub struct OllamaEmbedder {
    client: reqwest::Client,
    base_url: String,
    model: String,
    dimensions: usize,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    embedding: Vec<f32>,
}

impl OllamaEmbedder {
    pub fn new(model: &ModelConfig, memory: &MemoryConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: model.base_url.trim_end_matches('/').to_string(),
            model: model.embedding_model.clone(),
            dimensions: memory.embedding_dimensions,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let url = format!("{}/api/embeddings", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&EmbeddingRequest {
                model: &self.model,
                prompt: text,
            })
            .send()
            .await
            .with_context(|| format!("embedding request to {url} failed"))?;

        let status = response.status();
        anyhow::ensure!(status.is_success(), "embedding endpoint returned HTTP {status}");

        let body: EmbeddingResponse = response
            .json()
            .await
            .context("invalid embedding response")?;

        let mut embedding = body.embedding;
        anyhow::ensure!(
            embedding.len() == self.dimensions,
            "model {} produced {} dimensions, expected {}",
            self.model,
            embedding.len(),
            self.dimensions
        );
        l2_normalize(&mut embedding);
        Ok(embedding)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
