//! Token estimation strategies.

use anyhow::{anyhow, Result};
use std::path::Path;

use super::Message;

/// Fixed per-message cost for role markers and separators.
pub const MESSAGE_OVERHEAD: usize = 4;

/// Deterministic token estimate, monotonic in text length.
pub trait TokenEstimator: Send + Sync {
    fn count_text(&self, text: &str) -> usize;

    fn count_message(&self, message: &Message) -> usize {
        self.count_text(&message.content) + MESSAGE_OVERHEAD
    }

    fn count_messages(&self, messages: &[Message]) -> usize {
        messages.iter().map(|m| self.count_message(m)).sum()
    }
}

/// Roughly four characters per token.
#[derive(Debug, Clone, Copy, Default)]
pub struct CharEstimator;

impl TokenEstimator for CharEstimator {
    fn count_text(&self, text: &str) -> usize {
        text.chars().count().div_ceil(4)
    }
}

/// Exact counts from a HuggingFace `tokenizer.json`.
pub struct TokenizerEstimator {
    tokenizer: tokenizers::Tokenizer,
}

impl TokenizerEstimator {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let tokenizer = tokenizers::Tokenizer::from_file(path)
            .map_err(|e| anyhow!("failed to load tokenizer {}: {e}", path.display()))?;
        Ok(Self { tokenizer })
    }
}

impl TokenEstimator for TokenizerEstimator {
    fn count_text(&self, text: &str) -> usize {
        match self.tokenizer.encode(text, false) {
            Ok(encoding) => encoding.get_ids().len(),
            Err(e) => {
                tracing::debug!(error = %e, "tokenizer failed, using character estimate");
                CharEstimator.count_text(text)
            }
        }
    }
}
