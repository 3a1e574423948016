//! Fact record types shared by the store, search and CLI.

use serde::Serialize;

/// A remembered fact, matching the `facts` table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Fact {
    /// UUID v7 (time-sortable) primary key.
    pub id: String,
    pub content: String,
    /// Chat that asked for the fact to be remembered, if known.
    pub source: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub recall_count: u32,
}

/// Result of [`crate::memory::MemoryStore::add`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AddOutcome {
    /// Id of the stored fact, or of the existing fact it duplicated.
    pub id: String,
    pub deduplicated: bool,
}

/// A fact removed by similarity or id.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemovedFact {
    pub id: String,
    pub content: String,
    /// Cosine similarity to the query; `None` when matched by substring or id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub similarity: Option<f64>,
}

/// A search hit with its fused rank score.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredFact {
    pub id: String,
    pub content: String,
    pub score: f64,
    pub created_at: String,
}

/// Lowercased, whitespace-collapsed form used for exact duplicate detection.
pub fn normalize_fact(content: &str) -> String {
    content
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}
