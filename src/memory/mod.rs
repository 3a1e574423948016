//! Long-term fact memory.
//!
//! Synchronous SQLite operations live in [`store`], [`forget`], [`search`] and
//! [`stats`]. [`SqliteMemoryStore`] wraps them behind the async
//! [`MemoryStore`] trait the command dispatcher and the assistant depend on.

pub mod forget;
pub mod search;
pub mod stats;
pub mod store;
pub mod types;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rusqlite::Connection;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::config::MemoryConfig;
use crate::embedding::EmbeddingProvider;
use types::{AddOutcome, Fact, RemovedFact, ScoredFact};

/// Convert an f32 embedding slice to raw bytes for sqlite-vec.
pub fn embedding_to_bytes(embedding: &[f32]) -> &[u8] {
    unsafe {
        std::slice::from_raw_parts(
            embedding.as_ptr() as *const u8,
            std::mem::size_of_val(embedding),
        )
    }
}

/// Fact memory as seen by command handlers.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    async fn add(&self, fact: &str, source: Option<&str>) -> Result<AddOutcome>;

    async fn delete_by_similarity(&self, query: &str, threshold: f64)
        -> Result<Option<RemovedFact>>;

    async fn search(&self, query: &str, k: usize) -> Result<Vec<ScoredFact>>;
}

/// [`MemoryStore`] over a single shared SQLite connection.
///
/// Every database call runs on the blocking pool with the connection mutex
/// held; embedding requests happen before the lock is taken.
#[derive(Clone)]
pub struct SqliteMemoryStore {
    conn: Arc<Mutex<Connection>>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    config: MemoryConfig,
    db_path: Option<PathBuf>,
}

impl SqliteMemoryStore {
    pub fn new(
        conn: Connection,
        embedder: Option<Arc<dyn EmbeddingProvider>>,
        config: MemoryConfig,
    ) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            embedder,
            config,
            db_path: None,
        }
    }

    /// Record the on-disk location, used for size reporting.
    pub fn with_db_path(mut self, path: PathBuf) -> Self {
        self.db_path = Some(path);
        self
    }

    /// Embed `text`, degrading to `None` when the provider is missing or failing.
    async fn embed(&self, text: &str) -> Option<Vec<f32>> {
        let embedder = self.embedder.as_ref()?;
        match embedder.embed(text).await {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::warn!(error = %e, "embedding failed, falling back to keyword matching");
                None
            }
        }
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| anyhow!("memory database lock poisoned"))?;
            f(&mut guard)
        })
        .await?
    }

    pub async fn list(&self) -> Result<Vec<Fact>> {
        self.with_conn(|conn| search::list_facts(conn)).await
    }

    pub async fn stats(&self) -> Result<stats::MemoryStats> {
        let db_path = self.db_path.clone();
        self.with_conn(move |conn| stats::memory_stats(conn, db_path.as_deref()))
            .await
    }

    pub async fn delete_by_id(&self, id: &str) -> Result<RemovedFact> {
        let id = id.to_string();
        self.with_conn(move |conn| forget::delete_fact(conn, &id, Some("manual")))
            .await
    }

    /// Record which embedding model produced the stored vectors and warn when
    /// it differs from the configured one.
    pub async fn check_embedding_model(&self) -> Result<()> {
        let Some(embedder) = self.embedder.as_ref() else {
            return Ok(());
        };
        let configured = embedder.model_name().to_string();
        self.with_conn(move |conn| {
            match crate::db::migrations::get_embedding_model(conn)? {
                Some(stored) if stored != configured => tracing::warn!(
                    stored = %stored,
                    configured = %configured,
                    "embedding model changed; similarity against older facts will be unreliable"
                ),
                Some(_) => {}
                None => crate::db::migrations::set_embedding_model(conn, &configured)?,
            }
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl MemoryStore for SqliteMemoryStore {
    async fn add(&self, fact: &str, source: Option<&str>) -> Result<AddOutcome> {
        let embedding = self.embed(fact).await;
        let fact = fact.to_string();
        let source = source.map(str::to_string);
        let threshold = self.config.dedup_threshold;
        self.with_conn(move |conn| {
            store::add_fact(conn, &fact, source.as_deref(), embedding.as_deref(), threshold)
        })
        .await
    }

    async fn delete_by_similarity(
        &self,
        query: &str,
        threshold: f64,
    ) -> Result<Option<RemovedFact>> {
        let embedding = self.embed(query).await;
        let query = query.to_string();
        self.with_conn(move |conn| match embedding {
            Some(embedding) => forget::delete_by_embedding(conn, &embedding, threshold, &query),
            None => forget::delete_by_substring(conn, &query),
        })
        .await
    }

    async fn search(&self, query: &str, k: usize) -> Result<Vec<ScoredFact>> {
        let embedding = self.embed(query).await;
        let query = query.to_string();
        let rrf_k = self.config.rrf_k;
        self.with_conn(move |conn| {
            search::search_facts(conn, embedding.as_deref(), &query, k, rrf_k)
        })
        .await
    }
}
