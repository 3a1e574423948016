//! SQL DDL for the fact store.
//!
//! Defines the `facts`, `facts_fts` (FTS5), `facts_vec` (vec0), `fact_log`,
//! and `schema_meta` tables. All DDL uses `IF NOT EXISTS` so initialization
//! is idempotent.

use rusqlite::Connection;

const SCHEMA_SQL: &str = r#"
-- Remembered facts
CREATE TABLE IF NOT EXISTS facts (
    id TEXT PRIMARY KEY,
    content TEXT NOT NULL,
    normalized TEXT NOT NULL,
    source TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_facts_normalized ON facts(normalized);
CREATE INDEX IF NOT EXISTS idx_facts_created ON facts(created_at);

-- Full-text search (BM25)
CREATE VIRTUAL TABLE IF NOT EXISTS facts_fts USING fts5(
    content,
    id UNINDEXED,
    content='facts',
    content_rowid='rowid'
);

-- Audit log
CREATE TABLE IF NOT EXISTS fact_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    operation TEXT NOT NULL CHECK(operation IN ('create','dedup','delete')),
    fact_id TEXT NOT NULL,
    details TEXT,
    created_at TEXT NOT NULL
);

-- Schema metadata
CREATE TABLE IF NOT EXISTS schema_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// The vec0 table is sized by the embedding model, so it is built at runtime.
fn vec_table_sql(dimensions: usize) -> String {
    format!(
        "CREATE VIRTUAL TABLE IF NOT EXISTS facts_vec USING vec0(\n    \
         id TEXT PRIMARY KEY,\n    \
         embedding FLOAT[{dimensions}]\n);"
    )
}

/// Initialize all schema tables. Idempotent.
pub fn init_schema(conn: &Connection, dimensions: usize) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;
    conn.execute_batch(&vec_table_sql(dimensions))?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('schema_version', '1')",
        [],
    )?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('embedding_dimensions', ?1)",
        [dimensions.to_string()],
    )?;

    Ok(())
}

/// Dimension the vector table was created with.
pub fn stored_dimensions(conn: &Connection) -> rusqlite::Result<Option<usize>> {
    use rusqlite::OptionalExtension;
    let value: Option<String> = conn
        .query_row(
            "SELECT value FROM schema_meta WHERE key = 'embedding_dimensions'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value.and_then(|v| v.parse().ok()))
}
