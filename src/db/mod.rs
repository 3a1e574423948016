pub mod migrations;
pub mod schema;

use anyhow::{Context, Result};
use rusqlite::Connection;
use sqlite_vec::sqlite3_vec_init;
use std::path::Path;
use std::sync::Once;

static SQLITE_VEC_INIT: Once = Once::new();

/// Register the sqlite-vec extension globally. Safe to call multiple times.
pub fn load_sqlite_vec() {
    SQLITE_VEC_INIT.call_once(|| unsafe {
        rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute(
            sqlite3_vec_init as *const (),
        )));
    });
}

/// Open (or create) the fact database at the given path, with extensions
/// loaded, schema initialized and migrations applied.
pub fn open_database(path: impl AsRef<Path>, dimensions: usize) -> Result<Connection> {
    let path = path.as_ref();

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }

    load_sqlite_vec();

    let mut conn = Connection::open(path)
        .with_context(|| format!("failed to open database at {}", path.display()))?;

    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "busy_timeout", 5000)?;

    prepare(&mut conn, dimensions)?;

    tracing::info!(path = %path.display(), "database initialized");
    Ok(conn)
}

/// Open an in-memory database with the full schema. Used by tests and by
/// `femtobot chat` when persistence is not wanted.
pub fn open_memory_database(dimensions: usize) -> Result<Connection> {
    load_sqlite_vec();
    let mut conn = Connection::open_in_memory().context("failed to open in-memory database")?;
    prepare(&mut conn, dimensions)?;
    Ok(conn)
}

fn prepare(conn: &mut Connection, dimensions: usize) -> Result<()> {
    schema::init_schema(conn, dimensions).context("failed to initialize schema")?;
    migrations::run_migrations(conn).context("failed to run migrations")?;

    if let Some(stored) = schema::stored_dimensions(conn)? {
        anyhow::ensure!(
            stored == dimensions,
            "database vectors have {stored} dimensions but memory.embedding_dimensions is {dimensions}"
        );
    }
    Ok(())
}

/// Summary used by `femtobot doctor`.
#[derive(Debug)]
pub struct HealthReport {
    pub schema_version: u32,
    pub sqlite_vec_version: String,
    pub embedding_model: Option<String>,
    pub embedding_dimensions: Option<usize>,
    pub fact_count: u64,
    pub vector_count: u64,
    pub log_count: u64,
    pub integrity_ok: bool,
    pub integrity_details: String,
}

pub fn check_database_health(conn: &Connection) -> Result<HealthReport> {
    let schema_version = migrations::get_schema_version(conn)?;
    let sqlite_vec_version: String = conn.query_row("SELECT vec_version()", [], |r| r.get(0))?;
    let embedding_model = migrations::get_embedding_model(conn)?;
    let embedding_dimensions = schema::stored_dimensions(conn)?;

    let count = |sql: &str| -> Result<u64> {
        let n: i64 = conn.query_row(sql, [], |r| r.get(0))?;
        Ok(n as u64)
    };
    let fact_count = count("SELECT COUNT(*) FROM facts")?;
    let vector_count = count("SELECT COUNT(*) FROM facts_vec")?;
    let log_count = count("SELECT COUNT(*) FROM fact_log")?;

    let integrity: String = conn.query_row("PRAGMA integrity_check", [], |r| r.get(0))?;

    Ok(HealthReport {
        schema_version,
        sqlite_vec_version,
        embedding_model,
        embedding_dimensions,
        fact_count,
        vector_count,
        log_count,
        integrity_ok: integrity == "ok",
        integrity_details: integrity,
    })
}
