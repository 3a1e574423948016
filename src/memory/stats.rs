use anyhow::Result;
use rusqlite::Connection;
use serde::Serialize;
use std::path::Path;

/// Response for `femtobot memory stats`.
#[derive(Debug, Serialize)]
pub struct MemoryStats {
    pub total_facts: u64,
    /// Facts that also live in the vector index.
    pub embedded_facts: u64,
    pub deletions: u64,
    pub duplicates_skipped: u64,
    pub db_size_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oldest_fact: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub newest_fact: Option<String>,
}

/// Compute store statistics. Pass `None` as `db_path` for in-memory databases.
pub fn memory_stats(conn: &Connection, db_path: Option<&Path>) -> Result<MemoryStats> {
    let count = |sql: &str| -> Result<u64> {
        let n: i64 = conn.query_row(sql, [], |row| row.get(0))?;
        Ok(n as u64)
    };

    let total_facts = count("SELECT COUNT(*) FROM facts")?;
    let embedded_facts = count("SELECT COUNT(*) FROM facts_vec")?;
    let deletions = count("SELECT COUNT(*) FROM fact_log WHERE operation = 'delete'")?;
    let duplicates_skipped = count("SELECT COUNT(*) FROM fact_log WHERE operation = 'dedup'")?;

    let (oldest_fact, newest_fact): (Option<String>, Option<String>) = conn.query_row(
        "SELECT MIN(created_at), MAX(created_at) FROM facts",
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;

    let db_size_bytes = db_path
        .and_then(|p| std::fs::metadata(p).ok())
        .map(|m| m.len())
        .unwrap_or(0);

    Ok(MemoryStats {
        total_facts,
        embedded_facts,
        deletions,
        duplicates_skipped,
        db_size_bytes,
        embedding_model: crate::db::migrations::get_embedding_model(conn)?,
        oldest_fact,
        newest_fact,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::forget::delete_by_substring;
    use crate::memory::store::add_fact;
    use crate::memory::test_support::{spike, test_db};

    #[test]
    fn empty_store_has_zero_counts() {
        let conn = test_db();
        let stats = memory_stats(&conn, None).unwrap();
        assert_eq!(stats.total_facts, 0);
        assert!(stats.oldest_fact.is_none());
        assert_eq!(stats.db_size_bytes, 0);
    }

    #[test]
    fn counts_follow_writes_and_deletes() {
        let mut conn = test_db();
        add_fact(&mut conn, "Uses Linux", None, Some(&spike(0)), 0.92).unwrap();
        add_fact(&mut conn, "uses linux", None, Some(&spike(0)), 0.92).unwrap();
        add_fact(&mut conn, "Walks the dog at 7", None, None, 0.92).unwrap();
        delete_by_substring(&mut conn, "dog").unwrap();

        let stats = memory_stats(&conn, None).unwrap();
        assert_eq!(stats.total_facts, 1);
        assert_eq!(stats.embedded_facts, 1);
        assert_eq!(stats.deletions, 1);
        assert_eq!(stats.duplicates_skipped, 1);
        assert!(stats.newest_fact.is_some());
    }
}
