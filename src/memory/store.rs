//! Write path: duplicate detection, storage and audit logging.
//!
//! [`add_fact`] is the single entry point. It runs inside one transaction:
//! exact duplicate check, vector near-duplicate check, insert into `facts`,
//! FTS5 sync, vector insert, audit log.

use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension, Transaction};

use super::embedding_to_bytes;
use super::types::{normalize_fact, AddOutcome};
use crate::embedding::cosine_threshold_to_l2;

/// Store a fact unless it duplicates an existing one.
///
/// `embedding` is `None` when the embedding provider is unreachable; the fact is
/// then stored for keyword search only and vector dedup is skipped.
pub fn add_fact(
    conn: &mut Connection,
    content: &str,
    source: Option<&str>,
    embedding: Option<&[f32]>,
    dedup_threshold: f64,
) -> Result<AddOutcome> {
    let content = content.trim();
    anyhow::ensure!(!content.is_empty(), "fact cannot be empty");

    let normalized = normalize_fact(content);
    let tx = conn.transaction()?;

    // 1. Exact duplicate (case and whitespace insensitive)
    let exact: Option<String> = tx
        .query_row(
            "SELECT id FROM facts WHERE normalized = ?1",
            params![normalized],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(existing) = exact {
        touch(&tx, &existing)?;
        write_audit_log(&tx, "dedup", &existing, Some(&serde_json::json!({"reason": "exact"})))?;
        tx.commit()?;
        tracing::debug!(id = %existing, "fact already stored");
        return Ok(AddOutcome {
            id: existing,
            deduplicated: true,
        });
    }

    // 2. Near duplicate by vector similarity
    if let Some(embedding) = embedding {
        if let Some((existing, similarity)) = nearest_within(&tx, embedding, dedup_threshold)? {
            touch(&tx, &existing)?;
            write_audit_log(
                &tx,
                "dedup",
                &existing,
                Some(&serde_json::json!({"reason": "similar", "similarity": similarity})),
            )?;
            tx.commit()?;
            tracing::debug!(id = %existing, similarity, "near-duplicate fact");
            return Ok(AddOutcome {
                id: existing,
                deduplicated: true,
            });
        }
    }

    // 3. Insert
    let id = uuid::Uuid::now_v7().to_string();
    let now = chrono::Utc::now().to_rfc3339();
    tx.execute(
        "INSERT INTO facts (id, content, normalized, source, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
        params![id, content, normalized, source, now],
    )?;
    let rowid = tx.last_insert_rowid();

    tx.execute(
        "INSERT INTO facts_fts (rowid, content, id) VALUES (?1, ?2, ?3)",
        params![rowid, content, id],
    )?;

    if let Some(embedding) = embedding {
        tx.execute(
            "INSERT INTO facts_vec (id, embedding) VALUES (?1, ?2)",
            params![id, embedding_to_bytes(embedding)],
        )?;
    }

    write_audit_log(&tx, "create", &id, None)?;
    tx.commit()?;

    Ok(AddOutcome {
        id,
        deduplicated: false,
    })
}

/// Nearest fact whose cosine similarity is at least `threshold`.
pub(crate) fn nearest_within(
    conn: &Connection,
    embedding: &[f32],
    threshold: f64,
) -> Result<Option<(String, f64)>> {
    let max_distance = cosine_threshold_to_l2(threshold);
    let nearest: Option<(String, f64)> = conn
        .query_row(
            "SELECT id, distance FROM facts_vec WHERE embedding MATCH ?1 ORDER BY distance LIMIT 1",
            params![embedding_to_bytes(embedding)],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    Ok(nearest
        .filter(|(_, distance)| *distance <= max_distance)
        .map(|(id, distance)| (id, crate::embedding::l2_to_cosine(distance))))
}

fn touch(tx: &Transaction, id: &str) -> Result<()> {
    tx.execute(
        "UPDATE facts SET updated_at = ?1 WHERE id = ?2",
        params![chrono::Utc::now().to_rfc3339(), id],
    )?;
    Ok(())
}

/// Write an entry to the `fact_log` audit table.
pub(crate) fn write_audit_log(
    conn: &Connection,
    operation: &str,
    fact_id: &str,
    details: Option<&serde_json::Value>,
) -> Result<()> {
    let now = chrono::Utc::now().to_rfc3339();
    let details_json = details.map(|d| d.to_string());
    conn.execute(
        "INSERT INTO fact_log (operation, fact_id, details, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![operation, fact_id, details_json, now],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::test_support::{spike, test_db, tilted};

    #[test]
    fn stores_new_fact_in_all_indexes() {
        let mut conn = test_db();
        let outcome = add_fact(
            &mut conn,
            "El usuario ama las manzanas",
            Some("42"),
            Some(&spike(0)),
            0.92,
        )
        .unwrap();
        assert!(!outcome.deduplicated);

        let (content, source): (String, Option<String>) = conn
            .query_row(
                "SELECT content, source FROM facts WHERE id = ?1",
                params![outcome.id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(content, "El usuario ama las manzanas");
        assert_eq!(source.as_deref(), Some("42"));

        let fts_id: String = conn
            .query_row(
                "SELECT id FROM facts_fts WHERE facts_fts MATCH 'manzanas'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(fts_id, outcome.id);

        let vec_count: i64 = conn
            .query_row("SELECT COUNT(*) FROM facts_vec", [], |row| row.get(0))
            .unwrap();
        assert_eq!(vec_count, 1);

        let op: String = conn
            .query_row(
                "SELECT operation FROM fact_log WHERE fact_id = ?1",
                params![outcome.id],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(op, "create");
    }

    #[test]
    fn exact_duplicate_is_skipped_regardless_of_case() {
        let mut conn = test_db();
        let first = add_fact(&mut conn, "Likes green tea", None, Some(&spike(0)), 0.92).unwrap();
        let second =
            add_fact(&mut conn, "  likes GREEN   tea ", None, Some(&spike(5)), 0.92).unwrap();

        assert!(second.deduplicated);
        assert_eq!(second.id, first.id);

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM facts", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn near_duplicate_above_threshold_is_skipped() {
        let mut conn = test_db();
        let first = add_fact(&mut conn, "Has a cat named Tom", None, Some(&spike(0)), 0.92).unwrap();
        let second = add_fact(
            &mut conn,
            "Owns a cat called Tom",
            None,
            Some(&tilted(0, 1, 0.1)),
            0.92,
        )
        .unwrap();
        assert!(second.deduplicated);
        assert_eq!(second.id, first.id);
    }

    #[test]
    fn dissimilar_fact_is_stored() {
        let mut conn = test_db();
        let first = add_fact(&mut conn, "Has a cat", None, Some(&spike(0)), 0.92).unwrap();
        let second = add_fact(&mut conn, "Lives in Lima", None, Some(&spike(3)), 0.92).unwrap();
        assert!(!second.deduplicated);
        assert_ne!(second.id, first.id);
    }

    #[test]
    fn fact_without_embedding_is_keyword_only() {
        let mut conn = test_db();
        let outcome = add_fact(&mut conn, "Birthday is in May", None, None, 0.92).unwrap();
        assert!(!outcome.deduplicated);

        let vec_count: i64 = conn
            .query_row("SELECT COUNT(*) FROM facts_vec", [], |row| row.get(0))
            .unwrap();
        assert_eq!(vec_count, 0);
    }

    #[test]
    fn empty_fact_is_rejected() {
        let mut conn = test_db();
        assert!(add_fact(&mut conn, "   ", None, None, 0.92).is_err());
    }
}
