//! Hard deletion of facts.
//!
//! Facts are removed from `facts`, the FTS5 index and the vector index in one
//! transaction. Lookup is by vector similarity, by substring when no embedding
//! is available, or by id from the CLI.

use anyhow::{bail, Result};
use rusqlite::{params, Connection, OptionalExtension};

use super::store::{nearest_within, write_audit_log};
use super::types::RemovedFact;

/// Delete the nearest fact with cosine similarity of at least `threshold`.
pub fn delete_by_embedding(
    conn: &mut Connection,
    embedding: &[f32],
    threshold: f64,
    query: &str,
) -> Result<Option<RemovedFact>> {
    let Some((id, similarity)) = nearest_within(conn, embedding, threshold)? else {
        return Ok(None);
    };
    let mut removed = delete_fact(conn, &id, Some(query))?;
    removed.similarity = Some(similarity);
    Ok(Some(removed))
}

/// Delete the oldest fact containing `query`, ignoring case.
pub fn delete_by_substring(conn: &mut Connection, query: &str) -> Result<Option<RemovedFact>> {
    let needle = query.trim().to_lowercase();
    if needle.is_empty() {
        return Ok(None);
    }
    let id: Option<String> = conn
        .query_row(
            "SELECT id FROM facts WHERE instr(lower(content), ?1) > 0 ORDER BY created_at LIMIT 1",
            params![needle],
            |row| row.get(0),
        )
        .optional()?;

    match id {
        Some(id) => delete_fact(conn, &id, Some(query)).map(Some),
        None => Ok(None),
    }
}

/// Remove a fact from all tables by id.
pub fn delete_fact(conn: &mut Connection, fact_id: &str, reason: Option<&str>) -> Result<RemovedFact> {
    let tx = conn.transaction()?;

    let row: Option<(i64, String)> = tx
        .query_row(
            "SELECT rowid, content FROM facts WHERE id = ?1",
            params![fact_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    let Some((rowid, content)) = row else {
        bail!("fact not found: {fact_id}");
    };

    // External content FTS5 tables need the special delete command
    tx.execute(
        "INSERT INTO facts_fts(facts_fts, rowid, content, id) VALUES('delete', ?1, ?2, ?3)",
        params![rowid, content, fact_id],
    )?;
    tx.execute("DELETE FROM facts_vec WHERE id = ?1", params![fact_id])?;
    write_audit_log(
        &tx,
        "delete",
        fact_id,
        Some(&serde_json::json!({"reason": reason, "content": content})),
    )?;
    tx.execute("DELETE FROM facts WHERE id = ?1", params![fact_id])?;

    tx.commit()?;

    tracing::info!(id = %fact_id, "fact deleted");
    Ok(RemovedFact {
        id: fact_id.to_string(),
        content,
        similarity: None,
    })
}
