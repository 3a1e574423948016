use anyhow::Result;
use rusqlite::{params, Connection};
use std::collections::HashMap;

use super::types::{Fact, ScoredFact};

/// Hybrid search: vector KNN + FTS5 BM25, merged by Reciprocal Rank Fusion.
///
/// Without a query embedding only the keyword signal is used. Returned facts
/// get their recall counters bumped.
pub fn search_facts(
    conn: &Connection,
    query_embedding: Option<&[f32]>,
    query_text: &str,
    k: usize,
    rrf_k: usize,
) -> Result<Vec<ScoredFact>> {
    if k == 0 {
        return Ok(Vec::new());
    }
    let candidate_limit = k * 3;

    let vec_results = match query_embedding {
        Some(embedding) => vector_search(conn, embedding, candidate_limit)?,
        None => Vec::new(),
    };
    let fts_results = fts_search(conn, query_text, candidate_limit)?;

    let merged = rrf_merge(&vec_results, &fts_results, rrf_k);
    let ids: Vec<&str> = merged.iter().take(k).map(|(id, _)| id.as_str()).collect();
    let facts = fetch_facts(conn, &ids)?;

    let results: Vec<ScoredFact> = merged
        .iter()
        .take(k)
        .filter_map(|(id, score)| {
            facts.get(id.as_str()).map(|fact| ScoredFact {
                id: fact.id.clone(),
                content: fact.content.clone(),
                score: *score,
                created_at: fact.created_at.clone(),
            })
        })
        .collect();

    let returned: Vec<&str> = results.iter().map(|r| r.id.as_str()).collect();
    update_recall(conn, &returned)?;

    Ok(results)
}

/// All facts, oldest first.
pub fn list_facts(conn: &Connection) -> Result<Vec<Fact>> {
    let mut stmt = conn.prepare(
        "SELECT id, content, source, created_at, updated_at, recall_count \
         FROM facts ORDER BY created_at",
    )?;
    let facts = stmt
        .query_map([], row_to_fact)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(facts)
}

fn row_to_fact(row: &rusqlite::Row<'_>) -> rusqlite::Result<Fact> {
    Ok(Fact {
        id: row.get(0)?,
        content: row.get(1)?,
        source: row.get(2)?,
        created_at: row.get(3)?,
        updated_at: row.get(4)?,
        recall_count: row.get(5)?,
    })
}

fn vector_search(conn: &Connection, embedding: &[f32], limit: usize) -> Result<Vec<(String, f64)>> {
    let embedding_bytes = super::embedding_to_bytes(embedding);
    let mut stmt = conn.prepare(
        "SELECT id, distance FROM facts_vec \
         WHERE embedding MATCH ?1 ORDER BY distance LIMIT ?2",
    )?;
    let results = stmt
        .query_map(params![embedding_bytes, limit as i64], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(results)
}

/// FTS5 BM25 keyword search. Terms are OR-ed so partial matches still rank.
fn fts_search(conn: &Connection, query_text: &str, limit: usize) -> Result<Vec<(String, f64)>> {
    let escaped = escape_fts_query(query_text);
    if escaped.is_empty() {
        return Ok(Vec::new());
    }

    let mut stmt = conn.prepare(
        "SELECT id, rank FROM facts_fts \
         WHERE facts_fts MATCH ?1 ORDER BY rank LIMIT ?2",
    )?;
    let results = stmt
        .query_map(params![escaped, limit as i64], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(results)
}

/// Quote each word for FTS5 MATCH and join them with `OR`.
pub(crate) fn escape_fts_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|word| word.replace('"', ""))
        .filter(|word| !word.is_empty())
        .map(|word| format!("\"{word}\""))
        .collect::<Vec<_>>()
        .join(" OR ")
}

/// Reciprocal Rank Fusion: each list contributes `1 / (k + rank)` per document.
pub(crate) fn rrf_merge(
    vec_results: &[(String, f64)],
    fts_results: &[(String, f64)],
    k: usize,
) -> Vec<(String, f64)> {
    let mut scores: HashMap<String, f64> = HashMap::new();

    for (rank, (id, _)) in vec_results.iter().enumerate() {
        *scores.entry(id.clone()).or_insert(0.0) += 1.0 / (k as f64 + rank as f64 + 1.0);
    }
    for (rank, (id, _)) in fts_results.iter().enumerate() {
        *scores.entry(id.clone()).or_insert(0.0) += 1.0 / (k as f64 + rank as f64 + 1.0);
    }

    let mut merged: Vec<(String, f64)> = scores.into_iter().collect();
    merged.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    merged
}

fn fetch_facts(conn: &Connection, ids: &[&str]) -> Result<HashMap<String, Fact>> {
    if ids.is_empty() {
        return Ok(HashMap::new());
    }

    let placeholders: Vec<String> = (1..=ids.len()).map(|i| format!("?{i}")).collect();
    let sql = format!(
        "SELECT id, content, source, created_at, updated_at, recall_count \
         FROM facts WHERE id IN ({})",
        placeholders.join(", ")
    );
    let mut stmt = conn.prepare(&sql)?;
    let params: Vec<&dyn rusqlite::types::ToSql> =
        ids.iter().map(|id| id as &dyn rusqlite::types::ToSql).collect();

    let rows = stmt
        .query_map(params.as_slice(), row_to_fact)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(rows.into_iter().map(|f| (f.id.clone(), f)).collect())
}

fn update_recall(conn: &Connection, ids: &[&str]) -> Result<()> {
    if ids.is_empty() {
        return Ok(());
    }
    let now = chrono::Utc::now().to_rfc3339();
    let mut stmt = conn.prepare(
        "UPDATE facts SET recall_count = recall_count + 1, last_recalled = ?1 WHERE id = ?2",
    )?;
    for id in ids {
        stmt.execute(params![now, id])?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::store::add_fact;
    use crate::memory::test_support::{spike, test_db};

    #[test]
    fn vector_signal_finds_semantic_match() {
        let mut conn = test_db();
        add_fact(&mut conn, "Prefers dark roast coffee", None, Some(&spike(0)), 0.92).unwrap();
        add_fact(&mut conn, "Sister lives in Madrid", None, Some(&spike(4)), 0.92).unwrap();

        let results = search_facts(&conn, Some(&spike(4)), "family", 1, 60).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].content, "Sister lives in Madrid");
    }

    #[test]
    fn keyword_signal_works_without_embeddings() {
        let mut conn = test_db();
        add_fact(&mut conn, "Allergic to peanuts", None, None, 0.92).unwrap();
        add_fact(&mut conn, "Plays the guitar", None, None, 0.92).unwrap();

        let results = search_facts(&conn, None, "what about peanuts?", 3, 60).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].content, "Allergic to peanuts");
    }

    #[test]
    fn both_signals_rank_first() {
        let mut conn = test_db();
        add_fact(&mut conn, "Drinks green tea", None, Some(&spike(0)), 0.92).unwrap();
        add_fact(&mut conn, "Green is the favourite colour", None, Some(&spike(5)), 0.92).unwrap();

        let results = search_facts(&conn, Some(&spike(0)), "green tea", 2, 60).unwrap();
        assert_eq!(results[0].content, "Drinks green tea");
        assert!(results[0].score > results[1].score);
    }

    #[test]
    fn search_bumps_recall_count() {
        let mut conn = test_db();
        add_fact(&mut conn, "Runs on Sundays", None, Some(&spike(1)), 0.92).unwrap();

        search_facts(&conn, Some(&spike(1)), "sundays", 3, 60).unwrap();
        let facts = list_facts(&conn).unwrap();
        assert_eq!(facts[0].recall_count, 1);
    }

    #[test]
    fn rrf_merge_adds_scores_for_shared_ids() {
        let vec = vec![("a".to_string(), 0.1), ("b".to_string(), 0.2)];
        let fts = vec![("b".to_string(), -3.0), ("c".to_string(), -1.0)];
        let merged = rrf_merge(&vec, &fts, 60);

        assert_eq!(merged[0].0, "b");
        assert_eq!(merged.len(), 3);
    }

    #[test]
    fn escape_fts_query_quotes_and_ors_terms() {
        assert_eq!(escape_fts_query("hello \"world\""), "\"hello\" OR \"world\"");
        assert_eq!(escape_fts_query("   "), "");
    }
}
