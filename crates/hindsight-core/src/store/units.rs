//! `memory_units` queries: batched insert, point lookup, vector K-NN,
//! full-text search, and filtered scan with pagination (spec.md §4.1).

use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use super::codec::{decode_embedding, decode_metadata, encode_embedding, encode_metadata, parse_timestamp, parse_uuid};
use crate::error::EngineError;
use crate::llm::cosine_similarity;
use crate::model::{FactType, MemoryUnit, TemporalRange};

fn row_to_unit(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<MemoryUnit, EngineError>> {
    let id: String = row.get("id")?;
    let bank_id: String = row.get("bank_id")?;
    let document_id: Option<String> = row.get("document_id")?;
    let text: String = row.get("text")?;
    let fact_type: String = row.get("fact_type")?;
    let context: Option<String> = row.get("context")?;
    let embedding: Option<Vec<u8>> = row.get("embedding")?;
    let occurred_start: String = row.get("occurred_start")?;
    let occurred_end: String = row.get("occurred_end")?;
    let mentioned_at: String = row.get("mentioned_at")?;
    let metadata: String = row.get("metadata")?;
    let created_at: String = row.get("created_at")?;

    let converted = (|| -> Result<MemoryUnit, EngineError> {
        Ok(MemoryUnit {
            id: parse_uuid(&id)?,
            bank_id,
            document_id,
            text,
            fact_type: fact_type.parse::<FactType>()?,
            context,
            embedding: embedding.map(|bytes| decode_embedding(&bytes)),
            occurred: TemporalRange {
                start: parse_timestamp(&occurred_start)?,
                end: parse_timestamp(&occurred_end)?,
            },
            mentioned_at: parse_timestamp(&mentioned_at)?,
            metadata: decode_metadata(&metadata)?,
            created_at: parse_timestamp(&created_at)?,
        })
    })();
    Ok(converted)
}

const SELECT_COLUMNS: &str = "id, bank_id, document_id, text, fact_type, context, embedding, \
     occurred_start, occurred_end, mentioned_at, metadata, created_at";

/// Inserts a batch of units in extraction order, preserving caller-supplied
/// IDs so causal-link indices line up (spec.md §4.6 step 5).
pub fn insert_batch(conn: &Connection, units: &[MemoryUnit]) -> Result<(), EngineError> {
    let mut stmt = conn
        .prepare_cached(&format!(
            "INSERT INTO memory_units ({SELECT_COLUMNS}) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)"
        ))
        .map_err(EngineError::Database)?;
    for unit in units {
        stmt.execute(params![
            unit.id.to_string(),
            unit.bank_id,
            unit.document_id,
            unit.text,
            unit.fact_type.to_string(),
            unit.context,
            unit.embedding.as_ref().map(|v| encode_embedding(v)),
            super::codec::to_rfc3339(unit.occurred.start),
            super::codec::to_rfc3339(unit.occurred.end),
            super::codec::to_rfc3339(unit.mentioned_at),
            encode_metadata(&unit.metadata)?,
            super::codec::to_rfc3339(unit.created_at),
        ])
        .map_err(EngineError::Database)?;
    }
    Ok(())
}

pub fn get(conn: &Connection, bank_id: &str, id: Uuid) -> Result<Option<MemoryUnit>, EngineError> {
    conn.query_row(
        &format!("SELECT {SELECT_COLUMNS} FROM memory_units WHERE id = ?1 AND bank_id = ?2"),
        params![id.to_string(), bank_id],
        row_to_unit,
    )
    .optional()
    .map_err(EngineError::Database)?
    .transpose()
}

/// Deletes all units belonging to a document (cascades to `memory_links`,
/// `unit_entities` via `ON DELETE CASCADE`) — the upsert's "delete prior"
/// half (spec.md §3).
pub fn delete_by_document(conn: &Connection, bank_id: &str, document_id: &str) -> Result<(), EngineError> {
    conn.execute(
        "DELETE FROM memory_units WHERE bank_id = ?1 AND document_id = ?2",
        params![bank_id, document_id],
    )
    .map_err(EngineError::Database)?;
    Ok(())
}

/// Embeds-all-in-bank fetch used by the dedup pass and by the Link
/// Builder's semantic pass (spec.md §4.4 "fetches all existing embeddings
/// in the bank in one query").
pub fn fetch_all_embeddings(conn: &Connection, bank_id: &str) -> Result<Vec<(Uuid, Vec<f32>)>, EngineError> {
    let mut stmt = conn
        .prepare_cached("SELECT id, embedding FROM memory_units WHERE bank_id = ?1 AND embedding IS NOT NULL")
        .map_err(EngineError::Database)?;
    let rows = stmt
        .query_map(params![bank_id], |row| {
            let id: String = row.get(0)?;
            let embedding: Vec<u8> = row.get(1)?;
            Ok((id, embedding))
        })
        .map_err(EngineError::Database)?;

    let mut out = Vec::new();
    for row in rows {
        let (id, embedding) = row.map_err(EngineError::Database)?;
        out.push((parse_uuid(&id)?, decode_embedding(&embedding)));
    }
    Ok(out)
}

/// Exact-scan vector K-NN: cosine similarity against every embedded unit in
/// the bank, optionally restricted to `fact_types`. Adequate below ~10k
/// units per bank (SPEC_FULL.md §4.1); an HNSW path behind `vector-search`
/// is a drop-in replacement for larger banks.
pub fn vector_search(
    conn: &Connection,
    bank_id: &str,
    query: &[f32],
    fact_types: Option<&[FactType]>,
    limit: usize,
) -> Result<Vec<(MemoryUnit, f32)>, EngineError> {
    let mut stmt = conn
        .prepare_cached(&format!(
            "SELECT {SELECT_COLUMNS} FROM memory_units WHERE bank_id = ?1 AND embedding IS NOT NULL"
        ))
        .map_err(EngineError::Database)?;
    let rows = stmt.query_map(params![bank_id], row_to_unit).map_err(EngineError::Database)?;

    let mut scored = Vec::new();
    for row in rows {
        let unit = row.map_err(EngineError::Database)??;
        if let Some(types) = fact_types {
            if !types.contains(&unit.fact_type) {
                continue;
            }
        }
        if let Some(embedding) = &unit.embedding {
            let score = cosine_similarity(query, embedding);
            scored.push((unit, score));
        }
    }
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(limit);
    Ok(scored)
}

/// Full-text search over `text + context` via the FTS5 virtual table
/// (spec.md §4.1 "language-agnostic tokenization" via `unicode61`).
pub fn fulltext_search(
    conn: &Connection,
    bank_id: &str,
    query: &str,
    limit: usize,
) -> Result<Vec<(MemoryUnit, f32)>, EngineError> {
    if query.trim().is_empty() {
        return Ok(Vec::new());
    }
    let mut stmt = conn
        .prepare_cached(&format!(
            "SELECT {cols}, bm25(memory_units_fts) as rank
             FROM memory_units_fts
             JOIN memory_units ON memory_units.rowid = memory_units_fts.rowid
             WHERE memory_units_fts MATCH ?1 AND memory_units.bank_id = ?2
             ORDER BY rank LIMIT ?3",
            cols = SELECT_COLUMNS
                .split(", ")
                .map(|c| format!("memory_units.{c}"))
                .collect::<Vec<_>>()
                .join(", ")
        ))
        .map_err(EngineError::Database)?;

    let rows = stmt
        .query_map(params![fts_query(query), bank_id, limit as i64], |row| {
            let unit = row_to_unit(row)?;
            let rank: f64 = row.get("rank")?;
            Ok((unit, rank))
        })
        .map_err(EngineError::Database)?;

    let mut out = Vec::new();
    for row in rows {
        let (unit, rank) = row.map_err(EngineError::Database)?;
        // bm25() is lower-is-better; invert to a positive similarity-style score.
        out.push((unit?, (1.0 / (1.0 + rank.max(0.0))) as f32));
    }
    Ok(out)
}

/// Escapes an FTS5 query by quoting each token, so punctuation/query-syntax
/// characters in free text don't break the MATCH expression.
fn fts_query(raw: &str) -> String {
    raw.split_whitespace()
        .map(|token| format!("\"{}\"", token.replace('"', "")))
        .collect::<Vec<_>>()
        .join(" OR ")
}

/// Filters accepted by the filtered-scan query class (spec.md §4.1).
#[derive(Debug, Clone, Default)]
pub struct UnitFilter {
    pub fact_types: Option<Vec<FactType>>,
    pub document_id: Option<String>,
    pub since: Option<chrono::DateTime<chrono::Utc>>,
    pub until: Option<chrono::DateTime<chrono::Utc>>,
}

/// Paginated filtered scan, newest-first (matches the
/// `(bank_id, fact_type, mentioned_at desc)` index, spec.md §4.1).
pub fn list_units(
    conn: &Connection,
    bank_id: &str,
    filter: &UnitFilter,
    limit: usize,
    offset: usize,
) -> Result<Vec<MemoryUnit>, EngineError> {
    let mut sql = format!("SELECT {SELECT_COLUMNS} FROM memory_units WHERE bank_id = ?1");
    let mut args: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(bank_id.to_string())];

    if let Some(types) = &filter.fact_types {
        let placeholders = types.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
        sql.push_str(&format!(" AND fact_type IN ({placeholders})"));
        for t in types {
            args.push(Box::new(t.to_string()));
        }
    }
    if let Some(document_id) = &filter.document_id {
        sql.push_str(&format!(" AND document_id = ?{}", args.len() + 1));
        args.push(Box::new(document_id.clone()));
    }
    if let Some(since) = filter.since {
        sql.push_str(&format!(" AND mentioned_at >= ?{}", args.len() + 1));
        args.push(Box::new(super::codec::to_rfc3339(since)));
    }
    if let Some(until) = filter.until {
        sql.push_str(&format!(" AND mentioned_at <= ?{}", args.len() + 1));
        args.push(Box::new(super::codec::to_rfc3339(until)));
    }
    sql.push_str(&format!(
        " ORDER BY mentioned_at DESC LIMIT ?{} OFFSET ?{}",
        args.len() + 1,
        args.len() + 2
    ));
    args.push(Box::new(limit as i64));
    args.push(Box::new(offset as i64));

    let mut stmt = conn.prepare(&sql).map_err(EngineError::Database)?;
    let params_refs: Vec<&dyn rusqlite::ToSql> = args.iter().map(|b| b.as_ref()).collect();
    let rows = stmt.query_map(params_refs.as_slice(), row_to_unit).map_err(EngineError::Database)?;

    let mut out = Vec::new();
    for row in rows {
        out.push(row.map_err(EngineError::Database)??);
    }
    Ok(out)
}

/// Merges metadata keys onto an existing unit without clobbering keys the
/// unit already has, used when the retain pipeline dedups a fact against an
/// existing one rather than silently dropping its metadata (spec.md §4.6
/// step 3 "drop the new fact and (optionally) append its metadata to the
/// existing one").
pub fn merge_metadata(conn: &Connection, bank_id: &str, unit_id: Uuid, incoming: &std::collections::HashMap<String, Option<String>>) -> Result<(), EngineError> {
    let Some(mut unit) = get(conn, bank_id, unit_id)? else {
        return Ok(());
    };
    let mut changed = false;
    for (key, value) in incoming {
        if !unit.metadata.contains_key(key) {
            unit.metadata.insert(key.clone(), value.clone());
            changed = true;
        }
    }
    if !changed {
        return Ok(());
    }
    conn.execute(
        "UPDATE memory_units SET metadata = ?1 WHERE id = ?2 AND bank_id = ?3",
        params![encode_metadata(&unit.metadata)?, unit_id.to_string(), bank_id],
    )
    .map_err(EngineError::Database)?;
    Ok(())
}

/// Counts units referencing an entity, used by entity-seed recall
/// (spec.md §4.8).
pub fn units_for_entity(conn: &Connection, bank_id: &str, entity_id: Uuid, limit: usize) -> Result<Vec<MemoryUnit>, EngineError> {
    let mut stmt = conn
        .prepare_cached(&format!(
            "SELECT {cols} FROM memory_units
             JOIN unit_entities ON unit_entities.unit_id = memory_units.id
             WHERE memory_units.bank_id = ?1 AND unit_entities.entity_id = ?2
             ORDER BY mentioned_at DESC LIMIT ?3",
            cols = SELECT_COLUMNS
                .split(", ")
                .map(|c| format!("memory_units.{c}"))
                .collect::<Vec<_>>()
                .join(", ")
        ))
        .map_err(EngineError::Database)?;
    let rows = stmt
        .query_map(params![bank_id, entity_id.to_string(), limit as i64], row_to_unit)
        .map_err(EngineError::Database)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row.map_err(EngineError::Database)??);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::pool::ConnectionPool;
    use chrono::Utc;
    use std::collections::HashMap;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        for migration in crate::store::migrations::MIGRATIONS {
            conn.execute_batch(migration.up).unwrap();
        }
        conn.execute(
            "INSERT INTO banks (bank_id, name, personality, background, created_at, updated_at) VALUES ('b1','b1','{}','', ?1, ?1)",
            params![Utc::now().to_rfc3339()],
        )
        .unwrap();
        conn
    }

    fn make_unit(text: &str, fact_type: FactType) -> MemoryUnit {
        let now = Utc::now();
        MemoryUnit {
            id: Uuid::new_v4(),
            bank_id: "b1".to_string(),
            document_id: None,
            text: text.to_string(),
            fact_type,
            context: None,
            embedding: Some(vec![1.0, 0.0, 0.0]),
            occurred: TemporalRange::point(now),
            mentioned_at: now,
            metadata: HashMap::new(),
            created_at: now,
        }
    }

    #[test]
    fn insert_and_get_round_trips() {
        let conn = test_conn();
        let unit = make_unit("Alice works at Google.", FactType::World);
        insert_batch(&conn, std::slice::from_ref(&unit)).unwrap();
        let fetched = get(&conn, "b1", unit.id).unwrap().unwrap();
        assert_eq!(fetched.text, "Alice works at Google.");
        assert_eq!(fetched.fact_type, FactType::World);
    }

    #[test]
    fn fulltext_search_finds_matching_text() {
        let conn = test_conn();
        let unit = make_unit("Alice works at Google in Mountain View.", FactType::World);
        insert_batch(&conn, std::slice::from_ref(&unit)).unwrap();
        let results = fulltext_search(&conn, "b1", "Google", 10).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0.id, unit.id);
    }

    #[test]
    fn vector_search_ranks_by_cosine() {
        let conn = test_conn();
        let mut close = make_unit("close", FactType::World);
        close.embedding = Some(vec![1.0, 0.0, 0.0]);
        let mut far = make_unit("far", FactType::World);
        far.embedding = Some(vec![0.0, 1.0, 0.0]);
        insert_batch(&conn, &[close.clone(), far.clone()]).unwrap();
        let results = vector_search(&conn, "b1", &[1.0, 0.0, 0.0], None, 10).unwrap();
        assert_eq!(results[0].0.id, close.id);
    }

    #[test]
    fn delete_by_document_removes_its_units() {
        let conn = test_conn();
        let mut unit = make_unit("doc bound", FactType::World);
        unit.document_id = Some("doc-1".to_string());
        insert_batch(&conn, std::slice::from_ref(&unit)).unwrap();
        delete_by_document(&conn, "b1", "doc-1").unwrap();
        assert!(get(&conn, "b1", unit.id).unwrap().is_none());
    }

    #[tokio::test]
    async fn pool_roundtrip() {
        let pool = ConnectionPool::open(None, crate::error::RetryPolicy::default()).unwrap();
        pool.apply_migrations().unwrap();
        pool.with_writer(|conn| {
            conn.execute(
                "INSERT INTO banks (bank_id, name, personality, background, created_at, updated_at) VALUES ('b1','b1','{}','', ?1, ?1)",
                params![Utc::now().to_rfc3339()],
            )
            .map_err(EngineError::Database)
        })
        .await
        .unwrap();
    }
}
