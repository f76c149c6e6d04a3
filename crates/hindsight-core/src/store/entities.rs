//! `entities` and `unit_entities` queries (spec.md §3, §4.3).

use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use super::codec::{decode_metadata, encode_metadata, parse_timestamp, parse_uuid};
use crate::error::EngineError;
use crate::model::Entity;

fn row_to_entity(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<Entity, EngineError>> {
    let id: String = row.get("id")?;
    let bank_id: String = row.get("bank_id")?;
    let canonical_name: String = row.get("canonical_name")?;
    let mention_count: i64 = row.get("mention_count")?;
    let first_seen: String = row.get("first_seen")?;
    let last_seen: String = row.get("last_seen")?;
    let metadata: String = row.get("metadata")?;

    let converted = (|| -> Result<Entity, EngineError> {
        Ok(Entity {
            id: parse_uuid(&id)?,
            bank_id,
            canonical_name,
            mention_count: mention_count.max(0) as u64,
            first_seen: parse_timestamp(&first_seen)?,
            last_seen: parse_timestamp(&last_seen)?,
            metadata: decode_metadata(&metadata)?,
        })
    })();
    Ok(converted)
}

const SELECT_COLUMNS: &str = "id, bank_id, canonical_name, mention_count, first_seen, last_seen, metadata";

pub fn find_by_canonical_name(conn: &Connection, bank_id: &str, canonical_name: &str) -> Result<Option<Entity>, EngineError> {
    conn.query_row(
        &format!("SELECT {SELECT_COLUMNS} FROM entities WHERE bank_id = ?1 AND lower(canonical_name) = lower(?2)"),
        params![bank_id, canonical_name],
        row_to_entity,
    )
    .optional()
    .map_err(EngineError::Database)?
    .transpose()
}

pub fn get(conn: &Connection, bank_id: &str, id: Uuid) -> Result<Option<Entity>, EngineError> {
    conn.query_row(
        &format!("SELECT {SELECT_COLUMNS} FROM entities WHERE bank_id = ?1 AND id = ?2"),
        params![bank_id, id.to_string()],
        row_to_entity,
    )
    .optional()
    .map_err(EngineError::Database)?
    .transpose()
}

pub fn list(conn: &Connection, bank_id: &str, limit: usize, offset: usize) -> Result<Vec<Entity>, EngineError> {
    let mut stmt = conn
        .prepare_cached(&format!(
            "SELECT {SELECT_COLUMNS} FROM entities WHERE bank_id = ?1 ORDER BY last_seen DESC LIMIT ?2 OFFSET ?3"
        ))
        .map_err(EngineError::Database)?;
    let rows = stmt
        .query_map(params![bank_id, limit as i64, offset as i64], row_to_entity)
        .map_err(EngineError::Database)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row.map_err(EngineError::Database)??);
    }
    Ok(out)
}

/// Upserts an entity: inserts new rows, and for existing rows bumps
/// `mention_count`/`last_seen`/`first_seen` (spec.md §4.3's mutation
/// contract). Idempotent: calling twice with the same entity state is a
/// no-op beyond the bookkeeping bump.
pub fn upsert(conn: &Connection, entity: &Entity) -> Result<(), EngineError> {
    conn.execute(
        "INSERT INTO entities (id, bank_id, canonical_name, mention_count, first_seen, last_seen, metadata)
         VALUES (?1,?2,?3,?4,?5,?6,?7)
         ON CONFLICT(id) DO UPDATE SET
             mention_count = excluded.mention_count,
             first_seen = MIN(entities.first_seen, excluded.first_seen),
             last_seen = MAX(entities.last_seen, excluded.last_seen),
             canonical_name = excluded.canonical_name",
        params![
            entity.id.to_string(),
            entity.bank_id,
            entity.canonical_name,
            entity.mention_count as i64,
            super::codec::to_rfc3339(entity.first_seen),
            super::codec::to_rfc3339(entity.last_seen),
            encode_metadata(&entity.metadata)?,
        ],
    )
    .map_err(EngineError::Database)?;
    Ok(())
}

/// Bulk `unit_entities` writer; `ON CONFLICT DO NOTHING` on the composite
/// key makes repeated calls idempotent (spec.md §4.3).
pub fn insert_unit_entities(conn: &Connection, pairs: &[(Uuid, Uuid)]) -> Result<(), EngineError> {
    let mut stmt = conn
        .prepare_cached("INSERT INTO unit_entities (unit_id, entity_id) VALUES (?1,?2) ON CONFLICT DO NOTHING")
        .map_err(EngineError::Database)?;
    for (unit_id, entity_id) in pairs {
        stmt.execute(params![unit_id.to_string(), entity_id.to_string()])
            .map_err(EngineError::Database)?;
    }
    Ok(())
}

/// All unit ids tagged with `entity_id`, used by the Link Builder's entity
/// pass (spec.md §4.4: "one query that returns all units referencing it").
pub fn unit_ids_for_entity(conn: &Connection, entity_id: Uuid) -> Result<Vec<Uuid>, EngineError> {
    let mut stmt = conn
        .prepare_cached("SELECT unit_id FROM unit_entities WHERE entity_id = ?1")
        .map_err(EngineError::Database)?;
    let rows = stmt
        .query_map(params![entity_id.to_string()], |row| row.get::<_, String>(0))
        .map_err(EngineError::Database)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(parse_uuid(&row.map_err(EngineError::Database)?)?);
    }
    Ok(out)
}

/// Entity ids mentioned by a unit, used by the Observation Consolidator to
/// copy source facts' entity links onto new observation units (spec.md
/// §4.7).
pub fn entity_ids_for_unit(conn: &Connection, unit_id: Uuid) -> Result<Vec<Uuid>, EngineError> {
    let mut stmt = conn
        .prepare_cached("SELECT entity_id FROM unit_entities WHERE unit_id = ?1")
        .map_err(EngineError::Database)?;
    let rows = stmt
        .query_map(params![unit_id.to_string()], |row| row.get::<_, String>(0))
        .map_err(EngineError::Database)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(parse_uuid(&row.map_err(EngineError::Database)?)?);
    }
    Ok(out)
}

/// Entities whose canonical name appears in `query`, used by the Retrieval
/// Planner's entity-seed source (spec.md §4.8: one of the three candidate
/// sources feeding recall). Scans the bank's entities rather than parsing
/// the query for proper nouns, since the engine has no NER of its own
/// outside the extractor's LLM call.
pub fn find_mentioned_in_text(conn: &Connection, bank_id: &str, query: &str) -> Result<Vec<Entity>, EngineError> {
    let all = list(conn, bank_id, 500, 0)?;
    let query_lower = query.to_lowercase();
    Ok(all
        .into_iter()
        .filter(|e| query_lower.contains(&e.canonical_name.to_lowercase()))
        .collect())
}

/// Deletes only an entity's observation units, leaving the entity and its
/// source facts intact — used by the Observation Consolidator before
/// writing a fresh batch (spec.md §4.7 step 4 "delete this entity's prior
/// observation units").
pub fn delete_observations_only(conn: &Connection, bank_id: &str, entity_id: Uuid) -> Result<(), EngineError> {
    conn.execute(
        "DELETE FROM memory_units WHERE bank_id = ?1 AND fact_type = 'observation'
         AND json_extract(metadata, '$.entity_id') = ?2",
        params![bank_id, entity_id.to_string()],
    )
    .map_err(EngineError::Database)?;
    Ok(())
}

/// Deletes an entity and its observation units (spec.md §3 invariant:
/// "deleting the entity deletes its observations" — observations carry a
/// metadata back-reference checked here rather than a DB-level cascade
/// since observations are plain `memory_units` rows).
pub fn delete(conn: &Connection, bank_id: &str, entity_id: Uuid) -> Result<(), EngineError> {
    delete_observations_only(conn, bank_id, entity_id)?;
    conn.execute(
        "DELETE FROM entities WHERE bank_id = ?1 AND id = ?2",
        params![bank_id, entity_id.to_string()],
    )
    .map_err(EngineError::Database)?;
    Ok(())
}
