//! `memory_links` queries: bulk idempotent insert and graph traversal
//! (spec.md §3, §4.4, §4.8).

use rusqlite::{params, Connection};
use uuid::Uuid;

use super::codec::parse_uuid;
use crate::error::EngineError;
use crate::model::{LinkType, MemoryLink};

/// One `executemany`-style insert per link type, `ON CONFLICT DO NOTHING`
/// on `(from_unit_id, to_unit_id, link_type, entity_id-or-zero)` (spec.md
/// §4.4: "All inserts go through one executemany per link type").
pub fn insert_batch(conn: &Connection, links: &[MemoryLink]) -> Result<(), EngineError> {
    let mut stmt = conn
        .prepare_cached(
            "INSERT INTO memory_links (from_unit_id, to_unit_id, link_type, weight, entity_id)
             VALUES (?1,?2,?3,?4,?5)
             ON CONFLICT (from_unit_id, to_unit_id, link_type, entity_id) DO NOTHING",
        )
        .map_err(EngineError::Database)?;
    for link in links {
        stmt.execute(params![
            link.from_unit_id.to_string(),
            link.to_unit_id.to_string(),
            link.link_type.to_string(),
            link.weight,
            link.entity_key().to_string(),
        ])
        .map_err(EngineError::Database)?;
    }
    Ok(())
}

/// One hop of graph expansion: neighbors reachable from `unit_ids` over
/// `link_types`, with the edge weight, bounded to `fanout` per source unit
/// (spec.md §4.8 "Graph expansion").
pub fn neighbors(
    conn: &Connection,
    unit_ids: &[Uuid],
    link_types: &[LinkType],
    fanout: usize,
) -> Result<Vec<(Uuid, Uuid, f32)>, EngineError> {
    if unit_ids.is_empty() || link_types.is_empty() || fanout == 0 {
        return Ok(Vec::new());
    }

    let unit_placeholders = unit_ids.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
    let type_placeholders = link_types.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
    let sql = format!(
        "SELECT from_unit_id, to_unit_id, weight FROM memory_links
         WHERE from_unit_id IN ({unit_placeholders}) AND link_type IN ({type_placeholders})
         ORDER BY from_unit_id, weight DESC"
    );

    let mut args: Vec<String> = unit_ids.iter().map(Uuid::to_string).collect();
    args.extend(link_types.iter().map(LinkType::to_string));
    let params_refs: Vec<&dyn rusqlite::ToSql> = args.iter().map(|s| s as &dyn rusqlite::ToSql).collect();

    let mut stmt = conn.prepare(&sql).map_err(EngineError::Database)?;
    let rows = stmt
        .query_map(params_refs.as_slice(), |row| {
            let from: String = row.get(0)?;
            let to: String = row.get(1)?;
            let weight: f64 = row.get(2)?;
            Ok((from, to, weight as f32))
        })
        .map_err(EngineError::Database)?;

    let mut per_source_count: std::collections::HashMap<Uuid, usize> = std::collections::HashMap::new();
    let mut out = Vec::new();
    for row in rows {
        let (from, to, weight) = row.map_err(EngineError::Database)?;
        let from_id = parse_uuid(&from)?;
        let to_id = parse_uuid(&to)?;
        let count = per_source_count.entry(from_id).or_insert(0);
        if *count >= fanout {
            continue;
        }
        *count += 1;
        out.push((from_id, to_id, weight));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_conn() -> Connection {
        Connection::open_in_memory().unwrap()
    }

    fn setup(conn: &Connection) {
        for migration in crate::store::migrations::MIGRATIONS {
            conn.execute_batch(migration.up).unwrap();
        }
    }

    #[test]
    fn insert_batch_is_idempotent_under_conflict() {
        let conn = test_conn();
        setup(&conn);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let link = MemoryLink::new(a, b, LinkType::Semantic, 0.9);
        insert_batch(&conn, &[link.clone(), link.clone()]).unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM memory_links", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn neighbors_respects_fanout_cap() {
        let conn = test_conn();
        setup(&conn);
        let source = Uuid::new_v4();
        let targets: Vec<Uuid> = (0..5).map(|_| Uuid::new_v4()).collect();
        let links: Vec<MemoryLink> = targets
            .iter()
            .map(|t| MemoryLink::new(source, *t, LinkType::Semantic, 0.8))
            .collect();
        insert_batch(&conn, &links).unwrap();
        let found = neighbors(&conn, &[source], &[LinkType::Semantic], 2).unwrap();
        assert_eq!(found.len(), 2);
    }
}
