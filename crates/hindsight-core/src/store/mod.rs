//! The Store (spec.md §4.1): connection pool, schema, and every query class
//! the rest of the engine needs — point lookup, vector K-NN, full-text
//! search, and filtered scan with pagination, plus the bulk writers the
//! Link Builder and Entity Resolver rely on.

mod codec;
pub mod entities;
pub mod links;
pub mod migrations;
pub mod pool;
pub mod units;

use std::path::Path;

use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use crate::error::EngineError;
use crate::model::{AsyncOperation, Bank, Document, OperationStatus, PersonalityTraits};
use codec::{parse_timestamp, parse_uuid};
pub use pool::{default_db_path, ConnectionPool};
pub use units::UnitFilter;

/// Thin facade over [`ConnectionPool`] exposing the store's transactional
/// API (spec.md §4.1). Every write spanning more than one table goes
/// through [`Store::with_writer`]'s closure in a single SQLite transaction.
pub struct Store {
    pool: ConnectionPool,
}

impl Store {
    pub fn open(db_path: Option<&Path>, retry: crate::error::RetryPolicy) -> Result<Self, EngineError> {
        let pool = ConnectionPool::open(db_path, retry)?;
        pool.apply_migrations()?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    // ---- banks ----------------------------------------------------------

    /// Fetches a bank, auto-creating it with neutral defaults on first
    /// reference (spec.md §3).
    pub async fn get_or_create_bank(&self, bank_id: &str) -> Result<Bank, EngineError> {
        let bank_id = bank_id.to_string();
        self.pool
            .with_writer(move |conn| {
                if let Some(bank) = fetch_bank(conn, &bank_id)? {
                    return Ok(bank);
                }
                let bank = Bank::new_default(bank_id.clone());
                conn.execute(
                    "INSERT INTO banks (bank_id, name, personality, background, created_at, updated_at)
                     VALUES (?1,?2,?3,?4,?5,?6)
                     ON CONFLICT (bank_id) DO NOTHING",
                    params![
                        bank.bank_id,
                        bank.name,
                        serde_json::to_string(&bank.personality).map_err(EngineError::Serde)?,
                        bank.background,
                        bank.created_at.to_rfc3339(),
                        bank.updated_at.to_rfc3339(),
                    ],
                )
                .map_err(EngineError::Database)?;
                fetch_bank(conn, &bank_id)?.ok_or_else(|| EngineError::Fatal("bank insert vanished".into()))
            })
            .await
    }

    pub async fn list_banks(&self) -> Result<Vec<Bank>, EngineError> {
        self.pool
            .with_reader(|conn| {
                let mut stmt = conn
                    .prepare_cached("SELECT bank_id, name, personality, background, created_at, updated_at FROM banks ORDER BY bank_id")
                    .map_err(EngineError::Database)?;
                let rows = stmt.query_map([], row_to_bank).map_err(EngineError::Database)?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(row.map_err(EngineError::Database)??);
                }
                Ok(out)
            })
            .await
    }

    pub async fn update_bank_personality(&self, bank_id: &str, personality: PersonalityTraits) -> Result<Bank, EngineError> {
        let bank_id = bank_id.to_string();
        self.pool
            .with_writer(move |conn| {
                conn.execute(
                    "UPDATE banks SET personality = ?1, updated_at = ?2 WHERE bank_id = ?3",
                    params![
                        serde_json::to_string(&personality).map_err(EngineError::Serde)?,
                        Utc::now().to_rfc3339(),
                        bank_id,
                    ],
                )
                .map_err(EngineError::Database)?;
                fetch_bank(conn, &bank_id)?.ok_or_else(|| EngineError::NotFound(format!("bank {bank_id}")))
            })
            .await
    }

    pub async fn update_bank_background(&self, bank_id: &str, background: String, personality: Option<PersonalityTraits>) -> Result<Bank, EngineError> {
        let bank_id = bank_id.to_string();
        self.pool
            .with_writer(move |conn| {
                match &personality {
                    Some(p) => {
                        conn.execute(
                            "UPDATE banks SET background = ?1, personality = ?2, updated_at = ?3 WHERE bank_id = ?4",
                            params![
                                background,
                                serde_json::to_string(p).map_err(EngineError::Serde)?,
                                Utc::now().to_rfc3339(),
                                bank_id,
                            ],
                        )
                        .map_err(EngineError::Database)?;
                    }
                    None => {
                        conn.execute(
                            "UPDATE banks SET background = ?1, updated_at = ?2 WHERE bank_id = ?3",
                            params![background, Utc::now().to_rfc3339(), bank_id],
                        )
                        .map_err(EngineError::Database)?;
                    }
                }
                fetch_bank(conn, &bank_id)?.ok_or_else(|| EngineError::NotFound(format!("bank {bank_id}")))
            })
            .await
    }

    /// Cascading delete: removes the bank row and (via `ON DELETE CASCADE`
    /// foreign keys) every owned document/unit/link/entity/unit-entity row
    /// (spec.md §3 invariant).
    pub async fn delete_bank(&self, bank_id: &str) -> Result<(), EngineError> {
        let bank_id = bank_id.to_string();
        self.pool
            .with_writer(move |conn| {
                conn.execute("PRAGMA foreign_keys = ON", []).map_err(EngineError::Database)?;
                conn.execute("DELETE FROM banks WHERE bank_id = ?1", params![bank_id])
                    .map_err(EngineError::Database)?;
                Ok(())
            })
            .await
    }

    // ---- documents --------------------------------------------------------

    /// Deletes every unit, link, and unit-entity row derived from a
    /// document, without depending on `PRAGMA foreign_keys` being honored
    /// by the caller's connection (spec.md §3 "Upsert semantics").
    pub async fn delete_document_units(&self, bank_id: &str, document_id: &str) -> Result<(), EngineError> {
        let bank_id = bank_id.to_string();
        let document_id = document_id.to_string();
        self.pool
            .with_writer(move |conn| {
                conn.execute(
                    "DELETE FROM memory_links WHERE from_unit_id IN
                        (SELECT id FROM memory_units WHERE bank_id = ?1 AND document_id = ?2)
                     OR to_unit_id IN
                        (SELECT id FROM memory_units WHERE bank_id = ?1 AND document_id = ?2)",
                    params![bank_id, document_id],
                )
                .map_err(EngineError::Database)?;
                conn.execute(
                    "DELETE FROM unit_entities WHERE unit_id IN
                        (SELECT id FROM memory_units WHERE bank_id = ?1 AND document_id = ?2)",
                    params![bank_id, document_id],
                )
                .map_err(EngineError::Database)?;
                units::delete_by_document(conn, &bank_id, &document_id)
            })
            .await
    }

    pub async fn upsert_document(&self, document: Document) -> Result<Document, EngineError> {
        self.pool
            .with_writer(move |conn| {
                conn.execute(
                    "DELETE FROM documents WHERE id = ?1 AND bank_id = ?2",
                    params![document.id, document.bank_id],
                )
                .map_err(EngineError::Database)?;
                conn.execute(
                    "INSERT INTO documents (id, bank_id, original_text, content_hash, unit_count, created_at, updated_at)
                     VALUES (?1,?2,?3,?4,?5,?6,?7)",
                    params![
                        document.id,
                        document.bank_id,
                        document.original_text,
                        document.content_hash,
                        document.unit_count as i64,
                        document.created_at.to_rfc3339(),
                        document.updated_at.to_rfc3339(),
                    ],
                )
                .map_err(EngineError::Database)?;
                Ok(document.clone())
            })
            .await
    }

    pub async fn set_document_unit_count(&self, bank_id: &str, document_id: &str, unit_count: usize) -> Result<(), EngineError> {
        let bank_id = bank_id.to_string();
        let document_id = document_id.to_string();
        self.pool
            .with_writer(move |conn| {
                conn.execute(
                    "UPDATE documents SET unit_count = ?1, updated_at = ?2 WHERE id = ?3 AND bank_id = ?4",
                    params![unit_count as i64, Utc::now().to_rfc3339(), document_id, bank_id],
                )
                .map_err(EngineError::Database)?;
                Ok(())
            })
            .await
    }

    pub async fn get_document(&self, bank_id: &str, document_id: &str) -> Result<Option<Document>, EngineError> {
        let bank_id = bank_id.to_string();
        let document_id = document_id.to_string();
        self.pool
            .with_reader(move |conn| {
                conn.query_row(
                    "SELECT id, bank_id, original_text, content_hash, unit_count, created_at, updated_at
                     FROM documents WHERE id = ?1 AND bank_id = ?2",
                    params![document_id, bank_id],
                    row_to_document,
                )
                .optional()
                .map_err(EngineError::Database)?
                .transpose()
            })
            .await
    }

    pub async fn list_documents(&self, bank_id: &str, limit: usize, offset: usize) -> Result<Vec<Document>, EngineError> {
        let bank_id = bank_id.to_string();
        self.pool
            .with_reader(move |conn| {
                let mut stmt = conn
                    .prepare_cached(
                        "SELECT id, bank_id, original_text, content_hash, unit_count, created_at, updated_at
                         FROM documents WHERE bank_id = ?1 ORDER BY updated_at DESC LIMIT ?2 OFFSET ?3",
                    )
                    .map_err(EngineError::Database)?;
                let rows = stmt
                    .query_map(params![bank_id, limit as i64, offset as i64], row_to_document)
                    .map_err(EngineError::Database)?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(row.map_err(EngineError::Database)??);
                }
                Ok(out)
            })
            .await
    }

    pub async fn delete_document(&self, bank_id: &str, document_id: &str) -> Result<(), EngineError> {
        let bank_id = bank_id.to_string();
        let document_id = document_id.to_string();
        self.pool
            .with_writer(move |conn| {
                conn.execute(
                    "DELETE FROM documents WHERE id = ?1 AND bank_id = ?2",
                    params![document_id, bank_id],
                )
                .map_err(EngineError::Database)?;
                Ok(())
            })
            .await
    }

    // ---- async operations ---------------------------------------------

    pub async fn insert_operation(&self, operation: AsyncOperation) -> Result<AsyncOperation, EngineError> {
        self.pool
            .with_writer(move |conn| {
                conn.execute(
                    "INSERT INTO async_operations (id, bank_id, task_type, items_count, document_id, created_at, status, error_message)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
                    params![
                        operation.id.to_string(),
                        operation.bank_id,
                        operation.task_type,
                        operation.items_count as i64,
                        operation.document_id,
                        operation.created_at.to_rfc3339(),
                        operation.status.to_string(),
                        operation.error_message,
                    ],
                )
                .map_err(EngineError::Database)?;
                Ok(operation.clone())
            })
            .await
    }

    pub async fn update_operation_status(&self, id: Uuid, status: OperationStatus, error_message: Option<String>) -> Result<(), EngineError> {
        self.pool
            .with_writer(move |conn| {
                conn.execute(
                    "UPDATE async_operations SET status = ?1, error_message = ?2 WHERE id = ?3",
                    params![status.to_string(), error_message, id.to_string()],
                )
                .map_err(EngineError::Database)?;
                Ok(())
            })
            .await
    }

    /// Whether a pending operation still exists — the Task Backend worker
    /// checks this before executing a task so a cancelled (deleted) row is
    /// skipped (spec.md §4.9).
    pub async fn operation_exists(&self, id: Uuid) -> Result<bool, EngineError> {
        self.pool
            .with_reader(move |conn| {
                conn.query_row(
                    "SELECT EXISTS(SELECT 1 FROM async_operations WHERE id = ?1)",
                    params![id.to_string()],
                    |row| row.get(0),
                )
                .map_err(EngineError::Database)
            })
            .await
    }

    pub async fn cancel_operation(&self, id: Uuid) -> Result<(), EngineError> {
        self.pool
            .with_writer(move |conn| {
                conn.execute("DELETE FROM async_operations WHERE id = ?1", params![id.to_string()])
                    .map_err(EngineError::Database)?;
                Ok(())
            })
            .await
    }

    pub async fn list_operations(&self, bank_id: &str, limit: usize) -> Result<Vec<AsyncOperation>, EngineError> {
        let bank_id = bank_id.to_string();
        self.pool
            .with_reader(move |conn| {
                let mut stmt = conn
                    .prepare_cached(
                        "SELECT id, bank_id, task_type, items_count, document_id, created_at, status, error_message
                         FROM async_operations WHERE bank_id = ?1 ORDER BY created_at DESC LIMIT ?2",
                    )
                    .map_err(EngineError::Database)?;
                let rows = stmt
                    .query_map(params![bank_id, limit as i64], row_to_operation)
                    .map_err(EngineError::Database)?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(row.map_err(EngineError::Database)??);
                }
                Ok(out)
            })
            .await
    }

    // ---- graph export ---------------------------------------------------

    /// Every unit and link in a bank, optionally filtered by fact type —
    /// backs `get_graph_data` (spec.md §6).
    pub async fn graph_data(&self, bank_id: &str, fact_type: Option<crate::model::FactType>) -> Result<(Vec<crate::model::MemoryUnit>, Vec<crate::model::MemoryLink>), EngineError> {
        let bank_id = bank_id.to_string();
        self.pool
            .with_reader(move |conn| {
                let filter = UnitFilter {
                    fact_types: fact_type.map(|t| vec![t]),
                    ..UnitFilter::default()
                };
                let nodes = units::list_units(conn, &bank_id, &filter, usize::MAX, 0)?;
                let node_ids: std::collections::HashSet<Uuid> = nodes.iter().map(|u| u.id).collect();

                let mut stmt = conn
                    .prepare_cached("SELECT from_unit_id, to_unit_id, link_type, weight, entity_id FROM memory_links
                         WHERE from_unit_id IN (SELECT id FROM memory_units WHERE bank_id = ?1)")
                    .map_err(EngineError::Database)?;
                let rows = stmt
                    .query_map(params![bank_id], |row| {
                        let from: String = row.get(0)?;
                        let to: String = row.get(1)?;
                        let link_type: String = row.get(2)?;
                        let weight: f64 = row.get(3)?;
                        let entity_id: String = row.get(4)?;
                        Ok((from, to, link_type, weight, entity_id))
                    })
                    .map_err(EngineError::Database)?;

                let mut edges = Vec::new();
                for row in rows {
                    let (from, to, link_type, weight, entity_id) = row.map_err(EngineError::Database)?;
                    let from_id = parse_uuid(&from)?;
                    let to_id = parse_uuid(&to)?;
                    if !node_ids.contains(&from_id) || !node_ids.contains(&to_id) {
                        continue;
                    }
                    let mut link = crate::model::MemoryLink::new(from_id, to_id, link_type.parse()?, weight as f32);
                    let entity_uuid = parse_uuid(&entity_id)?;
                    if entity_uuid != crate::model::link::ZERO_ENTITY_ID {
                        link = link.with_entity(entity_uuid);
                    }
                    edges.push(link);
                }
                Ok((nodes, edges))
            })
            .await
    }
}

fn fetch_bank(conn: &rusqlite::Connection, bank_id: &str) -> Result<Option<Bank>, EngineError> {
    conn.query_row(
        "SELECT bank_id, name, personality, background, created_at, updated_at FROM banks WHERE bank_id = ?1",
        params![bank_id],
        row_to_bank,
    )
    .optional()
    .map_err(EngineError::Database)?
    .transpose()
}

fn row_to_bank(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<Bank, EngineError>> {
    let bank_id: String = row.get(0)?;
    let name: String = row.get(1)?;
    let personality: String = row.get(2)?;
    let background: String = row.get(3)?;
    let created_at: String = row.get(4)?;
    let updated_at: String = row.get(5)?;

    let converted = (|| -> Result<Bank, EngineError> {
        Ok(Bank {
            bank_id,
            name,
            personality: serde_json::from_str(&personality).map_err(EngineError::Serde)?,
            background,
            created_at: parse_timestamp(&created_at)?,
            updated_at: parse_timestamp(&updated_at)?,
        })
    })();
    Ok(converted)
}

fn row_to_document(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<Document, EngineError>> {
    let id: String = row.get(0)?;
    let bank_id: String = row.get(1)?;
    let original_text: String = row.get(2)?;
    let content_hash: String = row.get(3)?;
    let unit_count: i64 = row.get(4)?;
    let created_at: String = row.get(5)?;
    let updated_at: String = row.get(6)?;

    let converted = (|| -> Result<Document, EngineError> {
        Ok(Document {
            id,
            bank_id,
            original_text,
            content_hash,
            unit_count: unit_count.max(0) as usize,
            created_at: parse_timestamp(&created_at)?,
            updated_at: parse_timestamp(&updated_at)?,
        })
    })();
    Ok(converted)
}

fn row_to_operation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<AsyncOperation, EngineError>> {
    let id: String = row.get(0)?;
    let bank_id: String = row.get(1)?;
    let task_type: String = row.get(2)?;
    let items_count: i64 = row.get(3)?;
    let document_id: Option<String> = row.get(4)?;
    let created_at: String = row.get(5)?;
    let status: String = row.get(6)?;
    let error_message: Option<String> = row.get(7)?;

    let converted = (|| -> Result<AsyncOperation, EngineError> {
        Ok(AsyncOperation {
            id: parse_uuid(&id)?,
            bank_id,
            task_type,
            items_count: items_count.max(0) as usize,
            document_id,
            created_at: parse_timestamp(&created_at)?,
            status: status.parse()?,
            error_message,
        })
    })();
    Ok(converted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_or_create_bank_auto_creates_with_neutral_defaults() {
        let store = Store::open(None, crate::error::RetryPolicy::default()).unwrap();
        let bank = store.get_or_create_bank("acme").await.unwrap();
        assert_eq!(bank.name, "acme");
        assert_eq!(bank.personality.openness, 0.5);
    }

    #[tokio::test]
    async fn get_or_create_bank_is_idempotent() {
        let store = Store::open(None, crate::error::RetryPolicy::default()).unwrap();
        let first = store.get_or_create_bank("acme").await.unwrap();
        store
            .update_bank_personality(
                "acme",
                PersonalityTraits {
                    openness: 0.9,
                    ..PersonalityTraits::default()
                },
            )
            .await
            .unwrap();
        let second = store.get_or_create_bank("acme").await.unwrap();
        assert_eq!(first.bank_id, second.bank_id);
        assert_eq!(second.personality.openness, 0.9);
    }

    #[tokio::test]
    async fn document_upsert_replaces_prior_row() {
        let store = Store::open(None, crate::error::RetryPolicy::default()).unwrap();
        store.get_or_create_bank("acme").await.unwrap();
        let doc_v1 = Document::new("acme", "meeting-002", "Alice works at Google.");
        store.upsert_document(doc_v1).await.unwrap();
        let doc_v2 = Document::new("acme", "meeting-002", "Alice works at Microsoft. Bob works at Apple.");
        store.upsert_document(doc_v2).await.unwrap();
        let fetched = store.get_document("acme", "meeting-002").await.unwrap().unwrap();
        assert!(fetched.original_text.contains("Microsoft"));
    }

    #[tokio::test]
    async fn operation_lifecycle() {
        let store = Store::open(None, crate::error::RetryPolicy::default()).unwrap();
        store.get_or_create_bank("acme").await.unwrap();
        let op = AsyncOperation::new_pending("acme", "retain", 1);
        store.insert_operation(op.clone()).await.unwrap();
        assert!(store.operation_exists(op.id).await.unwrap());
        store.update_operation_status(op.id, OperationStatus::Completed, None).await.unwrap();
        let listed = store.list_operations("acme", 10).await.unwrap();
        assert_eq!(listed[0].status, OperationStatus::Completed);
        store.cancel_operation(op.id).await.unwrap();
        assert!(!store.operation_exists(op.id).await.unwrap());
    }
}
