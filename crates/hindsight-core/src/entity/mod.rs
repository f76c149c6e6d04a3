//! Entity Resolver (spec.md §4.3)
//!
//! Maps surface names to canonical entity IDs within a bank: exact match,
//! then LLM arbitration seeded by lexical+embedding candidates, then
//! create-new.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::error::EngineError;
use crate::llm::{CompletionClient, CompletionRequest, Message};
use crate::model::entity::normalize_name;
use crate::model::Entity;
use crate::store::Store;

/// One surface-form mention to resolve: the text as it appeared, a coarse
/// type hint, and the occurrence date used for batch grouping (spec.md
/// §4.3).
#[derive(Debug, Clone)]
pub struct EntityMention {
    pub surface_form: String,
    pub entity_type_hint: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Resolves surface forms to canonical entity IDs, batched per bank.
pub struct EntityResolver {
    store: Arc<Store>,
    completion: Arc<dyn CompletionClient>,
}

impl EntityResolver {
    pub fn new(store: Arc<Store>, completion: Arc<dyn CompletionClient>) -> Self {
        Self { store, completion }
    }

    /// Resolves a batch of mentions within one bank. Mentions with the same
    /// normalized surface form collapse to the same `entity_id`, satisfying
    /// the batch contract (spec.md §4.3). Returns, in input order, the
    /// resolved entity id for each mention.
    pub async fn resolve_batch(&self, bank_id: &str, mentions: &[EntityMention]) -> Result<Vec<Uuid>, EngineError> {
        let mut resolved_in_batch: HashMap<String, Uuid> = HashMap::new();
        let mut out = Vec::with_capacity(mentions.len());

        for mention in mentions {
            let normalized = normalize_name(&mention.surface_form);

            if let Some(&id) = resolved_in_batch.get(&normalized) {
                out.push(id);
                continue;
            }

            let entity_id = self.resolve_one(bank_id, mention).await?;
            resolved_in_batch.insert(normalized, entity_id);
            out.push(entity_id);
        }

        Ok(out)
    }

    async fn resolve_one(&self, bank_id: &str, mention: &EntityMention) -> Result<Uuid, EngineError> {
        // Step 1: exact canonical-name match within the bank.
        if let Some(existing) = self
            .store
            .pool()
            .with_reader({
                let bank_id = bank_id.to_string();
                let surface = mention.surface_form.clone();
                move |conn| crate::store::entities::find_by_canonical_name(conn, &bank_id, &surface)
            })
            .await?
        {
            self.bump_mention(bank_id, existing.id, mention.occurred_at).await?;
            return Ok(existing.id);
        }

        // Step 2: LLM arbitration seeded by lexical neighbors (embedding
        // candidates are left to a future vector-backed candidate source;
        // lexical match via LIKE is the baseline per spec.md §4.3).
        let candidates = self
            .store
            .pool()
            .with_reader({
                let bank_id = bank_id.to_string();
                move |conn| list_lexical_candidates(conn, &bank_id)
            })
            .await?;

        match self.arbitrate(bank_id, mention, &candidates).await {
            Ok(Arbitration::Existing(id)) => {
                self.bump_mention(bank_id, id, mention.occurred_at).await?;
                Ok(id)
            }
            Ok(Arbitration::New(canonical_name)) => self.create_entity(bank_id, &canonical_name, mention.occurred_at).await,
            Err(_) => {
                // Failure: fall back to create-new using the raw surface
                // form, log and continue (spec.md §4.3 "Failure").
                tracing::warn!(bank_id, surface = %mention.surface_form, "entity arbitration failed, falling back to raw surface form");
                self.create_entity(bank_id, &mention.surface_form, mention.occurred_at).await
            }
        }
    }

    async fn create_entity(&self, bank_id: &str, canonical_name: &str, at: DateTime<Utc>) -> Result<Uuid, EngineError> {
        // Idempotency: re-check exact match before inserting, since a
        // concurrent caller may have just created the same canonical name.
        if let Some(existing) = self
            .store
            .pool()
            .with_reader({
                let bank_id = bank_id.to_string();
                let name = canonical_name.to_string();
                move |conn| crate::store::entities::find_by_canonical_name(conn, &bank_id, &name)
            })
            .await?
        {
            self.bump_mention(bank_id, existing.id, at).await?;
            return Ok(existing.id);
        }

        let entity = Entity::new_from_mention(bank_id, canonical_name, at);
        let id = entity.id;
        self.store
            .pool()
            .with_writer(move |conn| crate::store::entities::upsert(conn, &entity))
            .await?;
        Ok(id)
    }

    async fn bump_mention(&self, bank_id: &str, entity_id: Uuid, at: DateTime<Utc>) -> Result<(), EngineError> {
        let bank_id = bank_id.to_string();
        self.store
            .pool()
            .with_writer(move |conn| {
                let mut entity = crate::store::entities::get(conn, &bank_id, entity_id)?
                    .ok_or_else(|| EngineError::NotFound(format!("entity {entity_id}")))?;
                entity.record_mention(at);
                crate::store::entities::upsert(conn, &entity)
            })
            .await
    }

    async fn arbitrate(&self, bank_id: &str, mention: &EntityMention, candidates: &[String]) -> Result<Arbitration, EngineError> {
        if candidates.is_empty() {
            return Ok(Arbitration::New(mention.surface_form.clone()));
        }

        let schema = serde_json::json!({
            "type": "object",
            "properties": {
                "matched_existing": {"type": "boolean"},
                "canonical_name": {"type": "string"},
            },
            "required": ["matched_existing", "canonical_name"],
        });
        let prompt = format!(
            "Bank '{bank_id}' has these known entities: {candidates:?}. A new mention \
             of '{surface}' (type hint: {hint:?}) appeared. If it refers to one of the \
             known entities, set matched_existing=true and canonical_name to that exact \
             existing name. Otherwise set matched_existing=false and canonical_name to a \
             clean canonical name for the new entity.",
            surface = mention.surface_form,
            hint = mention.entity_type_hint,
        );
        let request = CompletionRequest::new("entity_resolution", vec![Message::user(prompt)]).with_schema(schema);
        let response = self.completion.complete(&request).await?;
        parse_arbitration(bank_id, &response, self.store.clone()).await
    }
}

enum Arbitration {
    Existing(Uuid),
    New(String),
}

async fn parse_arbitration(bank_id: &str, response: &Value, store: Arc<Store>) -> Result<Arbitration, EngineError> {
    let matched = response.get("matched_existing").and_then(Value::as_bool).unwrap_or(false);
    let canonical_name = response
        .get("canonical_name")
        .and_then(Value::as_str)
        .ok_or_else(|| EngineError::Schema("arbitration response missing canonical_name".into()))?;

    if matched {
        let bank_id = bank_id.to_string();
        let name = canonical_name.to_string();
        let existing = store
            .pool()
            .with_reader(move |conn| crate::store::entities::find_by_canonical_name(conn, &bank_id, &name))
            .await?;
        match existing {
            Some(entity) => Ok(Arbitration::Existing(entity.id)),
            None => Ok(Arbitration::New(canonical_name.to_string())),
        }
    } else {
        Ok(Arbitration::New(canonical_name.to_string()))
    }
}

fn list_lexical_candidates(conn: &rusqlite::Connection, bank_id: &str) -> Result<Vec<String>, EngineError> {
    let mut stmt = conn
        .prepare_cached("SELECT canonical_name FROM entities WHERE bank_id = ?1 ORDER BY last_seen DESC LIMIT 50")
        .map_err(EngineError::Database)?;
    let rows = stmt
        .query_map(rusqlite::params![bank_id], |row| row.get::<_, String>(0))
        .map_err(EngineError::Database)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row.map_err(EngineError::Database)?);
    }
    Ok(out)
}
