//! Observation Consolidator (spec.md §4.7)
//!
//! Synthesizes an entity's scattered mentions into a small number of
//! up-to-date `observation`-typed units, replacing whatever observations
//! existed before.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use chrono::Utc;
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::llm::{CompletionClient, CompletionRequest, Message};
use crate::model::{FactType, MemoryLink, MemoryUnit, TemporalRange};
use crate::store::Store;

/// Per-entity advisory locks so two concurrent `regenerate` calls for the
/// same entity never race (spec.md §5 "Shared resources": "The Observation
/// Consolidator uses a per-entity advisory lock so two refreshes cannot
/// race"). Lazily allocates one `tokio::sync::Mutex` per entity id the first
/// time it's requested and keeps it forever — entity counts per bank are
/// small enough that this never needs eviction.
#[derive(Default)]
struct EntityLocks {
    locks: StdMutex<HashMap<Uuid, Arc<AsyncMutex<()>>>>,
}

impl EntityLocks {
    fn get(&self, entity_id: Uuid) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(entity_id).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
    }
}

/// One synthesized observation, pre-persistence.
#[derive(Debug, Clone)]
struct RawObservation {
    text: String,
}

fn observation_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "observations": {
                "type": "array",
                "items": {"type": "string"},
            },
        },
        "required": ["observations"],
    })
}

/// Regenerates the observation units for one entity within one bank
/// (spec.md §4.7).
pub struct ObservationConsolidator {
    store: Arc<Store>,
    completion: Arc<dyn CompletionClient>,
    config: EngineConfig,
    locks: EntityLocks,
}

impl ObservationConsolidator {
    pub fn new(store: Arc<Store>, completion: Arc<dyn CompletionClient>, config: EngineConfig) -> Self {
        Self {
            store,
            completion,
            config,
            locks: EntityLocks::default(),
        }
    }

    /// Regenerates observations for `entity_id`: gathers source units up to
    /// `max_tokens_per_entity`, synthesizes new observation text via the
    /// completion gateway, deletes prior observations for this entity, and
    /// writes the new ones carrying the same entity links as their source
    /// facts (spec.md §4.7 steps 1-5). Holds this entity's advisory lock for
    /// the whole call so two concurrent refreshes serialize instead of
    /// racing to delete/insert the same observation rows (spec.md §5).
    pub async fn regenerate(&self, bank_id: &str, entity_id: Uuid) -> Result<Vec<Uuid>, EngineError> {
        let lock = self.locks.get(entity_id);
        let _guard = lock.lock().await;
        self.regenerate_locked(bank_id, entity_id).await
    }

    async fn regenerate_locked(&self, bank_id: &str, entity_id: Uuid) -> Result<Vec<Uuid>, EngineError> {
        let entity = self
            .store
            .pool()
            .with_reader({
                let bank_id = bank_id.to_string();
                move |conn| crate::store::entities::get(conn, &bank_id, entity_id)
            })
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("entity {entity_id}")))?;

        let unit_ids = self
            .store
            .pool()
            .with_reader(move |conn| crate::store::entities::unit_ids_for_entity(conn, entity_id))
            .await?;

        let mut source_units = Vec::with_capacity(unit_ids.len());
        for unit_id in &unit_ids {
            let bank_id = bank_id.to_string();
            let unit_id = *unit_id;
            if let Some(unit) = self.store.pool().with_reader(move |conn| crate::store::units::get(conn, &bank_id, unit_id)).await? {
                if unit.fact_type != FactType::Observation {
                    source_units.push(unit);
                }
            }
        }
        source_units.sort_by(|a, b| b.mentioned_at.cmp(&a.mentioned_at));

        // Bound source material fed into one consolidation call by a
        // character-count proxy for tokens (4 chars/token is the same rough
        // heuristic the extractor's output-discipline bound uses).
        let max_chars = self.config.max_tokens_per_entity as usize * 4;
        let mut bounded = Vec::new();
        let mut total_chars = 0usize;
        for unit in source_units {
            if total_chars + unit.text.len() > max_chars && !bounded.is_empty() {
                break;
            }
            total_chars += unit.text.len();
            bounded.push(unit);
        }

        if bounded.is_empty() {
            self.delete_prior(bank_id, entity_id).await?;
            return Ok(Vec::new());
        }

        let observations = match self.synthesize(&entity.canonical_name, &bounded).await {
            Ok(obs) if !obs.is_empty() => obs,
            Ok(_) => vec![RawObservation {
                text: format!("{} has been mentioned {} times; no synthesized summary yet.", entity.canonical_name, bounded.len()),
            }],
            Err(err) => {
                // spec.md §7's "never silently drop content" extended to
                // consolidation: fall back to the most recent raw fact
                // rather than producing nothing.
                tracing::warn!(bank_id, %entity_id, error = %err, "observation synthesis failed, falling back to most recent source fact");
                vec![RawObservation {
                    text: bounded[0].text.clone(),
                }]
            }
        };

        self.delete_prior(bank_id, entity_id).await?;

        let now = Utc::now();
        let window = TemporalRange {
            start: bounded.iter().map(|u| u.occurred.start).min().unwrap_or(now),
            end: bounded.iter().map(|u| u.occurred.end).max().unwrap_or(now),
        };
        let mut metadata = HashMap::new();
        metadata.insert("entity_id".to_string(), Some(entity_id.to_string()));

        let new_units: Vec<MemoryUnit> = observations
            .into_iter()
            .map(|obs| MemoryUnit {
                id: Uuid::new_v4(),
                bank_id: bank_id.to_string(),
                document_id: None,
                text: obs.text,
                fact_type: FactType::Observation,
                context: None,
                embedding: None,
                occurred: window,
                mentioned_at: now,
                metadata: metadata.clone(),
                created_at: now,
            })
            .collect();

        self.store
            .pool()
            .with_writer({
                let units = new_units.clone();
                move |conn| crate::store::units::insert_batch(conn, &units)
            })
            .await?;

        // Copy the entity link set from source facts onto the new
        // observations (spec.md §4.7 step 5 "copy the entity link set").
        let mut links = Vec::new();
        let mut pairs = Vec::new();
        for new_unit in &new_units {
            pairs.push((new_unit.id, entity_id));
            for source in &bounded {
                links.push(MemoryLink::new(new_unit.id, source.id, crate::model::LinkType::Entity, 1.0).with_entity(entity_id));
                links.push(MemoryLink::new(source.id, new_unit.id, crate::model::LinkType::Entity, 1.0).with_entity(entity_id));
            }
        }
        self.store
            .pool()
            .with_writer(move |conn| crate::store::entities::insert_unit_entities(conn, &pairs))
            .await?;
        if !links.is_empty() {
            self.store.pool().with_writer(move |conn| crate::store::links::insert_batch(conn, &links)).await?;
        }

        Ok(new_units.into_iter().map(|u| u.id).collect())
    }

    async fn delete_prior(&self, bank_id: &str, entity_id: Uuid) -> Result<(), EngineError> {
        let bank_id = bank_id.to_string();
        self.store.pool().with_writer(move |conn| crate::store::entities::delete_observations_only(conn, &bank_id, entity_id)).await
    }

    async fn synthesize(&self, canonical_name: &str, units: &[MemoryUnit]) -> Result<Vec<RawObservation>, EngineError> {
        let facts_text = units
            .iter()
            .map(|u| format!("- {}", u.text))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = format!(
            "Synthesize a small number of concise, up-to-date observations about \
             '{canonical_name}' from these facts. Each observation should stand alone \
             and reflect the current state, not a chronological log. Facts:\n{facts_text}"
        );
        let request = CompletionRequest::new("observation", vec![Message::user(prompt)]).with_schema(observation_schema());
        let response = self.completion.complete(&request).await?;
        let texts = response
            .get("observations")
            .and_then(|v| v.as_array())
            .ok_or_else(|| EngineError::Schema("observation response missing observations array".into()))?;
        Ok(texts
            .iter()
            .filter_map(|v| v.as_str())
            .filter(|s| !s.trim().is_empty())
            .map(|s| RawObservation { text: s.to_string() })
            .collect())
    }
}
