//! Link Builder (spec.md §4.4)
//!
//! Given a set of newly written unit IDs within one bank, constructs all
//! edge types in four bulk passes: entity links, temporal links, semantic
//! links, causal links. Every pass issues one bulk fetch query, computes in
//! memory, and writes with one batch insert relying on
//! `ON CONFLICT DO NOTHING`.

use std::collections::HashMap;
use std::sync::Arc;

use uuid::Uuid;

use crate::config::EngineConfig;
use crate::entity::{EntityMention, EntityResolver};
use crate::error::EngineError;
use crate::llm::cosine_similarity;
use crate::model::{LinkType, MemoryLink, MemoryUnit};
use crate::store::Store;

/// One extracted causal relation, referencing another unit in the same
/// retain batch by its index (spec.md §4.4 "Causal links").
#[derive(Debug, Clone)]
pub struct CausalRelation {
    pub source_index: usize,
    pub target_index: usize,
    pub link_type: LinkType,
    pub strength: f32,
}

/// One fact's entity mentions, aligned by index with the written units
/// (spec.md §4.4 "Entity links").
#[derive(Debug, Clone, Default)]
pub struct FactEntities {
    pub mentions: Vec<EntityMention>,
}

pub struct LinkBuilder {
    store: Arc<Store>,
    resolver: Arc<EntityResolver>,
    config: EngineConfig,
}

impl LinkBuilder {
    pub fn new(store: Arc<Store>, resolver: Arc<EntityResolver>, config: EngineConfig) -> Self {
        Self { store, resolver, config }
    }

    /// Runs all four bulk passes over `units` (already persisted, in
    /// extraction order) plus the per-unit entity mentions and causal
    /// relations extracted alongside them. Returns the distinct entity ids
    /// touched by the entity pass, so callers (the retain pipeline) can
    /// decide whether to enqueue an observation refresh (spec.md §4.6 step
    /// 7) without this builder knowing about the task backend.
    pub async fn build_links(
        &self,
        bank_id: &str,
        units: &[MemoryUnit],
        entity_mentions: &[FactEntities],
        causal_relations: &[CausalRelation],
    ) -> Result<Vec<Uuid>, EngineError> {
        if units.is_empty() {
            return Ok(Vec::new());
        }

        let touched_entities = self.build_entity_links(bank_id, units, entity_mentions).await?;
        self.build_temporal_links(bank_id, units).await?;
        self.build_semantic_links(bank_id, units).await?;
        self.build_causal_links(units, causal_relations).await?;
        Ok(touched_entities)
    }

    /// Entity pass: resolves each fact's mentions, writes `unit_entities`,
    /// then for every distinct entity in this batch fetches *all* units
    /// referencing it and emits bidirectional `entity` edges over every
    /// unordered pair, skipping self-links (spec.md §4.4).
    async fn build_entity_links(&self, bank_id: &str, units: &[MemoryUnit], entity_mentions: &[FactEntities]) -> Result<Vec<Uuid>, EngineError> {
        let mut touched_entities: Vec<Uuid> = Vec::new();
        let mut unit_entity_pairs: Vec<(Uuid, Uuid)> = Vec::new();

        for (unit, facts) in units.iter().zip(entity_mentions.iter()) {
            if facts.mentions.is_empty() {
                continue;
            }
            let entity_ids = self.resolver.resolve_batch(bank_id, &facts.mentions).await?;
            for entity_id in entity_ids {
                unit_entity_pairs.push((unit.id, entity_id));
                if !touched_entities.contains(&entity_id) {
                    touched_entities.push(entity_id);
                }
            }
        }

        if unit_entity_pairs.is_empty() {
            return Ok(Vec::new());
        }

        let pairs = unit_entity_pairs.clone();
        self.store
            .pool()
            .with_writer(move |conn| crate::store::entities::insert_unit_entities(conn, &pairs))
            .await?;

        let mut links = Vec::new();
        for entity_id in &touched_entities {
            let entity_id = *entity_id;
            let unit_ids = self
                .store
                .pool()
                .with_reader(move |conn| crate::store::entities::unit_ids_for_entity(conn, entity_id))
                .await?;
            for i in 0..unit_ids.len() {
                for j in (i + 1)..unit_ids.len() {
                    let (a, b) = (unit_ids[i], unit_ids[j]);
                    if a == b {
                        continue;
                    }
                    links.push(MemoryLink::new(a, b, LinkType::Entity, 1.0).with_entity(entity_id));
                    links.push(MemoryLink::new(b, a, LinkType::Entity, 1.0).with_entity(entity_id));
                }
            }
        }

        if !links.is_empty() {
            self.store.pool().with_writer(move |conn| crate::store::links::insert_batch(conn, &links)).await?;
        }
        Ok(touched_entities)
    }

    /// Temporal pass: one query fetches all candidate neighbors in
    /// `[min - W, max + W]`, then per-new-unit in-memory filtering to its
    /// own `±W` window, top 10, weight `max(0.3, 1 - |Δt|/W)` (spec.md
    /// §4.4).
    async fn build_temporal_links(&self, bank_id: &str, units: &[MemoryUnit]) -> Result<(), EngineError> {
        let window = chrono::Duration::milliseconds((self.config.temporal_window_hours * 3_600_000.0) as i64);
        let min_time = units.iter().map(|u| u.occurred.start).min().unwrap() - window;
        let max_time = units.iter().map(|u| u.occurred.start).max().unwrap() + window;

        let filter = crate::store::UnitFilter {
            since: Some(min_time),
            until: Some(max_time),
            ..Default::default()
        };
        let bank_id_owned = bank_id.to_string();
        let candidates = self
            .store
            .pool()
            .with_reader(move |conn| crate::store::units::list_units(conn, &bank_id_owned, &filter, usize::MAX, 0))
            .await?;

        let new_ids: std::collections::HashSet<Uuid> = units.iter().map(|u| u.id).collect();
        let mut links = Vec::new();

        for unit in units {
            let mut neighbors: Vec<(Uuid, f32)> = candidates
                .iter()
                .filter(|c| c.id != unit.id)
                .filter_map(|c| {
                    let delta = (c.occurred.start - unit.occurred.start).num_milliseconds().abs() as f64 / 3_600_000.0;
                    if delta <= self.config.temporal_window_hours {
                        let weight = (1.0 - (delta / self.config.temporal_window_hours) as f32).max(self.config.temporal_min_weight);
                        Some((c.id, weight))
                    } else {
                        None
                    }
                })
                .collect();
            neighbors.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
            neighbors.truncate(self.config.temporal_max_neighbors);

            for (neighbor_id, weight) in neighbors {
                // Avoid writing both directions for a within-batch pair twice.
                if new_ids.contains(&neighbor_id) && neighbor_id < unit.id {
                    continue;
                }
                links.push(MemoryLink::new(unit.id, neighbor_id, LinkType::Temporal, weight));
            }
        }

        if !links.is_empty() {
            self.store.pool().with_writer(move |conn| crate::store::links::insert_batch(conn, &links)).await?;
        }
        Ok(())
    }

    /// Semantic pass: one query fetches all existing embeddings in the
    /// bank, computes cosine similarity in memory, keeps the top-K above
    /// threshold per new unit (spec.md §4.4).
    async fn build_semantic_links(&self, bank_id: &str, units: &[MemoryUnit]) -> Result<(), EngineError> {
        let bank_id_owned = bank_id.to_string();
        let all_embeddings = self
            .store
            .pool()
            .with_reader(move |conn| crate::store::units::fetch_all_embeddings(conn, &bank_id_owned))
            .await?;

        let threshold = self.config.semantic_threshold;
        let top_k = self.config.semantic_top_k;
        let mut links = Vec::new();

        for unit in units {
            let Some(query_embedding) = &unit.embedding else { continue };

            let mut scored: Vec<(Uuid, f32)> = all_embeddings
                .iter()
                .filter(|(id, _)| *id != unit.id)
                .map(|(id, vector)| (*id, cosine_similarity(query_embedding, vector)))
                .filter(|(_, score)| *score >= threshold)
                .collect();
            scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
            scored.truncate(top_k);

            for (neighbor_id, score) in scored {
                links.push(MemoryLink::new(unit.id, neighbor_id, LinkType::Semantic, score));
            }
        }

        if !links.is_empty() {
            self.store.pool().with_writer(move |conn| crate::store::links::insert_batch(conn, &links)).await?;
        }
        Ok(())
    }

    /// Causal pass: consumes the extractor's `causal_relations`, each
    /// referencing another unit in the same batch by index; invalid
    /// indices are logged and skipped, self-links skipped (spec.md §4.4).
    async fn build_causal_links(&self, units: &[MemoryUnit], causal_relations: &[CausalRelation]) -> Result<(), EngineError> {
        if causal_relations.is_empty() {
            return Ok(());
        }

        let mut links = Vec::new();
        for relation in causal_relations {
            if relation.source_index >= units.len() || relation.target_index >= units.len() {
                tracing::warn!(
                    source = relation.source_index,
                    target = relation.target_index,
                    batch_len = units.len(),
                    "causal relation references out-of-range unit index, skipping"
                );
                continue;
            }
            if relation.source_index == relation.target_index {
                continue;
            }
            links.push(MemoryLink::new(
                units[relation.source_index].id,
                units[relation.target_index].id,
                relation.link_type,
                relation.strength,
            ));
        }

        if !links.is_empty() {
            self.store.pool().with_writer(move |conn| crate::store::links::insert_batch(conn, &links)).await?;
        }
        Ok(())
    }
}

/// Utility used by the Retrieval Planner's graph expansion to bucket
/// traversed neighbor weights by hop for the decay calculation (spec.md
/// §4.8). Kept here since it operates on the same `memory_links` shape the
/// builder writes.
pub fn accumulate_weight(seed_weight: f32, edge_weights: &[f32], decay: f32, hop: u32) -> f32 {
    let edge_product: f32 = edge_weights.iter().product();
    seed_weight * edge_product * decay.powi(hop as i32)
}

pub type EntityMentionsByFact = HashMap<usize, FactEntities>;
