//! Retain Pipeline (spec.md §4.6)
//!
//! Turns raw text items into persisted, linked [`MemoryUnit`]s: extract,
//! dedup, embed, write, link — one bank at a time, one document's worth of
//! items per call.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::entity::EntityMention;
use crate::error::EngineError;
use crate::extract::{ExtractionInput, FactExtractor};
use crate::links::{CausalRelation, FactEntities, LinkBuilder};
use crate::llm::{cosine_similarity, Embedder};
use crate::model::{FactType, MemoryUnit, TemporalRange};
use crate::store::Store;

/// One raw item to retain: the text plus optional timestamp/context/metadata
/// (spec.md §4.6 "Input").
#[derive(Debug, Clone)]
pub struct RetainItem {
    pub content: String,
    pub timestamp: Option<chrono::DateTime<Utc>>,
    pub context: Option<String>,
    pub metadata: HashMap<String, Option<String>>,
}

impl RetainItem {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            timestamp: None,
            context: None,
            metadata: HashMap::new(),
        }
    }
}

/// One `retain` call's request (spec.md §6 "retain").
#[derive(Debug, Clone)]
pub struct RetainRequest {
    pub bank_id: String,
    pub items: Vec<RetainItem>,
    pub document_id: Option<String>,
}

/// Result of a `retain` call (spec.md §6): `operation_id` is set only for
/// the async entry point.
#[derive(Debug, Clone)]
pub struct RetainOutcome {
    pub operation_id: Option<Uuid>,
    pub items_count: usize,
}

/// Orchestrates fact extraction, dedup, embedding, persistence, and link
/// building for one `retain` call (spec.md §4.6).
pub struct RetainPipeline {
    store: Arc<Store>,
    extractor: FactExtractor,
    embedder: Arc<dyn Embedder>,
    link_builder: Arc<LinkBuilder>,
    config: EngineConfig,
}

/// One candidate fact awaiting dedup, tracking where it came from so
/// surviving causal relations can be remapped (spec.md §4.6 step 5: "causal
/// indices depend on [extraction] order").
struct Candidate {
    text: String,
    fact_type: FactType,
    occurred: TemporalRange,
    entity_surface_forms: Vec<String>,
    metadata: HashMap<String, Option<String>>,
    item_index: usize,
    local_index: usize,
}

impl RetainPipeline {
    pub fn new(
        store: Arc<Store>,
        extractor: FactExtractor,
        embedder: Arc<dyn Embedder>,
        link_builder: Arc<LinkBuilder>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            extractor,
            embedder,
            link_builder,
            config,
        }
    }

    /// Runs the full pipeline synchronously. Returns the set of entity ids
    /// touched by this batch's links, so the caller can decide whether to
    /// enqueue an observation refresh (spec.md §4.6 step 7) — the pipeline
    /// itself never talks to the task backend, avoiding a back-reference
    /// from retain to the consolidator (spec.md §9 `Deps` note).
    pub async fn execute(&self, request: RetainRequest, operation_id: Option<Uuid>) -> Result<(RetainOutcome, Vec<Uuid>), EngineError> {
        let items_count = request.items.len();
        if request.items.is_empty() {
            return Ok((
                RetainOutcome {
                    operation_id,
                    items_count: 0,
                },
                Vec::new(),
            ));
        }

        let bank = self.store.get_or_create_bank(&request.bank_id).await?;

        if let Some(document_id) = &request.document_id {
            self.store.delete_document_units(&request.bank_id, document_id).await?;
            let full_text = request
                .items
                .iter()
                .map(|item| item.content.as_str())
                .collect::<Vec<_>>()
                .join("\n\n");
            self.store
                .upsert_document(crate::model::Document::new(request.bank_id.clone(), document_id.clone(), full_text))
                .await?;
        }

        // Extraction: one call per item, in order. Each call's causal
        // relations reference facts local to that call (spec.md §4.5).
        let mut per_item_facts = Vec::with_capacity(request.items.len());
        let mut per_item_causal = Vec::with_capacity(request.items.len());
        for item in &request.items {
            let event_date = item.timestamp.unwrap_or_else(Utc::now);
            let input = ExtractionInput {
                text: item.content.clone(),
                context: item.context.clone(),
                event_date,
                agent_name: bank.name.clone(),
                hints: None,
            };
            let result = self.extractor.extract(&input).await?;
            per_item_facts.push(result.facts);
            per_item_causal.push(result.causal_relations);
        }

        // Flatten into dedup candidates, remembering provenance for the
        // causal-index remap below.
        let mut candidates = Vec::new();
        for (item_index, item) in request.items.iter().enumerate() {
            for (local_index, fact) in per_item_facts[item_index].iter().enumerate() {
                candidates.push(Candidate {
                    text: fact.text.clone(),
                    fact_type: fact.fact_type,
                    occurred: fact.occurred,
                    entity_surface_forms: fact.entity_surface_forms.clone(),
                    metadata: item.metadata.clone(),
                    item_index,
                    local_index,
                });
            }
        }

        if candidates.is_empty() {
            if let Some(document_id) = &request.document_id {
                self.store.set_document_unit_count(&request.bank_id, document_id, 0).await?;
            }
            return Ok((
                RetainOutcome {
                    operation_id,
                    items_count,
                },
                Vec::new(),
            ));
        }

        // Embed all candidates in one batched call, then dedup against both
        // the bank's existing units and survivors accepted earlier in this
        // same batch (spec.md §4.6 steps 3-4).
        let texts: Vec<String> = candidates.iter().map(|c| c.text.clone()).collect();
        let embeddings = self.embedder.embed(&texts).await?;

        let bank_id_owned = request.bank_id.clone();
        let existing = self
            .store
            .pool()
            .with_reader(move |conn| crate::store::units::fetch_all_embeddings(conn, &bank_id_owned))
            .await?;
        let existing_units = {
            let bank_id_owned = request.bank_id.clone();
            self.store
                .pool()
                .with_reader(move |conn| {
                    crate::store::units::list_units(conn, &bank_id_owned, &crate::store::UnitFilter::default(), usize::MAX, 0)
                })
                .await?
        };
        let existing_index: HashMap<Uuid, &MemoryUnit> = existing_units.iter().map(|u| (u.id, u)).collect();
        let existing_embeddings: HashMap<Uuid, &[f32]> = existing
            .iter()
            .filter_map(|(id, v)| existing_index.get(id).map(|_| (*id, v.as_slice())))
            .collect();

        // `None` = dropped by dedup, `Some(survivor_index)` = maps onto
        // `survivors`/`units` below.
        let mut index_map: Vec<Option<usize>> = Vec::with_capacity(candidates.len());
        let mut survivors: Vec<MemoryUnit> = Vec::new();
        let mut survivor_embeddings: Vec<&[f32]> = Vec::new();
        let mut survivor_entity_forms: Vec<Vec<String>> = Vec::new();

        for (candidate, embedding) in candidates.iter().zip(embeddings.iter()) {
            let best_existing = existing_units
                .iter()
                .filter(|u| u.fact_type == candidate.fact_type && u.occurred.overlaps(&candidate.occurred))
                .filter_map(|u| existing_embeddings.get(&u.id).map(|v| (u, cosine_similarity(embedding, v))))
                .filter(|(_, score)| *score >= self.config.dedup_threshold)
                .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

            let best_in_batch = survivors
                .iter()
                .zip(survivor_embeddings.iter())
                .enumerate()
                .filter(|(_, (u, _))| u.fact_type == candidate.fact_type && u.occurred.overlaps(&candidate.occurred))
                .map(|(i, (_, v))| (i, cosine_similarity(embedding, v)))
                .filter(|(_, score)| *score >= self.config.dedup_threshold)
                .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

            match (best_existing, best_in_batch) {
                (Some((existing_unit, _)), _) => {
                    tracing::debug!(unit_id = %existing_unit.id, "dropping duplicate fact, merging metadata onto existing unit");
                    if !candidate.metadata.is_empty() {
                        self.merge_metadata(&request.bank_id, existing_unit.id, &candidate.metadata).await?;
                    }
                    index_map.push(None);
                }
                (None, Some((survivor_index, _))) => {
                    for (key, value) in &candidate.metadata {
                        survivors[survivor_index].metadata.entry(key.clone()).or_insert_with(|| value.clone());
                    }
                    index_map.push(None);
                }
                (None, None) => {
                    let now = Utc::now();
                    let unit = MemoryUnit {
                        id: Uuid::new_v4(),
                        bank_id: request.bank_id.clone(),
                        document_id: request.document_id.clone(),
                        text: candidate.text.clone(),
                        fact_type: candidate.fact_type,
                        context: request.items[candidate.item_index].context.clone(),
                        embedding: Some(embedding.clone()),
                        occurred: candidate.occurred,
                        mentioned_at: now,
                        metadata: candidate.metadata.clone(),
                        created_at: now,
                    };
                    index_map.push(Some(survivors.len()));
                    survivors.push(unit);
                    survivor_embeddings.push(embedding.as_slice());
                    survivor_entity_forms.push(candidate.entity_surface_forms.clone());
                }
            }
        }

        if survivors.is_empty() {
            if let Some(document_id) = &request.document_id {
                self.store.set_document_unit_count(&request.bank_id, document_id, 0).await?;
            }
            return Ok((
                RetainOutcome {
                    operation_id,
                    items_count,
                },
                Vec::new(),
            ));
        }

        self.store
            .pool()
            .with_writer({
                let units = survivors.clone();
                move |conn| crate::store::units::insert_batch(conn, &units)
            })
            .await?;

        if request.document_id.is_some() {
            self.store
                .set_document_unit_count(&request.bank_id, request.document_id.as_deref().unwrap(), survivors.len())
                .await?;
        }

        let entity_mentions: Vec<FactEntities> = survivor_entity_forms
            .iter()
            .zip(survivors.iter())
            .map(|(forms, unit)| FactEntities {
                mentions: forms
                    .iter()
                    .map(|form| EntityMention {
                        surface_form: form.clone(),
                        entity_type_hint: None,
                        occurred_at: unit.occurred.start,
                    })
                    .collect(),
            })
            .collect();

        // Remap each item's causal relations (indexed into that item's raw
        // fact list) onto survivor positions, skipping relations whose
        // endpoint was deduped away (spec.md §4.4 "invalid indices are
        // logged and skipped" extended to cover dedup-dropped facts).
        let mut offsets = vec![0usize; request.items.len()];
        {
            let mut running = 0usize;
            for (item_index, facts) in per_item_facts.iter().enumerate() {
                offsets[item_index] = running;
                running += facts.len();
            }
        }

        let mut causal_relations: Vec<CausalRelation> = Vec::new();
        for (item_index, relations) in per_item_causal.iter().enumerate() {
            for relation in relations {
                let source_flat = offsets[item_index] + relation.source_index;
                let target_flat = offsets[item_index] + relation.target_index;
                let (Some(source_survivor), Some(target_survivor)) = (
                    index_map.get(source_flat).copied().flatten(),
                    index_map.get(target_flat).copied().flatten(),
                ) else {
                    tracing::warn!(
                        item_index,
                        source = relation.source_index,
                        target = relation.target_index,
                        "causal relation references a deduped or out-of-range fact, skipping"
                    );
                    continue;
                };
                causal_relations.push(CausalRelation {
                    source_index: source_survivor,
                    target_index: target_survivor,
                    link_type: relation.link_type,
                    strength: relation.strength,
                });
            }
        }

        let touched_entities = self
            .link_builder
            .build_links(&request.bank_id, &survivors, &entity_mentions, &causal_relations)
            .await?;

        Ok((
            RetainOutcome {
                operation_id,
                items_count,
            },
            touched_entities,
        ))
    }

    async fn merge_metadata(&self, bank_id: &str, unit_id: Uuid, metadata: &HashMap<String, Option<String>>) -> Result<(), EngineError> {
        let bank_id = bank_id.to_string();
        let metadata = metadata.clone();
        self.store
            .pool()
            .with_writer(move |conn| crate::store::units::merge_metadata(conn, &bank_id, unit_id, &metadata))
            .await
    }
}
