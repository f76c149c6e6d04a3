//! Retrieval Planner (spec.md §4.8)
//!
//! Backs `recall`: generates seeds from three independent sources (semantic,
//! lexical, entity), expands the seed set over the link graph with
//! budget-tiered depth/fanout and per-hop decay, fuses every candidate's
//! score, deprioritizes (never excludes) stale facts, and greedily assembles
//! a token-budgeted result list.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::llm::Embedder;
use crate::model::unit::Budget;
use crate::model::{FactType, LinkType, MemoryUnit};
use crate::store::Store;

/// One `recall` call's request (spec.md §6 "recall").
#[derive(Debug, Clone)]
pub struct RecallRequest {
    pub bank_id: String,
    pub query: String,
    pub types: Option<Vec<FactType>>,
    pub budget: Budget,
    pub max_tokens: u32,
    pub trace: bool,
    pub filters: Option<crate::store::UnitFilter>,
    pub query_timestamp: Option<DateTime<Utc>>,
    pub include_entities: bool,
}

impl RecallRequest {
    pub fn new(bank_id: impl Into<String>, query: impl Into<String>, budget: Budget, max_tokens: u32) -> Self {
        Self {
            bank_id: bank_id.into(),
            query: query.into(),
            types: None,
            budget,
            max_tokens,
            trace: false,
            filters: None,
            query_timestamp: None,
            include_entities: false,
        }
    }
}

/// One assembled result: the unit plus its final fused score.
#[derive(Debug, Clone)]
pub struct ScoredUnit {
    pub unit: MemoryUnit,
    pub score: f32,
}

/// One entity sidebar entry (spec.md §4.8 "optional entity sidebar").
#[derive(Debug, Clone)]
pub struct EntitySidebarEntry {
    pub entity_id: Uuid,
    pub canonical_name: String,
    pub observations: Vec<MemoryUnit>,
}

/// Which of the three candidate sources surfaced a unit, for trace output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SeedSource {
    Semantic,
    Lexical,
    Entity,
}

/// Diagnostic record of how recall arrived at its result set (spec.md §4.8
/// "optional trace": seed provenance, edges traversed, per-method result
/// sets, final scores).
#[derive(Debug, Clone, Default)]
pub struct RecallTrace {
    pub seeds: Vec<(Uuid, SeedSource)>,
    pub edges_traversed: Vec<(Uuid, Uuid, LinkType, f32)>,
    pub per_method_results: HashMap<&'static str, Vec<Uuid>>,
    pub final_scores: Vec<(Uuid, f32)>,
}

#[derive(Debug, Clone)]
pub struct RecallResult {
    pub results: Vec<ScoredUnit>,
    pub entities: Option<Vec<EntitySidebarEntry>>,
    pub trace: Option<RecallTrace>,
}

/// Per-candidate score components, accumulated across the three seed
/// sources and the graph expansion pass before fusion (spec.md §4.8
/// "Scoring").
#[derive(Debug, Clone, Default)]
struct Candidate {
    unit: Option<MemoryUnit>,
    semantic: f32,
    lexical: f32,
    graph: f32,
}

const ALL_LINK_TYPES: [LinkType; 7] = [
    LinkType::Temporal,
    LinkType::Semantic,
    LinkType::Entity,
    LinkType::Causes,
    LinkType::CausedBy,
    LinkType::Enables,
    LinkType::Prevents,
];

/// Plans and executes one `recall` call within one bank (spec.md §4.8).
pub struct RetrievalPlanner {
    store: Arc<Store>,
    embedder: Arc<dyn Embedder>,
    config: EngineConfig,
}

impl RetrievalPlanner {
    pub fn new(store: Arc<Store>, embedder: Arc<dyn Embedder>, config: EngineConfig) -> Self {
        Self { store, embedder, config }
    }

    pub async fn recall(&self, request: RecallRequest) -> Result<RecallResult, EngineError> {
        let profile = self.config.budget_profile(request.budget);
        let query_timestamp = request.query_timestamp.unwrap_or_else(Utc::now);
        let mut trace = request.trace.then(RecallTrace::default);

        let mut pool: HashMap<Uuid, Candidate> = HashMap::new();

        // ---- seed source 1: semantic ---------------------------------------
        let query_embedding = self.embedder.embed(&[request.query.clone()]).await?.into_iter().next().unwrap_or_default();
        let bank_id = request.bank_id.clone();
        let fact_types = request.types.clone();
        let semantic_seeds = {
            let query_embedding = query_embedding.clone();
            let bank_id = bank_id.clone();
            self.store
                .pool()
                .with_reader(move |conn| crate::store::units::vector_search(conn, &bank_id, &query_embedding, fact_types.as_deref(), profile.seeds_per_source))
                .await?
        };
        if let Some(t) = &mut trace {
            t.per_method_results.insert("semantic", semantic_seeds.iter().map(|(u, _)| u.id).collect());
        }
        for (unit, score) in &semantic_seeds {
            let entry = pool.entry(unit.id).or_default();
            entry.unit = Some(unit.clone());
            entry.semantic = entry.semantic.max(*score);
            if let Some(t) = &mut trace {
                t.seeds.push((unit.id, SeedSource::Semantic));
            }
        }

        // ---- seed source 2: lexical -----------------------------------------
        let lexical_seeds = {
            let bank_id = bank_id.clone();
            let query = request.query.clone();
            self.store
                .pool()
                .with_reader(move |conn| crate::store::units::fulltext_search(conn, &bank_id, &query, profile.seeds_per_source))
                .await?
        };
        if let Some(t) = &mut trace {
            t.per_method_results.insert("lexical", lexical_seeds.iter().map(|(u, _)| u.id).collect());
        }
        for (unit, score) in &lexical_seeds {
            let entry = pool.entry(unit.id).or_default();
            entry.unit = Some(unit.clone());
            entry.lexical = entry.lexical.max(*score);
            if let Some(t) = &mut trace {
                t.seeds.push((unit.id, SeedSource::Lexical));
            }
        }

        // ---- seed source 3: entity ------------------------------------------
        let mentioned_entities = {
            let bank_id = bank_id.clone();
            let query = request.query.clone();
            self.store
                .pool()
                .with_reader(move |conn| crate::store::entities::find_mentioned_in_text(conn, &bank_id, &query))
                .await?
        };
        let mut entity_seed_ids = Vec::new();
        for entity in &mentioned_entities {
            let bank_id = bank_id.clone();
            let entity_id = entity.id;
            let units = self
                .store
                .pool()
                .with_reader(move |conn| crate::store::units::units_for_entity(conn, &bank_id, entity_id, profile.seeds_per_source))
                .await?;
            for unit in units {
                entity_seed_ids.push(unit.id);
                let entry = pool.entry(unit.id).or_default();
                entry.unit = Some(unit);
            }
        }
        if let Some(t) = &mut trace {
            t.per_method_results.insert("entity", entity_seed_ids.clone());
            for id in &entity_seed_ids {
                t.seeds.push((*id, SeedSource::Entity));
            }
        }

        // ---- graph expansion -------------------------------------------------
        // w ← w_seed · Π edge_weight · decay^hop (spec.md §4.8). `w_seed` is
        // fixed at 1.0: every seed is an equally valid expansion origin
        // regardless of which source surfaced it or its fused score.
        if profile.graph_depth > 0 && !pool.is_empty() {
            let mut frontier: Vec<(Uuid, f32)> = pool.keys().map(|id| (*id, 1.0)).collect();
            let mut visited: HashSet<Uuid> = pool.keys().copied().collect();

            for hop in 1..=profile.graph_depth {
                let frontier_ids: Vec<Uuid> = frontier.iter().map(|(id, _)| *id).collect();
                let edges = {
                    let ids = frontier_ids.clone();
                    self.store
                        .pool()
                        .with_reader(move |conn| crate::store::links::neighbors(conn, &ids, &ALL_LINK_TYPES, profile.fanout_per_step))
                        .await?
                };
                let cumulative: HashMap<Uuid, f32> = frontier.iter().copied().collect();

                let mut next_frontier: Vec<(Uuid, f32)> = Vec::new();
                for (from, to, edge_weight) in &edges {
                    let Some(prior) = cumulative.get(from).copied() else { continue };
                    let new_cumulative = prior * edge_weight;
                    let graph_weight = crate::links::accumulate_weight(1.0, &[new_cumulative], self.config.graph_decay, hop as u32);

                    if let Some(t) = &mut trace {
                        t.edges_traversed.push((*from, *to, LinkType::Entity, *edge_weight));
                    }

                    let entry = pool.entry(*to).or_default();
                    entry.graph = entry.graph.max(graph_weight);
                    if visited.insert(*to) {
                        next_frontier.push((*to, new_cumulative));
                    }
                }
                frontier = next_frontier;
                if frontier.is_empty() {
                    break;
                }
            }
        }

        // Fetch full units for anything graph expansion reached that wasn't
        // already a seed.
        let missing_ids: Vec<Uuid> = pool.iter().filter(|(_, c)| c.unit.is_none()).map(|(id, _)| *id).collect();
        for id in missing_ids {
            let bank_id = bank_id.clone();
            if let Some(unit) = self.store.pool().with_reader(move |conn| crate::store::units::get(conn, &bank_id, id)).await? {
                if let Some(entry) = pool.get_mut(&id) {
                    entry.unit = Some(unit);
                }
            }
        }

        // ---- fuse, deprioritize stale, assemble within the token budget -----
        let weights = self.config.fusion_weights;
        let horizon = chrono::Duration::milliseconds((self.config.temporal_filter_horizon_hours * 3_600_000.0) as i64);
        let half_life = self.config.recency_half_life_hours.max(1.0);

        let mut scored: Vec<(MemoryUnit, f32)> = Vec::new();
        for (_, candidate) in pool {
            let Some(unit) = candidate.unit else { continue };
            match &request.types {
                Some(types) => {
                    if !types.contains(&unit.fact_type) {
                        continue;
                    }
                }
                // Observations are consolidator-written summaries, not raw
                // facts: recall surfaces them only via the entity sidebar
                // unless a caller explicitly asks for `FactType::Observation`
                // (spec.md §3 "excluded from recall unless explicitly
                // requested").
                None if unit.fact_type == FactType::Observation => continue,
                None => {}
            }
            if let Some(filters) = &request.filters {
                if let Some(document_id) = &filters.document_id {
                    if unit.document_id.as_deref() != Some(document_id.as_str()) {
                        continue;
                    }
                }
            }

            let hours_since = (query_timestamp - unit.mentioned_at).num_milliseconds() as f64 / 3_600_000.0;
            let recency = (-std::f64::consts::LN_2 * hours_since.max(0.0) / half_life).exp() as f32;

            let mut score = weights.semantic * candidate.semantic
                + weights.lexical * candidate.lexical
                + weights.graph * candidate.graph
                + weights.recency * recency;

            // Temporal deprioritization: stale facts are downweighted, never
            // excluded (spec.md §4.8 "multiplied by 0.5", §7 "never silently
            // drop").
            if unit.occurred.end < query_timestamp - horizon {
                score *= self.config.temporal_deprioritize_factor;
            }

            scored.push((unit, score));
        }

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.0.mentioned_at.cmp(&a.0.mentioned_at))
                .then_with(|| b.0.id.cmp(&a.0.id))
        });

        if let Some(t) = &mut trace {
            t.final_scores = scored.iter().map(|(u, s)| (u.id, *s)).collect();
        }

        // Greedy token-budgeted assembly: a 4-chars/token estimate, the same
        // heuristic the extractor's output-discipline bound uses, walking
        // candidates in fused-score order and keeping whatever still fits
        // (spec.md §4.8 "Budget assembly").
        let mut results = Vec::new();
        let mut tokens_used: u32 = 0;
        for (unit, score) in scored {
            let estimate = ((unit.text.len() + unit.context.as_deref().map(str::len).unwrap_or(0)) / 4).max(1) as u32;
            if tokens_used + estimate > request.max_tokens {
                continue;
            }
            tokens_used += estimate;
            results.push(ScoredUnit { unit, score });
        }

        // ---- optional entity sidebar -----------------------------------------
        let entities = if request.include_entities {
            let mut sidebar = Vec::with_capacity(mentioned_entities.len());
            for entity in &mentioned_entities {
                let bank_id = bank_id.clone();
                let entity_id = entity.id;
                let observations = self
                    .store
                    .pool()
                    .with_reader(move |conn| {
                        crate::store::units::list_units(
                            conn,
                            &bank_id,
                            &crate::store::UnitFilter {
                                fact_types: Some(vec![FactType::Observation]),
                                ..Default::default()
                            },
                            usize::MAX,
                            0,
                        )
                    })
                    .await?
                    .into_iter()
                    .filter(|u| u.metadata.get("entity_id").and_then(|v| v.as_deref()) == Some(entity_id.to_string().as_str()))
                    .collect::<Vec<_>>();

                let bounded = bound_by_tokens(observations, self.config.max_entity_tokens);
                sidebar.push(EntitySidebarEntry {
                    entity_id: entity.id,
                    canonical_name: entity.canonical_name.clone(),
                    observations: bounded,
                });
            }
            Some(sidebar)
        } else {
            None
        };

        Ok(RecallResult { results, entities, trace })
    }
}

/// Caps a unit list by a 4-chars/token estimate, always keeping at least one
/// (spec.md §4.8 `max_entity_tokens`).
fn bound_by_tokens(units: Vec<MemoryUnit>, max_tokens: u32) -> Vec<MemoryUnit> {
    let max_chars = max_tokens as usize * 4;
    let mut total = 0usize;
    let mut out = Vec::new();
    for unit in units {
        if total + unit.text.len() > max_chars && !out.is_empty() {
            break;
        }
        total += unit.text.len();
        out.push(unit);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TemporalRange;
    use std::collections::HashMap as Map;

    struct StubEmbedder;

    #[async_trait::async_trait]
    impl Embedder for StubEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EngineError> {
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }
        fn dimensions(&self) -> usize {
            2
        }
        fn model_name(&self) -> &str {
            "stub"
        }
    }

    fn make_unit(bank_id: &str, text: &str, embedding: Vec<f32>, at: DateTime<Utc>) -> MemoryUnit {
        MemoryUnit {
            id: Uuid::new_v4(),
            bank_id: bank_id.to_string(),
            document_id: None,
            text: text.to_string(),
            fact_type: FactType::World,
            context: None,
            embedding: Some(embedding),
            occurred: TemporalRange::point(at),
            mentioned_at: at,
            metadata: Map::new(),
            created_at: at,
        }
    }

    fn planner(store: Arc<Store>) -> RetrievalPlanner {
        RetrievalPlanner::new(store, Arc::new(StubEmbedder), EngineConfig::default())
    }

    #[tokio::test]
    async fn recall_against_empty_bank_returns_no_results() {
        let store = Arc::new(Store::open(None, crate::error::RetryPolicy::default()).unwrap());
        store.get_or_create_bank("b1").await.unwrap();
        let planner = planner(store);
        let result = planner
            .recall(RecallRequest::new("b1", "anything", Budget::Mid, 2000))
            .await
            .unwrap();
        assert!(result.results.is_empty());
    }

    #[tokio::test]
    async fn recall_finds_semantically_close_unit() {
        let store = Arc::new(Store::open(None, crate::error::RetryPolicy::default()).unwrap());
        store.get_or_create_bank("b1").await.unwrap();
        let now = Utc::now();
        let close = make_unit("b1", "Alice works at Google", vec![1.0, 0.0], now);
        let far = make_unit("b1", "unrelated fact about weather", vec![0.0, 1.0], now);
        store
            .pool()
            .with_writer({
                let units = vec![close.clone(), far.clone()];
                move |conn| crate::store::units::insert_batch(conn, &units)
            })
            .await
            .unwrap();

        let planner = planner(store);
        let result = planner.recall(RecallRequest::new("b1", "Alice", Budget::Low, 2000)).await.unwrap();
        assert!(result.results.iter().any(|r| r.unit.id == close.id));
        assert!(result.results[0].score >= result.results.last().unwrap().score);
    }

    #[tokio::test]
    async fn recall_never_exceeds_max_tokens() {
        let store = Arc::new(Store::open(None, crate::error::RetryPolicy::default()).unwrap());
        store.get_or_create_bank("b1").await.unwrap();
        let now = Utc::now();
        let units: Vec<MemoryUnit> = (0..20)
            .map(|i| make_unit("b1", &format!("fact number {i} about something"), vec![1.0, 0.0], now))
            .collect();
        store.pool().with_writer(move |conn| crate::store::units::insert_batch(conn, &units)).await.unwrap();

        let planner = planner(store);
        let max_tokens = 20;
        let result = planner.recall(RecallRequest::new("b1", "fact", Budget::High, max_tokens)).await.unwrap();
        let total: u32 = result.results.iter().map(|r| (r.unit.text.len() / 4).max(1) as u32).sum();
        assert!(total <= max_tokens);
    }

    #[tokio::test]
    async fn default_recall_excludes_observation_units() {
        let store = Arc::new(Store::open(None, crate::error::RetryPolicy::default()).unwrap());
        store.get_or_create_bank("b1").await.unwrap();
        let now = Utc::now();
        let mut observation = make_unit("b1", "Alice is a software engineer", vec![1.0, 0.0], now);
        observation.fact_type = FactType::Observation;
        let fact = make_unit("b1", "Alice works at Google", vec![1.0, 0.0], now);
        store
            .pool()
            .with_writer({
                let units = vec![observation.clone(), fact.clone()];
                move |conn| crate::store::units::insert_batch(conn, &units)
            })
            .await
            .unwrap();

        let planner = planner(store);
        let result = planner.recall(RecallRequest::new("b1", "Alice", Budget::Low, 2000)).await.unwrap();
        assert!(result.results.iter().all(|r| r.unit.id != observation.id));
        assert!(result.results.iter().any(|r| r.unit.id == fact.id));

        let mut explicit = RecallRequest::new("b1", "Alice", Budget::Low, 2000);
        explicit.types = Some(vec![FactType::Observation]);
        let with_observations = planner.recall(explicit).await.unwrap();
        assert!(with_observations.results.iter().any(|r| r.unit.id == observation.id));
    }

    #[tokio::test]
    async fn budget_tiers_increase_seed_pool_size() {
        let store = Arc::new(Store::open(None, crate::error::RetryPolicy::default()).unwrap());
        store.get_or_create_bank("b1").await.unwrap();
        let now = Utc::now();
        let units: Vec<MemoryUnit> = (0..30)
            .map(|i| make_unit("b1", &format!("fact number {i}"), vec![1.0, 0.0], now - chrono::Duration::minutes(i)))
            .collect();
        store.pool().with_writer(move |conn| crate::store::units::insert_batch(conn, &units)).await.unwrap();

        let planner = planner(store);
        let low = planner.recall(RecallRequest::new("b1", "fact", Budget::Low, 100_000)).await.unwrap();
        let high = planner.recall(RecallRequest::new("b1", "fact", Budget::High, 100_000)).await.unwrap();
        assert!(high.results.len() >= low.results.len());
    }
}
