//! Engine configuration
//!
//! A single struct collects every named knob the spec calls out instead of
//! burying magic numbers in the components that use them (§6 "Configuration").
//! Defaults match the spec's stated defaults; every field can be overridden
//! independently via an env-var-over-default convention, matching how the
//! embedding cache path and consolidation interval are made overridable
//! elsewhere in this crate.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::model::unit::Budget;

/// Per-budget recall shape: how many seeds per source, how many graph hops,
/// and how many neighbors to fan out to per hop. Defaults match spec.md §4.8's
/// table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BudgetProfile {
    pub seeds_per_source: usize,
    pub graph_depth: usize,
    pub fanout_per_step: usize,
}

/// Routing entry for one LLM completion scope: which model to call and the
/// token ceiling to apply (scopes in use: `"bank_background"`, `"memory"`).
#[derive(Debug, Clone)]
pub struct LlmRoute {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for LlmRoute {
    fn default() -> Self {
        Self {
            model: "default".to_string(),
            max_tokens: 2048,
            temperature: 0.3,
        }
    }
}

/// Engine-wide configuration. Constructed via [`EngineConfig::default`] and
/// overridden field-by-field, or via [`EngineConfig::from_env`] for the CLI
/// harness.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Path to the SQLite database file. `None` resolves to the platform
    /// default data directory via `directories::ProjectDirs`.
    pub db_path: Option<PathBuf>,

    /// Embedding model name, passed through to the `Embedder` implementation.
    pub embedder_model: String,
    /// Fixed embedding dimension `D` the store's vector column is sized for.
    pub embedding_dimensions: usize,

    /// Scope -> route table for the completion gateway.
    pub llm_routes: HashMap<String, LlmRoute>,

    /// Temporal link window `W`, default 24h (spec.md §3, §4.4).
    pub temporal_window_hours: f64,
    /// Cap on temporal neighbors kept per unit (spec.md §4.4: "up to 10").
    pub temporal_max_neighbors: usize,
    /// Floor on temporal link weight (spec.md §4.4: `max(0.3, 1 - |Δt|/W)`).
    pub temporal_min_weight: f32,

    /// Semantic link threshold, default 0.7 (spec.md §3).
    pub semantic_threshold: f32,
    /// Semantic link fan-out per unit, default K=5 (spec.md §3).
    pub semantic_top_k: usize,

    /// Dedup cosine threshold, default 0.95 (spec.md §4.6).
    pub dedup_threshold: f32,

    /// Recall budget table, keyed by [`Budget`].
    pub budget_table: HashMap<Budget, BudgetProfile>,
    /// Graph-expansion weight decay per hop, default 0.7 (spec.md §4.8).
    pub graph_decay: f32,
    /// Temporal-filter deprioritization multiplier (spec.md §4.8: "multiplied
    /// by 0.5").
    pub temporal_deprioritize_factor: f32,
    /// Horizon used by the temporal filter's `occurred_end < query_timestamp
    /// - horizon` test.
    pub temporal_filter_horizon_hours: f64,

    /// Fusion weights `(α sim, β lexical, γ graph, δ recency)` from spec.md
    /// §4.8's scoring formula.
    pub fusion_weights: FusionWeights,
    /// Half-life, in hours, of the recency term's exponential decay (spec.md
    /// §4.8 mentions a recency component but leaves its curve unspecified;
    /// one week is the chosen staleness window, see SPEC_FULL.md §4.8).
    pub recency_half_life_hours: f64,

    /// Whether the retain pipeline enqueues observation refreshes (spec.md
    /// §4.7's "optionally on a post-consolidation trigger").
    pub observation_consolidation_enabled: bool,
    /// Token budget per entity fed into one consolidation call (see
    /// SPEC_FULL.md §3).
    pub max_tokens_per_entity: u32,
    /// Token budget for the recall entity sidebar (spec.md §4.8
    /// `max_entity_tokens`).
    pub max_entity_tokens: u32,

    /// Concurrent task backend batch size / interval (spec.md §4.9).
    pub task_batch_size: usize,
    pub task_batch_interval_ms: u64,

    /// Retry policy shared by store acquisition, embedding, and completion
    /// calls.
    pub retry: crate::error::RetryPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FusionWeights {
    pub semantic: f32,
    pub lexical: f32,
    pub graph: f32,
    pub recency: f32,
}

impl Default for FusionWeights {
    fn default() -> Self {
        Self {
            semantic: 0.45,
            lexical: 0.25,
            graph: 0.2,
            recency: 0.1,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        let mut llm_routes = HashMap::new();
        llm_routes.insert("memory".to_string(), LlmRoute::default());
        llm_routes.insert(
            "bank_background".to_string(),
            LlmRoute {
                max_tokens: 8192,
                temperature: 0.3,
                ..LlmRoute::default()
            },
        );

        let mut budget_table = HashMap::new();
        budget_table.insert(
            Budget::Low,
            BudgetProfile {
                seeds_per_source: 8,
                graph_depth: 0,
                fanout_per_step: 0,
            },
        );
        budget_table.insert(
            Budget::Mid,
            BudgetProfile {
                seeds_per_source: 20,
                graph_depth: 1,
                fanout_per_step: 5,
            },
        );
        budget_table.insert(
            Budget::High,
            BudgetProfile {
                seeds_per_source: 50,
                graph_depth: 2,
                fanout_per_step: 10,
            },
        );

        Self {
            db_path: None,
            embedder_model: crate::DEFAULT_EMBEDDING_MODEL.to_string(),
            embedding_dimensions: 256,
            llm_routes,
            temporal_window_hours: 24.0,
            temporal_max_neighbors: 10,
            temporal_min_weight: 0.3,
            semantic_threshold: 0.7,
            semantic_top_k: 5,
            dedup_threshold: 0.95,
            budget_table,
            graph_decay: 0.7,
            temporal_deprioritize_factor: 0.5,
            temporal_filter_horizon_hours: 0.0,
            fusion_weights: FusionWeights::default(),
            recency_half_life_hours: 168.0,
            observation_consolidation_enabled: true,
            max_tokens_per_entity: 4096,
            max_entity_tokens: 512,
            task_batch_size: 10,
            task_batch_interval_ms: 1000,
            retry: crate::error::RetryPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Recall profile for a given budget tier. Falls back to `mid`'s profile
    /// if the table was overridden and is missing an entry — this should
    /// never happen with [`EngineConfig::default`].
    pub fn budget_profile(&self, budget: Budget) -> BudgetProfile {
        self.budget_table
            .get(&budget)
            .copied()
            .unwrap_or(BudgetProfile {
                seeds_per_source: 20,
                graph_depth: 1,
                fanout_per_step: 5,
            })
    }

    /// Builds a config from defaults overridden by `HINDSIGHT_*` environment
    /// variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("HINDSIGHT_DB_PATH") {
            config.db_path = Some(PathBuf::from(path));
        }
        if let Ok(model) = std::env::var("HINDSIGHT_EMBEDDER_MODEL") {
            config.embedder_model = model;
        }
        if let Ok(dims) = std::env::var("HINDSIGHT_EMBEDDING_DIMENSIONS") {
            if let Ok(parsed) = dims.parse() {
                config.embedding_dimensions = parsed;
            }
        }
        if let Ok(hours) = std::env::var("HINDSIGHT_TEMPORAL_WINDOW_HOURS") {
            if let Ok(parsed) = hours.parse() {
                config.temporal_window_hours = parsed;
            }
        }
        if let Ok(flag) = std::env::var("HINDSIGHT_OBSERVATION_CONSOLIDATION") {
            config.observation_consolidation_enabled = flag != "0" && flag.to_lowercase() != "false";
        }

        config
    }
}
