//! # Hindsight Core
//!
//! Long-term memory engine for conversational agents: a bank of durable
//! facts extracted from conversation turns and documents, linked across
//! temporal, semantic, entity, and causal relations, and recalled under a
//! token budget.
//!
//! The engine is organized around two pipelines:
//!
//! - **Retain** (`retain`, `extract`, `links`): turns raw conversational
//!   text and documents into deduplicated, linked [`model::unit::MemoryUnit`]
//!   rows.
//! - **Recall** (`retrieve`): fuses semantic, lexical, and entity-seeded
//!   candidates, expands them over the link graph, and assembles a
//!   budget-constrained result set.
//!
//! Entity identity (`entity`) and per-entity observation summaries
//! (`observation`) sit alongside both pipelines. Everything is wired
//! together by [`engine::Engine`], which owns a [`store::Store`], an
//! [`llm::Embedder`], an [`llm::completion::CompletionClient`], and a
//! [`task::TaskBackend`].
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use hindsight_core::{Engine, EngineConfig};
//! use hindsight_core::retain::{RetainItem, RetainRequest};
//! use hindsight_core::retrieve::RecallRequest;
//! use hindsight_core::model::Budget;
//!
//! let engine = Engine::new(None, EngineConfig::default()).await?;
//! engine.retain(RetainRequest::new("default", vec![RetainItem::text("Alice works at Acme")])).await?;
//! let recalled = engine.recall(RecallRequest::new("default", "Alice", Budget::Mid, 2000)).await?;
//! ```
//!
//! ## Feature flags
//!
//! - `embeddings` (default): local embedding generation via `fastembed`.
//! - `vector-search` (default): HNSW candidate search via `usearch`.
//! - `llm-http`: an HTTP `CompletionClient` for a hosted chat-completions API.
//! - `bundled-sqlite` (default): statically link SQLite via `rusqlite`'s `bundled` feature.
//! - `encryption`: SQLCipher-encrypted storage via `rusqlite`'s `bundled-sqlcipher` feature.
//! - `full`: every optional feature above.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(rustdoc::missing_crate_level_docs)]

// ============================================================================
// MODULES
// ============================================================================

pub mod config;
pub mod engine;
pub mod entity;
pub mod error;
pub mod extract;
pub mod links;
pub mod llm;
pub mod model;
pub mod observation;
pub mod retain;
pub mod retrieve;
pub mod store;
pub mod task;

// ============================================================================
// PUBLIC API RE-EXPORTS
// ============================================================================

pub use config::{BudgetProfile, EngineConfig, FusionWeights, LlmRoute};
pub use engine::{Engine, ReflectRequest, ReflectResult};
pub use entity::{EntityMention, EntityResolver};
pub use error::{EngineError, Result, RetryPolicy};
pub use extract::{ExtractedFact, ExtractionInput, ExtractionResult, FactExtractor};
pub use links::{CausalRelation, FactEntities, LinkBuilder};
pub use llm::{cosine_similarity, matryoshka_truncate, Embedder};
pub use model::{
    AsyncOperation, Bank, Budget, Document, Entity, FactType, LinkType, MemoryLink, MemoryUnit,
    OperationStatus, PersonalityTraits, TemporalRange,
};
pub use observation::ObservationConsolidator;
pub use retain::{RetainItem, RetainOutcome, RetainPipeline, RetainRequest};
pub use retrieve::{EntitySidebarEntry, RecallRequest, RecallResult, RetrievalPlanner, ScoredUnit};
pub use store::{default_db_path, ConnectionPool, Store, UnitFilter};
pub use task::{ConcurrentBackend, Executor, InlineBackend, Task, TaskBackend};

#[cfg(feature = "embeddings")]
#[cfg_attr(docsrs, doc(cfg(feature = "embeddings")))]
pub use llm::LocalEmbedder;

#[cfg(feature = "llm-http")]
#[cfg_attr(docsrs, doc(cfg(feature = "llm-http")))]
pub use llm::HttpCompletionClient;

// ============================================================================
// VERSION INFO
// ============================================================================

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default embedding model name used by [`EngineConfig::default`] when no
/// override is given — matches [`llm::LocalEmbedder`]'s fastembed model.
pub const DEFAULT_EMBEDDING_MODEL: &str = "nomic-embed-text-v1.5";

// ============================================================================
// PRELUDE
// ============================================================================

/// Convenient imports for common usage.
pub mod prelude {
    pub use crate::{
        Bank, Budget, Document, Engine, EngineConfig, EngineError, Entity, FactType, LinkType,
        MemoryLink, MemoryUnit, PersonalityTraits, RecallRequest, RecallResult, Result,
        RetainItem, RetainRequest, Store,
    };

    #[cfg(feature = "embeddings")]
    pub use crate::LocalEmbedder;

    #[cfg(feature = "llm-http")]
    pub use crate::HttpCompletionClient;
}
