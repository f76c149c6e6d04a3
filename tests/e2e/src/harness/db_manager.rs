//! Test engine harness
//!
//! Builds an [`Engine`] against a temporary on-disk (or in-memory) SQLite
//! database with an [`InlineBackend`] and a [`HeuristicCompletionClient`]
//! whose responses tests queue deterministically — a disposable, seedable
//! store per test.

use std::sync::Arc;

use hindsight_core::llm::HeuristicCompletionClient;
use hindsight_core::task::InlineBackend;
use hindsight_core::{Embedder, Engine, EngineConfig, EngineError, Store};
use tempfile::TempDir;

/// A deterministic stub embedder: every distinct text gets a fixed
/// pseudo-random unit vector, so cosine similarity is meaningful for tests
/// that check ordering without needing a real embedding model loaded.
pub struct StubEmbedder {
    dimensions: usize,
}

impl StubEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }
}

#[async_trait::async_trait]
impl Embedder for StubEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EngineError> {
        Ok(texts.iter().map(|text| hash_embedding(text, self.dimensions)).collect())
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_name(&self) -> &str {
        "stub-hash"
    }
}

/// Hashes `text` into a deterministic unit vector. Distinct strings land in
/// distinct directions; identical strings always embed identically, which
/// is all the dedup/semantic-link tests need.
fn hash_embedding(text: &str, dimensions: usize) -> Vec<f32> {
    let mut vector = vec![0.0f32; dimensions];
    let mut state: u64 = 1469598103934665603;
    for byte in text.bytes() {
        state ^= byte as u64;
        state = state.wrapping_mul(1099511628211);
        let idx = (state as usize) % dimensions;
        vector[idx] += 1.0;
    }
    hindsight_core::llm::embedder::normalize(&mut vector);
    vector
}

/// Owns a temp directory and a ready-to-use [`Engine`]. The temp directory
/// is kept alive for the harness's lifetime and removed on drop.
pub struct TestEngine {
    pub engine: Engine,
    pub completion: Arc<HeuristicCompletionClient>,
    _temp_dir: TempDir,
}

impl TestEngine {
    /// Builds an engine against a fresh temp-directory database with the
    /// given queued completion client, so callers can pre-seed extraction
    /// and arbitration responses before retaining anything.
    pub async fn new(completion: HeuristicCompletionClient) -> Self {
        let temp_dir = TempDir::new().expect("create temp dir");
        let db_path = temp_dir.path().join("hindsight-test.db");

        let mut config = EngineConfig::default();
        config.db_path = Some(db_path);
        // Keep dedup/link math on a low-dimensional stub embedding space
        // rather than pulling in a real model for every test.
        config.embedding_dimensions = 32;

        let store = Arc::new(Store::open(config.db_path.as_deref(), config.retry).expect("open store"));
        let embedder: Arc<dyn Embedder> = Arc::new(StubEmbedder::new(config.embedding_dimensions));
        let completion = Arc::new(completion);

        let engine = Engine::new(store, embedder, completion.clone(), config, InlineBackend::new());

        Self { engine, completion, _temp_dir: temp_dir }
    }

    /// Convenience constructor for tests that don't need to pre-seed any
    /// completion responses; extraction falls back to the heuristic
    /// schema-shaped default (empty facts), which is still enough to drive
    /// the retain pipeline's §7 never-silently-drop fallback.
    pub async fn with_default_completion() -> Self {
        Self::new(HeuristicCompletionClient::new()).await
    }
}
