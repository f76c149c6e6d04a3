//! Embedder contract and the local fastembed-backed implementation.
//!
//! Lazily initializes the ONNX model behind a `OnceLock` with a fixed
//! cache-dir resolution order, and uses a hand-rolled `Display`/`Error`
//! type for embedding failures rather than `thiserror`, consistent with
//! how other infrastructure-level errors in this crate are modeled.

use std::fmt;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::EngineError;

/// `embed(texts) → [vector]`: fixed dimension `D`, L2-normalized, batched,
/// order-preserving, deterministic for identical inputs within one model
/// version (spec.md §4.2).
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embeds a batch of texts, preserving input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EngineError>;

    /// Fixed output dimension `D`.
    fn dimensions(&self) -> usize;

    /// Model identifier, used for cache-invalidation bookkeeping (spec.md
    /// §3 invariant: "a change of model forces new units").
    fn model_name(&self) -> &str;
}

/// Manual error type for the embedding stack
/// (`ModelInit` / `EmbeddingFailed` / `InvalidInput`).
#[derive(Debug)]
pub enum EmbeddingError {
    ModelInit(String),
    EmbeddingFailed(String),
    InvalidInput(String),
}

impl fmt::Display for EmbeddingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmbeddingError::ModelInit(msg) => write!(f, "embedding model init failed: {msg}"),
            EmbeddingError::EmbeddingFailed(msg) => write!(f, "embedding failed: {msg}"),
            EmbeddingError::InvalidInput(msg) => write!(f, "invalid embedding input: {msg}"),
        }
    }
}

impl std::error::Error for EmbeddingError {}

impl From<EmbeddingError> for EngineError {
    fn from(err: EmbeddingError) -> Self {
        match err {
            EmbeddingError::ModelInit(msg) => EngineError::Fatal(msg),
            EmbeddingError::EmbeddingFailed(msg) => EngineError::TransientIo(msg),
            EmbeddingError::InvalidInput(msg) => EngineError::Validation(msg),
        }
    }
}

/// L2-normalizes `vector` in place.
pub fn normalize(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
}

/// Cosine similarity between two equal-length vectors. Returns 0.0 for
/// mismatched lengths rather than panicking.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot = dot_product(a, b);
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

pub fn dot_product(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Truncates an embedding to the first `dims` dimensions and re-normalizes,
/// for Matryoshka-style models whose prefix sub-vectors remain meaningful.
pub fn matryoshka_truncate(vector: &[f32], dims: usize) -> Vec<f32> {
    let mut truncated: Vec<f32> = vector.iter().take(dims).copied().collect();
    normalize(&mut truncated);
    truncated
}

#[cfg(feature = "embeddings")]
mod local {
    use super::*;
    use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
    use std::path::PathBuf;
    use std::sync::OnceLock;

    const MAX_TEXT_LENGTH: usize = 8192;
    const BATCH_SIZE: usize = 32;

    static MODEL: OnceLock<Result<Mutex<TextEmbedding>, String>> = OnceLock::new();

    fn cache_dir() -> PathBuf {
        if let Ok(path) = std::env::var("HINDSIGHT_EMBEDDING_CACHE_PATH") {
            return PathBuf::from(path);
        }
        if let Some(dirs) = directories::ProjectDirs::from("dev", "hindsight", "hindsight") {
            return dirs.cache_dir().join("embeddings");
        }
        PathBuf::from(".hindsight-cache/embeddings")
    }

    fn model() -> Result<&'static Mutex<TextEmbedding>, EmbeddingError> {
        let result = MODEL.get_or_init(|| {
            let options = InitOptions::new(EmbeddingModel::NomicEmbedTextV15)
                .with_show_download_progress(true)
                .with_cache_dir(cache_dir());
            TextEmbedding::try_new(options)
                .map(Mutex::new)
                .map_err(|e| e.to_string())
        });
        result.as_ref().map_err(|msg| EmbeddingError::ModelInit(msg.clone()))
    }

    /// fastembed/ONNX-backed [`Embedder`] using a lazily-initialized local
    /// model.
    pub struct LocalEmbedder {
        dimensions: usize,
        model_name: String,
    }

    impl LocalEmbedder {
        pub fn new(dimensions: usize) -> Self {
            Self {
                dimensions,
                model_name: "nomic-embed-text-v1.5".to_string(),
            }
        }

        /// Forces model initialization eagerly, surfacing `ModelInit`
        /// failures at startup rather than on first use.
        pub fn warm_up(&self) -> Result<(), EmbeddingError> {
            model().map(|_| ())
        }
    }

    #[async_trait]
    impl Embedder for LocalEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EngineError> {
            if texts.is_empty() {
                return Ok(Vec::new());
            }
            for text in texts {
                if text.len() > MAX_TEXT_LENGTH {
                    return Err(EmbeddingError::InvalidInput(format!(
                        "text exceeds {MAX_TEXT_LENGTH} bytes"
                    ))
                    .into());
                }
            }

            let dimensions = self.dimensions;
            let owned: Vec<String> = texts.to_vec();
            let vectors = tokio::task::spawn_blocking(move || -> Result<Vec<Vec<f32>>, EmbeddingError> {
                let guard = model()?;
                let mut embedder = guard
                    .lock()
                    .map_err(|_| EmbeddingError::EmbeddingFailed("embedding model mutex poisoned".into()))?;
                let mut out = Vec::with_capacity(owned.len());
                for chunk in owned.chunks(BATCH_SIZE) {
                    let batch_refs: Vec<&str> = chunk.iter().map(String::as_str).collect();
                    let batch = embedder
                        .embed(batch_refs, None)
                        .map_err(|e| EmbeddingError::EmbeddingFailed(e.to_string()))?;
                    for mut vector in batch {
                        normalize(&mut vector);
                        out.push(matryoshka_truncate(&vector, dimensions));
                    }
                }
                Ok(out)
            })
            .await
            .map_err(|e| EngineError::TransientIo(format!("embedding task panicked: {e}")))??;

            Ok(vectors)
        }

        fn dimensions(&self) -> usize {
            self.dimensions
        }

        fn model_name(&self) -> &str {
            &self.model_name
        }
    }
}

#[cfg(feature = "embeddings")]
pub use local::LocalEmbedder;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_identical_vectors_is_one() {
        let a = vec![0.6, 0.8];
        assert!((cosine_similarity(&a, &a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_orthogonal_vectors_is_zero() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn cosine_opposite_vectors_is_negative_one() {
        let a = vec![1.0, 0.0];
        let b = vec![-1.0, 0.0];
        assert!((cosine_similarity(&a, &b) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn normalize_produces_unit_vector() {
        let mut v = vec![3.0, 4.0];
        normalize(&mut v);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn truncate_reduces_dimension_and_renormalizes() {
        let v = vec![0.5, 0.5, 0.5, 0.5];
        let truncated = matryoshka_truncate(&v, 2);
        assert_eq!(truncated.len(), 2);
        let norm: f32 = truncated.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn mismatched_length_cosine_is_zero() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0]), 0.0);
    }
}
