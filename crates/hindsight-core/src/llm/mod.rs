//! Embedder / LLM Gateway (spec.md §4.2)
//!
//! Thin `async_trait` contracts over an external text-embedding model and an
//! external chat-completion model, pulled in the same shape the
//! `darianrosebrook-agent-agency` example pack repo uses for its pluggable
//! LLM client (`async-trait` + `reqwest`). The engine itself never talks to
//! a specific provider — it only calls these two traits.

pub mod completion;
pub mod embedder;

pub use completion::{
    CompletionClient, CompletionRequest, HeuristicCompletionClient, Message, Role,
};
#[cfg(feature = "llm-http")]
pub use completion::HttpCompletionClient;
pub use embedder::{cosine_similarity, matryoshka_truncate, Embedder};
#[cfg(feature = "embeddings")]
pub use embedder::LocalEmbedder;
