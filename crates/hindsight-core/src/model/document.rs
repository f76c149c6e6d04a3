//! Document: a caller-identified grouping of raw ingested text.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A grouping of raw text ingested in one `retain` call. Re-ingesting with
/// the same `(bank_id, id)` deletes all prior units/links derived from it,
/// then re-inserts (spec.md §3 "Upsert semantics").
#[non_exhaustive]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: String,
    pub bank_id: String,
    pub original_text: String,
    pub content_hash: String,
    pub unit_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    /// sha256 hex digest of `original_text`. Stored purely as an
    /// informational equality check exposed via `get_document` — it does not
    /// gate upsert behavior (SPEC_FULL.md §9, following the original
    /// source's treatment of content hashing as informational).
    pub fn hash_content(text: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    pub fn new(bank_id: impl Into<String>, id: impl Into<String>, original_text: impl Into<String>) -> Self {
        let original_text = original_text.into();
        let content_hash = Self::hash_content(&original_text);
        let now = Utc::now();
        Self {
            id: id.into(),
            bank_id: bank_id.into(),
            original_text,
            content_hash,
            unit_count: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_for_identical_content() {
        let a = Document::hash_content("Alice works at Google.");
        let b = Document::hash_content("Alice works at Google.");
        assert_eq!(a, b);
    }

    #[test]
    fn hash_differs_for_different_content() {
        let a = Document::hash_content("Alice works at Google.");
        let b = Document::hash_content("Alice works at Microsoft.");
        assert_ne!(a, b);
    }
}
