//! Entity: a resolved canonical referent within a bank.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// `(id, bank_id, canonical_name, mention_count, first_seen, last_seen,
/// metadata)` (spec.md §3). Many-to-many with units via `unit_entities`.
#[non_exhaustive]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub id: Uuid,
    pub bank_id: String,
    pub canonical_name: String,
    pub mention_count: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, Option<String>>,
}

impl Entity {
    /// A freshly created entity from one surface-form mention (Entity
    /// Resolver miss path, spec.md §4.3 step 3).
    pub fn new_from_mention(bank_id: impl Into<String>, canonical_name: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            bank_id: bank_id.into(),
            canonical_name: canonical_name.into(),
            mention_count: 1,
            first_seen: at,
            last_seen: at,
            metadata: HashMap::new(),
        }
    }

    /// Bumps bookkeeping fields for an additional mention at `at`
    /// (spec.md §4.3: "mutated only to bump mention_count, last_seen, and
    /// canonical name").
    pub fn record_mention(&mut self, at: DateTime<Utc>) {
        self.mention_count += 1;
        if at > self.last_seen {
            self.last_seen = at;
        }
        if at < self.first_seen {
            self.first_seen = at;
        }
    }
}

/// Normalizes a surface form for entity-name comparison: trims, lowercases.
/// Used by the resolver's exact canonical-name match (spec.md §4.3) and the
/// batch-resolution same-normalized-name collapse guarantee.
pub fn normalize_name(raw: &str) -> String {
    raw.trim().to_lowercase()
}
