//! Memory unit: the atomic, self-contained, dated fact.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The four fact types a memory unit can carry (spec.md §3, GLOSSARY).
///
/// A plain enum with `Display` + `FromStr` round-tripping its serde wire
/// form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactType {
    /// Third-person facts about the world.
    World,
    /// First-person facts about the bank's own actions.
    Agent,
    /// The bank's stated positions.
    Opinion,
    /// Entity-centric synthesized summaries, written by the Consolidator.
    Observation,
}

impl fmt::Display for FactType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FactType::World => "world",
            FactType::Agent => "agent",
            FactType::Opinion => "opinion",
            FactType::Observation => "observation",
        };
        f.write_str(s)
    }
}

impl FromStr for FactType {
    type Err = crate::error::EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "world" => Ok(FactType::World),
            "agent" => Ok(FactType::Agent),
            "opinion" => Ok(FactType::Opinion),
            "observation" => Ok(FactType::Observation),
            other => Err(crate::error::EngineError::Validation(format!(
                "unknown fact_type: {other}"
            ))),
        }
    }
}

/// A temporal interval. Points collapse `start == end`; intervals carry a
/// real range (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemporalRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TemporalRange {
    pub fn point(at: DateTime<Utc>) -> Self {
        Self { start: at, end: at }
    }

    pub fn is_valid(&self) -> bool {
        self.start <= self.end
    }

    /// Whether `self` and `other` overlap, used by the dedup pass's
    /// "overlapping temporal range" check (spec.md §4.6).
    pub fn overlaps(&self, other: &TemporalRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

/// Recall budget tier (spec.md §4.8, GLOSSARY).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Budget {
    Low,
    Mid,
    High,
}

impl fmt::Display for Budget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Budget::Low => "low",
            Budget::Mid => "mid",
            Budget::High => "high",
        };
        f.write_str(s)
    }
}

impl FromStr for Budget {
    type Err = crate::error::EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Budget::Low),
            "mid" => Ok(Budget::Mid),
            "high" => Ok(Budget::High),
            other => Err(crate::error::EngineError::Validation(format!(
                "unknown budget tier: {other}"
            ))),
        }
    }
}

/// The atomic record the rest of the engine operates on (spec.md §3).
#[non_exhaustive]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryUnit {
    pub id: Uuid,
    pub bank_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_id: Option<String>,
    pub text: String,
    pub fact_type: FactType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    /// Fixed-dimension, L2-normalized, nullable until computed (spec.md §3).
    /// Stored as opaque `f32` bytes by the store — see SPEC_FULL.md §9
    /// "Vector storage".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub occurred: TemporalRange,
    pub mentioned_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, Option<String>>,
    pub created_at: DateTime<Utc>,
}

impl MemoryUnit {
    pub fn is_valid(&self) -> bool {
        self.occurred.is_valid()
    }
}
