//! Memory link: a typed, weighted, directed edge between two units.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Zero UUID substituted for `entity_id` in the uniqueness key when a link
/// carries no entity (spec.md §3 "entity_id-or-zero"), so the composite
/// `ON CONFLICT` key stays well-defined for entity-less links.
pub const ZERO_ENTITY_ID: Uuid = Uuid::nil();

/// Edge types the Link Builder produces (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkType {
    Temporal,
    Semantic,
    Entity,
    Causes,
    CausedBy,
    Enables,
    Prevents,
}

impl LinkType {
    /// Whether this is one of the four causal sub-types (spec.md §3
    /// "Causal:").
    pub fn is_causal(self) -> bool {
        matches!(
            self,
            LinkType::Causes | LinkType::CausedBy | LinkType::Enables | LinkType::Prevents
        )
    }
}

impl fmt::Display for LinkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LinkType::Temporal => "temporal",
            LinkType::Semantic => "semantic",
            LinkType::Entity => "entity",
            LinkType::Causes => "causes",
            LinkType::CausedBy => "caused_by",
            LinkType::Enables => "enables",
            LinkType::Prevents => "prevents",
        };
        f.write_str(s)
    }
}

impl FromStr for LinkType {
    type Err = crate::error::EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "temporal" => Ok(LinkType::Temporal),
            "semantic" => Ok(LinkType::Semantic),
            "entity" => Ok(LinkType::Entity),
            "causes" => Ok(LinkType::Causes),
            "caused_by" => Ok(LinkType::CausedBy),
            "enables" => Ok(LinkType::Enables),
            "prevents" => Ok(LinkType::Prevents),
            other => Err(crate::error::EngineError::Validation(format!(
                "unknown link_type: {other}"
            ))),
        }
    }
}

/// A typed directed edge `(from_unit, to_unit, link_type, weight, entity_id?)`
/// (spec.md §3). Uniqueness key is `(from_unit_id, to_unit_id, link_type,
/// entity_id-or-zero)`.
#[non_exhaustive]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryLink {
    pub from_unit_id: Uuid,
    pub to_unit_id: Uuid,
    pub link_type: LinkType,
    pub weight: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<Uuid>,
}

impl MemoryLink {
    pub fn new(from_unit_id: Uuid, to_unit_id: Uuid, link_type: LinkType, weight: f32) -> Self {
        Self {
            from_unit_id,
            to_unit_id,
            link_type,
            weight: weight.clamp(0.0, 1.0),
            entity_id: None,
        }
    }

    pub fn with_entity(mut self, entity_id: Uuid) -> Self {
        self.entity_id = Some(entity_id);
        self
    }

    /// The entity_id half of the uniqueness key, substituting the zero UUID
    /// sentinel for links with no entity.
    pub fn entity_key(&self) -> Uuid {
        self.entity_id.unwrap_or(ZERO_ENTITY_ID)
    }
}
