//! Row <-> domain-type conversions shared by every store query module.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rusqlite::Error as SqliteError;
use uuid::Uuid;

use crate::error::EngineError;

pub fn to_rfc3339(at: DateTime<Utc>) -> String {
    at.to_rfc3339()
}

pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, EngineError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| EngineError::Validation(format!("invalid timestamp '{raw}': {e}")))
}

pub fn parse_uuid(raw: &str) -> Result<Uuid, EngineError> {
    Uuid::parse_str(raw).map_err(|e| EngineError::Validation(format!("invalid uuid '{raw}': {e}")))
}

/// Packs an L2-normalized embedding as little-endian `f32` bytes — "opaque
/// bytes of known dimension" per SPEC_FULL.md §9's vector-storage note, no
/// assumption of a specific vector extension.
pub fn encode_embedding(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vector.len() * 4);
    for value in vector {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

pub fn decode_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

pub fn encode_metadata(metadata: &HashMap<String, Option<String>>) -> Result<String, EngineError> {
    serde_json::to_string(metadata).map_err(EngineError::Serde)
}

pub fn decode_metadata(raw: &str) -> Result<HashMap<String, Option<String>>, EngineError> {
    if raw.is_empty() {
        return Ok(HashMap::new());
    }
    serde_json::from_str(raw).map_err(EngineError::Serde)
}

/// Adapts a `rusqlite` row-mapping error already carrying an [`EngineError`]
/// (via `rusqlite::Error::UserFunctionError`/custom conversion paths are
/// avoided entirely; store code calls fallible conversions outside `.get`
/// and maps explicitly) — kept for call sites that need a quick `From`.
pub fn sqlite_err(err: SqliteError) -> EngineError {
    EngineError::Database(err)
}
