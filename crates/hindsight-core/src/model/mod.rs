//! Typed data model
//!
//! Every shape the store persists and every shape crossing an API boundary
//! is a concrete struct, not a loose JSON map — see SPEC_FULL.md §3.

pub mod bank;
pub mod document;
pub mod entity;
pub mod link;
pub mod operation;
pub mod unit;

pub use bank::{Bank, PersonalityTraits};
pub use document::Document;
pub use entity::Entity;
pub use link::{LinkType, MemoryLink};
pub use operation::{AsyncOperation, OperationStatus};
pub use unit::{Budget, FactType, MemoryUnit, TemporalRange};
