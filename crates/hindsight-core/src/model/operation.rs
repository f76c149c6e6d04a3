//! Async operation: the ledger entry for background retain work.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of an [`AsyncOperation`] (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OperationStatus::Pending => "pending",
            OperationStatus::Running => "running",
            OperationStatus::Completed => "completed",
            OperationStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for OperationStatus {
    type Err = crate::error::EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OperationStatus::Pending),
            "running" => Ok(OperationStatus::Running),
            "completed" => Ok(OperationStatus::Completed),
            "failed" => Ok(OperationStatus::Failed),
            other => Err(crate::error::EngineError::Validation(format!(
                "unknown operation status: {other}"
            ))),
        }
    }
}

/// Ledger entry for background work so clients can poll and cancel
/// (spec.md §3).
#[non_exhaustive]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AsyncOperation {
    pub id: Uuid,
    pub bank_id: String,
    pub task_type: String,
    pub items_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub status: OperationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl AsyncOperation {
    pub fn new_pending(bank_id: impl Into<String>, task_type: impl Into<String>, items_count: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            bank_id: bank_id.into(),
            task_type: task_type.into(),
            items_count,
            document_id: None,
            created_at: Utc::now(),
            status: OperationStatus::Pending,
            error_message: None,
        }
    }

    pub fn mark_failed(&mut self, message: impl Into<String>) {
        self.status = OperationStatus::Failed;
        self.error_message = Some(message.into());
    }

    pub fn mark_completed(&mut self) {
        self.status = OperationStatus::Completed;
        self.error_message = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips() {
        for status in [
            OperationStatus::Pending,
            OperationStatus::Running,
            OperationStatus::Completed,
            OperationStatus::Failed,
        ] {
            let parsed: OperationStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn new_operation_starts_pending() {
        let op = AsyncOperation::new_pending("bank-1", "retain", 3);
        assert_eq!(op.status, OperationStatus::Pending);
        assert!(op.error_message.is_none());
    }

    #[test]
    fn mark_failed_sets_message() {
        let mut op = AsyncOperation::new_pending("bank-1", "retain", 3);
        op.mark_failed("boom");
        assert_eq!(op.status, OperationStatus::Failed);
        assert_eq!(op.error_message.as_deref(), Some("boom"));
    }
}
