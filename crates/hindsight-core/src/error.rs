//! Engine error taxonomy
//!
//! Four kinds per the error handling design: bad input is `Validation` (no
//! retry), flaky infrastructure is `TransientIo` (retried with backoff),
//! non-conforming LLM output is `SchemaError` (retried, then a deterministic
//! fallback), and anything that should abort startup is `Fatal`.

use std::time::Duration;

/// Crate-wide error type.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Caller-supplied input failed validation (bad fact type, malformed
    /// timestamp, invalid id, `occurred_start > occurred_end`, ...).
    #[error("validation error: {0}")]
    Validation(String),

    /// Transient infrastructure failure (DB connection reset, LLM 5xx,
    /// embedding timeout). Safe to retry with backoff.
    #[error("transient I/O error: {0}")]
    TransientIo(String),

    /// LLM output could not be validated against its declared schema after
    /// retries were exhausted.
    #[error("schema error: {0}")]
    Schema(String),

    /// Unrecoverable configuration or initialization failure.
    #[error("fatal error: {0}")]
    Fatal(String),

    /// Requested bank/unit/entity/document/operation does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    /// Whether this error class is worth retrying (matches the
    /// `TransientIo`/`Schema` taxonomy; `Validation`/`Fatal`/`NotFound`
    /// never are).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::TransientIo(_) | EngineError::Schema(_) | EngineError::Database(_)
        )
    }
}

/// Capped exponential backoff used by the store's connection acquisition
/// wrapper and by the LLM/embedding gateways.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let scaled = self.base_delay.saturating_mul(1 << attempt.min(10));
        scaled.min(self.max_delay)
    }
}

/// Retry an async operation under `policy`, retrying only errors for which
/// `is_retryable` returns true. On exhaustion returns the last error.
pub async fn with_retry<T, F, Fut>(policy: RetryPolicy, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt + 1 < policy.max_attempts => {
                tokio::time::sleep(policy.delay_for_attempt(attempt)).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(EngineError::TransientIo("x".into()).is_retryable());
        assert!(EngineError::Schema("x".into()).is_retryable());
        assert!(!EngineError::Validation("x".into()).is_retryable());
        assert!(!EngineError::Fatal("x".into()).is_retryable());
        assert!(!EngineError::NotFound("x".into()).is_retryable());
    }

    #[tokio::test]
    async fn with_retry_gives_up_on_non_retryable() {
        let mut calls = 0;
        let result: Result<()> = with_retry(RetryPolicy::default(), || {
            calls += 1;
            async { Err(EngineError::Validation("nope".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn with_retry_retries_transient_then_succeeds() {
        let mut calls = 0;
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        };
        let result = with_retry(policy, || {
            calls += 1;
            async move {
                if calls < 3 {
                    Err(EngineError::TransientIo("flaky".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 42);
        assert_eq!(calls, 3);
    }
}
