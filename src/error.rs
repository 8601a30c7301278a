//! Engine-wide error type.
//!
//! One `thiserror` enum covering every error tag in the design (WAL,
//! locking, row engine, column store, query analyzer/router). Grounded on
//! the teacher's `error::CoreError`, switched from hand-rolled `Display` +
//! constructor methods to `#[derive(thiserror::Error)]`.

use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine has not been initialized")]
    NotInitialized,

    #[error("entity not found: {0}")]
    NotFound(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("lock wait on {key} exceeded the deadline and was treated as a deadlock")]
    Deadlock { key: String },

    #[error("write-ahead log is corrupt: {0}")]
    WalCorruption(String),

    #[error("column store operation failed: {0}")]
    ColumnarFailure(String),

    #[error("columnar configuration error: {0}")]
    ConfigError(String),

    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    #[must_use]
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound(key.into())
    }

    #[must_use]
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    #[must_use]
    pub fn config(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    #[must_use]
    pub fn columnar(msg: impl Into<String>) -> Self {
        Self::ColumnarFailure(msg.into())
    }

    /// Whether the router should treat this error as recoverable by
    /// falling back to the entity-only strategy (spec §4.7, §7).
    #[must_use]
    pub const fn is_columnar_recoverable(&self) -> bool {
        matches!(self, Self::ColumnarFailure(_) | Self::UnsupportedOperation(_))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn columnar_failure_is_recoverable() {
        assert!(EngineError::columnar("boom").is_columnar_recoverable());
        assert!(!EngineError::NotInitialized.is_columnar_recoverable());
    }
}
