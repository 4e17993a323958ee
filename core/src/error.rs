//! Error taxonomy for the adaptive assessment engine
//!
//! Errors are grouped by the layer that raises them:
//!
//! - [`ValidationError`]: malformed input detected before any state mutation
//!   (non-finite matrices, dimension mismatches, out-of-range features).
//! - [`StoreError`]: failures of the persistence collaborators. These are
//!   always propagated; a write is never assumed to have happened.
//! - [`EngineError`]: request-path failures surfaced to the caller, including
//!   [`EngineError::PoolExhausted`] which leaves the fallback policy to the
//!   caller (widen filters, end the quiz).
//!
//! Batch-level errors (`CalibrationError`, `MaintenanceError`) live beside the
//! code that raises them.
//!
//! Copyright (c) 2025 Mohammad Atashi <mohammadaliatashi@icloud.com>

use thiserror::Error;

use crate::types::{ItemId, TopicId};

/// Input rejected before any state was touched
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    /// Operand dimensions disagree
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// A matrix or vector contains NaN or an infinity
    #[error("Non-finite value in {context}")]
    NonFinite { context: String },

    /// A normalized feature fell outside [0, 1]
    #[error("Feature '{feature}' out of range: {value}")]
    OutOfRange { feature: &'static str, value: f64 },

    /// A model or configuration parameter is unusable
    #[error("Invalid parameter {name}={value}: {reason}")]
    InvalidParameter {
        name: &'static str,
        value: f64,
        reason: &'static str,
    },
}

/// Persistence collaborator failure
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    /// Requested record does not exist
    #[error("{kind} not found: {key}")]
    NotFound { kind: &'static str, key: String },

    /// Optimistic concurrency check failed
    #[error("Version conflict on {key}: expected {expected:?}, found {actual:?}")]
    VersionConflict {
        key: String,
        expected: Option<u64>,
        actual: Option<u64>,
    },

    /// Backend-specific failure
    #[error("Storage backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn not_found(kind: &'static str, key: impl ToString) -> Self {
        StoreError::NotFound {
            kind,
            key: key.to_string(),
        }
    }
}

/// Request-path error returned by the engine and selector
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("Store failure: {0}")]
    Store(#[from] StoreError),

    /// No eligible candidate remains for the requested topics
    #[error("Question pool exhausted for topics {topics:?}")]
    PoolExhausted { topics: Vec<TopicId> },

    /// Optimistic updates kept losing the race for an arm
    #[error("Arm {key} still contended after {attempts} attempts")]
    Contention { key: String, attempts: usize },

    /// The session already reached its planned length
    #[error("Session complete after {answered} of {length} items")]
    SessionComplete { answered: u32, length: u32 },

    /// The item was already answered in this session
    #[error("Item {0} already answered in this session")]
    DuplicateAnswer(ItemId),

    #[error("Unknown item {0}")]
    UnknownItem(ItemId),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Engine result type
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_converts_into_engine_error() {
        let err: EngineError = ValidationError::DimensionMismatch {
            expected: 4,
            actual: 3,
        }
        .into();
        assert!(matches!(
            err,
            EngineError::Validation(ValidationError::DimensionMismatch { expected: 4, actual: 3 })
        ));
        assert!(err.to_string().contains("expected 4, got 3"));
    }

    #[test]
    fn test_store_not_found_message() {
        let err = StoreError::not_found("item", ItemId(7));
        assert_eq!(err.to_string(), "item not found: item#7");
    }
}
