//! Saga error types.

use common::SagaId;
use event_store::EventStoreError;
use thiserror::Error;

/// Errors that can occur while storing or running sagas.
#[derive(Debug, Error)]
pub enum SagaError {
    /// Another active instance of the same saga type already holds the
    /// association. Routing would be ambiguous, so the save is rejected.
    #[error("Correlation conflict for saga type {saga_type}: {key}={value} is already associated")]
    CorrelationConflict {
        saga_type: String,
        key: String,
        value: String,
    },

    /// The stored revision moved on since the instance was loaded.
    #[error(
        "Concurrent modification of saga {saga_id}: expected revision {expected}, found {}",
        actual.map_or_else(|| "<none>".to_string(), |r| r.to_string())
    )]
    ConcurrentModification {
        saga_id: SagaId,
        expected: u64,
        actual: Option<u64>,
    },

    /// The saga's own logic rejected the event.
    #[error("Saga {saga_type} failed: {reason}")]
    Handler { saga_type: String, reason: String },

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// An error occurred reading the event store.
    #[error("Event store error: {0}")]
    EventStore(#[from] EventStoreError),

    /// Saga state could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SagaError {
    /// Creates a handler error for the given saga type.
    pub fn handler(saga_type: impl Into<String>, reason: impl ToString) -> Self {
        SagaError::Handler {
            saga_type: saga_type.into(),
            reason: reason.to_string(),
        }
    }

    /// Returns true if reloading the instance and handling the event again
    /// may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SagaError::ConcurrentModification { .. } | SagaError::CorrelationConflict { .. }
        )
    }

    /// Returns true for connection-level database failures.
    pub fn is_transient(&self) -> bool {
        match self {
            SagaError::Database(err) => matches!(
                err,
                sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::Tls(_)
            ),
            SagaError::EventStore(err) => err.is_transient(),
            _ => false,
        }
    }
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
