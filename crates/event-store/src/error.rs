use thiserror::Error;

use crate::event::position;
use crate::{AggregateId, Sequence};

/// Errors that can occur when interacting with the event store.
#[derive(Debug, Error)]
pub enum EventStoreError {
    /// The stream's last sequence did not match the caller's expectation.
    /// Nothing was appended.
    #[error(
        "Concurrency conflict for aggregate {aggregate_id}: expected last sequence {}, found {}",
        position(.expected),
        position(.actual)
    )]
    ConcurrencyConflict {
        aggregate_id: AggregateId,
        expected: Option<Sequence>,
        actual: Option<Sequence>,
    },

    /// A batch did not continue the stream contiguously.
    #[error(
        "Non-contiguous sequence for aggregate {aggregate_id}: expected {expected}, got {found}"
    )]
    NonContiguous {
        aggregate_id: AggregateId,
        expected: Sequence,
        found: Sequence,
    },

    /// A batch or envelope was malformed (empty, mixed aggregates, missing fields).
    #[error("Invalid event batch: {0}")]
    InvalidBatch(String),

    /// A snapshot claimed to cover events the stream does not have.
    #[error(
        "Snapshot for aggregate {aggregate_id} at sequence {snapshot} is ahead of the stream (last {})",
        position(.last)
    )]
    SnapshotAhead {
        aggregate_id: AggregateId,
        snapshot: Sequence,
        last: Option<Sequence>,
    },

    /// Persisted data could not be interpreted.
    #[error("Corrupted data at {location}: {reason}")]
    Corrupted { location: String, reason: String },

    /// A filesystem error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EventStoreError {
    /// Returns true for failures worth retrying at the store boundary: the
    /// backend could not be reached, but no state was changed.
    pub fn is_transient(&self) -> bool {
        match self {
            EventStoreError::Database(err) => matches!(
                err,
                sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::Tls(_)
            ),
            EventStoreError::Io(err) => matches!(
                err.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }

    /// Returns true when the backend itself failed, as opposed to the caller
    /// supplying a conflicting or malformed request.
    pub fn is_storage_failure(&self) -> bool {
        matches!(
            self,
            EventStoreError::Io(_)
                | EventStoreError::Database(_)
                | EventStoreError::Corrupted { .. }
        )
    }
}

/// Result type for event store operations.
pub type Result<T> = std::result::Result<T, EventStoreError>;
