//! Domain error types.

use event_store::EventStoreError;
use thiserror::Error;

/// Errors that can occur while loading or snapshotting aggregates.
#[derive(Debug, Error)]
pub enum DomainError {
    /// An error occurred in the event store.
    #[error("Event store error: {0}")]
    EventStore(#[from] EventStoreError),

    /// A stored event or snapshot did not match the aggregate's types.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
