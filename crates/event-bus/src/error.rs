//! Listener error types.

use thiserror::Error;

/// Errors a listener can report for one delivered event.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// An error occurred in the event store.
    #[error("Event store error: {0}")]
    EventStore(#[from] event_store::EventStoreError),

    /// Failed to deserialize an event payload.
    #[error("Event deserialization error: {0}")]
    Deserialization(#[from] serde_json::Error),

    /// The listener's hand-off queue is closed.
    #[error("Listener queue closed")]
    QueueClosed,

    /// A listener-specific error.
    #[error("Listener error: {0}")]
    Failed(String),
}

/// Result type for listener operations.
pub type Result<T> = std::result::Result<T, ListenerError>;
