//! Startup error type.

use event_store::EventStoreError;
use saga::SagaError;
use thiserror::Error;

use crate::config::ConfigError;

/// Errors that can occur while assembling the backbone.
#[derive(Debug, Error)]
pub enum BackboneError {
    /// The configuration is incomplete or malformed.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The event store could not be opened.
    #[error("Event store error: {0}")]
    EventStore(#[from] EventStoreError),

    /// The saga repository could not be opened.
    #[error("Saga repository error: {0}")]
    Saga(#[from] SagaError),
}
