//! Saga (process manager) support.
//!
//! - [`SagaInstance`] with its correlation [`Association`]s and lifecycle
//! - [`SagaRepository`] with an in-memory and a PostgreSQL document backend
//! - [`Saga`] and [`SagaManager`], which route published events to instances

pub mod document;
pub mod error;
pub mod instance;
pub mod manager;
pub mod repository;
pub mod state;

pub use document::DocumentSagaRepository;
pub use error::{Result, SagaError};
pub use instance::{Association, SagaInstance};
pub use manager::{Saga, SagaContext, SagaManager};
pub use repository::{InMemorySagaRepository, SagaRepository};
pub use state::SagaStatus;
