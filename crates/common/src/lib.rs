//! Identifier types shared by every crate of the backbone.

mod types;

pub use types::{AggregateId, SagaId};
