//! Append-only event storage with optimistic concurrency.
//!
//! Two backends implement [`EventStore`]: [`LogFileEventStore`] keeps one
//! JSON-lines log per aggregate on the local filesystem, and
//! [`DocumentEventStore`] keeps events as JSONB documents in PostgreSQL.

pub mod document;
pub mod error;
pub mod event;
pub mod logfile;
pub mod retry;
pub mod snapshot;
pub mod store;

pub use common::AggregateId;
pub use document::DocumentEventStore;
pub use error::{EventStoreError, Result};
pub use event::{EventEnvelope, EventEnvelopeBuilder, EventId, Sequence};
pub use logfile::LogFileEventStore;
pub use snapshot::Snapshot;
pub use store::{EventStore, EventStoreExt, EventStream, SnapshotAndTail};
