//! Domain layer for the event-sourcing backbone.
//!
//! This crate provides the core domain abstractions including:
//! - Aggregate trait for event-sourced entities and their rehydration
//! - The Command message routed by the command bus
//! - Snapshotter with its policy and background trigger
//! - A bank account aggregate used by the sample handlers

pub mod account;
pub mod aggregate;
pub mod command;
pub mod error;
pub mod snapshotter;

pub use account::{Account, AccountError, AccountEvent};
pub use aggregate::{Aggregate, DomainEvent, Rehydrated, build_envelopes, decode_event};
pub use command::{CAUSATION_ID, COMMAND_TYPE, CORRELATION_ID, Command};
pub use error::DomainError;
pub use snapshotter::{
    AutoSnapshot, BackgroundSnapshotter, SnapshotPolicy, SnapshotTrigger, Snapshotter,
};
