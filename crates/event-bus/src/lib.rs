//! In-process event bus.
//!
//! This crate delivers events to the consumers of the write side:
//! - [`EventListener`] trait implemented by projections and saga dispatch
//! - [`EventBus`] fanning published events out to every subscribed listener
//! - [`QueuedListener`] moving slow listeners onto their own task

pub mod bus;
pub mod error;
pub mod listener;
pub mod queued;

pub use bus::{DeliveryFailure, EventBus, PublishReport};
pub use error::{ListenerError, Result};
pub use listener::{EventListener, FnListener, ListenerId};
pub use queued::QueuedListener;
