//! Core listener trait.

use std::fmt;

use async_trait::async_trait;
use event_store::EventEnvelope;

use crate::Result;

/// Handle returned by [`crate::EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub(crate) u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener#{}", self.0)
    }
}

/// A consumer of published events.
///
/// Delivery is at-least-once: a listener may see an event again after a
/// restart and must tolerate duplicates.
#[async_trait]
pub trait EventListener: Send + Sync {
    /// Returns the name used in logs and metrics.
    fn name(&self) -> &str;

    /// Handles a single event.
    ///
    /// An error is reported by the bus and never reaches the publisher.
    async fn on_event(&self, event: &EventEnvelope) -> Result<()>;
}

/// Adapts a synchronous closure into a listener.
pub struct FnListener<F> {
    name: String,
    f: F,
}

impl<F> FnListener<F>
where
    F: Fn(&EventEnvelope) -> Result<()> + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

#[async_trait]
impl<F> EventListener for FnListener<F>
where
    F: Fn(&EventEnvelope) -> Result<()> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn on_event(&self, event: &EventEnvelope) -> Result<()> {
        (self.f)(event)
    }
}
