//! Hand-off of events to a listener running on its own task.

use std::sync::Arc;

use async_trait::async_trait;
use event_store::EventEnvelope;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::bus::deliver;
use crate::listener::EventListener;
use crate::{ListenerError, Result};

/// Wraps a listener so publishing only enqueues the event.
///
/// The queue is bounded: when it is full, delivery waits for room. Failures
/// of the wrapped listener happen after the hand-off, so they are logged and
/// counted on the worker task instead of being reported to the bus.
pub struct QueuedListener {
    name: String,
    tx: mpsc::Sender<EventEnvelope>,
}

impl QueuedListener {
    /// Spawns the worker task draining the queue into `inner`.
    ///
    /// The task ends once the `QueuedListener` is dropped and the queue is
    /// empty.
    pub fn spawn(inner: Arc<dyn EventListener>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<EventEnvelope>(capacity.max(1));
        let name = format!("queued({})", inner.name());

        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Err(err) = deliver(inner.as_ref(), &event).await {
                    tracing::warn!(
                        listener = inner.name(),
                        event_id = %event.event_id,
                        error = %err,
                        "queued listener failed"
                    );
                    metrics::counter!("event_bus_listener_failures_total").increment(1);
                }
            }
        });

        (Self { name, tx }, task)
    }
}

#[async_trait]
impl EventListener for QueuedListener {
    fn name(&self) -> &str {
        &self.name
    }

    async fn on_event(&self, event: &EventEnvelope) -> Result<()> {
        self.tx
            .send(event.clone())
            .await
            .map_err(|_| ListenerError::QueueClosed)
    }
}
