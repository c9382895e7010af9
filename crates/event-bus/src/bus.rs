//! Fan-out of published events to subscribed listeners.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use event_store::{EventEnvelope, EventId};
use futures_util::FutureExt;

use crate::error::ListenerError;
use crate::listener::{EventListener, ListenerId};

/// A listener that failed to handle one event.
#[derive(Debug, Clone)]
pub struct DeliveryFailure {
    pub listener: String,
    pub event_id: EventId,
    pub error: String,
}

/// Outcome of one `publish` call.
#[derive(Debug, Clone, Default)]
pub struct PublishReport {
    /// Successful (event, listener) deliveries.
    pub delivered: usize,

    /// Failed deliveries, in delivery order.
    pub failures: Vec<DeliveryFailure>,
}

impl PublishReport {
    /// Returns true if every delivery succeeded.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Calls one listener, turning a panic into a [`ListenerError::Failed`].
pub(crate) async fn deliver(
    listener: &dyn EventListener,
    event: &EventEnvelope,
) -> crate::Result<()> {
    AssertUnwindSafe(listener.on_event(event))
        .catch_unwind()
        .await
        .unwrap_or_else(|_| Err(ListenerError::Failed("listener panicked".to_string())))
}

/// Publishes events to every currently subscribed listener.
///
/// Listeners are called on the publishing task, one after the other. A
/// listener with unbounded work should be wrapped in a
/// [`crate::QueuedListener`].
#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<Vec<(ListenerId, Arc<dyn EventListener>)>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes a listener to all future publications.
    pub fn subscribe(&self, listener: Arc<dyn EventListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        tracing::debug!(%id, listener = listener.name(), "listener subscribed");
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, listener));
        id
    }

    /// Removes a listener. Returns false if it was not subscribed.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        before != listeners.len()
    }

    /// Returns the number of subscribed listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Delivers each event, in order, to every listener subscribed when the
    /// call started.
    ///
    /// Listener failures, panics included, are logged, counted and reported,
    /// never returned as errors.
    #[tracing::instrument(skip(self, events), fields(count = events.len()))]
    pub async fn publish(&self, events: &[EventEnvelope]) -> PublishReport {
        let listeners: Vec<Arc<dyn EventListener>> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();

        let mut report = PublishReport::default();
        for event in events {
            for listener in &listeners {
                match deliver(listener.as_ref(), event).await {
                    Ok(()) => report.delivered += 1,
                    Err(err) => {
                        tracing::warn!(
                            listener = listener.name(),
                            event_id = %event.event_id,
                            event_type = %event.event_type,
                            error = %err,
                            "listener failed"
                        );
                        metrics::counter!("event_bus_listener_failures_total").increment(1);
                        report.failures.push(DeliveryFailure {
                            listener: listener.name().to_string(),
                            event_id: event.event_id,
                            error: err.to_string(),
                        });
                    }
                }
            }
        }

        metrics::counter!("event_bus_events_published_total").increment(events.len() as u64);
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FnListener, ListenerError};
    use common::AggregateId;
    use event_store::Sequence;
    use std::sync::Mutex;

    fn event(sequence: u64) -> EventEnvelope {
        EventEnvelope::builder()
            .aggregate_id(AggregateId::new("A1"))
            .aggregate_type("Account")
            .event_type("AmountDeposited")
            .sequence(Sequence::new(sequence))
            .payload_raw(serde_json::json!({"amount": sequence}))
            .build()
            .unwrap()
    }

    fn recorder(seen: Arc<Mutex<Vec<u64>>>) -> Arc<dyn EventListener> {
        Arc::new(FnListener::new("recorder", move |e: &EventEnvelope| {
            seen.lock().unwrap().push(e.sequence.as_u64());
            Ok(())
        }))
    }

    #[tokio::test]
    async fn test_events_delivered_in_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(recorder(seen.clone()));

        let report = bus.publish(&[event(0), event(1), event(2)]).await;

        assert!(report.is_clean());
        assert_eq!(report.delivered, 3);
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_failing_listener_does_not_block_others() {
        let bus = EventBus::new();
        bus.subscribe(Arc::new(FnListener::new("broken", |_: &EventEnvelope| {
            Err(ListenerError::Failed("boom".to_string()))
        })));
        let seen = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(recorder(seen.clone()));

        let report = bus.publish(&[event(0), event(1)]).await;

        assert_eq!(report.delivered, 2);
        assert_eq!(report.failures.len(), 2);
        assert_eq!(report.failures[0].listener, "broken");
        assert!(report.failures[0].error.contains("boom"));
        assert_eq!(*seen.lock().unwrap(), vec![0, 1]);
    }

    #[tokio::test]
    async fn test_panicking_listener_is_reported_as_failure() {
        let bus = EventBus::new();
        bus.subscribe(Arc::new(FnListener::new("panicky", |_: &EventEnvelope| {
            panic!("listener bug")
        })));
        let seen = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(recorder(seen.clone()));

        let report = bus.publish(&[event(0), event(1)]).await;

        assert_eq!(report.delivered, 2);
        assert_eq!(report.failures.len(), 2);
        assert_eq!(report.failures[0].listener, "panicky");
        assert!(report.failures[0].error.contains("panicked"));
        assert_eq!(*seen.lock().unwrap(), vec![0, 1]);
    }

    #[tokio::test]
    async fn test_unsubscribed_listener_receives_nothing() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let id = bus.subscribe(recorder(seen.clone()));

        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        assert_eq!(bus.listener_count(), 0);

        let report = bus.publish(&[event(0)]).await;
        assert_eq!(report.delivered, 0);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_publish_with_no_listeners() {
        let bus = EventBus::new();
        let report = bus.publish(&[event(0)]).await;
        assert!(report.is_clean());
        assert_eq!(report.delivered, 0);
    }
}
