//! Core aggregate and domain event traits.

use common::AggregateId;
use event_store::{EventEnvelope, EventStore, Sequence, SnapshotAndTail};
use serde::{Serialize, de::DeserializeOwned};

use crate::error::DomainError;

/// Trait for domain events.
///
/// Domain events represent facts that have happened in the domain.
/// They are immutable and should be named in past tense.
pub trait DomainEvent: Serialize + DeserializeOwned + Send + Sync + Clone {
    /// Returns the event type name.
    ///
    /// Stored on the envelope and used by listeners and sagas for routing.
    fn event_type(&self) -> &'static str;
}

/// Trait for aggregates in an event-sourced system.
///
/// An aggregate is a consistency boundary identified by an id. Its state is
/// never stored directly: it is rebuilt by replaying its events, optionally
/// starting from a snapshot of a previous state.
///
/// The state must serialize losslessly, since snapshots are taken by
/// serializing it and restored by deserializing it.
pub trait Aggregate: Default + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// The type of events this aggregate produces and consumes.
    type Event: DomainEvent;

    /// Returns the aggregate type name.
    fn aggregate_type() -> &'static str;

    /// Applies an event to the aggregate, updating its state.
    ///
    /// This method must be pure and deterministic:
    /// - Given the same state and event, it must always produce the same new state
    /// - It must not have side effects
    /// - It must not fail (events represent facts that have happened)
    fn apply(&mut self, event: Self::Event);

    /// Applies multiple events in sequence.
    fn apply_events(&mut self, events: impl IntoIterator<Item = Self::Event>) {
        for event in events {
            self.apply(event);
        }
    }
}

/// An aggregate rebuilt from its history, together with the position it was
/// rebuilt up to.
#[derive(Debug, Clone, Default)]
pub struct Rehydrated<A> {
    /// Current state.
    pub state: A,

    /// Sequence of the last event folded into `state`, `None` for a new
    /// aggregate.
    pub last_sequence: Option<Sequence>,
}

impl<A: Aggregate> Rehydrated<A> {
    /// Loads the latest snapshot and the events after it from `store`.
    pub async fn load<S>(store: &S, aggregate_id: &AggregateId) -> Result<Self, DomainError>
    where
        S: EventStore + ?Sized,
    {
        let history = store.read_stream_with_snapshot(aggregate_id).await?;
        Self::from_history(history)
    }

    /// Restores the snapshot state (if any) and folds the tail over it.
    pub fn from_history(history: SnapshotAndTail) -> Result<Self, DomainError> {
        let last_sequence = history.last_sequence();
        let mut state = match history.snapshot {
            Some(snapshot) => snapshot.restore()?,
            None => A::default(),
        };
        for envelope in &history.events {
            state.apply(decode_event::<A>(envelope)?);
        }
        Ok(Self {
            state,
            last_sequence,
        })
    }

    /// Replays a full stream from the first event, ignoring snapshots.
    pub fn replay(events: &[EventEnvelope]) -> Result<Self, DomainError> {
        Self::from_history(SnapshotAndTail {
            snapshot: None,
            events: events.to_vec(),
        })
    }

    /// Returns true if at least one event has been recorded.
    pub fn exists(&self) -> bool {
        self.last_sequence.is_some()
    }
}

/// Decodes an envelope's payload into the aggregate's event type.
pub fn decode_event<A: Aggregate>(envelope: &EventEnvelope) -> Result<A::Event, DomainError> {
    Ok(envelope.payload_as()?)
}

/// Wraps domain events in envelopes continuing the stream after `last`.
pub fn build_envelopes<A: Aggregate>(
    aggregate_id: &AggregateId,
    last: Option<Sequence>,
    events: &[A::Event],
) -> Result<Vec<EventEnvelope>, DomainError> {
    let mut envelopes = Vec::with_capacity(events.len());
    let mut sequence = Sequence::after(last);

    for event in events {
        let envelope = EventEnvelope::builder()
            .aggregate_id(aggregate_id.clone())
            .aggregate_type(A::aggregate_type())
            .event_type(event.event_type())
            .sequence(sequence)
            .payload(event)?
            .build()?;
        envelopes.push(envelope);
        sequence = sequence.next();
    }

    Ok(envelopes)
}
