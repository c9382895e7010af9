use std::pin::Pin;

use async_trait::async_trait;
use futures_core::Stream;
use futures_util::TryStreamExt;

use crate::{AggregateId, EventEnvelope, EventStoreError, Result, Sequence, Snapshot};

/// A lazy, ordered, finite stream of events.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<EventEnvelope>> + Send>>;

/// The most recent snapshot of an aggregate plus the events recorded after it.
#[derive(Debug, Clone, Default)]
pub struct SnapshotAndTail {
    /// Latest snapshot, if one was ever taken.
    pub snapshot: Option<Snapshot>,

    /// Events after the snapshot (or the whole stream without one).
    pub events: Vec<EventEnvelope>,
}

impl SnapshotAndTail {
    /// Last sequence covered by the snapshot and the tail together.
    pub fn last_sequence(&self) -> Option<Sequence> {
        self.events
            .last()
            .map(|e| e.sequence)
            .or_else(|| self.snapshot.as_ref().map(|s| s.sequence))
    }

    /// Returns true if the aggregate has no history at all.
    pub fn is_empty(&self) -> bool {
        self.snapshot.is_none() && self.events.is_empty()
    }
}

/// Core trait for event store backends.
///
/// The store is the only component allowed to change an aggregate's persisted
/// history. Implementations must be thread-safe and must never expose a
/// partially written batch to readers.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Appends a batch of events to an aggregate's stream.
    ///
    /// `expected_last` is the sequence of the stream's last event as the
    /// caller saw it, `None` meaning the stream must still be empty. A
    /// mismatch fails with `ConcurrencyConflict` and leaves the stream
    /// untouched. The batch is appended atomically and must continue the
    /// stream contiguously.
    ///
    /// Returns the sequence of the last appended event.
    async fn append_events(
        &self,
        aggregate_id: &AggregateId,
        expected_last: Option<Sequence>,
        events: Vec<EventEnvelope>,
    ) -> Result<Sequence>;

    /// Streams the aggregate's events starting at `from`, in sequence order.
    ///
    /// The stream ends at the last event committed when the call was made.
    /// Reading again from the same position yields the same events.
    async fn read_stream(&self, aggregate_id: &AggregateId, from: Sequence)
    -> Result<EventStream>;

    /// Sequence of the aggregate's last event, `None` if it has no events.
    async fn last_sequence(&self, aggregate_id: &AggregateId) -> Result<Option<Sequence>>;

    /// Records a snapshot. The snapshot may not be ahead of the stream.
    async fn save_snapshot(&self, snapshot: Snapshot) -> Result<()>;

    /// Returns the most recent snapshot of an aggregate.
    async fn latest_snapshot(&self, aggregate_id: &AggregateId) -> Result<Option<Snapshot>>;

    /// Returns the latest snapshot (if any) and the events after it.
    async fn read_stream_with_snapshot(&self, aggregate_id: &AggregateId) -> Result<SnapshotAndTail> {
        let snapshot = self.latest_snapshot(aggregate_id).await?;
        let from = snapshot
            .as_ref()
            .map_or(Sequence::first(), Snapshot::resume_from);
        let events = self.read_stream(aggregate_id, from).await?.try_collect().await?;
        Ok(SnapshotAndTail { snapshot, events })
    }
}

/// Extension trait providing convenience methods for event stores.
#[async_trait]
pub trait EventStoreExt: EventStore {
    /// Collects the aggregate's whole stream.
    async fn read_all(&self, aggregate_id: &AggregateId) -> Result<Vec<EventEnvelope>> {
        self.read_stream(aggregate_id, Sequence::first())
            .await?
            .try_collect()
            .await
    }

    /// Checks if an aggregate exists (has any events).
    async fn aggregate_exists(&self, aggregate_id: &AggregateId) -> Result<bool> {
        Ok(self.last_sequence(aggregate_id).await?.is_some())
    }
}

impl<T: EventStore + ?Sized> EventStoreExt for T {}

#[async_trait]
impl<T: EventStore + ?Sized> EventStore for std::sync::Arc<T> {
    async fn append_events(
        &self,
        aggregate_id: &AggregateId,
        expected_last: Option<Sequence>,
        events: Vec<EventEnvelope>,
    ) -> Result<Sequence> {
        (**self).append_events(aggregate_id, expected_last, events).await
    }

    async fn read_stream(
        &self,
        aggregate_id: &AggregateId,
        from: Sequence,
    ) -> Result<EventStream> {
        (**self).read_stream(aggregate_id, from).await
    }

    async fn last_sequence(&self, aggregate_id: &AggregateId) -> Result<Option<Sequence>> {
        (**self).last_sequence(aggregate_id).await
    }

    async fn save_snapshot(&self, snapshot: Snapshot) -> Result<()> {
        (**self).save_snapshot(snapshot).await
    }

    async fn latest_snapshot(&self, aggregate_id: &AggregateId) -> Result<Option<Snapshot>> {
        (**self).latest_snapshot(aggregate_id).await
    }

    async fn read_stream_with_snapshot(&self, aggregate_id: &AggregateId) -> Result<SnapshotAndTail> {
        (**self).read_stream_with_snapshot(aggregate_id).await
    }
}

/// Checks a batch before any backend touches storage.
///
/// The batch must be non-empty, target `aggregate_id` only, share one
/// aggregate type and start right after `expected_last` with no gaps.
pub fn validate_batch(
    aggregate_id: &AggregateId,
    expected_last: Option<Sequence>,
    events: &[EventEnvelope],
) -> Result<()> {
    if aggregate_id.is_empty() {
        return Err(EventStoreError::InvalidBatch(
            "aggregate id must not be empty".to_string(),
        ));
    }
    let Some(first) = events.first() else {
        return Err(EventStoreError::InvalidBatch(
            "cannot append an empty batch".to_string(),
        ));
    };

    let mut expected = Sequence::after(expected_last);
    for event in events {
        if &event.aggregate_id != aggregate_id {
            return Err(EventStoreError::InvalidBatch(format!(
                "event {} belongs to aggregate {}, not {}",
                event.event_id, event.aggregate_id, aggregate_id
            )));
        }
        if event.aggregate_type != first.aggregate_type {
            return Err(EventStoreError::InvalidBatch(
                "all events must have the same aggregate type".to_string(),
            ));
        }
        if event.sequence != expected {
            return Err(EventStoreError::NonContiguous {
                aggregate_id: aggregate_id.clone(),
                expected,
                found: event.sequence,
            });
        }
        expected = expected.next();
    }

    Ok(())
}

/// Checks that a snapshot does not claim events beyond the stream's end.
pub(crate) fn validate_snapshot(snapshot: &Snapshot, last: Option<Sequence>) -> Result<()> {
    match last {
        Some(last) if snapshot.sequence <= last => Ok(()),
        _ => Err(EventStoreError::SnapshotAhead {
            aggregate_id: snapshot.aggregate_id.clone(),
            snapshot: snapshot.sequence,
            last,
        }),
    }
}
