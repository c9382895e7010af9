//! Snapshotting of aggregate state.
//!
//! Snapshots only shorten replay. The plain event stream is always enough to
//! rebuild an aggregate, so a snapshot that is skipped, delayed or fails to
//! be written never affects correctness.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use common::AggregateId;
use event_store::{EventStore, Sequence, Snapshot};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::aggregate::{Aggregate, Rehydrated};
use crate::error::DomainError;

/// When a snapshot becomes due.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SnapshotPolicy {
    /// Never snapshot automatically.
    #[default]
    Never,

    /// Snapshot whenever an append crosses a multiple of `n` events.
    EveryNEvents(u64),
}

impl SnapshotPolicy {
    /// Builds a policy from an interval, `0` meaning never.
    pub fn every(n: u64) -> Self {
        if n == 0 {
            SnapshotPolicy::Never
        } else {
            SnapshotPolicy::EveryNEvents(n)
        }
    }

    /// Returns whether an append that moved the stream from `before` to
    /// `after` makes a snapshot due.
    pub fn is_due(&self, before: Option<Sequence>, after: Sequence) -> bool {
        match *self {
            SnapshotPolicy::Never => false,
            SnapshotPolicy::EveryNEvents(n) => {
                let count_before = before.map_or(0, |s| s.as_u64() + 1);
                let count_after = after.as_u64() + 1;
                count_after / n > count_before / n
            }
        }
    }
}

/// Rebuilds an aggregate and records its state as a snapshot.
pub struct Snapshotter<A> {
    store: Arc<dyn EventStore>,
    _aggregate: PhantomData<fn() -> A>,
}

impl<A> Clone for Snapshotter<A> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            _aggregate: PhantomData,
        }
    }
}

impl<A> fmt::Debug for Snapshotter<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshotter")
            .field("aggregate", &std::any::type_name::<A>())
            .finish()
    }
}

impl<A: Aggregate> Snapshotter<A> {
    /// Creates a snapshotter over `store`.
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self {
            store,
            _aggregate: PhantomData,
        }
    }

    /// Replays the aggregate from its latest snapshot and writes a new one at
    /// the stream's current last sequence.
    ///
    /// Returns `Ok(None)` when the stream is empty or the latest snapshot is
    /// already current.
    #[tracing::instrument(skip(self), fields(aggregate_type = A::aggregate_type()))]
    pub async fn snapshot(&self, aggregate_id: &AggregateId) -> Result<Option<Snapshot>, DomainError> {
        let history = self.store.read_stream_with_snapshot(aggregate_id).await?;
        if history.events.is_empty() {
            return Ok(None);
        }

        let rebuilt = Rehydrated::<A>::from_history(history)?;
        let Some(sequence) = rebuilt.last_sequence else {
            return Ok(None);
        };

        let snapshot = Snapshot::capture(
            aggregate_id.clone(),
            A::aggregate_type(),
            sequence,
            &rebuilt.state,
        )?;
        self.store.save_snapshot(snapshot.clone()).await?;

        metrics::counter!("snapshots_taken_total", "aggregate_type" => A::aggregate_type())
            .increment(1);
        tracing::debug!(%aggregate_id, %sequence, "snapshot taken");

        Ok(Some(snapshot))
    }
}

/// Runs snapshots on a background task, off the dispatch path.
///
/// Requests are queued on a bounded channel. When the queue is full the
/// request is dropped: the next due append will ask again.
#[derive(Debug, Clone)]
pub struct BackgroundSnapshotter {
    aggregate_type: &'static str,
    tx: mpsc::Sender<AggregateId>,
}

impl BackgroundSnapshotter {
    /// Spawns the background task. It stops once every handle is dropped.
    pub fn spawn<A: Aggregate>(
        snapshotter: Snapshotter<A>,
        capacity: usize,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<AggregateId>(capacity.max(1));

        let task = tokio::spawn(async move {
            while let Some(aggregate_id) = rx.recv().await {
                if let Err(err) = snapshotter.snapshot(&aggregate_id).await {
                    tracing::warn!(%aggregate_id, error = %err, "background snapshot failed");
                }
            }
            tracing::debug!(aggregate_type = A::aggregate_type(), "background snapshotter stopped");
        });

        (
            Self {
                aggregate_type: A::aggregate_type(),
                tx,
            },
            task,
        )
    }

    /// Queues a snapshot request without waiting. Returns false if it was
    /// dropped.
    pub fn request(&self, aggregate_id: &AggregateId) -> bool {
        match self.tx.try_send(aggregate_id.clone()) {
            Ok(()) => true,
            Err(err) => {
                tracing::debug!(%aggregate_id, error = %err, "snapshot request dropped");
                metrics::counter!("snapshot_requests_dropped_total", "aggregate_type" => self.aggregate_type)
                    .increment(1);
                false
            }
        }
    }
}

/// Where a due snapshot is taken.
pub enum SnapshotTrigger<A> {
    /// On the dispatching task, right after the append.
    Inline(Snapshotter<A>),

    /// On a background task.
    Background(BackgroundSnapshotter),
}

impl<A> Clone for SnapshotTrigger<A> {
    fn clone(&self) -> Self {
        match self {
            SnapshotTrigger::Inline(snapshotter) => SnapshotTrigger::Inline(snapshotter.clone()),
            SnapshotTrigger::Background(background) => SnapshotTrigger::Background(background.clone()),
        }
    }
}

/// Snapshot policy and trigger attached to one aggregate type.
pub struct AutoSnapshot<A> {
    policy: SnapshotPolicy,
    trigger: SnapshotTrigger<A>,
}

impl<A> Clone for AutoSnapshot<A> {
    fn clone(&self) -> Self {
        Self {
            policy: self.policy,
            trigger: self.trigger.clone(),
        }
    }
}

impl<A: Aggregate> AutoSnapshot<A> {
    pub fn new(policy: SnapshotPolicy, trigger: SnapshotTrigger<A>) -> Self {
        Self { policy, trigger }
    }

    pub fn policy(&self) -> SnapshotPolicy {
        self.policy
    }

    /// Takes or schedules a snapshot if the append from `before` to `after`
    /// made one due. Failures are logged and never returned.
    pub async fn after_append(
        &self,
        aggregate_id: &AggregateId,
        before: Option<Sequence>,
        after: Sequence,
    ) {
        if !self.policy.is_due(before, after) {
            return;
        }
        match &self.trigger {
            SnapshotTrigger::Inline(snapshotter) => {
                if let Err(err) = snapshotter.snapshot(aggregate_id).await {
                    tracing::warn!(%aggregate_id, error = %err, "inline snapshot failed");
                }
            }
            SnapshotTrigger::Background(background) => {
                background.request(aggregate_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::{Account, AccountEvent};
    use crate::aggregate::build_envelopes;
    use event_store::{EventStoreExt, LogFileEventStore};

    async fn store_with_history(
        dir: &std::path::Path,
        deposits: u64,
    ) -> (Arc<dyn EventStore>, AggregateId) {
        let store: Arc<dyn EventStore> = Arc::new(LogFileEventStore::open(dir).await.unwrap());
        let id = AggregateId::new("A1");

        let mut events = vec![AccountEvent::AccountOpened {
            owner: "bob".to_string(),
        }];
        events.extend((1..=deposits).map(|amount| AccountEvent::AmountDeposited {
            amount: amount as i64,
        }));
        let envelopes = build_envelopes::<Account>(&id, None, &events).unwrap();
        store.append_events(&id, None, envelopes).await.unwrap();

        (store, id)
    }

    #[test]
    fn policy_fires_when_crossing_a_multiple() {
        let policy = SnapshotPolicy::every(3);
        // Stream of 1..=2 events: not due.
        assert!(!policy.is_due(None, Sequence::new(1)));
        // Third event crosses the first multiple.
        assert!(policy.is_due(Some(Sequence::new(1)), Sequence::new(2)));
        // A batch jumping from 2 events to 7 crosses 3 and 6.
        assert!(policy.is_due(Some(Sequence::new(1)), Sequence::new(6)));
        assert!(!policy.is_due(Some(Sequence::new(2)), Sequence::new(4)));

        assert!(!SnapshotPolicy::every(0).is_due(None, Sequence::new(1000)));
        assert_eq!(SnapshotPolicy::every(0), SnapshotPolicy::Never);
    }

    #[tokio::test]
    async fn snapshot_of_empty_stream_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn EventStore> =
            Arc::new(LogFileEventStore::open(dir.path()).await.unwrap());
        let snapshotter = Snapshotter::<Account>::new(store);

        let taken = snapshotter.snapshot(&AggregateId::new("none")).await.unwrap();
        assert!(taken.is_none());
    }

    #[tokio::test]
    async fn snapshot_is_taken_at_last_sequence_once() {
        let dir = tempfile::tempdir().unwrap();
        let (store, id) = store_with_history(dir.path(), 4).await;
        let snapshotter = Snapshotter::<Account>::new(store.clone());

        let snapshot = snapshotter.snapshot(&id).await.unwrap().unwrap();
        assert_eq!(snapshot.sequence, Sequence::new(4));
        assert_eq!(snapshot.aggregate_type, "Account");

        // Already current.
        assert!(snapshotter.snapshot(&id).await.unwrap().is_none());
        assert_eq!(store.latest_snapshot(&id).await.unwrap(), Some(snapshot));
    }

    #[tokio::test]
    async fn snapshot_replay_matches_full_replay() {
        let dir = tempfile::tempdir().unwrap();
        let (store, id) = store_with_history(dir.path(), 6).await;
        Snapshotter::<Account>::new(store.clone())
            .snapshot(&id)
            .await
            .unwrap();

        let more = build_envelopes::<Account>(
            &id,
            Some(Sequence::new(6)),
            &[AccountEvent::AmountDeposited { amount: 100 }],
        )
        .unwrap();
        store.append_events(&id, Some(Sequence::new(6)), more).await.unwrap();

        let with_snapshot = Rehydrated::<Account>::load(store.as_ref(), &id).await.unwrap();
        let full = Rehydrated::<Account>::replay(&store.read_all(&id).await.unwrap()).unwrap();

        assert_eq!(with_snapshot.state, full.state);
        assert_eq!(with_snapshot.last_sequence, Some(Sequence::new(7)));
        assert_eq!(full.state.balance(), 121);
    }

    #[tokio::test]
    async fn inline_trigger_snapshots_when_due() {
        let dir = tempfile::tempdir().unwrap();
        let (store, id) = store_with_history(dir.path(), 2).await;
        let auto = AutoSnapshot::new(
            SnapshotPolicy::every(3),
            SnapshotTrigger::Inline(Snapshotter::<Account>::new(store.clone())),
        );

        auto.after_append(&id, Some(Sequence::new(0)), Sequence::new(1)).await;
        assert!(store.latest_snapshot(&id).await.unwrap().is_none());

        auto.after_append(&id, Some(Sequence::new(1)), Sequence::new(2)).await;
        let snapshot = store.latest_snapshot(&id).await.unwrap().unwrap();
        assert_eq!(snapshot.sequence, Sequence::new(2));
    }

    #[tokio::test]
    async fn background_snapshotter_drains_requests() {
        let dir = tempfile::tempdir().unwrap();
        let (store, id) = store_with_history(dir.path(), 3).await;
        let (background, task) =
            BackgroundSnapshotter::spawn(Snapshotter::<Account>::new(store.clone()), 8);

        assert!(background.request(&id));
        drop(background);
        task.await.unwrap();

        let snapshot = store.latest_snapshot(&id).await.unwrap().unwrap();
        assert_eq!(snapshot.sequence, Sequence::new(3));
    }
}
