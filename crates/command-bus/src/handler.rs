//! Command handlers.
//!
//! The bus stores handlers behind the object-safe [`CommandHandler`] trait.
//! [`AggregateHandler`] is the usual implementation: it rebuilds one
//! aggregate type from the store and runs a decision function against it.

use async_trait::async_trait;
use common::AggregateId;
use domain::{Aggregate, AutoSnapshot, Command, Rehydrated, build_envelopes};
use event_store::{EventEnvelope, EventStore, Sequence};

use crate::error::{BoxError, DispatchError, Violation};

/// What a handler decided for one command.
#[derive(Debug, Clone, Default)]
pub struct Decision {
    /// Last sequence of the aggregate as loaded; the append expects it.
    pub loaded_last: Option<Sequence>,

    /// Events to append, continuing the stream after `loaded_last`.
    pub events: Vec<EventEnvelope>,
}

/// A handler for one or more command types.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Loads the target aggregate and decides which events the command
    /// produces. Must not write to the store.
    async fn decide(&self, store: &dyn EventStore, command: &Command)
    -> Result<Decision, DispatchError>;

    /// Called after the decided events were appended.
    async fn appended(&self, _aggregate_id: &AggregateId, _before: Option<Sequence>, _after: Sequence) {
    }
}

type DecideFn<A> = dyn Fn(&A, &Command) -> Result<Vec<<A as Aggregate>::Event>, BoxError> + Send + Sync;

/// Runs a decision function against a rehydrated aggregate.
pub struct AggregateHandler<A: Aggregate> {
    decide: Box<DecideFn<A>>,
    requires_existing: bool,
    snapshots: Option<AutoSnapshot<A>>,
}

impl<A: Aggregate> AggregateHandler<A> {
    /// Handler for commands that may target a new aggregate.
    pub fn new<F>(decide: F) -> Self
    where
        F: Fn(&A, &Command) -> Result<Vec<A::Event>, BoxError> + Send + Sync + 'static,
    {
        Self {
            decide: Box::new(decide),
            requires_existing: false,
            snapshots: None,
        }
    }

    /// Handler for commands that fail with `AggregateNotFound` on an empty
    /// stream.
    pub fn existing<F>(decide: F) -> Self
    where
        F: Fn(&A, &Command) -> Result<Vec<A::Event>, BoxError> + Send + Sync + 'static,
    {
        Self {
            requires_existing: true,
            ..Self::new(decide)
        }
    }

    /// Snapshots the aggregate according to `snapshots` after each append.
    pub fn with_snapshots(mut self, snapshots: AutoSnapshot<A>) -> Self {
        self.snapshots = Some(snapshots);
        self
    }
}

#[async_trait]
impl<A: Aggregate> CommandHandler for AggregateHandler<A> {
    async fn decide(
        &self,
        store: &dyn EventStore,
        command: &Command,
    ) -> Result<Decision, DispatchError> {
        if command.aggregate_type != A::aggregate_type() {
            return Err(DispatchError::ValidationFailed(vec![Violation::new(
                "aggregate_type",
                format!("must be {}, got {}", A::aggregate_type(), command.aggregate_type),
            )]));
        }

        let aggregate_id = &command.aggregate_id;
        let loaded = Rehydrated::<A>::load(store, aggregate_id).await?;

        if self.requires_existing && !loaded.exists() {
            return Err(DispatchError::AggregateNotFound {
                aggregate_type: A::aggregate_type().to_string(),
                aggregate_id: aggregate_id.clone(),
            });
        }

        if let Some(expected) = command.expected_sequence
            && loaded.last_sequence != Some(expected)
        {
            return Err(DispatchError::ConcurrencyConflict {
                aggregate_id: aggregate_id.clone(),
                expected: Some(expected),
                actual: loaded.last_sequence,
            });
        }

        let events = (self.decide)(&loaded.state, command).map_err(DispatchError::HandlerError)?;
        let events = build_envelopes::<A>(aggregate_id, loaded.last_sequence, &events)?;

        Ok(Decision {
            loaded_last: loaded.last_sequence,
            events,
        })
    }

    async fn appended(&self, aggregate_id: &AggregateId, before: Option<Sequence>, after: Sequence) {
        if let Some(snapshots) = &self.snapshots {
            snapshots.after_append(aggregate_id, before, after).await;
        }
    }
}
