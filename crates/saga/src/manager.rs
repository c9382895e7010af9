//! Event-driven saga dispatch.
//!
//! A [`Saga`] declares how events correlate to its instances and what it does
//! with them. The [`SagaManager`] subscribes to the event bus, finds the
//! instances an event belongs to (starting one when the saga asks for it),
//! runs the saga and persists the result through a [`SagaRepository`].

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use common::SagaId;
use event_bus::{EventListener, ListenerError};
use event_store::EventEnvelope;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::instance::{Association, SagaInstance};
use crate::repository::SagaRepository;
use crate::{Result, SagaError};

const MAX_ATTEMPTS: usize = 3;

/// What a running saga may change about its own instance.
#[derive(Debug)]
pub struct SagaContext {
    saga_id: SagaId,
    associations: BTreeSet<Association>,
    ended: bool,
}

impl SagaContext {
    pub fn saga_id(&self) -> SagaId {
        self.saga_id
    }

    /// Routes future events carrying `key = value` to this instance.
    pub fn associate(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.associations.insert(Association::new(key, value));
    }

    /// Stops routing `key = value` to this instance.
    pub fn dissociate(&mut self, key: &str, value: &str) -> bool {
        self.associations.remove(&Association::new(key, value))
    }

    pub fn associations(&self) -> impl Iterator<Item = &Association> {
        self.associations.iter()
    }

    /// Ends the saga once the current event is handled.
    pub fn end(&mut self) {
        self.ended = true;
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }
}

/// A long-running process reacting to events across aggregates.
///
/// Collaborators such as a command gateway are handed to the saga when it is
/// constructed; instances only carry serializable [`Saga::State`].
#[async_trait]
pub trait Saga: Send + Sync + 'static {
    type State: Serialize + DeserializeOwned + Default + Send + Sync;

    /// Name instances of this saga are stored under.
    fn saga_type(&self) -> &str;

    /// Extracts the association an event is routed by, if the saga cares
    /// about it at all.
    fn correlation(&self, event: &EventEnvelope) -> Option<Association>;

    /// Returns true if the event starts a new instance when none matches.
    fn starts_on(&self, event: &EventEnvelope) -> bool;

    /// Handles one correlated event.
    async fn handle(
        &self,
        state: &mut Self::State,
        event: &EventEnvelope,
        ctx: &mut SagaContext,
    ) -> Result<()>;
}

#[async_trait]
trait ErasedSaga: Send + Sync {
    fn saga_type(&self) -> &str;

    fn correlation(&self, event: &EventEnvelope) -> Option<Association>;

    fn starts_on(&self, event: &EventEnvelope) -> bool;

    fn new_instance(&self) -> Result<SagaInstance>;

    async fn handle_instance(&self, instance: &mut SagaInstance, event: &EventEnvelope)
    -> Result<()>;
}

struct SagaWrapper<S> {
    saga: S,
}

#[async_trait]
impl<S: Saga> ErasedSaga for SagaWrapper<S> {
    fn saga_type(&self) -> &str {
        self.saga.saga_type()
    }

    fn correlation(&self, event: &EventEnvelope) -> Option<Association> {
        self.saga.correlation(event)
    }

    fn starts_on(&self, event: &EventEnvelope) -> bool {
        self.saga.starts_on(event)
    }

    fn new_instance(&self) -> Result<SagaInstance> {
        SagaInstance::new(self.saga.saga_type(), &S::State::default())
    }

    async fn handle_instance(
        &self,
        instance: &mut SagaInstance,
        event: &EventEnvelope,
    ) -> Result<()> {
        let mut state: S::State = instance.state_as()?;
        let mut ctx = SagaContext {
            saga_id: instance.saga_id,
            associations: instance.associations.clone(),
            ended: false,
        };

        self.saga.handle(&mut state, event, &mut ctx).await?;

        instance.set_state(&state)?;
        instance.associations = ctx.associations;
        if ctx.ended {
            instance.end();
        }
        Ok(())
    }
}

/// Routes published events to saga instances.
pub struct SagaManager {
    repository: Arc<dyn SagaRepository>,
    sagas: Vec<Arc<dyn ErasedSaga>>,
}

impl SagaManager {
    pub fn new(repository: Arc<dyn SagaRepository>) -> Self {
        Self {
            repository,
            sagas: Vec::new(),
        }
    }

    /// Registers a saga.
    pub fn register<S: Saga>(mut self, saga: S) -> Self {
        self.sagas.push(Arc::new(SagaWrapper { saga }));
        self
    }

    pub fn repository(&self) -> &Arc<dyn SagaRepository> {
        &self.repository
    }

    /// Types of the registered sagas, in registration order.
    pub fn saga_types(&self) -> impl Iterator<Item = &str> {
        self.sagas.iter().map(|saga| saga.saga_type())
    }

    /// Runs every registered saga against one event.
    ///
    /// A failing saga does not keep the others from seeing the event; the
    /// first failure is returned once all of them ran.
    #[tracing::instrument(skip(self, event), fields(event_type = %event.event_type, aggregate_id = %event.aggregate_id))]
    pub async fn handle_event(&self, event: &EventEnvelope) -> Result<()> {
        let mut first_error = None;
        for saga in &self.sagas {
            if let Err(err) = self.dispatch(saga.as_ref(), event).await {
                tracing::warn!(saga_type = saga.saga_type(), error = %err, "saga failed to handle event");
                metrics::counter!("saga_failures_total", "saga_type" => saga.saga_type().to_string())
                    .increment(1);
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn dispatch(&self, saga: &dyn ErasedSaga, event: &EventEnvelope) -> Result<()> {
        let Some(association) = saga.correlation(event) else {
            return Ok(());
        };

        let mut attempt = 1;
        loop {
            match self.try_dispatch(saga, event, &association).await {
                Err(err) if err.is_retryable() && attempt < MAX_ATTEMPTS => {
                    tracing::debug!(saga_type = saga.saga_type(), attempt, error = %err, "reloading saga");
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    async fn try_dispatch(
        &self,
        saga: &dyn ErasedSaga,
        event: &EventEnvelope,
        association: &Association,
    ) -> Result<()> {
        let ids = self
            .repository
            .find(saga.saga_type(), &association.key, &association.value)
            .await?;

        if ids.is_empty() {
            if !saga.starts_on(event) {
                return Ok(());
            }
            let mut instance = saga.new_instance()?;
            instance.associate(association.clone());
            return self.run(saga, instance, event, true).await;
        }

        for saga_id in ids {
            // Ended between find and load.
            let Some(instance) = self.repository.load(saga_id).await? else {
                continue;
            };
            if instance.is_active() {
                self.run(saga, instance, event, false).await?;
            }
        }
        Ok(())
    }

    async fn run(
        &self,
        saga: &dyn ErasedSaga,
        mut instance: SagaInstance,
        event: &EventEnvelope,
        started: bool,
    ) -> Result<()> {
        saga.handle_instance(&mut instance, event).await?;

        // An instance that starts and ends on the same event was never stored.
        if !(started && !instance.is_active()) {
            self.repository.save(&mut instance).await?;
        }

        let saga_type = saga.saga_type().to_string();
        if started {
            tracing::info!(saga_id = %instance.saga_id, saga_type = %saga_type, "saga started");
            metrics::counter!("saga_instances_started_total", "saga_type" => saga_type.clone())
                .increment(1);
        }
        if !instance.is_active() {
            tracing::info!(saga_id = %instance.saga_id, saga_type = %saga_type, "saga ended");
            metrics::counter!("saga_instances_ended_total", "saga_type" => saga_type).increment(1);
        }
        Ok(())
    }
}

#[async_trait]
impl EventListener for SagaManager {
    fn name(&self) -> &str {
        "saga-manager"
    }

    async fn on_event(&self, event: &EventEnvelope) -> event_bus::Result<()> {
        self.handle_event(event).await.map_err(|err| match err {
            SagaError::EventStore(err) => ListenerError::EventStore(err),
            SagaError::Serialization(err) => ListenerError::Deserialization(err),
            other => ListenerError::Failed(other.to_string()),
        })
    }
}
