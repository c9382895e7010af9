//! The command bus: interceptors, handler routing, append and publish.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

use common::AggregateId;
use domain::{CAUSATION_ID, COMMAND_TYPE, Command};
use event_bus::EventBus;
use event_store::{EventEnvelope, EventStore, Sequence};
use uuid::Uuid;

use crate::error::DispatchError;
use crate::handler::CommandHandler;
use crate::interceptor::{Interceptor, InterceptorChain};

/// Result of a successful dispatch.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    /// The aggregate the command targeted.
    pub aggregate_id: AggregateId,

    /// The events appended and published, possibly none.
    pub events: Vec<EventEnvelope>,

    /// Last sequence of the aggregate after the dispatch, `None` if the
    /// stream is still empty.
    pub last_sequence: Option<Sequence>,
}

/// Routes commands to exactly one handler per command type.
///
/// Dispatch runs the interceptor chain, lets the handler decide on the
/// aggregate's current state, appends the resulting events with optimistic
/// concurrency and publishes them. A concurrency conflict is returned to the
/// caller, never retried here.
pub struct CommandBus {
    store: Arc<dyn EventStore>,
    events: Arc<EventBus>,
    interceptors: InterceptorChain,
    handlers: RwLock<HashMap<String, Arc<dyn CommandHandler>>>,
}

/// Builder for [`CommandBus`]; the interceptor chain is fixed by `build`.
pub struct CommandBusBuilder {
    store: Arc<dyn EventStore>,
    events: Arc<EventBus>,
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl CommandBusBuilder {
    /// Appends an interceptor to the chain.
    pub fn interceptor(mut self, interceptor: impl Interceptor + 'static) -> Self {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    /// Appends an already shared interceptor to the chain.
    pub fn interceptor_arc(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn build(self) -> CommandBus {
        CommandBus {
            store: self.store,
            events: self.events,
            interceptors: InterceptorChain::new(self.interceptors),
            handlers: RwLock::new(HashMap::new()),
        }
    }
}

impl CommandBus {
    pub fn builder(store: Arc<dyn EventStore>, events: Arc<EventBus>) -> CommandBusBuilder {
        CommandBusBuilder {
            store,
            events,
            interceptors: Vec::new(),
        }
    }

    /// Creates a bus without interceptors.
    pub fn new(store: Arc<dyn EventStore>, events: Arc<EventBus>) -> Self {
        Self::builder(store, events).build()
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn interceptors(&self) -> &InterceptorChain {
        &self.interceptors
    }

    /// Registers the handler for `command_type`, replacing any previous one.
    pub fn subscribe(&self, command_type: impl Into<String>, handler: Arc<dyn CommandHandler>) {
        let command_type = command_type.into();
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        if handlers.insert(command_type.clone(), handler).is_some() {
            tracing::warn!(%command_type, "command handler replaced");
        } else {
            tracing::debug!(%command_type, "command handler subscribed");
        }
    }

    /// Removes the handler for `command_type`. Returns false if none was set.
    pub fn unsubscribe(&self, command_type: &str) -> bool {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(command_type)
            .is_some()
    }

    fn handler(&self, command_type: &str) -> Option<Arc<dyn CommandHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(command_type)
            .cloned()
    }

    /// Dispatches one command.
    #[tracing::instrument(
        skip(self, command),
        fields(command_type = %command.command_type, aggregate_id = %command.aggregate_id)
    )]
    pub async fn dispatch(&self, command: Command) -> Result<DispatchOutcome, DispatchError> {
        let started = Instant::now();
        let command_type = command.command_type.clone();

        let result = self.dispatch_inner(command).await;

        let outcome = match &result {
            Ok(_) => "ok",
            Err(err) => err.label(),
        };
        metrics::counter!(
            "commands_dispatched_total",
            "command_type" => command_type.clone(),
            "outcome" => outcome
        )
        .increment(1);
        metrics::histogram!("command_dispatch_duration_seconds", "command_type" => command_type)
            .record(started.elapsed().as_secs_f64());

        match &result {
            Ok(done) => tracing::debug!(events = done.events.len(), "command dispatched"),
            Err(err) => tracing::debug!(error = %err, "command failed"),
        }
        result
    }

    async fn dispatch_inner(&self, command: Command) -> Result<DispatchOutcome, DispatchError> {
        let command = self.interceptors.apply(command)?;

        let handler = self
            .handler(&command.command_type)
            .ok_or_else(|| DispatchError::NoHandlerFound(command.command_type.clone()))?;

        let decision = handler.decide(self.store.as_ref(), &command).await?;
        let aggregate_id = command.aggregate_id.clone();

        if decision.events.is_empty() {
            return Ok(DispatchOutcome {
                aggregate_id,
                events: Vec::new(),
                last_sequence: decision.loaded_last,
            });
        }

        let causation_id = Uuid::new_v4().to_string();
        let events: Vec<EventEnvelope> = decision
            .events
            .into_iter()
            .map(|mut event| {
                event.metadata.extend(command.metadata.clone());
                event
                    .metadata
                    .insert(COMMAND_TYPE.to_string(), command.command_type.clone());
                event
                    .metadata
                    .insert(CAUSATION_ID.to_string(), causation_id.clone());
                event
            })
            .collect();

        let last = self
            .store
            .append_events(&aggregate_id, decision.loaded_last, events.clone())
            .await?;

        let report = self.events.publish(&events).await;
        if !report.is_clean() {
            tracing::debug!(failures = report.failures.len(), "publish reported listener failures");
        }

        handler.appended(&aggregate_id, decision.loaded_last, last).await;

        Ok(DispatchOutcome {
            aggregate_id,
            events,
            last_sequence: Some(last),
        })
    }
}
