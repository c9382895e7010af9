//! Assembly of the backbone from its configuration.

use std::sync::Arc;
use std::time::Duration;

use command_bus::{CommandBus, CommandGateway, CorrelationInterceptor, LoggingInterceptor};
use domain::account::Account;
use domain::{AutoSnapshot, BackgroundSnapshotter, SnapshotPolicy, SnapshotTrigger, Snapshotter};
use event_bus::{EventBus, ListenerId, QueuedListener};
use event_store::{DocumentEventStore, EventStore, LogFileEventStore};
use saga::{DocumentSagaRepository, InMemorySagaRepository, SagaManager, SagaRepository};
use tokio::task::JoinHandle;

use crate::account::{account_validation, register_account_handlers};
use crate::config::{Config, InterceptorKind, Profile};
use crate::error::BackboneError;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// The wired components: store, saga repository, event bus, command bus,
/// gateway and snapshotter.
pub struct Backbone {
    config: Config,
    store: Arc<dyn EventStore>,
    sagas: Arc<dyn SagaRepository>,
    events: Arc<EventBus>,
    bus: Arc<CommandBus>,
    gateway: Arc<CommandGateway>,
    saga_listeners: Vec<(ListenerId, JoinHandle<()>)>,
    snapshot_task: Option<JoinHandle<()>>,
}

impl Backbone {
    /// Opens the storage of the configured profile and wires the account
    /// handlers behind the configured interceptors.
    #[tracing::instrument(skip(config), fields(profile = %config.profile))]
    pub async fn build(config: Config) -> Result<Self, BackboneError> {
        let (store, sagas): (Arc<dyn EventStore>, Arc<dyn SagaRepository>) = match &config.profile
        {
            Profile::Embedded { events_dir } => (
                Arc::new(LogFileEventStore::open(events_dir.clone()).await?),
                Arc::new(InMemorySagaRepository::new()),
            ),
            Profile::DocumentStore { database_url } => {
                let store = DocumentEventStore::connect(database_url).await?;
                store.ensure_schema().await?;
                let sagas = DocumentSagaRepository::new(store.pool().clone());
                sagas.ensure_schema().await?;
                (Arc::new(store), Arc::new(sagas))
            }
        };

        let events = Arc::new(EventBus::new());

        let mut builder = CommandBus::builder(store.clone(), events.clone());
        let interceptors = config.interceptor_chain();
        for kind in &interceptors {
            builder = match kind {
                InterceptorKind::Validation => builder.interceptor(account_validation()),
                InterceptorKind::Correlation => builder.interceptor(CorrelationInterceptor),
                InterceptorKind::Logging => builder.interceptor(LoggingInterceptor),
            };
        }
        let bus = builder.build();

        let (snapshots, snapshot_task) = match SnapshotPolicy::every(config.snapshot_every) {
            SnapshotPolicy::Never => (None, None),
            policy => {
                let (background, task) = BackgroundSnapshotter::spawn(
                    Snapshotter::<Account>::new(store.clone()),
                    config.queue_capacity,
                );
                let trigger = SnapshotTrigger::Background(background);
                (Some(AutoSnapshot::new(policy, trigger)), Some(task))
            }
        };
        register_account_handlers(&bus, snapshots);

        let bus = Arc::new(bus);
        let gateway = Arc::new(CommandGateway::start(bus.clone(), config.gateway()));

        tracing::info!(
            ?interceptors,
            snapshot_every = config.snapshot_every,
            "backbone ready"
        );

        Ok(Self {
            config,
            store,
            sagas,
            events,
            bus,
            gateway,
            saga_listeners: Vec::new(),
            snapshot_task,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    pub fn saga_repository(&self) -> &Arc<dyn SagaRepository> {
        &self.sagas
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn bus(&self) -> &Arc<CommandBus> {
        &self.bus
    }

    pub fn gateway(&self) -> &Arc<CommandGateway> {
        &self.gateway
    }

    /// A saga manager over this backbone's repository, with no sagas yet.
    pub fn saga_manager(&self) -> SagaManager {
        SagaManager::new(self.sagas.clone())
    }

    /// Subscribes `manager` to the event bus on its own task, so saga work
    /// never runs on the dispatching worker.
    pub fn run_sagas(&mut self, manager: SagaManager) {
        let sagas: Vec<String> = manager.saga_types().map(str::to_string).collect();
        let (listener, task) = QueuedListener::spawn(Arc::new(manager), self.config.queue_capacity);
        let id = self.events.subscribe(Arc::new(listener));
        tracing::info!(listener = %id, ?sagas, "sagas running");
        self.saga_listeners.push((id, task));
    }

    /// Drains the gateway, then the saga queues, then pending snapshots.
    pub async fn shutdown(self) {
        let Backbone {
            events,
            bus,
            gateway,
            saga_listeners,
            snapshot_task,
            ..
        } = self;

        gateway.shutdown().await;

        for (id, task) in saga_listeners {
            events.unsubscribe(id);
            if let Err(err) = task.await {
                tracing::warn!(listener = %id, error = %err, "saga listener task failed");
            }
        }

        // The snapshot queue closes once the handlers holding it are gone.
        drop(bus);
        drop(gateway);
        if let Some(task) = snapshot_task
            && tokio::time::timeout(SHUTDOWN_GRACE, task).await.is_err()
        {
            tracing::warn!("background snapshotter still busy at shutdown");
        }

        tracing::info!("backbone stopped");
    }
}
