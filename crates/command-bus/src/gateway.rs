//! Command gateway backed by a per-aggregate worker pool.
//!
//! Each worker owns a bounded queue. A command goes to the worker chosen by
//! hashing its aggregate id, so commands for one aggregate are dispatched one
//! at a time and in submission order. A dispatch that panics is reported as
//! [`ErrorKind::Failed`] and the worker keeps serving its queue.

use std::collections::hash_map::DefaultHasher;
use std::any::Any;
use std::hash::{Hash, Hasher};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use common::AggregateId;
use domain::Command;
use futures_util::FutureExt;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::bus::{CommandBus, DispatchOutcome};
use crate::error::{ErrorKind, GatewayError};

/// Worker pool sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatewayConfig {
    /// Number of workers.
    pub workers: usize,

    /// Capacity of each worker's queue.
    pub queue_capacity: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 256,
        }
    }
}

/// Receives the failures of fire-and-forget commands.
pub type ErrorHandler = Arc<dyn Fn(&Command, &GatewayError) + Send + Sync>;

fn log_error() -> ErrorHandler {
    Arc::new(|command: &Command, err: &GatewayError| {
        tracing::warn!(
            command_type = %command.command_type,
            aggregate_id = %command.aggregate_id,
            kind = %err.kind,
            error = %err.message,
            "fire-and-forget command failed"
        );
    })
}

enum Reply {
    Wait(oneshot::Sender<Result<DispatchOutcome, GatewayError>>),
    Forget,
}

struct Job {
    command: Command,
    reply: Reply,
}

/// Entry point for command producers.
pub struct CommandGateway {
    queues: RwLock<Vec<mpsc::Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    error_handler: ErrorHandler,
}

impl CommandGateway {
    /// Starts the workers. Failures of fire-and-forget commands are logged.
    pub fn start(bus: Arc<CommandBus>, config: GatewayConfig) -> Self {
        Self::with_error_handler(bus, config, log_error())
    }

    /// Starts the workers with a custom handler for fire-and-forget failures.
    pub fn with_error_handler(
        bus: Arc<CommandBus>,
        config: GatewayConfig,
        error_handler: ErrorHandler,
    ) -> Self {
        let workers = config.workers.max(1);
        let mut queues = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);

        for index in 0..workers {
            let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
            queues.push(tx);
            handles.push(tokio::spawn(run_worker(
                index,
                bus.clone(),
                rx,
                error_handler.clone(),
            )));
        }

        tracing::info!(workers, queue_capacity = config.queue_capacity, "command gateway started");

        Self {
            queues: RwLock::new(queues),
            workers: Mutex::new(handles),
            error_handler,
        }
    }

    fn queue_for(&self, aggregate_id: &AggregateId) -> Option<mpsc::Sender<Job>> {
        let queues = self.queues.read().unwrap_or_else(PoisonError::into_inner);
        if queues.is_empty() {
            return None;
        }
        let mut hasher = DefaultHasher::new();
        aggregate_id.hash(&mut hasher);
        let index = (hasher.finish() % queues.len() as u64) as usize;
        Some(queues[index].clone())
    }

    fn closed() -> GatewayError {
        GatewayError::new(ErrorKind::Unavailable, "command gateway is shut down")
    }

    /// Dispatches a command and waits for its outcome.
    pub async fn send(&self, command: Command) -> Result<DispatchOutcome, GatewayError> {
        let queue = self.queue_for(&command.aggregate_id).ok_or_else(Self::closed)?;
        let (tx, rx) = oneshot::channel();

        queue
            .send(Job {
                command,
                reply: Reply::Wait(tx),
            })
            .await
            .map_err(|_| Self::closed())?;

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::new(
                ErrorKind::Unavailable,
                "worker stopped before replying",
            )),
        }
    }

    /// Like [`send`](Self::send), but stops waiting after `deadline`.
    ///
    /// A command that was already queued still runs to completion and may
    /// commit after the caller got `Timeout`.
    pub async fn send_with_timeout(
        &self,
        command: Command,
        deadline: Duration,
    ) -> Result<DispatchOutcome, GatewayError> {
        let described = command.to_string();
        tokio::time::timeout(deadline, self.send(command))
            .await
            .unwrap_or_else(|_| {
                metrics::counter!("gateway_timeouts_total").increment(1);
                Err(GatewayError::new(
                    ErrorKind::Timeout,
                    format!("no outcome for {described} within {deadline:?}"),
                ))
            })
    }

    /// Queues a command without waiting for it.
    ///
    /// Failures, including a full queue, go to the error handler only.
    pub fn send_and_forget(&self, command: Command) {
        let Some(queue) = self.queue_for(&command.aggregate_id) else {
            (self.error_handler)(&command, &Self::closed());
            return;
        };

        if let Err(err) = queue.try_send(Job {
            command,
            reply: Reply::Forget,
        }) {
            let (job, error) = match err {
                mpsc::error::TrySendError::Full(job) => (
                    job,
                    GatewayError::new(ErrorKind::Unavailable, "worker queue is full"),
                ),
                mpsc::error::TrySendError::Closed(job) => (job, Self::closed()),
            };
            metrics::counter!("gateway_rejected_total").increment(1);
            (self.error_handler)(&job.command, &error);
        }
    }

    /// Closes the queues and waits until every queued command has run.
    pub async fn shutdown(&self) {
        let queues = std::mem::take(&mut *self.queues.write().unwrap_or_else(PoisonError::into_inner));
        drop(queues);

        let handles = std::mem::take(&mut *self.workers.lock().await);
        for handle in handles {
            if let Err(err) = handle.await {
                tracing::error!(error = %err, "command worker panicked");
            }
        }
        tracing::info!("command gateway stopped");
    }
}

async fn run_worker(
    index: usize,
    bus: Arc<CommandBus>,
    mut rx: mpsc::Receiver<Job>,
    error_handler: ErrorHandler,
) {
    while let Some(Job { command, reply }) = rx.recv().await {
        let retained = command.clone();
        let result = dispatch_guarded(index, &bus, command).await;
        match reply {
            Reply::Wait(tx) => {
                // The caller may have timed out; the outcome is dropped then.
                let _ = tx.send(result);
            }
            Reply::Forget => {
                if let Err(err) = result {
                    error_handler(&retained, &err);
                }
            }
        }
    }
    tracing::debug!(worker = index, "command worker stopped");
}

async fn dispatch_guarded(
    index: usize,
    bus: &CommandBus,
    command: Command,
) -> Result<DispatchOutcome, GatewayError> {
    let described = command.to_string();
    match AssertUnwindSafe(bus.dispatch(command)).catch_unwind().await {
        Ok(result) => result.map_err(GatewayError::from),
        Err(panic) => {
            let reason = panic_message(panic.as_ref());
            tracing::error!(worker = index, command = %described, %reason, "command dispatch panicked");
            metrics::counter!("gateway_dispatch_panics_total").increment(1);
            Err(GatewayError::new(
                ErrorKind::Failed,
                format!("dispatch of {described} panicked: {reason}"),
            ))
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}
