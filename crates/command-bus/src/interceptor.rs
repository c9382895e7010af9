//! Dispatch interceptors.
//!
//! An interceptor sees every command before it reaches its handler and
//! either passes it on (possibly replaced by a modified copy) or halts the
//! dispatch with an error. The chain is fixed when the bus is built.

use std::sync::Arc;

use domain::{CORRELATION_ID, Command};
use uuid::Uuid;

use crate::error::DispatchError;

/// A step of the dispatch pipeline run before the handler.
pub trait Interceptor: Send + Sync {
    /// Returns the name used in logs.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Returns the command to pass on, or the error halting the dispatch.
    fn intercept(&self, command: Command) -> Result<Command, DispatchError>;
}

impl<F> Interceptor for F
where
    F: Fn(Command) -> Result<Command, DispatchError> + Send + Sync,
{
    fn intercept(&self, command: Command) -> Result<Command, DispatchError> {
        self(command)
    }
}

/// Ordered, immutable list of interceptors.
#[derive(Clone, Default)]
pub struct InterceptorChain {
    interceptors: Arc<[Arc<dyn Interceptor>]>,
}

impl InterceptorChain {
    pub fn new(interceptors: Vec<Arc<dyn Interceptor>>) -> Self {
        Self {
            interceptors: interceptors.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    /// Runs every interceptor in registration order.
    pub fn apply(&self, mut command: Command) -> Result<Command, DispatchError> {
        for interceptor in self.interceptors.iter() {
            command = interceptor.intercept(command).inspect_err(|err| {
                tracing::debug!(interceptor = interceptor.name(), error = %err, "command halted");
            })?;
        }
        Ok(command)
    }
}

/// Rejects commands missing any of the given metadata entries.
#[derive(Debug, Clone)]
pub struct RequireMetadataInterceptor {
    keys: Vec<String>,
}

impl RequireMetadataInterceptor {
    pub fn new<I, K>(keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        Self {
            keys: keys.into_iter().map(Into::into).collect(),
        }
    }
}

impl Interceptor for RequireMetadataInterceptor {
    fn name(&self) -> &str {
        "require_metadata"
    }

    fn intercept(&self, command: Command) -> Result<Command, DispatchError> {
        let missing: Vec<&str> = self
            .keys
            .iter()
            .filter(|key| command.metadata_value(key).is_none_or(str::is_empty))
            .map(String::as_str)
            .collect();

        if missing.is_empty() {
            Ok(command)
        } else {
            Err(DispatchError::Unauthorized(format!(
                "missing metadata: {}",
                missing.join(", ")
            )))
        }
    }
}

/// Stamps a fresh correlation id on commands that carry none.
#[derive(Debug, Clone, Copy, Default)]
pub struct CorrelationInterceptor;

impl Interceptor for CorrelationInterceptor {
    fn name(&self) -> &str {
        "correlation"
    }

    fn intercept(&self, command: Command) -> Result<Command, DispatchError> {
        if command.metadata_value(CORRELATION_ID).is_some() {
            return Ok(command);
        }
        Ok(command.with_metadata(CORRELATION_ID, Uuid::new_v4().to_string()))
    }
}

/// Records every command passing through the chain.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingInterceptor;

impl Interceptor for LoggingInterceptor {
    fn name(&self) -> &str {
        "logging"
    }

    fn intercept(&self, command: Command) -> Result<Command, DispatchError> {
        tracing::debug!(
            command_type = %command.command_type,
            aggregate_id = %command.aggregate_id,
            fields = command.payload.len(),
            "command intercepted"
        );
        Ok(command)
    }
}
