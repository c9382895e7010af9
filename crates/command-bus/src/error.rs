//! Dispatch and gateway error types.

use std::fmt;

use common::AggregateId;
use domain::DomainError;
use event_store::{EventStoreError, Sequence};
use thiserror::Error;

/// Boxed error returned by command handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// One failed field constraint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub field: String,
    pub message: String,
}

impl Violation {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.field, self.message)
    }
}

fn join(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

fn position(sequence: &Option<Sequence>) -> String {
    sequence.map_or_else(|| "<empty stream>".to_string(), |s| s.to_string())
}

/// Errors that can end a dispatch. None of them leaves events behind.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// An interceptor rejected the command's payload.
    #[error("Validation failed: {}", join(.0))]
    ValidationFailed(Vec<Violation>),

    /// An interceptor refused the command for the caller.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// No handler is subscribed for the command type.
    #[error("No handler registered for command type {0}")]
    NoHandlerFound(String),

    /// The command requires an existing aggregate.
    #[error("Aggregate not found: {aggregate_type} with id {aggregate_id}")]
    AggregateNotFound {
        aggregate_type: String,
        aggregate_id: AggregateId,
    },

    /// The aggregate moved on since the caller (or the handler) last saw it.
    #[error(
        "Concurrency conflict for aggregate {aggregate_id}: expected last sequence {}, found {}",
        position(.expected),
        position(.actual)
    )]
    ConcurrencyConflict {
        aggregate_id: AggregateId,
        expected: Option<Sequence>,
        actual: Option<Sequence>,
    },

    /// The handler's domain logic refused the command.
    #[error("Handler error: {0}")]
    HandlerError(#[source] BoxError),

    /// The store could not load or persist the aggregate.
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(#[source] EventStoreError),
}

impl From<EventStoreError> for DispatchError {
    fn from(err: EventStoreError) -> Self {
        match err {
            EventStoreError::ConcurrencyConflict {
                aggregate_id,
                expected,
                actual,
            } => DispatchError::ConcurrencyConflict {
                aggregate_id,
                expected,
                actual,
            },
            other => DispatchError::StorageUnavailable(other),
        }
    }
}

impl From<DomainError> for DispatchError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::EventStore(err) => err.into(),
            DomainError::Serialization(err) => {
                DispatchError::StorageUnavailable(EventStoreError::Serialization(err))
            }
        }
    }
}

impl DispatchError {
    /// Short label used as the `outcome` metric label.
    pub fn label(&self) -> &'static str {
        match self {
            DispatchError::ValidationFailed(_) => "validation_failed",
            DispatchError::Unauthorized(_) => "unauthorized",
            DispatchError::NoHandlerFound(_) => "no_handler",
            DispatchError::AggregateNotFound { .. } => "not_found",
            DispatchError::ConcurrencyConflict { .. } => "conflict",
            DispatchError::HandlerError(_) => "rejected",
            DispatchError::StorageUnavailable(_) => "storage_unavailable",
        }
    }
}

/// Stable error classes reported by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The command was malformed or not permitted.
    Invalid,
    /// No handler exists for the command type.
    Unroutable,
    /// The target aggregate does not exist.
    NotFound,
    /// Domain logic refused the command.
    Rejected,
    /// Lost an optimistic concurrency race.
    Conflict,
    /// Storage or the gateway itself could not take the command.
    Unavailable,
    /// The caller stopped waiting.
    Timeout,
    /// Dispatch panicked; whether its events were committed is unknown.
    Failed,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Invalid => "invalid",
            ErrorKind::Unroutable => "unroutable",
            ErrorKind::NotFound => "not found",
            ErrorKind::Rejected => "rejected",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Error returned to gateway callers.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct GatewayError {
    pub kind: ErrorKind,
    pub message: String,
}

impl GatewayError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Returns true when resubmitting the same command may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::Conflict | ErrorKind::Unavailable | ErrorKind::Timeout
        )
    }
}

impl From<DispatchError> for GatewayError {
    fn from(err: DispatchError) -> Self {
        let kind = match &err {
            DispatchError::ValidationFailed(_) | DispatchError::Unauthorized(_) => {
                ErrorKind::Invalid
            }
            DispatchError::NoHandlerFound(_) => ErrorKind::Unroutable,
            DispatchError::AggregateNotFound { .. } => ErrorKind::NotFound,
            DispatchError::HandlerError(_) => ErrorKind::Rejected,
            DispatchError::ConcurrencyConflict { .. } => ErrorKind::Conflict,
            DispatchError::StorageUnavailable(_) => ErrorKind::Unavailable,
        };
        GatewayError::new(kind, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_message_lists_every_violation() {
        let err = DispatchError::ValidationFailed(vec![
            Violation::new("owner", "must not be blank"),
            Violation::new("amount", "must be greater than 0"),
        ]);
        assert_eq!(
            err.to_string(),
            "Validation failed: owner must not be blank; amount must be greater than 0"
        );
    }

    #[test]
    fn store_conflicts_stay_conflicts() {
        let err: DispatchError = EventStoreError::ConcurrencyConflict {
            aggregate_id: AggregateId::new("A1"),
            expected: Some(Sequence::new(0)),
            actual: Some(Sequence::new(1)),
        }
        .into();
        assert!(matches!(err, DispatchError::ConcurrencyConflict { .. }));

        let err: DispatchError = EventStoreError::Io(std::io::Error::other("disk")).into();
        assert!(matches!(err, DispatchError::StorageUnavailable(_)));
    }

    #[test]
    fn gateway_kinds_separate_retryable_from_futile() {
        let retryable = [
            DispatchError::ConcurrencyConflict {
                aggregate_id: AggregateId::new("A1"),
                expected: None,
                actual: Some(Sequence::new(0)),
            },
            DispatchError::StorageUnavailable(EventStoreError::Io(std::io::Error::other("x"))),
        ];
        for err in retryable {
            assert!(GatewayError::from(err).is_retryable());
        }

        let futile = [
            DispatchError::ValidationFailed(vec![]),
            DispatchError::Unauthorized("no token".into()),
            DispatchError::NoHandlerFound("Nope".into()),
            DispatchError::AggregateNotFound {
                aggregate_type: "Account".into(),
                aggregate_id: AggregateId::new("A1"),
            },
            DispatchError::HandlerError("insufficient funds".into()),
        ];
        for err in futile {
            assert!(!GatewayError::from(err).is_retryable());
        }

        assert!(GatewayError::new(ErrorKind::Timeout, "late").is_retryable());
        assert!(!GatewayError::new(ErrorKind::Failed, "panicked").is_retryable());
    }

    #[test]
    fn gateway_error_display() {
        let err = GatewayError::from(DispatchError::NoHandlerFound("Nope".into()));
        assert_eq!(err.kind, ErrorKind::Unroutable);
        assert_eq!(
            err.to_string(),
            "unroutable: No handler registered for command type Nope"
        );
    }
}
