//! Saga lifecycle.

use serde::{Deserialize, Serialize};

/// The lifecycle status of a saga instance.
///
/// ```text
/// Active ──► Ended
/// ```
///
/// An ended instance is never matched again and is removed from the
/// repository on its next save.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SagaStatus {
    /// The saga is waiting for correlated events.
    #[default]
    Active,

    /// The saga's termination condition fired (terminal state).
    Ended,
}

impl SagaStatus {
    /// Returns true if the instance still takes part in routing.
    pub fn is_active(&self) -> bool {
        matches!(self, SagaStatus::Active)
    }

    /// Returns the status name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaStatus::Active => "Active",
            SagaStatus::Ended => "Ended",
        }
    }
}

impl std::fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
