//! Account domain events.

use serde::{Deserialize, Serialize};

use crate::aggregate::DomainEvent;

/// Events that can occur on an account aggregate.
///
/// Internally tagged, so the stored payload is the event's fields plus a
/// `type` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AccountEvent {
    /// The account was opened.
    AccountOpened { owner: String },

    /// Money was deposited.
    AmountDeposited { amount: i64 },

    /// Money was withdrawn.
    AmountWithdrawn { amount: i64 },
}

impl DomainEvent for AccountEvent {
    fn event_type(&self) -> &'static str {
        match self {
            AccountEvent::AccountOpened { .. } => "AccountOpened",
            AccountEvent::AmountDeposited { .. } => "AmountDeposited",
            AccountEvent::AmountWithdrawn { .. } => "AmountWithdrawn",
        }
    }
}
