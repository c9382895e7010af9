//! Bank account aggregate used by the sample handlers and tests.

mod aggregate;
mod commands;
mod events;

pub use aggregate::Account;
pub use commands::{Deposit, OpenAccount, Withdraw};
pub use events::AccountEvent;

use thiserror::Error;

/// Errors that can occur during account operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AccountError {
    /// The account was already opened.
    #[error("Account already opened")]
    AlreadyOpened,

    /// The account does not exist yet.
    #[error("Account is not open")]
    NotOpened,

    /// An owner is required to open an account.
    #[error("Owner is required")]
    OwnerRequired,

    /// Amounts must be strictly positive.
    #[error("Invalid amount: {amount} (must be greater than 0)")]
    InvalidAmount { amount: i64 },

    /// A withdrawal exceeded the balance.
    #[error("Insufficient funds: balance {balance}, requested {requested}")]
    InsufficientFunds { balance: i64, requested: i64 },

    /// A deposit would push the balance past `i64::MAX`.
    #[error("Balance overflow: balance {balance}, deposit {amount}")]
    BalanceOverflow { balance: i64, amount: i64 },
}
