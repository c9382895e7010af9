//! Typed payloads of the account commands.

use serde::{Deserialize, Serialize};

/// Payload of `OpenAccount`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAccount {
    pub owner: String,
}

impl OpenAccount {
    pub const TYPE: &'static str = "OpenAccount";
}

/// Payload of `Deposit`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deposit {
    pub amount: i64,
}

impl Deposit {
    pub const TYPE: &'static str = "Deposit";
}

/// Payload of `Withdraw`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Withdraw {
    pub amount: i64,
}

impl Withdraw {
    pub const TYPE: &'static str = "Withdraw";
}
