//! Bank-account command handlers.

use std::sync::Arc;

use command_bus::{AggregateHandler, BoxError, CommandBus, Constraint, ValidationInterceptor};
use domain::account::{Account, AccountEvent, Deposit, OpenAccount, Withdraw};
use domain::{AutoSnapshot, Command};

/// Payload rules of the account commands.
pub fn account_validation() -> ValidationInterceptor {
    ValidationInterceptor::new()
        .rule(OpenAccount::TYPE, "owner", Constraint::Required)
        .rule(OpenAccount::TYPE, "owner", Constraint::NotBlank)
        .rule(OpenAccount::TYPE, "owner", Constraint::MaxLength(120))
        .rule(Deposit::TYPE, "amount", Constraint::Required)
        .rule(Deposit::TYPE, "amount", Constraint::Positive)
        .rule(Withdraw::TYPE, "amount", Constraint::Required)
        .rule(Withdraw::TYPE, "amount", Constraint::Positive)
}

fn open(account: &Account, command: &Command) -> Result<Vec<AccountEvent>, BoxError> {
    let open: OpenAccount = command.payload_as()?;
    Ok(account.open(open.owner)?)
}

fn deposit(account: &Account, command: &Command) -> Result<Vec<AccountEvent>, BoxError> {
    let deposit: Deposit = command.payload_as()?;
    Ok(account.deposit(deposit.amount)?)
}

fn withdraw(account: &Account, command: &Command) -> Result<Vec<AccountEvent>, BoxError> {
    let withdraw: Withdraw = command.payload_as()?;
    Ok(account.withdraw(withdraw.amount)?)
}

/// Subscribes the `OpenAccount`, `Deposit` and `Withdraw` handlers.
pub fn register_account_handlers(bus: &CommandBus, snapshots: Option<AutoSnapshot<Account>>) {
    let handlers = [
        (OpenAccount::TYPE, AggregateHandler::<Account>::new(open)),
        (Deposit::TYPE, AggregateHandler::existing(deposit)),
        (Withdraw::TYPE, AggregateHandler::existing(withdraw)),
    ];

    for (command_type, handler) in handlers {
        let handler = match &snapshots {
            Some(snapshots) => handler.with_snapshots(snapshots.clone()),
            None => handler,
        };
        bus.subscribe(command_type, Arc::new(handler));
    }
}
