//! Welcome bonus saga.

use std::sync::Arc;

use async_trait::async_trait;
use command_bus::CommandGateway;
use domain::account::{Account, AccountEvent, Deposit};
use domain::{Aggregate, CORRELATION_ID, Command};
use event_store::EventEnvelope;
use saga::{Association, Saga, SagaContext};
use serde::{Deserialize, Serialize};

/// Metadata key carrying the id of the saga that issued a command.
pub const SAGA_ID: &str = "saga_id";

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct WelcomeBonusState {
    pub requested: bool,
}

/// Credits every newly opened account with a bonus deposit.
///
/// The saga starts on `AccountOpened`, issues the deposit through the gateway
/// and ends when the deposit it issued comes back as `AmountDeposited`.
pub struct WelcomeBonus {
    gateway: Arc<CommandGateway>,
    amount: i64,
}

impl WelcomeBonus {
    pub const TYPE: &'static str = "WelcomeBonus";

    pub fn new(gateway: Arc<CommandGateway>, amount: i64) -> Self {
        Self { gateway, amount }
    }
}

#[async_trait]
impl Saga for WelcomeBonus {
    type State = WelcomeBonusState;

    fn saga_type(&self) -> &str {
        Self::TYPE
    }

    fn correlation(&self, event: &EventEnvelope) -> Option<Association> {
        (event.aggregate_type == Account::aggregate_type())
            .then(|| Association::new("account_id", event.aggregate_id.as_str()))
    }

    fn starts_on(&self, event: &EventEnvelope) -> bool {
        event.event_type == "AccountOpened"
    }

    async fn handle(
        &self,
        state: &mut WelcomeBonusState,
        event: &EventEnvelope,
        ctx: &mut SagaContext,
    ) -> saga::Result<()> {
        match event.payload_as::<AccountEvent>()? {
            AccountEvent::AccountOpened { .. } if !state.requested => {
                let mut command = Command::new(
                    Deposit::TYPE,
                    Account::aggregate_type(),
                    event.aggregate_id.clone(),
                )
                .with_field("amount", self.amount)
                .with_metadata(SAGA_ID, ctx.saga_id().to_string());
                if let Some(correlation) = event.metadata.get(CORRELATION_ID) {
                    command = command.with_metadata(CORRELATION_ID, correlation.clone());
                }

                // The dispatching worker may be the one publishing this event.
                self.gateway.send_and_forget(command);
                state.requested = true;
            }
            AccountEvent::AmountDeposited { .. }
                if event.metadata.get(SAGA_ID) == Some(&ctx.saga_id().to_string()) =>
            {
                ctx.end();
            }
            _ => {}
        }
        Ok(())
    }
}
