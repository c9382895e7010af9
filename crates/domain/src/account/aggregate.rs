//! Account aggregate implementation.

use serde::{Deserialize, Serialize};

use crate::aggregate::Aggregate;

use super::{AccountError, AccountEvent};

/// Account aggregate root.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Account {
    /// Owner, set once the account is opened.
    owner: Option<String>,

    /// Current balance in minor units.
    balance: i64,

    /// Number of movements (deposits and withdrawals).
    movements: u64,
}

impl Aggregate for Account {
    type Event = AccountEvent;

    fn aggregate_type() -> &'static str {
        "Account"
    }

    fn apply(&mut self, event: Self::Event) {
        match event {
            AccountEvent::AccountOpened { owner } => {
                self.owner = Some(owner);
            }
            AccountEvent::AmountDeposited { amount } => {
                self.balance = self.balance.saturating_add(amount);
                self.movements += 1;
            }
            AccountEvent::AmountWithdrawn { amount } => {
                self.balance = self.balance.saturating_sub(amount);
                self.movements += 1;
            }
        }
    }
}

// Query methods
impl Account {
    /// Returns the owner, `None` until the account is opened.
    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    pub fn balance(&self) -> i64 {
        self.balance
    }

    pub fn movements(&self) -> u64 {
        self.movements
    }

    pub fn is_open(&self) -> bool {
        self.owner.is_some()
    }
}

// Command methods
impl Account {
    /// Opens the account.
    pub fn open(&self, owner: impl Into<String>) -> Result<Vec<AccountEvent>, AccountError> {
        if self.is_open() {
            return Err(AccountError::AlreadyOpened);
        }
        let owner = owner.into();
        if owner.trim().is_empty() {
            return Err(AccountError::OwnerRequired);
        }
        Ok(vec![AccountEvent::AccountOpened { owner }])
    }

    /// Deposits a positive amount the balance can still hold.
    pub fn deposit(&self, amount: i64) -> Result<Vec<AccountEvent>, AccountError> {
        self.ensure_open()?;
        if amount <= 0 {
            return Err(AccountError::InvalidAmount { amount });
        }
        if self.balance.checked_add(amount).is_none() {
            return Err(AccountError::BalanceOverflow {
                balance: self.balance,
                amount,
            });
        }
        Ok(vec![AccountEvent::AmountDeposited { amount }])
    }

    /// Withdraws a positive amount covered by the balance.
    pub fn withdraw(&self, amount: i64) -> Result<Vec<AccountEvent>, AccountError> {
        self.ensure_open()?;
        if amount <= 0 {
            return Err(AccountError::InvalidAmount { amount });
        }
        if amount > self.balance {
            return Err(AccountError::InsufficientFunds {
                balance: self.balance,
                requested: amount,
            });
        }
        Ok(vec![AccountEvent::AmountWithdrawn { amount }])
    }

    fn ensure_open(&self) -> Result<(), AccountError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(AccountError::NotOpened)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opened() -> Account {
        let mut account = Account::default();
        account.apply_events(account.open("bob").unwrap());
        account
    }

    #[test]
    fn test_open_account() {
        let account = opened();
        assert!(account.is_open());
        assert_eq!(account.owner(), Some("bob"));
        assert_eq!(account.balance(), 0);
    }

    #[test]
    fn test_cannot_open_twice() {
        assert_eq!(opened().open("alice"), Err(AccountError::AlreadyOpened));
    }

    #[test]
    fn test_blank_owner_rejected() {
        assert_eq!(Account::default().open("  "), Err(AccountError::OwnerRequired));
    }

    #[test]
    fn test_deposit_and_withdraw() {
        let mut account = opened();
        account.apply_events(account.deposit(50).unwrap());
        account.apply_events(account.withdraw(20).unwrap());

        assert_eq!(account.balance(), 30);
        assert_eq!(account.movements(), 2);
    }

    #[test]
    fn test_deposit_requires_open_account() {
        assert_eq!(Account::default().deposit(10), Err(AccountError::NotOpened));
    }

    #[test]
    fn test_invalid_amounts_rejected() {
        let account = opened();
        assert_eq!(
            account.deposit(0),
            Err(AccountError::InvalidAmount { amount: 0 })
        );
        assert_eq!(
            account.withdraw(-5),
            Err(AccountError::InvalidAmount { amount: -5 })
        );
    }

    #[test]
    fn test_deposit_past_max_balance_rejected() {
        let mut account = opened();
        account.apply_events(account.deposit(i64::MAX).unwrap());

        assert_eq!(
            account.deposit(1),
            Err(AccountError::BalanceOverflow {
                balance: i64::MAX,
                amount: 1
            })
        );
        assert_eq!(account.balance(), i64::MAX);
    }

    #[test]
    fn test_replay_saturates_instead_of_panicking() {
        let mut account = opened();
        account.apply_events(vec![
            AccountEvent::AmountDeposited { amount: i64::MAX },
            AccountEvent::AmountDeposited { amount: 1 },
        ]);
        assert_eq!(account.balance(), i64::MAX);
    }

    #[test]
    fn test_overdraft_rejected() {
        let account = opened();
        assert_eq!(
            account.withdraw(1),
            Err(AccountError::InsufficientFunds {
                balance: 0,
                requested: 1
            })
        );
    }
}
