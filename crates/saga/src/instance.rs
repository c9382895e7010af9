//! Persisted saga instances.

use std::collections::BTreeSet;
use std::fmt;

use common::SagaId;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::state::SagaStatus;

/// A correlation key: the `(key, value)` pair an event is routed by.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Association {
    pub key: String,
    pub value: String,
}

impl Association {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

impl fmt::Display for Association {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

/// A running process manager as the repository stores it.
///
/// `revision` counts successful saves: a fresh instance has revision 0 and
/// every save bumps it, which is how the repository detects two writers
/// working from the same copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaInstance {
    pub saga_id: SagaId,
    pub saga_type: String,
    pub associations: BTreeSet<Association>,
    pub state: serde_json::Value,
    pub status: SagaStatus,
    pub revision: u64,
}

impl SagaInstance {
    /// Creates a new, unsaved instance with the given state.
    pub fn new<S: Serialize>(saga_type: impl Into<String>, state: &S) -> Result<Self> {
        Ok(Self {
            saga_id: SagaId::new(),
            saga_type: saga_type.into(),
            associations: BTreeSet::new(),
            state: serde_json::to_value(state)?,
            status: SagaStatus::Active,
            revision: 0,
        })
    }

    /// Adds an association. Returns false if it was already present.
    pub fn associate(&mut self, association: Association) -> bool {
        self.associations.insert(association)
    }

    /// Removes an association. Returns false if it was not present.
    pub fn dissociate(&mut self, association: &Association) -> bool {
        self.associations.remove(association)
    }

    pub fn is_associated_with(&self, association: &Association) -> bool {
        self.associations.contains(association)
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    /// Marks the instance ended.
    pub fn end(&mut self) {
        self.status = SagaStatus::Ended;
    }

    /// Deserializes the saga state.
    pub fn state_as<S: DeserializeOwned>(&self) -> Result<S> {
        Ok(serde_json::from_value(self.state.clone())?)
    }

    /// Replaces the saga state.
    pub fn set_state<S: Serialize>(&mut self, state: &S) -> Result<()> {
        self.state = serde_json::to_value(state)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Progress {
        step: u32,
    }

    #[test]
    fn new_instance_is_active_at_revision_zero() {
        let instance = SagaInstance::new("Transfer", &Progress::default()).unwrap();
        assert!(instance.is_active());
        assert_eq!(instance.revision, 0);
        assert!(instance.associations.is_empty());
    }

    #[test]
    fn associations_are_a_set() {
        let mut instance = SagaInstance::new("Transfer", &Progress::default()).unwrap();
        assert!(instance.associate(Association::new("account_id", "A1")));
        assert!(!instance.associate(Association::new("account_id", "A1")));
        assert!(instance.is_associated_with(&Association::new("account_id", "A1")));

        assert!(instance.dissociate(&Association::new("account_id", "A1")));
        assert!(!instance.dissociate(&Association::new("account_id", "A1")));
    }

    #[test]
    fn state_round_trips_through_json() {
        let mut instance = SagaInstance::new("Transfer", &Progress::default()).unwrap();
        instance.set_state(&Progress { step: 2 }).unwrap();
        assert_eq!(instance.state_as::<Progress>().unwrap(), Progress { step: 2 });
    }

    #[test]
    fn association_display() {
        assert_eq!(Association::new("account_id", "A1").to_string(), "account_id=A1");
    }
}
