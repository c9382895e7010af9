//! Saga repository trait and the in-memory backend.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use common::SagaId;

use crate::instance::{Association, SagaInstance};
use crate::{Result, SagaError};

/// Stores saga instances and finds them by correlation key.
///
/// The repository is the only component that mutates saga routing state.
/// Conflicting writes are rejected rather than merged: a save fails with
/// `ConcurrentModification` when the stored revision moved on, and with
/// `CorrelationConflict` when another active instance of the same type
/// already holds one of the associations.
#[async_trait]
pub trait SagaRepository: Send + Sync {
    /// Returns the ids of the active instances of `saga_type` associated
    /// with `key = value`.
    async fn find(&self, saga_type: &str, key: &str, value: &str) -> Result<HashSet<SagaId>>;

    /// Loads an instance by id.
    async fn load(&self, saga_id: SagaId) -> Result<Option<SagaInstance>>;

    /// Stores an instance and bumps its revision.
    ///
    /// Saving an ended instance deletes it.
    async fn save(&self, instance: &mut SagaInstance) -> Result<()>;

    /// Removes an instance. Returns false if it was not stored.
    async fn delete(&self, saga_id: SagaId) -> Result<bool>;
}

#[async_trait]
impl<T: SagaRepository + ?Sized> SagaRepository for Arc<T> {
    async fn find(&self, saga_type: &str, key: &str, value: &str) -> Result<HashSet<SagaId>> {
        (**self).find(saga_type, key, value).await
    }

    async fn load(&self, saga_id: SagaId) -> Result<Option<SagaInstance>> {
        (**self).load(saga_id).await
    }

    async fn save(&self, instance: &mut SagaInstance) -> Result<()> {
        (**self).save(instance).await
    }

    async fn delete(&self, saga_id: SagaId) -> Result<bool> {
        (**self).delete(saga_id).await
    }
}

/// Checks the caller's revision against the stored one.
pub(crate) fn check_revision(instance: &SagaInstance, stored: Option<u64>) -> Result<()> {
    match stored {
        None if instance.revision == 0 => Ok(()),
        Some(revision) if revision == instance.revision => Ok(()),
        actual => Err(SagaError::ConcurrentModification {
            saga_id: instance.saga_id,
            expected: instance.revision,
            actual,
        }),
    }
}

type IndexKey = (String, String, String);

fn index_key(saga_type: &str, association: &Association) -> IndexKey {
    (
        saga_type.to_string(),
        association.key.clone(),
        association.value.clone(),
    )
}

#[derive(Default)]
struct Inner {
    sagas: HashMap<SagaId, SagaInstance>,
    index: HashMap<IndexKey, HashSet<SagaId>>,
}

impl Inner {
    fn unindex(&mut self, instance: &SagaInstance) {
        for association in &instance.associations {
            let key = index_key(&instance.saga_type, association);
            if let Some(ids) = self.index.get_mut(&key) {
                ids.remove(&instance.saga_id);
                if ids.is_empty() {
                    self.index.remove(&key);
                }
            }
        }
    }

    fn remove(&mut self, saga_id: SagaId) -> bool {
        match self.sagas.remove(&saga_id) {
            Some(stored) => {
                self.unindex(&stored);
                true
            }
            None => false,
        }
    }
}

/// Saga repository kept in process memory.
///
/// In-flight sagas are lost on restart.
#[derive(Default)]
pub struct InMemorySagaRepository {
    inner: Mutex<Inner>,
}

impl InMemorySagaRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored (active) instances.
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .sagas
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SagaRepository for InMemorySagaRepository {
    async fn find(&self, saga_type: &str, key: &str, value: &str) -> Result<HashSet<SagaId>> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let key = (saga_type.to_string(), key.to_string(), value.to_string());
        Ok(inner.index.get(&key).cloned().unwrap_or_default())
    }

    async fn load(&self, saga_id: SagaId) -> Result<Option<SagaInstance>> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(inner.sagas.get(&saga_id).cloned())
    }

    async fn save(&self, instance: &mut SagaInstance) -> Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);

        let stored = inner.sagas.get(&instance.saga_id).map(|s| s.revision);
        check_revision(instance, stored)?;

        if !instance.is_active() {
            inner.remove(instance.saga_id);
            return Ok(());
        }

        for association in &instance.associations {
            let holders = inner.index.get(&index_key(&instance.saga_type, association));
            if holders.is_some_and(|ids| ids.iter().any(|id| *id != instance.saga_id)) {
                return Err(SagaError::CorrelationConflict {
                    saga_type: instance.saga_type.clone(),
                    key: association.key.clone(),
                    value: association.value.clone(),
                });
            }
        }

        inner.remove(instance.saga_id);
        for association in &instance.associations {
            inner
                .index
                .entry(index_key(&instance.saga_type, association))
                .or_default()
                .insert(instance.saga_id);
        }
        instance.revision += 1;
        inner.sagas.insert(instance.saga_id, instance.clone());

        Ok(())
    }

    async fn delete(&self, saga_id: SagaId) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(inner.remove(saga_id))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn transfer(account: &str) -> SagaInstance {
        let mut instance = SagaInstance::new("Transfer", &json!({})).unwrap();
        instance.associate(Association::new("account_id", account));
        instance
    }

    #[tokio::test]
    async fn saved_instances_are_found_by_association() {
        let repo = InMemorySagaRepository::new();
        let mut saga = transfer("A1");
        repo.save(&mut saga).await.unwrap();

        let found = repo.find("Transfer", "account_id", "A1").await.unwrap();
        assert_eq!(found, HashSet::from([saga.saga_id]));

        assert!(repo.find("Transfer", "account_id", "B2").await.unwrap().is_empty());
        assert!(repo.find("Refund", "account_id", "A1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn save_bumps_the_revision() {
        let repo = InMemorySagaRepository::new();
        let mut saga = transfer("A1");
        repo.save(&mut saga).await.unwrap();
        repo.save(&mut saga).await.unwrap();

        assert_eq!(saga.revision, 2);
        assert_eq!(repo.load(saga.saga_id).await.unwrap().unwrap().revision, 2);
    }

    #[tokio::test]
    async fn stale_copy_is_rejected() {
        let repo = InMemorySagaRepository::new();
        let mut saga = transfer("A1");
        repo.save(&mut saga).await.unwrap();

        let mut stale = saga.clone();
        repo.save(&mut saga).await.unwrap();

        let err = repo.save(&mut stale).await.unwrap_err();
        assert!(matches!(
            err,
            SagaError::ConcurrentModification { expected: 1, actual: Some(2), .. }
        ));
    }

    #[tokio::test]
    async fn two_active_instances_cannot_share_an_association() {
        let repo = InMemorySagaRepository::new();
        repo.save(&mut transfer("A1")).await.unwrap();

        let mut second = transfer("A1");
        let err = repo.save(&mut second).await.unwrap_err();
        assert!(matches!(err, SagaError::CorrelationConflict { ref value, .. } if value == "A1"));
        assert_eq!(repo.len(), 1);

        // Other saga types may reuse the value.
        let mut refund = SagaInstance::new("Refund", &json!({})).unwrap();
        refund.associate(Association::new("account_id", "A1"));
        repo.save(&mut refund).await.unwrap();
    }

    #[tokio::test]
    async fn dissociated_values_are_released() {
        let repo = InMemorySagaRepository::new();
        let mut first = transfer("A1");
        repo.save(&mut first).await.unwrap();

        first.dissociate(&Association::new("account_id", "A1"));
        first.associate(Association::new("account_id", "C3"));
        repo.save(&mut first).await.unwrap();

        assert!(repo.find("Transfer", "account_id", "A1").await.unwrap().is_empty());
        repo.save(&mut transfer("A1")).await.unwrap();
    }

    #[tokio::test]
    async fn ended_instances_are_never_found_again() {
        let repo = InMemorySagaRepository::new();
        let mut saga = transfer("A1");
        repo.save(&mut saga).await.unwrap();

        saga.end();
        repo.save(&mut saga).await.unwrap();

        assert!(repo.find("Transfer", "account_id", "A1").await.unwrap().is_empty());
        assert!(repo.load(saga.saga_id).await.unwrap().is_none());
        assert!(repo.is_empty());
    }

    #[tokio::test]
    async fn delete_removes_from_the_index() {
        let repo = InMemorySagaRepository::new();
        let mut saga = transfer("A1");
        repo.save(&mut saga).await.unwrap();

        assert!(repo.delete(saga.saga_id).await.unwrap());
        assert!(!repo.delete(saga.saga_id).await.unwrap());
        assert!(repo.find("Transfer", "account_id", "A1").await.unwrap().is_empty());
    }
}
