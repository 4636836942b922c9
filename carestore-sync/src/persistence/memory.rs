use super::{replica_mismatch, ChangeSet, DurableStore, Snapshot};
use crate::entity::Entity;
use crate::error::{StoreError, StoreResult};
use crate::knowledge::KnowledgeVector;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Default)]
struct Clocks {
    replica_id: Option<Uuid>,
    knowledge: KnowledgeVector,
    last_synced: KnowledgeVector,
}

/// Durable store that keeps everything in process memory
///
/// Clones share the same storage, so a test can drop a `CareStore` and
/// reopen another one over the same records.
#[derive(Debug, Clone, Default)]
pub struct MemoryDurableStore {
    entities: Arc<DashMap<Uuid, Entity>>,
    clocks: Arc<Mutex<Clocks>>,
    fail_writes: Arc<AtomicBool>,
}

impl MemoryDurableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following `apply` fail, for exercising rollback paths.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

#[async_trait]
impl DurableStore for MemoryDurableStore {
    async fn bind_replica(&self, requested: Option<Uuid>) -> StoreResult<Uuid> {
        let mut clocks = self.clocks.lock();
        match (clocks.replica_id, requested) {
            (Some(stored), Some(requested)) if stored != requested => {
                Err(replica_mismatch(stored, requested))
            }
            (Some(stored), _) => Ok(stored),
            (None, requested) => {
                let replica_id = requested.unwrap_or_else(Uuid::new_v4);
                clocks.replica_id = Some(replica_id);
                Ok(replica_id)
            }
        }
    }

    async fn load(&self) -> StoreResult<Snapshot> {
        let clocks = self.clocks.lock();
        Ok(Snapshot {
            entities: self.entities.iter().map(|entry| entry.value().clone()).collect(),
            knowledge: clocks.knowledge.clone(),
            last_synced: clocks.last_synced.clone(),
        })
    }

    async fn apply(&self, changes: &ChangeSet) -> StoreResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Internal("Injected write failure".to_string()));
        }

        let mut clocks = self.clocks.lock();
        if changes.reset {
            self.entities.clear();
        }
        for entity in &changes.upserts {
            self.entities.insert(entity.uuid(), entity.clone());
        }
        clocks.knowledge = changes.knowledge.clone();
        clocks.last_synced = changes.last_synced.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{Patient, PersonName, Versioned};

    #[tokio::test]
    async fn test_replica_binding() {
        let store = MemoryDurableStore::new();
        let first = store.bind_replica(None).await.unwrap();
        assert_eq!(store.bind_replica(None).await.unwrap(), first);
        assert_eq!(store.bind_replica(Some(first)).await.unwrap(), first);
        assert!(matches!(
            store.bind_replica(Some(Uuid::new_v4())).await,
            Err(StoreError::InvalidValue(_))
        ));
    }

    #[tokio::test]
    async fn test_apply_and_reset() {
        let store = MemoryDurableStore::new();
        let mut patient = Versioned::new("p1", Patient::new(PersonName::new("Jane", "Doe")));
        patient.header.uuid = Uuid::new_v4();

        let replica = Uuid::new_v4();
        store
            .apply(&ChangeSet {
                upserts: vec![patient.into_entity()],
                knowledge: KnowledgeVector::single(replica, 1),
                ..Default::default()
            })
            .await
            .unwrap();

        let snapshot = store.load().await.unwrap();
        assert_eq!(snapshot.entities.len(), 1);
        assert_eq!(snapshot.knowledge.clock(replica), 1);

        store
            .apply(&ChangeSet {
                reset: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_injected_failure_leaves_state_untouched() {
        let store = MemoryDurableStore::new();
        store.fail_writes(true);
        let result = store
            .apply(&ChangeSet {
                reset: true,
                knowledge: KnowledgeVector::single(Uuid::new_v4(), 3),
                ..Default::default()
            })
            .await;
        assert!(result.is_err());
        assert!(store.load().await.unwrap().knowledge.is_zero());
    }
}
