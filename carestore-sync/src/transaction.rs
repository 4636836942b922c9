//! Scoped write transactions
//!
//! A [`Transaction`] holds the store's write lock for its whole lifetime and
//! works on a private copy of the working set. `commit` writes the touched
//! records through the durable store and only then publishes the copy;
//! dropping the transaction without committing discards every change.

use crate::entity::{Entity, EntityKind};
use crate::error::StoreResult;
use crate::knowledge::KnowledgeVector;
use crate::persistence::{ChangeSet, DurableStore};
use crate::state::StoreState;
use std::collections::BTreeSet;
use tokio::sync::{broadcast, RwLockWriteGuard};
use uuid::Uuid;

/// Notification published after every commit that changed records
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreChange {
    pub kinds: BTreeSet<EntityKind>,
    pub uuids: Vec<Uuid>,
    /// All local records were replaced
    pub reset: bool,
}

impl StoreChange {
    pub fn is_empty(&self) -> bool {
        !self.reset && self.uuids.is_empty()
    }

    pub fn touches(&self, kind: EntityKind) -> bool {
        self.reset || self.kinds.contains(&kind)
    }
}

pub(crate) struct Transaction<'a> {
    guard: RwLockWriteGuard<'a, StoreState>,
    working: StoreState,
    durable: &'a dyn DurableStore,
    changes: &'a broadcast::Sender<StoreChange>,
    stamp: Option<KnowledgeVector>,
    reset: bool,
}

impl<'a> Transaction<'a> {
    pub(crate) fn new(
        guard: RwLockWriteGuard<'a, StoreState>,
        durable: &'a dyn DurableStore,
        changes: &'a broadcast::Sender<StoreChange>,
    ) -> Self {
        let working = guard.clone();
        Self {
            guard,
            working,
            durable,
            changes,
            stamp: None,
            reset: false,
        }
    }

    pub(crate) fn state(&self) -> &StoreState {
        &self.working
    }

    pub(crate) fn state_mut(&mut self) -> &mut StoreState {
        &mut self.working
    }

    /// Stamp for local writes: the local clock advances once per transaction.
    pub(crate) fn local_stamp(&mut self) -> KnowledgeVector {
        if let Some(stamp) = &self.stamp {
            return stamp.clone();
        }
        let stamp = self.working.increment_clock();
        self.stamp = Some(stamp.clone());
        stamp
    }

    /// Replace all local records with whatever this transaction writes next.
    pub(crate) fn reset(&mut self) {
        self.working.reset();
        self.reset = true;
        self.stamp = None;
    }

    pub(crate) async fn commit(mut self) -> StoreResult<StoreChange> {
        let touched = self.working.take_touched();
        let upserts: Vec<Entity> = touched
            .iter()
            .filter_map(|uuid| self.working.get(*uuid).cloned())
            .collect();

        let change = StoreChange {
            kinds: upserts.iter().map(Entity::kind).collect(),
            uuids: touched.into_iter().collect(),
            reset: self.reset,
        };

        let clocks_changed = self.working.knowledge() != self.guard.knowledge()
            || self.working.last_synced() != self.guard.last_synced();
        if change.is_empty() && !clocks_changed {
            return Ok(change);
        }

        let change_set = ChangeSet {
            reset: self.reset,
            upserts,
            knowledge: self.working.knowledge().clone(),
            last_synced: self.working.last_synced().clone(),
        };
        self.durable.apply(&change_set).await?;

        let Transaction {
            mut guard,
            working,
            changes,
            ..
        } = self;
        *guard = working;
        drop(guard);

        if !change.is_empty() {
            // No receivers is fine
            let _ = changes.send(change.clone());
        }
        tracing::debug!(records = change.uuids.len(), reset = change.reset, "Committed transaction");
        Ok(change)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{Patient, PersonName, Versioned};
    use crate::persistence::MemoryDurableStore;
    use tokio::sync::RwLock;

    fn patient(id: &str) -> Entity {
        Versioned::new(id, Patient::new(PersonName::new("Jane", "Doe"))).into_entity()
    }

    #[tokio::test]
    async fn test_commit_publishes_working_copy() {
        let lock = RwLock::new(StoreState::new(Uuid::new_v4()));
        let durable = MemoryDurableStore::new();
        let (sender, mut receiver) = broadcast::channel(8);

        let mut tx = Transaction::new(lock.write().await, &durable, &sender);
        let stamp = tx.local_stamp();
        assert_eq!(tx.local_stamp(), stamp);
        tx.state_mut().create_head(patient("p1"), &stamp).unwrap();
        let change = tx.commit().await.unwrap();

        assert!(change.touches(EntityKind::Patient));
        assert_eq!(lock.read().await.len(), 1);
        assert_eq!(durable.len(), 1);
        assert_eq!(receiver.recv().await.unwrap(), change);
    }

    #[tokio::test]
    async fn test_drop_rolls_back() {
        let lock = RwLock::new(StoreState::new(Uuid::new_v4()));
        let durable = MemoryDurableStore::new();
        let (sender, _receiver) = broadcast::channel(8);

        {
            let mut tx = Transaction::new(lock.write().await, &durable, &sender);
            let stamp = tx.local_stamp();
            tx.state_mut().create_head(patient("p1"), &stamp).unwrap();
        }

        let state = lock.read().await;
        assert!(state.is_empty());
        assert!(state.knowledge().is_zero());
        assert!(durable.is_empty());
    }

    #[tokio::test]
    async fn test_failed_durable_write_rolls_back() {
        let lock = RwLock::new(StoreState::new(Uuid::new_v4()));
        let durable = MemoryDurableStore::new();
        durable.fail_writes(true);
        let (sender, _receiver) = broadcast::channel(8);

        let mut tx = Transaction::new(lock.write().await, &durable, &sender);
        let stamp = tx.local_stamp();
        tx.state_mut().create_head(patient("p1"), &stamp).unwrap();
        assert!(tx.commit().await.is_err());

        assert!(lock.read().await.is_empty());
    }
}
