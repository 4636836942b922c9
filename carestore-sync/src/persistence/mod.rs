//! Durable storage seam
//!
//! The store keeps its working set in memory and writes every committed
//! transaction through a [`DurableStore`] as one atomic [`ChangeSet`].

pub mod memory;
pub mod sqlite;

pub use memory::MemoryDurableStore;
pub use sqlite::SqliteDurableStore;

use crate::entity::Entity;
use crate::error::StoreResult;
use crate::knowledge::KnowledgeVector;
use async_trait::async_trait;
use uuid::Uuid;

/// Everything a store needs to rebuild its working set
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub entities: Vec<Entity>,
    pub knowledge: KnowledgeVector,
    pub last_synced: KnowledgeVector,
}

/// One committed transaction, written atomically
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    /// Remove every stored record before applying `upserts`.
    pub reset: bool,
    pub upserts: Vec<Entity>,
    pub knowledge: KnowledgeVector,
    pub last_synced: KnowledgeVector,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        !self.reset && self.upserts.is_empty()
    }
}

/// Persistence interface for a replica's records and clocks
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Return the persisted replica id, recording `requested` (or a fresh id)
    /// on first use. A requested id that disagrees with the stored one is an
    /// `InvalidValue` error.
    async fn bind_replica(&self, requested: Option<Uuid>) -> StoreResult<Uuid>;

    /// Read back everything that was committed.
    async fn load(&self) -> StoreResult<Snapshot>;

    /// Apply a change set atomically.
    async fn apply(&self, changes: &ChangeSet) -> StoreResult<()>;
}

pub(crate) fn replica_mismatch(stored: Uuid, requested: Uuid) -> crate::error::StoreError {
    crate::error::StoreError::InvalidValue(format!(
        "Store belongs to replica {} but {} was requested",
        stored, requested
    ))
}
