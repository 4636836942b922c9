//! Remote endpoint interface and an in-process hub implementation

use crate::conflict::{ConflictPolicy, ConflictResolver, MergeConflict, Resolution};
use crate::error::StoreResult;
use crate::knowledge::KnowledgeVector;
use crate::revision::{self, RevisionRecord};
use crate::state::StoreState;
use crate::store::{CareStore, StoreInner};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use uuid::Uuid;

/// A server or peer the store synchronizes with
///
/// Transport, retries and timeouts are the endpoint's business; whatever
/// error it returns is surfaced as `RemoteSyncFailed`.
#[async_trait]
pub trait RemoteEndpoint: Send + Sync {
    /// Every revision the remote holds that `since` does not cover.
    async fn pull_revisions(&self, since: &KnowledgeVector) -> StoreResult<Vec<RevisionRecord>>;

    /// Hand the remote a local revision. With `overwrite` the remote
    /// replaces its state with the record instead of merging it.
    async fn push_revisions(&self, record: RevisionRecord, overwrite: bool) -> StoreResult<()>;

    /// Decide a conflict found while merging pulled revisions.
    async fn choose_conflict_resolution(&self, conflict: &MergeConflict) -> StoreResult<Resolution>;

    /// Whether local writes should trigger a background sync.
    fn automatically_synchronizes(&self) -> bool {
        false
    }

    /// Called once when the endpoint is installed on a store.
    fn attach(&self, _handle: SyncHandle) {}
}

/// Lets an endpoint ask its store for a sync without keeping the store alive
#[derive(Clone)]
pub struct SyncHandle {
    store: Weak<StoreInner>,
}

impl SyncHandle {
    pub(crate) fn new(store: &CareStore) -> Self {
        Self {
            store: Arc::downgrade(&store.inner),
        }
    }

    /// Start a background sync unless one is already running.
    ///
    /// Returns `false` once the store has been dropped.
    pub fn request_sync(&self) -> bool {
        match self.store.upgrade() {
            Some(inner) => {
                CareStore { inner }.request_sync();
                true
            }
            None => false,
        }
    }
}

/// Adapts an endpoint's conflict callback to the merge engine's resolver seam
pub(crate) struct RemoteResolver<'a>(pub(crate) &'a dyn RemoteEndpoint);

#[async_trait]
impl ConflictResolver for RemoteResolver<'_> {
    async fn resolve(&self, conflict: &MergeConflict) -> StoreResult<Resolution> {
        self.0.choose_conflict_resolution(conflict).await
    }
}

struct Hub {
    records: StoreState,
    policy: ConflictPolicy,
    automatic: bool,
    peers: Vec<SyncHandle>,
}

/// In-process endpoint that keeps every pushed record
///
/// Clones share one hub, so several stores in one process can sync through
/// it. The hub never resolves conflicts itself; it stores the union of what
/// it was given and answers conflict callbacks with a fixed policy.
#[derive(Clone)]
pub struct MemoryRemote {
    hub: Arc<Mutex<Hub>>,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::with_policy(ConflictPolicy::KeepRemote)
    }

    pub fn with_policy(policy: ConflictPolicy) -> Self {
        Self {
            hub: Arc::new(Mutex::new(Hub {
                records: StoreState::new(Uuid::new_v4()),
                policy,
                automatic: false,
                peers: Vec::new(),
            })),
        }
    }

    /// Make attached stores sync after their local writes.
    pub fn automatic(self, automatic: bool) -> Self {
        self.hub.lock().automatic = automatic;
        self
    }

    pub fn set_policy(&self, policy: ConflictPolicy) {
        self.hub.lock().policy = policy;
    }

    /// Ask every attached store to sync; returns how many are still alive.
    pub fn request_sync(&self) -> usize {
        let peers = self.hub.lock().peers.clone();
        peers.iter().filter(|peer| peer.request_sync()).count()
    }

    pub fn knowledge(&self) -> KnowledgeVector {
        self.hub.lock().records.knowledge().clone()
    }

    /// Number of stored records, tombstones included.
    pub fn len(&self) -> usize {
        self.hub.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RemoteEndpoint for MemoryRemote {
    async fn pull_revisions(&self, since: &KnowledgeVector) -> StoreResult<Vec<RevisionRecord>> {
        let hub = self.hub.lock();
        let record = revision::compute_revision(&hub.records, since);
        tracing::debug!(entities = record.len(), "Hub serving pull");
        Ok(vec![record])
    }

    async fn push_revisions(&self, record: RevisionRecord, overwrite: bool) -> StoreResult<()> {
        let mut hub = self.hub.lock();
        // Work on a copy so a rejected record leaves the hub as it was
        let mut records = hub.records.clone();
        if overwrite {
            records = StoreState::new(records.replica_id());
        }
        let entities = record.len();
        for entity in record.entities {
            records.merge_record(entity)?;
        }
        records.merge_knowledge(&record.knowledge_vector);
        records.take_touched();
        hub.records = records;

        tracing::debug!(entities, overwrite, "Hub accepted push");
        Ok(())
    }

    async fn choose_conflict_resolution(&self, conflict: &MergeConflict) -> StoreResult<Resolution> {
        let policy = self.hub.lock().policy;
        policy.resolve(conflict).await
    }

    fn automatically_synchronizes(&self) -> bool {
        self.hub.lock().automatic
    }

    fn attach(&self, handle: SyncHandle) {
        self.hub.lock().peers.push(handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{CarePlan, Versioned};

    fn record_with(title: &str) -> RevisionRecord {
        let mut state = StoreState::new(Uuid::new_v4());
        let stamp = state.increment_clock();
        state
            .create_head(Versioned::new("plan", CarePlan::new(title)).into_entity(), &stamp)
            .unwrap();
        revision::compute_revision(&state, &KnowledgeVector::new())
    }

    #[tokio::test]
    async fn test_hub_keeps_union_of_pushes() {
        let remote = MemoryRemote::new();
        let first = record_with("Diet");
        let second = record_with("Sleep");
        remote.push_revisions(first.clone(), false).await.unwrap();
        remote.push_revisions(second.clone(), false).await.unwrap();

        assert_eq!(remote.len(), 2);
        assert!(remote.knowledge().dominates(&first.knowledge_vector));
        assert!(remote.knowledge().dominates(&second.knowledge_vector));

        let pulled = remote.pull_revisions(&first.knowledge_vector).await.unwrap();
        assert_eq!(pulled.len(), 1);
        assert_eq!(pulled[0].entities, second.entities);
    }

    #[tokio::test]
    async fn test_overwrite_replaces_hub_state() {
        let remote = MemoryRemote::new();
        remote.push_revisions(record_with("Diet"), false).await.unwrap();
        let replacement = record_with("Sleep");
        remote.push_revisions(replacement.clone(), true).await.unwrap();

        assert_eq!(remote.len(), 1);
        assert_eq!(remote.knowledge(), replacement.knowledge_vector);
    }

    #[test]
    fn test_automatic_flag() {
        assert!(!MemoryRemote::new().automatically_synchronizes());
        assert!(MemoryRemote::new().automatic(true).automatically_synchronizes());
    }
}
