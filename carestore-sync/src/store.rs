//! Care store facade
//!
//! [`CareStore`] is the public entry point: typed CRUD per entity kind,
//! queries and result streams, revision export and merge, and the sync
//! entry points in [`crate::sync`]. Every write runs in one [`Transaction`]
//! behind the store's write lock, so writes are serialized while reads run
//! concurrently with each other.

use crate::config::StoreConfig;
use crate::conflict::ConflictResolver;
use crate::entity::{Entity, EntityKind, Outcome, Payload, Task, Versioned};
use crate::error::{StoreError, StoreResult};
use crate::guard;
use crate::knowledge::KnowledgeVector;
use crate::merge::{self, MergeReport};
use crate::persistence::{DurableStore, MemoryDurableStore, SqliteDurableStore};
use crate::query::{EntityQuery, QueryStream};
use crate::revision::{self, RevisionRecord};
use crate::state::StoreState;
use crate::sync::{RemoteEndpoint, SyncEvent};
use crate::transaction::{StoreChange, Transaction};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

/// Shared state behind every clone of a [`CareStore`]
pub(crate) struct StoreInner {
    pub(crate) config: StoreConfig,
    pub(crate) replica_id: Uuid,
    pub(crate) state: RwLock<StoreState>,
    pub(crate) durable: Arc<dyn DurableStore>,
    pub(crate) changes: broadcast::Sender<StoreChange>,
    pub(crate) remote: parking_lot::RwLock<Option<Arc<dyn RemoteEndpoint>>>,
    pub(crate) sync_in_flight: AtomicBool,
    pub(crate) sync_events: broadcast::Sender<SyncEvent>,
}

/// A local replica of the care record store
///
/// Cloning is cheap; clones share the same replica.
#[derive(Clone)]
pub struct CareStore {
    pub(crate) inner: Arc<StoreInner>,
}

/// Per-kind record counts and clock state, as shown by `carestore inspect`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoreSummary {
    pub replica_id: Uuid,
    /// Live heads per kind
    pub live: BTreeMap<EntityKind, usize>,
    /// Stored versions per kind, tombstones and superseded versions included
    pub stored: BTreeMap<EntityKind, usize>,
    pub conflicts: Vec<(EntityKind, String)>,
    pub knowledge: KnowledgeVector,
    pub last_synced: KnowledgeVector,
}

impl CareStore {
    /// Open (or create) a SQLite-backed store.
    pub async fn open(config: StoreConfig) -> StoreResult<Self> {
        let durable = SqliteDurableStore::open(&config).await?;
        Self::with_durable(config, Arc::new(durable)).await
    }

    /// An ephemeral store that keeps nothing once dropped.
    pub async fn in_memory() -> StoreResult<Self> {
        Self::with_durable(StoreConfig::in_memory(), Arc::new(MemoryDurableStore::new())).await
    }

    /// Open a store over any durable backend.
    pub async fn with_durable(config: StoreConfig, durable: Arc<dyn DurableStore>) -> StoreResult<Self> {
        let replica_id = durable.bind_replica(config.replica_id).await?;
        let snapshot = durable.load().await?;
        let state = StoreState::from_snapshot(replica_id, snapshot);

        let capacity = config.watch_buffer.max(1);
        let (changes, _) = broadcast::channel(capacity);
        let (sync_events, _) = broadcast::channel(capacity);

        tracing::info!(
            replica = %replica_id,
            records = state.len(),
            knowledge = %state.knowledge(),
            "Opened care store"
        );

        Ok(Self {
            inner: Arc::new(StoreInner {
                config,
                replica_id,
                state: RwLock::new(state),
                durable,
                changes,
                remote: parking_lot::RwLock::new(None),
                sync_in_flight: AtomicBool::new(false),
                sync_events,
            }),
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    pub fn replica_id(&self) -> Uuid {
        self.inner.replica_id
    }

    /// Start a write transaction; waits for any other writer to finish.
    pub(crate) async fn begin(&self) -> Transaction<'_> {
        let guard = self.inner.state.write().await;
        Transaction::new(guard, self.inner.durable.as_ref(), &self.inner.changes)
    }

    /// Run a local write in its own transaction and schedule a sync on success.
    async fn write<R>(&self, op: impl FnOnce(&mut Transaction<'_>) -> StoreResult<R>) -> StoreResult<R> {
        let result = {
            let mut tx = self.begin().await;
            let result = op(&mut tx)?;
            tx.commit().await?;
            result
        };
        self.schedule_sync();
        Ok(result)
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Add a new entity as the head of a new chain.
    ///
    /// Outcomes are placed on their task's occurrence: the task version must
    /// exist and its schedule must have the occurrence, in a region no newer
    /// task version has claimed.
    pub async fn add<T: Payload>(&self, version: Versioned<T>) -> StoreResult<Versioned<T>> {
        let entity = self
            .write(|tx| {
                let stamp = tx.local_stamp();
                add_entity(tx.state_mut(), version.into_entity(), &stamp)
            })
            .await?;
        typed(entity)
    }

    /// Add several entities atomically; they share one stamp.
    pub async fn add_all<T: Payload>(&self, versions: Vec<Versioned<T>>) -> StoreResult<Vec<Versioned<T>>> {
        let added = self
            .write(|tx| {
                let stamp = tx.local_stamp();
                versions
                    .into_iter()
                    .map(|version| add_entity(tx.state_mut(), version.into_entity(), &stamp))
                    .collect::<StoreResult<Vec<Entity>>>()
            })
            .await?;
        added.into_iter().map(typed).collect()
    }

    /// Append a new version after the current head of `version`'s chain.
    ///
    /// If `version` carries a UUID it must be the current head; a nil UUID
    /// updates whatever the head is.
    pub async fn update<T: Payload>(&self, version: Versioned<T>) -> StoreResult<Versioned<T>> {
        let entity = self
            .write(|tx| {
                let stamp = tx.local_stamp();
                update_entity(tx.state_mut(), version.into_entity(), &stamp)
            })
            .await?;
        typed(entity)
    }

    /// Tombstone the head of a chain in place. Returns the tombstoned version.
    pub async fn delete<T: Payload>(&self, id: &str) -> StoreResult<Versioned<T>> {
        let entity = self
            .write(|tx| {
                let stamp = tx.local_stamp();
                tx.state_mut().tombstone(T::KIND, id, &stamp)
            })
            .await?;
        typed(entity)
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub async fn fetch<T: Payload>(&self, query: &EntityQuery) -> StoreResult<Vec<Versioned<T>>> {
        let state = self.inner.state.read().await;
        query
            .evaluate(&state, T::KIND)
            .into_iter()
            .cloned()
            .map(typed)
            .collect()
    }

    pub async fn fetch_entities(&self, kind: EntityKind, query: &EntityQuery) -> Vec<Entity> {
        let state = self.inner.state.read().await;
        query.evaluate(&state, kind).into_iter().cloned().collect()
    }

    pub async fn count<T: Payload>(&self, query: &EntityQuery) -> usize {
        let state = self.inner.state.read().await;
        query.evaluate(&state, T::KIND).len()
    }

    /// The live head of a chain, if any.
    pub async fn fetch_head<T: Payload>(&self, id: &str) -> StoreResult<Option<Versioned<T>>> {
        let state = self.inner.state.read().await;
        state.resolve_head(T::KIND, id)?.cloned().map(typed).transpose()
    }

    /// The live outcome recorded for one occurrence of a task version.
    pub async fn fetch_outcome(&self, task_uuid: Uuid, occurrence: u32) -> StoreResult<Option<Versioned<Outcome>>> {
        self.fetch_head::<Outcome>(&Outcome::logical_id(task_uuid, occurrence))
            .await
    }

    /// Every stored version of a chain, oldest effective date first.
    pub async fn fetch_history<T: Payload>(&self, id: &str) -> StoreResult<Vec<Versioned<T>>> {
        self.history(T::KIND, id).await.into_iter().map(typed).collect()
    }

    pub async fn history(&self, kind: EntityKind, id: &str) -> Vec<Entity> {
        let state = self.inner.state.read().await;
        let mut versions: Vec<Entity> = state.versions(kind, id).into_iter().cloned().collect();
        versions.sort_by_key(|version| {
            let header = version.header();
            (header.effective_date, header.created_date, header.uuid)
        });
        versions
    }

    pub async fn get(&self, uuid: Uuid) -> Option<Entity> {
        self.inner.state.read().await.get(uuid).cloned()
    }

    /// A stream of query results that re-emits when they change.
    pub fn watch<T: Payload>(&self, query: EntityQuery) -> QueryStream<T> {
        QueryStream::new(self.clone(), query)
    }

    /// Commit notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.inner.changes.subscribe()
    }

    pub async fn knowledge(&self) -> KnowledgeVector {
        self.inner.state.read().await.knowledge().clone()
    }

    /// Knowledge pushed by the last successful sync.
    pub async fn last_synced(&self) -> KnowledgeVector {
        self.inner.state.read().await.last_synced().clone()
    }

    /// Chains left with more than one live head.
    pub async fn conflicts(&self) -> Vec<(EntityKind, String)> {
        self.inner.state.read().await.conflicts()
    }

    pub async fn summary(&self) -> StoreSummary {
        let state = self.inner.state.read().await;
        let mut live = BTreeMap::new();
        let mut stored = BTreeMap::new();
        for kind in EntityKind::ALL {
            let ids: Vec<&str> = state.logical_ids(kind).collect();
            let heads = ids.iter().map(|id| state.live_heads(kind, id).len()).sum();
            let versions = ids.iter().map(|id| state.versions(kind, id).len()).sum();
            live.insert(kind, heads);
            stored.insert(kind, versions);
        }
        StoreSummary {
            replica_id: state.replica_id(),
            live,
            stored,
            conflicts: state.conflicts(),
            knowledge: state.knowledge().clone(),
            last_synced: state.last_synced().clone(),
        }
    }

    // ------------------------------------------------------------------
    // Revisions
    // ------------------------------------------------------------------

    /// Everything `since` does not cover; the zero vector exports everything.
    pub async fn compute_revision(&self, since: &KnowledgeVector) -> RevisionRecord {
        let state = self.inner.state.read().await;
        revision::compute_revision(&state, since)
    }

    /// Everything except what this replica's first `since` changes already
    /// covered. `0` exports everything.
    pub async fn compute_revision_since(&self, since: i64) -> RevisionRecord {
        let vector = KnowledgeVector::single(self.inner.replica_id, since);
        self.compute_revision(&vector).await
    }

    /// Merge a revision record from another replica in one transaction.
    ///
    /// A failing resolver rejects the whole record.
    pub async fn merge_revision(
        &self,
        record: RevisionRecord,
        resolver: &dyn ConflictResolver,
    ) -> StoreResult<MergeReport> {
        let mut tx = self.begin().await;
        let report = merge::merge_revision(&mut tx, record, resolver).await?;
        tx.commit().await?;
        Ok(report)
    }
}

/// Convert a stored entity back to its payload type.
fn typed<T: Payload>(entity: Entity) -> StoreResult<Versioned<T>> {
    let kind = entity.kind();
    T::from_entity(entity)
        .ok_or_else(|| StoreError::Internal(format!("expected {} but found {}", T::KIND, kind)))
}

fn add_entity(state: &mut StoreState, mut entity: Entity, stamp: &KnowledgeVector) -> StoreResult<Entity> {
    place_outcome(state, &mut entity)?;
    state.create_head(entity, stamp)
}

fn update_entity(state: &mut StoreState, mut entity: Entity, stamp: &KnowledgeVector) -> StoreResult<Entity> {
    match entity.kind() {
        EntityKind::Outcome => {
            place_outcome(state, &mut entity)?;
            let updated = state.create_next_version(entity, stamp)?;
            for previous in &updated.header().previous_version_uuids {
                state.tombstone_version(*previous, stamp)?;
            }
            Ok(updated)
        }
        EntityKind::Task => {
            let head = state
                .resolve_head(EntityKind::Task, entity.id())?
                .and_then(Entity::as_task)
                .cloned();
            if let Some(head) = head {
                guard::check_task_update(state, &head, entity.header().effective_date)?;
            }
            state.create_next_version(entity, stamp)
        }
        _ => state.create_next_version(entity, stamp),
    }
}

/// Pin an outcome to its task occurrence: derive its id and event dates.
fn place_outcome(state: &StoreState, entity: &mut Entity) -> StoreResult<()> {
    let Entity::Outcome(outcome) = entity else {
        return Ok(());
    };
    let task_uuid = outcome.value.task_uuid;
    let occurrence = outcome.value.task_occurrence_index;

    let task: &Versioned<Task> = state
        .get(task_uuid)
        .and_then(Entity::as_task)
        .filter(|task| !task.header.is_tombstoned())
        .ok_or_else(|| StoreError::NotFound(format!("task version {}", task_uuid)))?;
    let event = guard::check_outcome_region(state, task, occurrence)?;

    outcome.value.start_date = Some(event.start);
    outcome.value.end_date = Some(event.end);
    outcome.header.id = Outcome::logical_id(task_uuid, occurrence);
    Ok(())
}
