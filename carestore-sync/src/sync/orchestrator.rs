//! Sync orchestration for a [`CareStore`]

use super::remote::{RemoteEndpoint, RemoteResolver, SyncHandle};
use super::{SyncEvent, SyncMode, SyncStats};
use crate::conflict::ConflictPolicy;
use crate::error::{StoreError, StoreResult};
use crate::knowledge::KnowledgeVector;
use crate::merge::{self, MergeReport};
use crate::revision;
use crate::store::CareStore;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Clears the in-flight flag however the sync ends.
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn acquire(flag: &'a AtomicBool) -> StoreResult<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| Self(flag))
            .map_err(|_| StoreError::SyncBusy)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Endpoint errors surface as `RemoteSyncFailed`.
fn remote_failure(err: StoreError) -> StoreError {
    match err {
        StoreError::RemoteSyncFailed(_) => err,
        other => StoreError::RemoteSyncFailed(other.to_string()),
    }
}

impl CareStore {
    /// Install the endpoint used by [`CareStore::sync`].
    pub fn set_remote(&self, remote: Arc<dyn RemoteEndpoint>) {
        remote.attach(SyncHandle::new(self));
        *self.inner.remote.write() = Some(remote);
    }

    pub fn remote(&self) -> Option<Arc<dyn RemoteEndpoint>> {
        self.inner.remote.read().clone()
    }

    /// Sync attempt outcomes, background ones included.
    pub fn sync_events(&self) -> tokio::sync::broadcast::Receiver<SyncEvent> {
        self.inner.sync_events.subscribe()
    }

    pub fn is_syncing(&self) -> bool {
        self.inner.sync_in_flight.load(Ordering::Acquire)
    }

    /// Synchronize with the installed remote endpoint.
    ///
    /// Fails with `SyncBusy` while another sync of this store is running.
    /// Every other outcome is also published on [`CareStore::sync_events`].
    pub async fn sync(&self, mode: SyncMode) -> StoreResult<SyncStats> {
        let _in_flight = InFlight::acquire(&self.inner.sync_in_flight)?;

        let result = self.run_sync(mode).await;
        let event = match &result {
            Ok(stats) => {
                tracing::info!(
                    ?mode,
                    pulled = stats.pulled_revisions,
                    merged = stats.merged_entities,
                    conflicts = stats.conflicts_resolved,
                    pushed = stats.pushed_entities,
                    "Sync completed"
                );
                SyncEvent::Completed(stats.clone())
            }
            Err(err) => {
                tracing::warn!(?mode, error = %err, "Sync failed");
                SyncEvent::Failed {
                    error: err.to_string(),
                    retryable: err.is_retryable(),
                }
            }
        };
        // No subscribers is fine
        let _ = self.inner.sync_events.send(event);
        result
    }

    async fn run_sync(&self, mode: SyncMode) -> StoreResult<SyncStats> {
        let remote = self
            .remote()
            .ok_or_else(|| StoreError::RemoteSyncFailed("no remote endpoint configured".to_string()))?;
        tracing::info!(?mode, replica = %self.replica_id(), "Sync started");

        match mode {
            SyncMode::Standard => self.sync_standard(remote.as_ref()).await,
            SyncMode::OverwriteDeviceRecordsWithRemote => self.overwrite_device(remote.as_ref()).await,
            SyncMode::OverwriteRemoteWithDeviceRecords => self.overwrite_remote(remote.as_ref()).await,
        }
    }

    async fn sync_standard(&self, remote: &dyn RemoteEndpoint) -> StoreResult<SyncStats> {
        let since = self.knowledge().await;
        let revisions = remote.pull_revisions(&since).await.map_err(remote_failure)?;
        let pulled_revisions = revisions.len();

        let mut pulled = KnowledgeVector::new();
        let mut report = MergeReport::default();
        {
            let mut tx = self.begin().await;
            let resolver = RemoteResolver(remote);
            for record in revisions {
                pulled.merge(&record.knowledge_vector);
                report.absorb(&merge::merge_revision(&mut tx, record, &resolver).await?);
            }
            tx.local_stamp();
            tx.commit().await?;
        }

        let record = {
            let state = self.inner.state.read().await;
            let covered = state.last_synced().merged(&pulled);
            revision::compute_revision(&state, &covered)
        };
        let pushed_entities = record.len();
        let pushed_knowledge = record.knowledge_vector.clone();
        remote.push_revisions(record, false).await.map_err(remote_failure)?;
        self.mark_synced(pushed_knowledge).await?;

        Ok(SyncStats {
            pulled_revisions,
            merged_entities: report.merged(),
            conflicts_resolved: report.conflicts_resolved,
            pushed_entities,
        })
    }

    async fn overwrite_device(&self, remote: &dyn RemoteEndpoint) -> StoreResult<SyncStats> {
        let revisions = remote
            .pull_revisions(&KnowledgeVector::new())
            .await
            .map_err(remote_failure)?;
        let pulled_revisions = revisions.len();

        let mut report = MergeReport::default();
        let mut tx = self.begin().await;
        tx.reset();
        for record in revisions {
            report.absorb(&merge::merge_revision(&mut tx, record, &ConflictPolicy::KeepRemote).await?);
        }
        tx.local_stamp();
        let knowledge = tx.state().knowledge().clone();
        tx.state_mut().set_last_synced(knowledge);
        tx.commit().await?;

        tracing::info!(records = report.merged(), "Replaced local records with remote state");
        Ok(SyncStats {
            pulled_revisions,
            merged_entities: report.merged(),
            conflicts_resolved: report.conflicts_resolved,
            pushed_entities: 0,
        })
    }

    async fn overwrite_remote(&self, remote: &dyn RemoteEndpoint) -> StoreResult<SyncStats> {
        let record = self.compute_revision(&KnowledgeVector::new()).await;
        let pushed_entities = record.len();
        let pushed_knowledge = record.knowledge_vector.clone();
        remote.push_revisions(record, true).await.map_err(remote_failure)?;
        self.mark_synced(pushed_knowledge).await?;

        Ok(SyncStats {
            pushed_entities,
            ..SyncStats::default()
        })
    }

    async fn mark_synced(&self, knowledge: KnowledgeVector) -> StoreResult<()> {
        let mut tx = self.begin().await;
        let synced = tx.state().last_synced().merged(&knowledge);
        tx.state_mut().set_last_synced(synced);
        tx.commit().await?;
        Ok(())
    }

    /// Start a background sync unless one is already running.
    ///
    /// Ignores `auto_sync`; endpoints call this through their [`SyncHandle`].
    pub fn request_sync(&self) {
        if self.is_syncing() {
            tracing::debug!("Sync requested while one is running");
            return;
        }
        self.spawn_sync();
    }

    /// After a local write: sync in the background if both the store and
    /// the endpoint are configured for it.
    pub(crate) fn schedule_sync(&self) {
        if !self.inner.config.auto_sync || self.is_syncing() {
            return;
        }
        let automatic = self
            .remote()
            .map_or(false, |remote| remote.automatically_synchronizes());
        if automatic {
            self.spawn_sync();
        }
    }

    fn spawn_sync(&self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("No async runtime available for background sync");
            return;
        };
        let store = self.clone();
        runtime.spawn(async move {
            // Failures are already published as sync events
            if let Err(StoreError::SyncBusy) = store.sync(SyncMode::Standard).await {
                tracing::debug!("Background sync skipped, another sync is running");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{CarePlan, Versioned};
    use crate::sync::MemoryRemote;

    #[tokio::test]
    async fn test_sync_without_remote_fails() {
        let store = CareStore::in_memory().await.unwrap();
        let mut events = store.sync_events();

        let result = store.sync(SyncMode::Standard).await;
        assert!(matches!(result, Err(StoreError::RemoteSyncFailed(_))));
        assert!(matches!(events.recv().await.unwrap(), SyncEvent::Failed { retryable: true, .. }));
        assert!(!store.is_syncing());
    }

    #[tokio::test]
    async fn test_in_flight_flag_is_exclusive() {
        let flag = AtomicBool::new(false);
        let held = InFlight::acquire(&flag).unwrap();
        assert!(matches!(InFlight::acquire(&flag), Err(StoreError::SyncBusy)));
        drop(held);
        assert!(InFlight::acquire(&flag).is_ok());
    }

    #[tokio::test]
    async fn test_standard_sync_marks_pushed_knowledge() {
        let store = CareStore::in_memory().await.unwrap();
        let remote = MemoryRemote::new();
        store.set_remote(Arc::new(remote.clone()));
        store.add(Versioned::new("plan", CarePlan::new("Diet"))).await.unwrap();

        let stats = store.sync(SyncMode::Standard).await.unwrap();
        assert_eq!(stats.pushed_entities, 1);
        assert_eq!(remote.len(), 1);
        assert!(store.last_synced().await.dominates(&remote.knowledge()));

        let again = store.sync(SyncMode::Standard).await.unwrap();
        assert_eq!(again.pushed_entities, 0);
        assert_eq!(again.merged_entities, 0);
    }
}
