//! Synchronization with a remote endpoint
//!
//! Protocol flow for [`SyncMode::Standard`]:
//! 1. Pull: fetch remote revisions the local knowledge does not cover
//! 2. Merge: fold them in, asking the endpoint to resolve conflicts
//! 3. Push: send everything neither the last sync nor the pull covered
//! 4. Mark synced: persist the pushed knowledge as the last-synced vector
//!
//! Only one sync runs per store at a time; a second attempt fails with
//! [`crate::StoreError::SyncBusy`].

pub mod orchestrator;
pub mod remote;

pub use remote::{MemoryRemote, RemoteEndpoint, SyncHandle};

use serde::{Deserialize, Serialize};

/// How a sync treats the two sides
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncMode {
    /// Pull, merge, then push.
    #[default]
    Standard,
    /// Replace every local record with a full import of the remote.
    OverwriteDeviceRecordsWithRemote,
    /// Push a full export and ask the remote to replace its state with it.
    OverwriteRemoteWithDeviceRecords,
}

/// Sync statistics
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStats {
    pub pulled_revisions: usize,
    pub merged_entities: usize,
    pub conflicts_resolved: usize,
    pub pushed_entities: usize,
}

/// Published after every sync attempt, including background ones
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    Completed(SyncStats),
    Failed { error: String, retryable: bool },
}
