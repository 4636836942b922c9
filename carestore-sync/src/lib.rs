//! Versioned care-record store with knowledge-vector synchronization
//!
//! Provides:
//! - Version chains for patients, care plans, contacts and tasks
//! - Outcomes pinned to task occurrences, one live outcome per occurrence
//! - Knowledge vectors for causality tracking and delta export
//! - A merge engine that converges regardless of delivery order
//! - Pull/merge/push sync against a pluggable remote endpoint
//! - SQLite or in-memory durable storage

pub mod config;
pub mod conflict;
pub mod entity;
pub mod error;
pub mod guard;
pub mod knowledge;
pub mod merge;
pub mod persistence;
pub mod query;
pub mod revision;
pub mod schedule;
pub mod state;
pub mod store;
pub mod sync;
pub mod telemetry;
pub mod transaction;

pub use config::StoreConfig;
pub use conflict::{ConflictPolicy, ConflictResolver, MergeConflict, Resolution};
pub use entity::{
    BiologicalSex, CarePlan, Contact, ContactCategory, Entity, EntityKind, LabeledValue, Metadata,
    Note, Outcome, OutcomeValue, Patient, Payload, PersonName, PostalAddress, Task, TypedValue,
    VersionHeader, Versioned,
};
pub use error::{StoreError, StoreResult};
pub use knowledge::KnowledgeVector;
pub use merge::MergeReport;
pub use persistence::{DurableStore, MemoryDurableStore, SqliteDurableStore};
pub use query::{DateInterval, EntityQuery, QueryStream};
pub use revision::{compute_revision, RevisionRecord};
pub use schedule::{
    EventDuration, Schedule, ScheduleElement, ScheduleEvent, ScheduleInterval, MAX_OCCURRENCE,
};
pub use state::StoreState;
pub use store::{CareStore, StoreSummary};
pub use sync::{MemoryRemote, RemoteEndpoint, SyncEvent, SyncHandle, SyncMode, SyncStats};
pub use transaction::StoreChange;
