//! Entity queries and result streams

use crate::entity::{Entity, EntityKind, Payload, Versioned};
use crate::error::StoreResult;
use crate::state::StoreState;
use crate::store::CareStore;
use crate::transaction::StoreChange;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use tokio::sync::broadcast::{self, error::RecvError};
use uuid::Uuid;

/// Half-open time window `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateInterval {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Filter over one entity kind. Empty lists do not filter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityQuery {
    pub ids: Vec<String>,
    pub uuids: Vec<Uuid>,
    pub group_identifiers: Vec<String>,
    pub remote_ids: Vec<String>,
    pub care_plan_uuids: Vec<Uuid>,
    pub patient_uuids: Vec<Uuid>,
    pub task_uuids: Vec<Uuid>,
    /// Return the version in force during this window instead of the heads
    pub date_interval: Option<DateInterval>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl EntityQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ids.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn uuids(mut self, uuids: impl IntoIterator<Item = Uuid>) -> Self {
        self.uuids.extend(uuids);
        self
    }

    pub fn groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.group_identifiers.extend(groups.into_iter().map(Into::into));
        self
    }

    pub fn care_plans(mut self, uuids: impl IntoIterator<Item = Uuid>) -> Self {
        self.care_plan_uuids.extend(uuids);
        self
    }

    pub fn patients(mut self, uuids: impl IntoIterator<Item = Uuid>) -> Self {
        self.patient_uuids.extend(uuids);
        self
    }

    pub fn tasks(mut self, uuids: impl IntoIterator<Item = Uuid>) -> Self {
        self.task_uuids.extend(uuids);
        self
    }

    pub fn during(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.date_interval = Some(DateInterval { start, end });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    fn matches_header(&self, entity: &Entity) -> bool {
        let header = entity.header();
        let metadata = &header.metadata;
        (self.uuids.is_empty() || self.uuids.contains(&header.uuid))
            && (self.group_identifiers.is_empty()
                || metadata
                    .group_identifier
                    .as_ref()
                    .map_or(false, |group| self.group_identifiers.contains(group)))
            && (self.remote_ids.is_empty()
                || metadata
                    .remote_id
                    .as_ref()
                    .map_or(false, |remote| self.remote_ids.contains(remote)))
    }

    /// Run the query against a working set.
    pub(crate) fn evaluate<'s>(&self, state: &'s StoreState, kind: EntityKind) -> Vec<&'s Entity> {
        let mut results: Vec<&Entity> = Vec::new();

        for id in state.logical_ids(kind) {
            if !self.ids.is_empty() && !self.ids.iter().any(|wanted| wanted == id) {
                continue;
            }
            let versions = state.versions(kind, id);
            let selected: Vec<&Entity> = match (&self.date_interval, kind.is_chain_versioned()) {
                (None, _) => versions.into_iter().filter(|v| v.header().is_head()).collect(),
                (Some(interval), true) => in_force(state, versions, interval),
                (Some(interval), false) => versions
                    .into_iter()
                    .filter(|v| v.header().is_head() && outcome_overlaps(v, interval))
                    .collect(),
            };
            results.extend(
                selected
                    .into_iter()
                    .filter(|entity| self.matches_header(entity) && entity.matches(self)),
            );
        }

        results.sort_by(|a, b| {
            let a_key = (a.header().effective_date, a.id(), a.uuid());
            let b_key = (b.header().effective_date, b.id(), b.uuid());
            a_key.cmp(&b_key)
        });
        results
            .into_iter()
            .skip(self.offset)
            .take(self.limit.unwrap_or(usize::MAX))
            .collect()
    }
}

/// The version of one chain in force during `interval`, if any.
///
/// A version is in force when it takes effect before the window ends and no
/// live successor takes effect before then. Tombstoned successors are
/// discarded branches; a chain only continues through them if they were
/// themselves continued. Deleted chains have no version in force. When a
/// resolved conflict leaves more than one candidate, the one that took
/// effect last wins.
fn in_force<'s>(state: &'s StoreState, versions: Vec<&'s Entity>, interval: &DateInterval) -> Vec<&'s Entity> {
    let tips_deleted = versions
        .iter()
        .filter(|v| v.header().next_version_uuids.is_empty())
        .all(|v| v.is_tombstoned());
    if tips_deleted {
        return Vec::new();
    }

    versions
        .into_iter()
        .filter(|v| !v.is_tombstoned() && v.header().effective_date < interval.end)
        .filter(|v| {
            live_successors(state, v)
                .iter()
                .all(|next| next.header().effective_date >= interval.end)
        })
        .max_by_key(|v| (v.header().effective_date, v.recency_key()))
        .into_iter()
        .collect()
}

/// Nearest non-tombstoned versions after `version`, looking through
/// tombstoned ones.
fn live_successors<'s>(state: &'s StoreState, version: &Entity) -> Vec<&'s Entity> {
    let mut live = Vec::new();
    let mut seen: HashSet<Uuid> = HashSet::new();
    let mut pending: Vec<Uuid> = version.header().next_version_uuids.clone();

    while let Some(uuid) = pending.pop() {
        if !seen.insert(uuid) {
            continue;
        }
        let Some(next) = state.get(uuid) else { continue };
        if next.is_tombstoned() {
            pending.extend(next.header().next_version_uuids.iter().copied());
        } else {
            live.push(next);
        }
    }
    live
}

fn outcome_overlaps(entity: &Entity, interval: &DateInterval) -> bool {
    let Some(outcome) = entity.as_outcome() else {
        return false;
    };
    let start = outcome.value.start_date.unwrap_or(outcome.header.effective_date);
    let end = outcome.value.end_date.unwrap_or(start);
    start < interval.end && end >= interval.start
}

/// Re-emitting query results
///
/// The first `next` returns the current results; later calls wait for a
/// commit touching the queried kind and return only when the results differ
/// from the last ones returned.
pub struct QueryStream<T: Payload> {
    store: CareStore,
    query: EntityQuery,
    changes: broadcast::Receiver<StoreChange>,
    last: Option<Vec<Versioned<T>>>,
}

impl<T: Payload> QueryStream<T> {
    pub(crate) fn new(store: CareStore, query: EntityQuery) -> Self {
        let changes = store.subscribe();
        Self {
            store,
            query,
            changes,
            last: None,
        }
    }

    /// Next distinct result set, or `None` once the store is gone.
    pub async fn next(&mut self) -> Option<StoreResult<Vec<Versioned<T>>>> {
        if self.last.is_none() {
            return Some(self.refresh().await);
        }
        loop {
            match self.changes.recv().await {
                Ok(change) if !change.touches(T::KIND) => continue,
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => return None,
            }
            let results = match self.store.fetch::<T>(&self.query).await {
                Ok(results) => results,
                Err(err) => return Some(Err(err)),
            };
            if self.last.as_ref() != Some(&results) {
                self.last = Some(results.clone());
                return Some(Ok(results));
            }
        }
    }

    async fn refresh(&mut self) -> StoreResult<Vec<Versioned<T>>> {
        let results = self.store.fetch::<T>(&self.query).await?;
        self.last = Some(results.clone());
        Ok(results)
    }
}
