//! Revision merge engine
//!
//! Merging is a join over version records: a known UUID only gains
//! information, `next` links are derived from `previous` links, and outcome
//! groups settle on their most recently created record. None of that depends
//! on arrival order, so conflict-free revisions merge idempotently,
//! commutatively and associatively. Divergent heads are handed to a
//! [`ConflictResolver`]; resolution writes are local changes and carry a
//! fresh local stamp.

use crate::conflict::{ConflictResolver, MergeConflict, Resolution};
use crate::entity::{Entity, EntityKind, Outcome, Versioned};
use crate::error::{StoreError, StoreResult};
use crate::guard;
use crate::revision::RevisionRecord;
use crate::state::{MergedRecord, StoreState};
use crate::transaction::Transaction;
use chrono::Utc;
use std::collections::{BTreeSet, HashSet};
use uuid::Uuid;

/// Counts of what one merge did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Records that were new here
    pub inserted: usize,
    /// Known records that gained a tombstone, stamp or link
    pub joined: usize,
    /// Live outcomes refused by the version-region guard
    pub skipped: usize,
    pub conflicts_resolved: usize,
    /// Outcomes moved from a discarded task version onto the winner
    pub rehomed: usize,
}

impl MergeReport {
    pub fn merged(&self) -> usize {
        self.inserted + self.joined
    }

    pub fn absorb(&mut self, other: &MergeReport) {
        self.inserted += other.inserted;
        self.joined += other.joined;
        self.skipped += other.skipped;
        self.conflicts_resolved += other.conflicts_resolved;
        self.rehomed += other.rehomed;
    }
}

type ChainKey = (EntityKind, String);

/// Merge one revision record into the transaction's working set.
///
/// A resolver error aborts the merge; the caller drops the transaction and
/// nothing from the record is kept.
pub(crate) async fn merge_revision(
    tx: &mut Transaction<'_>,
    record: RevisionRecord,
    resolver: &dyn ConflictResolver,
) -> StoreResult<MergeReport> {
    let mut report = MergeReport::default();
    let mut incoming: HashSet<Uuid> = HashSet::new();
    let mut chains: BTreeSet<ChainKey> = BTreeSet::new();
    let mut outcome_groups: BTreeSet<String> = BTreeSet::new();

    let (outcomes, versioned): (Vec<Entity>, Vec<Entity>) = record
        .entities
        .into_iter()
        .partition(|entity| entity.kind() == EntityKind::Outcome);

    for entity in versioned {
        let key = (entity.kind(), entity.id().to_string());
        let uuid = entity.uuid();
        if absorb(tx.state_mut(), entity, &mut report)? == MergedRecord::Inserted {
            incoming.insert(uuid);
        }
        chains.insert(key);
    }

    for entity in outcomes {
        entity.check_identity()?;
        entity.validate()?;
        let known = tx.state().contains(entity.uuid());
        let admitted = match entity.as_outcome() {
            Some(outcome) => known || guard::admits_outcome(tx.state(), outcome),
            None => true,
        };
        if !admitted {
            tracing::warn!(
                uuid = %entity.uuid(),
                id = %entity.id(),
                "Skipping outcome in a region claimed by a newer task version"
            );
            report.skipped += 1;
            continue;
        }
        outcome_groups.insert(entity.id().to_string());
        absorb(tx.state_mut(), entity, &mut report)?;
    }

    for (kind, id) in chains {
        let heads = tx.state().live_heads(kind, &id);
        if heads.len() < 2 {
            continue;
        }
        let (remote, local): (Vec<Entity>, Vec<Entity>) = heads
            .into_iter()
            .cloned()
            .partition(|head| incoming.contains(&head.uuid()));
        let conflict = MergeConflict { kind, id, local, remote };

        tracing::info!(
            kind = %conflict.kind,
            id = %conflict.id,
            local = conflict.local.len(),
            remote = conflict.remote.len(),
            "Resolving merge conflict"
        );
        let resolution = resolver.resolve(&conflict).await?;
        let rehomed = apply_resolution(tx, &conflict, resolution, &mut outcome_groups)?;
        report.conflicts_resolved += 1;
        report.rehomed += rehomed;
    }

    for id in outcome_groups {
        settle_outcomes(tx.state_mut(), &id);
    }

    tx.state_mut().merge_knowledge(&record.knowledge_vector);

    tracing::debug!(
        inserted = report.inserted,
        joined = report.joined,
        skipped = report.skipped,
        conflicts = report.conflicts_resolved,
        "Merged revision"
    );
    Ok(report)
}

fn absorb(state: &mut StoreState, entity: Entity, report: &mut MergeReport) -> StoreResult<MergedRecord> {
    let merged = state.merge_record(entity)?;
    match merged {
        MergedRecord::Inserted => report.inserted += 1,
        MergedRecord::Joined => report.joined += 1,
        MergedRecord::Unchanged => {}
    }
    Ok(merged)
}

/// Install the winner of a conflict as the sole head; returns re-homed outcome count.
fn apply_resolution(
    tx: &mut Transaction<'_>,
    conflict: &MergeConflict,
    resolution: Resolution,
    outcome_groups: &mut BTreeSet<String>,
) -> StoreResult<usize> {
    let keep_remote = matches!(resolution, Resolution::KeepRemote);

    let (winner, discarded, superseded) = match resolution {
        Resolution::KeepRemote | Resolution::KeepDevice => {
            let preferred = if keep_remote {
                latest(&conflict.remote).or_else(|| latest(&conflict.local))
            } else {
                latest(&conflict.local).or_else(|| latest(&conflict.remote))
            };
            let winner = preferred.ok_or_else(|| {
                StoreError::Internal(format!("Conflict on '{}' has no candidates", conflict.id))
            })?;

            let stamp = tx.local_stamp();
            let mut discarded = Vec::new();
            for loser in conflict.candidates().filter(|head| head.uuid() != winner.uuid()) {
                discarded.push(tx.state_mut().tombstone_version(loser.uuid(), &stamp)?);
            }
            (winner, discarded, Vec::new())
        }
        Resolution::Keep(chosen) => {
            if !conflict.is_candidate(&chosen) {
                return Err(StoreError::InvalidValue(format!(
                    "Resolution for '{}' names {}, which is not a competing head",
                    conflict.id,
                    chosen.uuid()
                )));
            }
            let stamp = tx.local_stamp();
            let heads: Vec<Uuid> = conflict.candidates().map(Entity::uuid).collect();
            let source = tx
                .state()
                .get(chosen.uuid())
                .cloned()
                .unwrap_or(chosen);

            let mut resolved = source;
            let now = Utc::now();
            let header = resolved.header_mut();
            header.uuid = Uuid::new_v4();
            header.previous_version_uuids = heads;
            header.previous_version_uuids.sort();
            header.next_version_uuids.clear();
            header.deleted_date = None;
            header.created_date = now;
            header.updated_date = now;
            header.stamp = stamp;
            tx.state_mut().upsert(resolved.clone());

            (resolved, Vec::new(), conflict.candidates().cloned().collect())
        }
    };

    tracing::debug!(
        id = %conflict.id,
        winner = %winner.uuid(),
        discarded = discarded.len(),
        "Conflict resolved"
    );

    if winner.kind() != EntityKind::Task {
        return Ok(0);
    }
    rehome_outcomes(tx, &winner, &discarded, &superseded, outcome_groups)
}

fn latest(heads: &[Entity]) -> Option<Entity> {
    heads.iter().max_by_key(|head| head.recency_key()).cloned()
}

/// Move live outcomes off losing task versions.
///
/// Outcomes on a discarded version all move; outcomes on a superseded
/// version move only if they fall in the winner's region. An outcome moves
/// when the winner has the same occurrence and no live outcome there yet,
/// and is tombstoned otherwise.
fn rehome_outcomes(
    tx: &mut Transaction<'_>,
    winner: &Entity,
    discarded: &[Entity],
    superseded: &[Entity],
    outcome_groups: &mut BTreeSet<String>,
) -> StoreResult<usize> {
    let Some(winner) = winner.as_task().cloned() else {
        return Ok(0);
    };

    let mut stranded: Vec<Versioned<Outcome>> = Vec::new();
    for (task, whole) in discarded
        .iter()
        .map(|task| (task, true))
        .chain(superseded.iter().map(|task| (task, false)))
    {
        if task.uuid() == winner.uuid() {
            continue;
        }
        for entity in tx.state().outcomes_for_task(task.uuid()) {
            let Some(outcome) = entity.as_outcome() else { continue };
            if outcome.header.is_tombstoned() {
                continue;
            }
            let in_winner_region = guard::outcome_start(tx.state(), outcome)
                .map_or(true, |start| start >= winner.header.effective_date);
            if whole || in_winner_region {
                stranded.push(outcome.clone());
            }
        }
    }
    if stranded.is_empty() {
        return Ok(0);
    }

    let stamp = tx.local_stamp();
    let mut rehomed = 0;
    for outcome in stranded {
        let occurrence = outcome.value.task_occurrence_index;
        let target_id = Outcome::logical_id(winner.uuid(), occurrence);
        let target_free = tx.state().live_heads(EntityKind::Outcome, &target_id).is_empty();
        let event = winner.value.schedule.event(occurrence);

        tx.state_mut().tombstone_version(outcome.uuid(), &stamp)?;
        outcome_groups.insert(outcome.id().to_string());

        match event {
            Some(event) if target_free => {
                let now = Utc::now();
                let mut moved = outcome.clone();
                moved.value.task_uuid = winner.uuid();
                moved.value.start_date = Some(event.start);
                moved.value.end_date = Some(event.end);
                moved.header.id = target_id.clone();
                moved.header.uuid = Uuid::new_v4();
                moved.header.previous_version_uuids = vec![outcome.uuid()];
                moved.header.next_version_uuids.clear();
                moved.header.deleted_date = None;
                moved.header.created_date = now;
                moved.header.updated_date = now;
                moved.header.stamp = stamp.clone();

                tracing::debug!(
                    from = %outcome.uuid(),
                    to = %moved.header.uuid,
                    occurrence,
                    "Re-homed outcome onto winning task version"
                );
                tx.state_mut().upsert(moved.into_entity());
                outcome_groups.insert(target_id);
                rehomed += 1;
            }
            _ => {
                tracing::debug!(uuid = %outcome.uuid(), occurrence, "Dropped outcome of discarded task version");
            }
        }
    }
    Ok(rehomed)
}

/// Leave at most one live outcome in a group: the most recently created one.
///
/// Each older record is tombstoned no later than the creation of the record
/// created right after it. Records only ever join a group, so that date can
/// only move earlier as more of the group arrives, and every replica derives
/// the same result without stamping it.
pub(crate) fn settle_outcomes(state: &mut StoreState, id: &str) {
    let mut versions: Vec<Entity> = state
        .versions(EntityKind::Outcome, id)
        .into_iter()
        .cloned()
        .collect();
    versions.sort_by_key(Entity::recency_key);

    for pair in versions.windows(2) {
        let [older, newer] = pair else { continue };
        let cutoff = newer.header().created_date;
        let mut entity = older.clone();
        let header = entity.header_mut();
        let deleted = header.deleted_date.map_or(cutoff, |date| date.min(cutoff));
        if header.deleted_date != Some(deleted) {
            header.deleted_date = Some(deleted);
            tracing::debug!(uuid = %header.uuid, id = %id, "Superseded outcome tombstoned");
            state.upsert(entity);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::ConflictPolicy;
    use crate::entity::{Patient, PersonName};
    use crate::knowledge::KnowledgeVector;
    use crate::persistence::MemoryDurableStore;
    use crate::revision::compute_revision;
    use chrono::Duration;
    use tokio::sync::{broadcast, RwLock};

    fn patient(given: &str) -> Entity {
        Versioned::new("p1", Patient::new(PersonName::new(given, "Doe"))).into_entity()
    }

    /// A replica's state after a single local add.
    fn replica_with(given: &str) -> StoreState {
        let mut state = StoreState::new(Uuid::new_v4());
        let stamp = state.increment_clock();
        state.create_head(patient(given), &stamp).unwrap();
        state
    }

    async fn merge_into(
        state: StoreState,
        record: RevisionRecord,
        resolver: &dyn ConflictResolver,
    ) -> StoreResult<(StoreState, MergeReport)> {
        let lock = RwLock::new(state);
        let durable = MemoryDurableStore::new();
        let (sender, _receiver) = broadcast::channel(8);
        let report = {
            let mut tx = Transaction::new(lock.write().await, &durable, &sender);
            let report = merge_revision(&mut tx, record, resolver).await?;
            tx.commit().await?;
            report
        };
        Ok((lock.into_inner(), report))
    }

    #[tokio::test]
    async fn test_fresh_records_are_inserted_and_knowledge_folded() {
        let source = replica_with("Jane");
        let record = compute_revision(&source, &KnowledgeVector::new());
        let target = StoreState::new(Uuid::new_v4());

        let (merged, report) = merge_into(target, record.clone(), &ConflictPolicy::KeepRemote).await.unwrap();
        assert_eq!(report.inserted, 1);
        assert_eq!(report.conflicts_resolved, 0);
        assert!(merged.knowledge().dominates(&record.knowledge_vector));

        let (again, report) = merge_into(merged.clone(), record, &ConflictPolicy::KeepRemote).await.unwrap();
        assert_eq!(report.merged(), 0);
        assert!(again.same_records(&merged));
    }

    #[tokio::test]
    async fn test_keep_remote_discards_local_head() {
        let local = replica_with("Local");
        let remote = replica_with("Remote");
        let local_head = local.resolve_head(EntityKind::Patient, "p1").unwrap().unwrap().uuid();
        let remote_head = remote.resolve_head(EntityKind::Patient, "p1").unwrap().unwrap().uuid();
        let record = compute_revision(&remote, &KnowledgeVector::new());

        let (merged, report) = merge_into(local, record, &ConflictPolicy::KeepRemote).await.unwrap();
        assert_eq!(report.conflicts_resolved, 1);
        let head = merged.resolve_head(EntityKind::Patient, "p1").unwrap().unwrap();
        assert_eq!(head.uuid(), remote_head);
        assert!(head.header().previous_version_uuids.is_empty());
        assert!(merged.get(local_head).unwrap().is_tombstoned());
    }

    #[tokio::test]
    async fn test_keep_device_still_advances_knowledge() {
        let local = replica_with("Local");
        let remote = replica_with("Remote");
        let local_head = local.resolve_head(EntityKind::Patient, "p1").unwrap().unwrap().uuid();
        let record = compute_revision(&remote, &KnowledgeVector::new());

        let (merged, _) = merge_into(local, record.clone(), &ConflictPolicy::KeepDevice).await.unwrap();
        assert_eq!(merged.resolve_head(EntityKind::Patient, "p1").unwrap().unwrap().uuid(), local_head);
        assert!(merged.knowledge().dominates(&record.knowledge_vector));
    }

    #[tokio::test]
    async fn test_rejected_head_keeps_its_remote_stamp() {
        let remote = replica_with("Remote");
        let remote_head = remote.resolve_head(EntityKind::Patient, "p1").unwrap().unwrap().clone();
        let record = compute_revision(&remote, &KnowledgeVector::new());

        let (merged, _) = merge_into(replica_with("Local"), record, &ConflictPolicy::KeepDevice).await.unwrap();
        let rejected = merged.get(remote_head.uuid()).unwrap();
        assert!(rejected.is_tombstoned());
        assert!(rejected.header().stamp.dominates(&remote_head.header().stamp));
        assert!(rejected.header().stamp.clock(merged.replica_id()) > 0);
    }

    #[tokio::test]
    async fn test_remerge_after_resolution_is_a_no_op() {
        for policy in [ConflictPolicy::KeepRemote, ConflictPolicy::KeepDevice, ConflictPolicy::KeepLatest] {
            let record = compute_revision(&replica_with("Remote"), &KnowledgeVector::new());
            let (merged, report) = merge_into(replica_with("Local"), record.clone(), &policy).await.unwrap();
            assert_eq!(report.conflicts_resolved, 1, "{}", policy);

            let (again, report) = merge_into(merged.clone(), record, &policy).await.unwrap();
            assert_eq!(report, MergeReport::default(), "{}", policy);
            assert!(again.same_records(&merged), "{}", policy);
            assert_eq!(again.knowledge(), merged.knowledge(), "{}", policy);
        }
    }

    #[tokio::test]
    async fn test_keep_creates_resolution_version_over_all_heads() {
        let local = replica_with("Local");
        let remote = replica_with("Remote");
        let record = compute_revision(&remote, &KnowledgeVector::new());

        let (merged, _) = merge_into(local, record, &ConflictPolicy::KeepLatest).await.unwrap();
        let head = merged.resolve_head(EntityKind::Patient, "p1").unwrap().unwrap();
        assert_eq!(head.header().previous_version_uuids.len(), 2);
        for previous in &head.header().previous_version_uuids {
            let loser = merged.get(*previous).unwrap();
            assert!(!loser.is_tombstoned());
            assert_eq!(loser.header().next_version_uuids, vec![head.uuid()]);
        }
    }

    struct Foreign;

    #[async_trait::async_trait]
    impl ConflictResolver for Foreign {
        async fn resolve(&self, _conflict: &MergeConflict) -> StoreResult<Resolution> {
            Ok(Resolution::Keep(replica_with("Stranger").entities().next().cloned().unwrap()))
        }
    }

    struct Failing;

    #[async_trait::async_trait]
    impl ConflictResolver for Failing {
        async fn resolve(&self, _conflict: &MergeConflict) -> StoreResult<Resolution> {
            Err(StoreError::RemoteSyncFailed("resolver offline".to_string()))
        }
    }

    #[tokio::test]
    async fn test_resolver_must_pick_a_candidate() {
        let record = compute_revision(&replica_with("Remote"), &KnowledgeVector::new());
        let result = merge_into(replica_with("Local"), record, &Foreign).await;
        assert!(matches!(result, Err(StoreError::InvalidValue(_))));
    }

    #[tokio::test]
    async fn test_resolver_failure_rejects_whole_revision() {
        let local = replica_with("Local");
        let record = compute_revision(&replica_with("Remote"), &KnowledgeVector::new());

        let lock = RwLock::new(local.clone());
        let durable = MemoryDurableStore::new();
        let (sender, _receiver) = broadcast::channel(8);
        {
            let mut tx = Transaction::new(lock.write().await, &durable, &sender);
            assert!(merge_revision(&mut tx, record, &Failing).await.is_err());
        }
        let after = lock.read().await;
        assert!(after.same_records(&local));
        assert_eq!(after.knowledge(), local.knowledge());
    }

    #[test]
    fn test_settled_dates_do_not_depend_on_arrival_order() {
        let task = Uuid::new_v4();
        let now = Utc::now();
        let outcome = |minutes_ago: i64| {
            let mut version = Versioned::new("", Outcome::new(task, 0, Vec::new()));
            version.header.uuid = Uuid::new_v4();
            version.header.created_date = now - Duration::minutes(minutes_ago);
            version.into_entity()
        };
        let (oldest, middle, newest) = (outcome(10), outcome(5), outcome(0));
        let id = oldest.id().to_string();

        let mut settled = Vec::new();
        for order in [[&oldest, &middle, &newest], [&oldest, &newest, &middle]] {
            let mut state = StoreState::new(Uuid::new_v4());
            for entity in order {
                state.upsert(entity.clone());
                settle_outcomes(&mut state, &id);
            }
            settled.push(
                [&oldest, &middle, &newest]
                    .map(|entity| state.get(entity.uuid()).unwrap().header().deleted_date),
            );
        }

        assert_eq!(settled[0], settled[1]);
        assert_eq!(
            settled[0],
            [Some(middle.header().created_date), Some(now), None]
        );
    }

    #[test]
    fn test_settle_outcomes_keeps_newest_live() {
        let mut state = StoreState::new(Uuid::new_v4());
        let stamp = state.increment_clock();
        let task = Uuid::new_v4();
        let now = Utc::now();

        let mut older = Versioned::new("", Outcome::new(task, 0, Vec::new()));
        older.header.uuid = Uuid::new_v4();
        older.header.created_date = now - Duration::minutes(5);
        older.header.stamp = stamp.clone();
        let mut newer = older.clone();
        newer.header.uuid = Uuid::new_v4();
        newer.header.created_date = now;
        newer.header.deleted_date = Some(now + Duration::minutes(1));

        state.upsert(older.clone().into_entity());
        state.upsert(newer.clone().into_entity());
        settle_outcomes(&mut state, older.id());

        assert_eq!(state.get(older.uuid()).unwrap().header().deleted_date, Some(now));
        assert_eq!(
            state.get(newer.uuid()).unwrap().header().deleted_date,
            Some(now + Duration::minutes(1))
        );
    }
}
