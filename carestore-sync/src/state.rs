//! In-memory working set and version-chain operations
//!
//! `StoreState` is the replica's full view: every stored version indexed by
//! UUID and by `(kind, logical id)`, the replica's knowledge vector and the
//! knowledge it had at its last successful sync. Transactions work on a
//! private clone of it; every write records the UUIDs it touched so that the
//! commit can hand exactly those records to the durable store.

use crate::entity::{Entity, EntityKind};
use crate::error::{StoreError, StoreResult};
use crate::knowledge::KnowledgeVector;
use crate::persistence::Snapshot;
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use uuid::Uuid;

/// What happened to a record offered by a remote replica
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergedRecord {
    /// The UUID was new here.
    Inserted,
    /// The UUID was known and its tombstone, stamp or links were joined.
    Joined,
    /// Nothing new.
    Unchanged,
}

#[derive(Debug, Clone)]
pub struct StoreState {
    replica_id: Uuid,
    knowledge: KnowledgeVector,
    last_synced: KnowledgeVector,
    entities: HashMap<Uuid, Entity>,
    chains: BTreeMap<(EntityKind, String), BTreeSet<Uuid>>,
    /// UUID -> versions naming it as a previous version (present or not)
    successors: HashMap<Uuid, BTreeSet<Uuid>>,
    touched: BTreeSet<Uuid>,
}

impl StoreState {
    pub fn new(replica_id: Uuid) -> Self {
        Self {
            replica_id,
            knowledge: KnowledgeVector::new(),
            last_synced: KnowledgeVector::new(),
            entities: HashMap::new(),
            chains: BTreeMap::new(),
            successors: HashMap::new(),
            touched: BTreeSet::new(),
        }
    }

    pub fn from_snapshot(replica_id: Uuid, snapshot: Snapshot) -> Self {
        let mut state = Self::new(replica_id);
        state.knowledge = snapshot.knowledge;
        state.last_synced = snapshot.last_synced;
        for entity in snapshot.entities {
            state.upsert(entity);
        }
        state.touched.clear();
        state
    }

    pub fn replica_id(&self) -> Uuid {
        self.replica_id
    }

    pub fn knowledge(&self) -> &KnowledgeVector {
        &self.knowledge
    }

    pub fn last_synced(&self) -> &KnowledgeVector {
        &self.last_synced
    }

    pub fn set_last_synced(&mut self, vector: KnowledgeVector) {
        self.last_synced = vector;
    }

    pub fn merge_knowledge(&mut self, vector: &KnowledgeVector) {
        self.knowledge.merge(vector);
    }

    /// Count one locally originated change and return the resulting vector.
    pub fn increment_clock(&mut self) -> KnowledgeVector {
        self.knowledge.increment(self.replica_id);
        self.knowledge.clone()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn get(&self, uuid: Uuid) -> Option<&Entity> {
        self.entities.get(&uuid)
    }

    pub fn contains(&self, uuid: Uuid) -> bool {
        self.entities.contains_key(&uuid)
    }

    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    /// Logical ids of one kind, in id order.
    pub fn logical_ids(&self, kind: EntityKind) -> impl Iterator<Item = &str> {
        self.chains
            .range((kind, String::new())..)
            .take_while(move |((k, _), _)| *k == kind)
            .map(|((_, id), _)| id.as_str())
    }

    pub fn has_chain(&self, kind: EntityKind, id: &str) -> bool {
        self.chains.contains_key(&(kind, id.to_string()))
    }

    /// Every stored version of a chain, in no particular order.
    pub fn versions(&self, kind: EntityKind, id: &str) -> Vec<&Entity> {
        self.chains
            .get(&(kind, id.to_string()))
            .map(|uuids| uuids.iter().filter_map(|uuid| self.entities.get(uuid)).collect())
            .unwrap_or_default()
    }

    /// Versions with no successor and no tombstone, oldest first.
    pub fn live_heads(&self, kind: EntityKind, id: &str) -> Vec<&Entity> {
        let mut heads: Vec<&Entity> = self
            .versions(kind, id)
            .into_iter()
            .filter(|entity| entity.header().is_head())
            .collect();
        heads.sort_by_key(|entity| entity.recency_key());
        heads
    }

    /// The unique live head of a chain.
    ///
    /// More than one live head means a merge left the chain in conflict,
    /// which is reported as an internal error.
    pub fn resolve_head(&self, kind: EntityKind, id: &str) -> StoreResult<Option<&Entity>> {
        let heads = self.live_heads(kind, id);
        match heads.len() {
            0 => Ok(None),
            1 => Ok(heads.into_iter().next()),
            n => Err(StoreError::Internal(format!(
                "{} '{}' has {} competing heads",
                kind, id, n
            ))),
        }
    }

    /// Chains that currently have more than one live head.
    pub fn conflicts(&self) -> Vec<(EntityKind, String)> {
        self.chains
            .keys()
            .filter(|(kind, id)| self.live_heads(*kind, id).len() > 1)
            .cloned()
            .collect()
    }

    /// All outcome versions recorded against one task version.
    pub fn outcomes_for_task(&self, task_uuid: Uuid) -> Vec<&Entity> {
        let prefix = format!("{}_", task_uuid);
        self.chains
            .range((EntityKind::Outcome, prefix.clone())..)
            .take_while(|((kind, id), _)| *kind == EntityKind::Outcome && id.starts_with(&prefix))
            .flat_map(|(_, uuids)| uuids.iter().filter_map(|uuid| self.entities.get(uuid)))
            .collect()
    }

    /// Write a record and maintain the indexes and derived `next` links.
    pub(crate) fn upsert(&mut self, mut entity: Entity) {
        let uuid = entity.uuid();
        let previous = entity.header().previous_version_uuids.clone();

        for predecessor in &previous {
            self.successors.entry(*predecessor).or_default().insert(uuid);
            if let Some(existing) = self.entities.get_mut(predecessor) {
                let next = &mut existing.header_mut().next_version_uuids;
                if !next.contains(&uuid) {
                    next.push(uuid);
                    next.sort();
                    self.touched.insert(*predecessor);
                }
            }
        }

        if let Some(successors) = self.successors.get(&uuid) {
            let next = &mut entity.header_mut().next_version_uuids;
            next.extend(successors.iter().copied());
            next.sort();
            next.dedup();
        }

        self.chains
            .entry((entity.kind(), entity.id().to_string()))
            .or_default()
            .insert(uuid);
        self.entities.insert(uuid, entity);
        self.touched.insert(uuid);
    }

    /// Join a remote record into the working set.
    ///
    /// A known UUID only ever gains information: the earlier tombstone date,
    /// the union of stamps and the union of `next` links. Outcomes must be
    /// valid and stored under the id their task and occurrence derive.
    pub(crate) fn merge_record(&mut self, incoming: Entity) -> StoreResult<MergedRecord> {
        incoming.check_identity()?;
        if incoming.kind() == EntityKind::Outcome {
            incoming.validate()?;
        }
        let Some(existing) = self.entities.get(&incoming.uuid()) else {
            self.upsert(incoming);
            return Ok(MergedRecord::Inserted);
        };
        if existing.kind() != incoming.kind() || existing.id() != incoming.id() {
            return Err(StoreError::IdentifierConflict(format!(
                "version {} is already stored as {} '{}'",
                incoming.uuid(),
                existing.kind(),
                existing.id()
            )));
        }

        let mut joined = existing.clone();
        let theirs = incoming.header();
        let ours = joined.header_mut();
        ours.deleted_date = match (ours.deleted_date, theirs.deleted_date) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        ours.updated_date = ours.updated_date.max(theirs.updated_date);
        ours.stamp.merge(&theirs.stamp);
        ours.next_version_uuids.extend(theirs.next_version_uuids.iter().copied());
        ours.next_version_uuids.sort();
        ours.next_version_uuids.dedup();

        if &joined == existing {
            return Ok(MergedRecord::Unchanged);
        }
        self.upsert(joined);
        Ok(MergedRecord::Joined)
    }

    /// Start a new chain (or, for outcomes, a new live record at its id).
    pub(crate) fn create_head(
        &mut self,
        mut entity: Entity,
        stamp: &KnowledgeVector,
    ) -> StoreResult<Entity> {
        entity.validate()?;
        let kind = entity.kind();
        let id = entity.id().to_string();

        if !entity.uuid().is_nil() && self.contains(entity.uuid()) {
            return Err(StoreError::IdentifierConflict(format!(
                "version {} already exists",
                entity.uuid()
            )));
        }
        let taken = if kind.is_chain_versioned() {
            self.has_chain(kind, &id)
        } else {
            !self.live_heads(kind, &id).is_empty()
        };
        if taken {
            return Err(StoreError::IdentifierConflict(format!("{} '{}' already exists", kind, id)));
        }

        let now = Utc::now();
        let header = entity.header_mut();
        if header.uuid.is_nil() {
            header.uuid = Uuid::new_v4();
        }
        header.previous_version_uuids.clear();
        header.next_version_uuids.clear();
        header.deleted_date = None;
        header.created_date = now;
        header.updated_date = now;
        header.stamp = stamp.clone();

        tracing::debug!(kind = %kind, id = %id, uuid = %entity.uuid(), "Created head");
        self.upsert(entity.clone());
        Ok(entity)
    }

    /// Append a version after the current head.
    ///
    /// A non-nil UUID on `entity` names the version the caller edited; it
    /// must still be the head.
    pub(crate) fn create_next_version(
        &mut self,
        mut entity: Entity,
        stamp: &KnowledgeVector,
    ) -> StoreResult<Entity> {
        entity.validate()?;
        let kind = entity.kind();
        let id = entity.id().to_string();

        let head_uuid = match self.resolve_head(kind, &id)? {
            Some(head) => head.uuid(),
            None => {
                return Err(StoreError::NotFound(format!("{} '{}' has no live version", kind, id)))
            }
        };
        if !entity.uuid().is_nil() && entity.uuid() != head_uuid {
            return Err(StoreError::StaleHead(format!(
                "{} '{}' was edited from {} but the head is {}",
                kind,
                id,
                entity.uuid(),
                head_uuid
            )));
        }

        let now = Utc::now();
        let header = entity.header_mut();
        header.uuid = Uuid::new_v4();
        header.previous_version_uuids = vec![head_uuid];
        header.next_version_uuids.clear();
        header.deleted_date = None;
        header.created_date = now;
        header.updated_date = now;
        header.stamp = stamp.clone();

        tracing::debug!(kind = %kind, id = %id, uuid = %entity.uuid(), previous = %head_uuid, "Created next version");
        self.upsert(entity.clone());
        Ok(entity)
    }

    /// Mark the live head of a chain deleted, in place.
    pub(crate) fn tombstone(
        &mut self,
        kind: EntityKind,
        id: &str,
        stamp: &KnowledgeVector,
    ) -> StoreResult<Entity> {
        let head = match self.resolve_head(kind, id)? {
            Some(head) => head.uuid(),
            None => {
                return Err(StoreError::NotFound(format!("{} '{}' has no live version", kind, id)))
            }
        };
        let tombstoned = self.tombstone_version(head, stamp)?;
        tracing::debug!(kind = %kind, id = %id, uuid = %head, "Tombstoned head");
        Ok(tombstoned)
    }

    /// Mark one stored version deleted as a local change.
    ///
    /// An existing tombstone keeps the earlier of the two dates. The local
    /// stamp is joined into the version's own stamp, so a record that came
    /// from another replica still carries that replica's clock.
    pub(crate) fn tombstone_version(
        &mut self,
        uuid: Uuid,
        stamp: &KnowledgeVector,
    ) -> StoreResult<Entity> {
        let mut version = self
            .get(uuid)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("version {}", uuid)))?;

        let now = Utc::now();
        let header = version.header_mut();
        header.deleted_date = Some(header.deleted_date.map_or(now, |date| date.min(now)));
        header.updated_date = header.updated_date.max(now);
        header.stamp.merge(stamp);

        self.upsert(version.clone());
        Ok(version)
    }

    /// Drop every record, keeping only this replica's own clock.
    pub(crate) fn reset(&mut self) {
        let own = self.knowledge.clock(self.replica_id);
        let replica_id = self.replica_id;
        *self = Self::new(replica_id);
        self.knowledge = KnowledgeVector::single(replica_id, own);
    }

    pub(crate) fn take_touched(&mut self) -> BTreeSet<Uuid> {
        std::mem::take(&mut self.touched)
    }

    /// Whether both working sets hold exactly the same records.
    pub fn same_records(&self, other: &StoreState) -> bool {
        self.entities == other.entities
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{Outcome, Patient, PersonName, Versioned};

    fn patient(id: &str, given: &str) -> Entity {
        Versioned::new(id, Patient::new(PersonName::new(given, "Appleseed"))).into_entity()
    }

    fn state() -> StoreState {
        StoreState::new(Uuid::new_v4())
    }

    #[test]
    fn test_create_head_assigns_identity() {
        let mut state = state();
        let stamp = state.increment_clock();
        let head = state.create_head(patient("p1", "John"), &stamp).unwrap();

        assert!(!head.uuid().is_nil());
        assert_eq!(head.header().stamp, stamp);
        assert_eq!(state.resolve_head(EntityKind::Patient, "p1").unwrap().unwrap().uuid(), head.uuid());
    }

    #[test]
    fn test_duplicate_logical_id_conflicts() {
        let mut state = state();
        let stamp = state.increment_clock();
        state.create_head(patient("p1", "John"), &stamp).unwrap();
        state.tombstone(EntityKind::Patient, "p1", &stamp).unwrap();

        let result = state.create_head(patient("p1", "Jane"), &stamp);
        assert!(matches!(result, Err(StoreError::IdentifierConflict(_))));
    }

    #[test]
    fn test_next_version_links_both_directions() {
        let mut state = state();
        let stamp = state.increment_clock();
        let v1 = state.create_head(patient("p1", "John"), &stamp).unwrap();
        let v2 = state.create_next_version(patient("p1", "Johnny"), &stamp).unwrap();

        assert_eq!(v2.header().previous_version_uuids, vec![v1.uuid()]);
        let stored_v1 = state.get(v1.uuid()).unwrap();
        assert_eq!(stored_v1.header().next_version_uuids, vec![v2.uuid()]);
        assert_eq!(state.live_heads(EntityKind::Patient, "p1").len(), 1);
    }

    #[test]
    fn test_update_from_stale_version_is_rejected() {
        let mut state = state();
        let stamp = state.increment_clock();
        let v1 = state.create_head(patient("p1", "John"), &stamp).unwrap();
        state.create_next_version(patient("p1", "Johnny"), &stamp).unwrap();

        let mut edit = v1.clone();
        if let Entity::Patient(version) = &mut edit {
            version.value.allergies.push("penicillin".to_string());
        }
        let result = state.create_next_version(edit, &stamp);
        assert!(matches!(result, Err(StoreError::StaleHead(_))));
    }

    #[test]
    fn test_update_and_delete_missing_chain() {
        let mut state = state();
        let stamp = state.increment_clock();
        assert!(matches!(
            state.create_next_version(patient("ghost", "Nobody"), &stamp),
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            state.tombstone(EntityKind::Patient, "ghost", &stamp),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_links_are_derived_regardless_of_arrival_order() {
        let mut source = state();
        let stamp = source.increment_clock();
        let v1 = source.create_head(patient("p1", "John"), &stamp).unwrap();
        let v2 = source.create_next_version(patient("p1", "Johnny"), &stamp).unwrap();

        let mut v1_bare = v1.clone();
        v1_bare.header_mut().next_version_uuids.clear();

        let mut target = state();
        target.merge_record(v2.clone()).unwrap();
        target.merge_record(v1_bare).unwrap();

        assert_eq!(target.get(v1.uuid()).unwrap().header().next_version_uuids, vec![v2.uuid()]);
        assert_eq!(target.resolve_head(EntityKind::Patient, "p1").unwrap().unwrap().uuid(), v2.uuid());
    }

    #[test]
    fn test_merge_record_joins_tombstones() {
        let mut source = state();
        let stamp = source.increment_clock();
        let live = source.create_head(patient("p1", "John"), &stamp).unwrap();
        let dead = source.tombstone(EntityKind::Patient, "p1", &stamp).unwrap();

        let mut target = state();
        assert_eq!(target.merge_record(live.clone()).unwrap(), MergedRecord::Inserted);
        assert_eq!(target.merge_record(dead.clone()).unwrap(), MergedRecord::Joined);
        assert_eq!(target.merge_record(live).unwrap(), MergedRecord::Unchanged);
        assert_eq!(target.get(dead.uuid()).unwrap().header().deleted_date, dead.header().deleted_date);
    }

    #[test]
    fn test_merge_rejects_misaddressed_outcome() {
        let task = Uuid::new_v4();
        let mut outcome = Versioned::new("", Outcome::new(task, 0, Vec::new()));
        outcome.header.uuid = Uuid::new_v4();
        outcome.header.id = Outcome::logical_id(task, 1);

        let mut state = state();
        let result = state.merge_record(outcome.into_entity());
        assert!(matches!(result, Err(StoreError::InvalidValue(_))));
        assert!(state.is_empty());
    }

    #[test]
    fn test_merge_rejects_outcome_above_occurrence_limit() {
        let mut outcome = Versioned::new("", Outcome::new(Uuid::new_v4(), u32::MAX, Vec::new()));
        outcome.header.uuid = Uuid::new_v4();

        let mut state = state();
        assert!(matches!(
            state.merge_record(outcome.into_entity()),
            Err(StoreError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_reset_keeps_own_clock() {
        let mut state = state();
        let stamp = state.increment_clock();
        state.create_head(patient("p1", "John"), &stamp).unwrap();
        state.merge_knowledge(&KnowledgeVector::single(Uuid::new_v4(), 7));

        state.reset();
        assert!(state.is_empty());
        assert_eq!(state.knowledge(), &KnowledgeVector::single(state.replica_id(), 1));
    }
}
