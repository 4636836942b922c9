//! Version-region guard
//!
//! A task version boundary partitions the occurrence timeline: occurrences
//! starting at or after a newer version's effective date belong to that
//! newer version. Outcomes must stay addressable by exactly one version, so
//! writes that would put an outcome on the wrong side of a boundary, or move
//! a boundary over existing outcomes, are rejected.

use crate::entity::{Entity, Outcome, Task, Versioned};
use crate::error::{StoreError, StoreResult};
use crate::schedule::ScheduleEvent;
use crate::state::StoreState;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, VecDeque};
use uuid::Uuid;

/// Check that `occurrence` of `task` may receive an outcome and return its event.
pub fn check_outcome_region(
    state: &StoreState,
    task: &Versioned<Task>,
    occurrence: u32,
) -> StoreResult<ScheduleEvent> {
    let event = task.value.schedule.event(occurrence).ok_or_else(|| {
        StoreError::InvalidValue(format!(
            "task '{}' has no occurrence {}",
            task.id(),
            occurrence
        ))
    })?;

    for successor in later_versions(state, task.uuid()) {
        if successor.effective_date <= event.start {
            return Err(StoreError::DataLossRejected(format!(
                "occurrence {} of task '{}' starts at {}, which version {} (effective {}) has claimed",
                occurrence,
                task.id(),
                event.start,
                successor.uuid,
                successor.effective_date
            )));
        }
    }
    Ok(event)
}

/// Check that a new version of `head` effective at `effective_date` would not
/// strand outcomes recorded against it or its ancestors.
pub fn check_task_update(
    state: &StoreState,
    head: &Versioned<Task>,
    effective_date: DateTime<Utc>,
) -> StoreResult<()> {
    let latest = ancestors(state, head.uuid())
        .into_iter()
        .flat_map(|task| live_outcome_starts(state, task))
        .max();

    match latest {
        Some(start) if start >= effective_date => Err(StoreError::DataLossRejected(format!(
            "task '{}' has an outcome at {}, after the new version's effective date {}",
            head.id(),
            start,
            effective_date
        ))),
        _ => Ok(()),
    }
}

/// Whether an outcome offered by a remote replica may be stored here.
///
/// Tombstones and outcomes whose task version is unknown locally are let
/// through; there is nothing to protect.
pub(crate) fn admits_outcome(state: &StoreState, outcome: &Versioned<Outcome>) -> bool {
    if outcome.header.is_tombstoned() {
        return true;
    }
    match state.get(outcome.value.task_uuid).and_then(Entity::as_task) {
        Some(task) => check_outcome_region(state, task, outcome.value.task_occurrence_index).is_ok(),
        None => true,
    }
}

/// Start of the event an outcome addresses, from the outcome itself or its task.
pub(crate) fn outcome_start(state: &StoreState, outcome: &Versioned<Outcome>) -> Option<DateTime<Utc>> {
    outcome.value.start_date.or_else(|| {
        state
            .get(outcome.value.task_uuid)
            .and_then(Entity::as_task)
            .and_then(|task| task.value.schedule.event(outcome.value.task_occurrence_index))
            .map(|event| event.start)
    })
}

struct Boundary {
    uuid: Uuid,
    effective_date: DateTime<Utc>,
}

/// Every stored version reachable through `next` links, breadth first.
fn later_versions(state: &StoreState, uuid: Uuid) -> Vec<Boundary> {
    walk(state, uuid, |entity| entity.header().next_version_uuids.clone())
        .into_iter()
        .skip(1)
        .map(|entity| Boundary {
            uuid: entity.uuid(),
            effective_date: entity.header().effective_date,
        })
        .collect()
}

/// The version itself and every stored version reachable through `previous` links.
fn ancestors(state: &StoreState, uuid: Uuid) -> Vec<Uuid> {
    walk(state, uuid, |entity| entity.header().previous_version_uuids.clone())
        .into_iter()
        .map(Entity::uuid)
        .collect()
}

fn walk<'s>(
    state: &'s StoreState,
    start: Uuid,
    links: impl Fn(&Entity) -> Vec<Uuid>,
) -> Vec<&'s Entity> {
    let mut seen = BTreeSet::new();
    let mut queue = VecDeque::from([start]);
    let mut visited = Vec::new();

    while let Some(uuid) = queue.pop_front() {
        if !seen.insert(uuid) {
            continue;
        }
        if let Some(entity) = state.get(uuid) {
            queue.extend(links(entity));
            visited.push(entity);
        }
    }
    visited
}

fn live_outcome_starts(state: &StoreState, task_uuid: Uuid) -> Vec<DateTime<Utc>> {
    state
        .outcomes_for_task(task_uuid)
        .into_iter()
        .filter(|entity| !entity.is_tombstoned())
        .filter_map(Entity::as_outcome)
        .filter_map(|outcome| outcome_start(state, outcome))
        .collect()
}
