//! Revision records and export

use crate::entity::Entity;
use crate::knowledge::KnowledgeVector;
use crate::state::StoreState;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// A batch of entity snapshots plus the exporter's knowledge at export time
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevisionRecord {
    pub entities: Vec<Entity>,
    pub knowledge_vector: KnowledgeVector,
}

impl RevisionRecord {
    pub fn new(mut entities: Vec<Entity>, knowledge_vector: KnowledgeVector) -> Self {
        sort_for_export(&mut entities);
        Self {
            entities,
            knowledge_vector,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn tombstones(&self) -> impl Iterator<Item = &Entity> {
        self.entities.iter().filter(|entity| entity.is_tombstoned())
    }
}

/// Tombstones first, then by kind, then by creation date and UUID.
pub fn export_order(a: &Entity, b: &Entity) -> Ordering {
    b.is_tombstoned()
        .cmp(&a.is_tombstoned())
        .then_with(|| a.kind().cmp(&b.kind()))
        .then_with(|| a.recency_key().cmp(&b.recency_key()))
}

pub fn sort_for_export(entities: &mut [Entity]) {
    entities.sort_by(export_order);
}

/// Everything stamped with knowledge `since` does not already cover.
///
/// The zero vector exports the full state. Read-only.
pub fn compute_revision(state: &StoreState, since: &KnowledgeVector) -> RevisionRecord {
    let full = since.is_zero();
    let entities = state
        .entities()
        .filter(|entity| full || !since.dominates(&entity.header().stamp))
        .cloned()
        .collect();
    RevisionRecord::new(entities, state.knowledge().clone())
}
