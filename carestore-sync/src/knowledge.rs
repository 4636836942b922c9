/// Knowledge Vectors
///
/// A knowledge vector maps each replica to the number of changes it has
/// originated. Every replica keeps one for the whole store, and every stored
/// version carries one as its stamp. Vectors are merged by taking the
/// pointwise maximum, which makes the merge idempotent, commutative and
/// associative.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Vector clock keyed by replica UUID
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KnowledgeVector {
    /// Map of replica_id -> counter
    clocks: BTreeMap<Uuid, i64>,
}

impl KnowledgeVector {
    /// Create a new empty vector
    pub fn new() -> Self {
        Self::default()
    }

    /// A vector that only knows `replica` up to `clock`.
    pub fn single(replica: Uuid, clock: i64) -> Self {
        let mut vector = Self::new();
        if clock > 0 {
            vector.clocks.insert(replica, clock);
        }
        vector
    }

    /// Get the counter for a replica (zero when unknown)
    pub fn clock(&self, replica: Uuid) -> i64 {
        self.clocks.get(&replica).copied().unwrap_or(0)
    }

    /// Increment the counter for a replica and return the new value
    pub fn increment(&mut self, replica: Uuid) -> i64 {
        let counter = self.clocks.entry(replica).or_insert(0);
        *counter = counter.saturating_add(1);
        *counter
    }

    /// Merge with another vector (taking the maximum of each counter)
    pub fn merge(&mut self, other: &KnowledgeVector) {
        for (replica, clock) in &other.clocks {
            if *clock <= 0 {
                continue;
            }
            let current = self.clocks.entry(*replica).or_insert(*clock);
            *current = (*current).max(*clock);
        }
    }

    /// Merged copy of two vectors.
    pub fn merged(&self, other: &KnowledgeVector) -> KnowledgeVector {
        let mut merged = self.clone();
        merged.merge(other);
        merged
    }

    /// True when this vector knows at least as much as `other` about every replica.
    pub fn dominates(&self, other: &KnowledgeVector) -> bool {
        other
            .clocks
            .iter()
            .all(|(replica, clock)| self.clock(*replica) >= *clock)
    }

    /// Strictly-less ordering: `self <= other` pointwise and `self != other`.
    pub fn happened_before(&self, other: &KnowledgeVector) -> bool {
        other.dominates(self) && !self.dominates(other)
    }

    /// Neither vector dominates the other.
    pub fn is_concurrent(&self, other: &KnowledgeVector) -> bool {
        !self.dominates(other) && !other.dominates(self)
    }

    /// True when no replica has a positive counter.
    pub fn is_zero(&self) -> bool {
        self.clocks.values().all(|clock| *clock == 0)
    }

    pub fn replicas(&self) -> impl Iterator<Item = (&Uuid, &i64)> {
        self.clocks.iter()
    }
}

impl FromIterator<(Uuid, i64)> for KnowledgeVector {
    fn from_iter<I: IntoIterator<Item = (Uuid, i64)>>(iter: I) -> Self {
        let mut vector = Self::new();
        for (replica, clock) in iter {
            vector.merge(&Self::single(replica, clock));
        }
        vector
    }
}

impl fmt::Display for KnowledgeVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (replica, clock) in &self.clocks {
            if !first {
                f.write_str(",")?;
            }
            write!(f, "{}:{}", replica, clock)?;
            first = false;
        }
        Ok(())
    }
}
