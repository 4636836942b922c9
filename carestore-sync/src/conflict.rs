//! Conflict descriptions and resolution policies

use crate::entity::{Entity, EntityKind};
use crate::error::{StoreError, StoreResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Divergent heads found for one logical id while merging
#[derive(Debug, Clone, PartialEq)]
pub struct MergeConflict {
    pub kind: EntityKind,
    pub id: String,
    /// Heads that were already stored here
    pub local: Vec<Entity>,
    /// Heads introduced by the revision being merged
    pub remote: Vec<Entity>,
}

impl MergeConflict {
    /// Every competing head, local first.
    pub fn candidates(&self) -> impl Iterator<Item = &Entity> {
        self.local.iter().chain(self.remote.iter())
    }

    pub fn is_candidate(&self, entity: &Entity) -> bool {
        self.candidates().any(|candidate| candidate.uuid() == entity.uuid())
    }

    /// The most recently created candidate.
    pub fn latest(&self) -> Option<&Entity> {
        self.candidates().max_by_key(|candidate| candidate.recency_key())
    }
}

/// Outcome of a conflict-resolution decision
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// The newest remote head wins; local heads are discarded.
    KeepRemote,
    /// Local heads win; remote heads are discarded.
    KeepDevice,
    /// A new version with this candidate's content supersedes every head.
    Keep(Entity),
}

/// Strategy consulted once per conflicting logical id
#[async_trait]
pub trait ConflictResolver: Send + Sync {
    async fn resolve(&self, conflict: &MergeConflict) -> StoreResult<Resolution>;
}

/// Fixed resolution policies
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictPolicy {
    #[default]
    KeepRemote,
    KeepDevice,
    /// Keep the most recently created candidate, wherever it came from.
    KeepLatest,
}

impl ConflictPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictPolicy::KeepRemote => "keep-remote",
            ConflictPolicy::KeepDevice => "keep-device",
            ConflictPolicy::KeepLatest => "keep-latest",
        }
    }
}

impl fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictPolicy {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "keep-remote" => Ok(ConflictPolicy::KeepRemote),
            "keep-device" => Ok(ConflictPolicy::KeepDevice),
            "keep-latest" => Ok(ConflictPolicy::KeepLatest),
            _ => Err(StoreError::InvalidValue(format!("Unknown conflict policy: {}", s))),
        }
    }
}

#[async_trait]
impl ConflictResolver for ConflictPolicy {
    async fn resolve(&self, conflict: &MergeConflict) -> StoreResult<Resolution> {
        match self {
            ConflictPolicy::KeepRemote => Ok(Resolution::KeepRemote),
            ConflictPolicy::KeepDevice => Ok(Resolution::KeepDevice),
            ConflictPolicy::KeepLatest => conflict
                .latest()
                .cloned()
                .map(Resolution::Keep)
                .ok_or_else(|| StoreError::Internal(format!("Conflict on '{}' has no candidates", conflict.id))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{Patient, PersonName, Versioned};
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    fn head(given: &str, age: i64) -> Entity {
        let mut version = Versioned::new("p1", Patient::new(PersonName::new(given, "Doe")));
        version.header.uuid = Uuid::new_v4();
        version.header.created_date = Utc::now() - Duration::minutes(age);
        version.into_entity()
    }

    #[tokio::test]
    async fn test_keep_latest_picks_newest_candidate() {
        let newest = head("Newest", 1);
        let conflict = MergeConflict {
            kind: EntityKind::Patient,
            id: "p1".to_string(),
            local: vec![head("Old", 30)],
            remote: vec![newest.clone(), head("Older", 60)],
        };

        assert_eq!(conflict.candidates().count(), 3);
        assert!(conflict.is_candidate(&newest));
        assert_eq!(
            ConflictPolicy::KeepLatest.resolve(&conflict).await.unwrap(),
            Resolution::Keep(newest)
        );
        assert_eq!(
            ConflictPolicy::KeepDevice.resolve(&conflict).await.unwrap(),
            Resolution::KeepDevice
        );
    }

    #[test]
    fn test_policy_names() {
        for policy in [ConflictPolicy::KeepRemote, ConflictPolicy::KeepDevice, ConflictPolicy::KeepLatest] {
            assert_eq!(policy.as_str().parse::<ConflictPolicy>().unwrap(), policy);
        }
        assert!("newest".parse::<ConflictPolicy>().is_err());
    }
}
