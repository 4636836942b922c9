use super::{impl_payload_conversions, Entity, EntityKind, Payload, Versioned};
use crate::error::{StoreError, StoreResult};
use crate::query::EntityQuery;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A named plan of tasks, optionally tied to a patient version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CarePlan {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patient_uuid: Option<Uuid>,
}

impl CarePlan {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            patient_uuid: None,
        }
    }

    pub fn for_patient(mut self, patient_uuid: Uuid) -> Self {
        self.patient_uuid = Some(patient_uuid);
        self
    }
}

impl Payload for CarePlan {
    const KIND: EntityKind = EntityKind::CarePlan;

    impl_payload_conversions!(CarePlan);

    fn validate(&self) -> StoreResult<()> {
        if self.title.trim().is_empty() {
            return Err(StoreError::InvalidValue("Care plan title is empty".to_string()));
        }
        Ok(())
    }

    fn matches(&self, query: &EntityQuery) -> bool {
        query.patient_uuids.is_empty()
            || self
                .patient_uuid
                .map_or(false, |uuid| query.patient_uuids.contains(&uuid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patient_filter() {
        let patient = Uuid::new_v4();
        let plan = CarePlan::new("Nausea").for_patient(patient);

        assert!(plan.matches(&EntityQuery::default()));
        assert!(plan.matches(&EntityQuery::default().patients([patient])));
        assert!(!plan.matches(&EntityQuery::default().patients([Uuid::new_v4()])));
        assert!(!CarePlan::new("Orphan").matches(&EntityQuery::default().patients([patient])));
    }
}
