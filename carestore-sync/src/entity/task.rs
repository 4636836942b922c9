use super::{impl_payload_conversions, Entity, EntityKind, Payload, Versioned};
use crate::error::{StoreError, StoreResult};
use crate::query::EntityQuery;
use crate::schedule::Schedule;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Something the patient is asked to do, on a schedule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    #[serde(default = "default_impacts_adherence")]
    pub impacts_adherence: bool,
    pub schedule: Schedule,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub care_plan_uuid: Option<Uuid>,
}

fn default_impacts_adherence() -> bool {
    true
}

impl Task {
    pub fn new(title: impl Into<String>, schedule: Schedule) -> Self {
        Self {
            title: Some(title.into()),
            instructions: None,
            impacts_adherence: true,
            schedule,
            care_plan_uuid: None,
        }
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    pub fn in_care_plan(mut self, care_plan_uuid: Uuid) -> Self {
        self.care_plan_uuid = Some(care_plan_uuid);
        self
    }
}

impl Payload for Task {
    const KIND: EntityKind = EntityKind::Task;

    impl_payload_conversions!(Task);

    fn validate(&self) -> StoreResult<()> {
        if let Some(title) = &self.title {
            if title.trim().is_empty() {
                return Err(StoreError::InvalidValue("Task title is empty".to_string()));
            }
        }
        self.schedule.validate()
    }

    fn matches(&self, query: &EntityQuery) -> bool {
        query.care_plan_uuids.is_empty()
            || self
                .care_plan_uuid
                .map_or(false, |uuid| query.care_plan_uuids.contains(&uuid))
    }
}
