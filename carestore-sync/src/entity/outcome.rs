use super::{impl_payload_conversions, Entity, EntityKind, Payload, Versioned};
use crate::error::{StoreError, StoreResult};
use crate::query::EntityQuery;
use crate::schedule::MAX_OCCURRENCE;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single recorded value, tagged with its type on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum TypedValue {
    Integer(i64),
    Double(f64),
    Boolean(bool),
    Text(String),
    Binary(Vec<u8>),
    Date(DateTime<Utc>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutcomeValue {
    pub value: TypedValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub units: Option<String>,
    /// Caller-defined label such as "systolic"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub created_date: DateTime<Utc>,
}

impl OutcomeValue {
    pub fn new(value: TypedValue) -> Self {
        Self {
            value,
            units: None,
            kind: None,
            created_date: Utc::now(),
        }
    }

    pub fn with_units(mut self, units: impl Into<String>) -> Self {
        self.units = Some(units.into());
        self
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }
}

/// Result recorded against one occurrence of one task version.
///
/// The logical id is derived from `(task_uuid, task_occurrence_index)`, so
/// every replica agrees on which records compete for the same event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Outcome {
    pub task_uuid: Uuid,
    pub task_occurrence_index: u32,
    #[serde(default)]
    pub values: Vec<OutcomeValue>,
    /// Start of the addressed event, filled in by the store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<DateTime<Utc>>,
}

impl Outcome {
    pub fn new(task_uuid: Uuid, task_occurrence_index: u32, values: Vec<OutcomeValue>) -> Self {
        Self {
            task_uuid,
            task_occurrence_index,
            values,
            start_date: None,
            end_date: None,
        }
    }

    pub fn logical_id(task_uuid: Uuid, occurrence: u32) -> String {
        format!("{}_{}", task_uuid, occurrence)
    }
}

impl Payload for Outcome {
    const KIND: EntityKind = EntityKind::Outcome;

    impl_payload_conversions!(Outcome);

    fn derived_id(&self) -> Option<String> {
        Some(Outcome::logical_id(self.task_uuid, self.task_occurrence_index))
    }

    fn validate(&self) -> StoreResult<()> {
        if self.task_uuid.is_nil() {
            return Err(StoreError::InvalidValue(
                "Outcome must reference a task version".to_string(),
            ));
        }
        if self.task_occurrence_index > MAX_OCCURRENCE {
            return Err(StoreError::InvalidValue(format!(
                "Occurrence index {} is above the limit of {}",
                self.task_occurrence_index, MAX_OCCURRENCE
            )));
        }
        if let (Some(start), Some(end)) = (self.start_date, self.end_date) {
            if end < start {
                return Err(StoreError::InvalidValue(format!(
                    "Outcome ends before it starts: {} < {}",
                    end, start
                )));
            }
        }
        Ok(())
    }

    fn matches(&self, query: &EntityQuery) -> bool {
        query.task_uuids.is_empty() || query.task_uuids.contains(&self.task_uuid)
    }
}
