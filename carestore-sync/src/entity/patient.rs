use super::{impl_payload_conversions, Entity, EntityKind, Payload, Versioned};
use crate::error::{StoreError, StoreResult};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersonName {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub given_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub middle_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub family_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suffix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
}

impl PersonName {
    pub fn new(given: impl Into<String>, family: impl Into<String>) -> Self {
        Self {
            given_name: Some(given.into()),
            family_name: Some(family.into()),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        [
            &self.prefix,
            &self.given_name,
            &self.middle_name,
            &self.family_name,
            &self.suffix,
            &self.nickname,
        ]
        .iter()
        .all(|part| part.as_deref().map_or(true, |s| s.trim().is_empty()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BiologicalSex {
    Male,
    Female,
    Other(String),
}

/// The person a care plan is for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Patient {
    pub name: PersonName,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sex: Option<BiologicalSex>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub birthday: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allergies: Vec<String>,
}

impl Patient {
    pub fn new(name: PersonName) -> Self {
        Self {
            name,
            sex: None,
            birthday: None,
            allergies: Vec::new(),
        }
    }
}

impl Payload for Patient {
    const KIND: EntityKind = EntityKind::Patient;

    impl_payload_conversions!(Patient);

    fn validate(&self) -> StoreResult<()> {
        if self.name.is_empty() {
            return Err(StoreError::InvalidValue("Patient name is empty".to_string()));
        }
        Ok(())
    }
}
