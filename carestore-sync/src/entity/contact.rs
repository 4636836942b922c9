use super::{impl_payload_conversions, Entity, EntityKind, Payload, PersonName, Versioned};
use crate::error::{StoreError, StoreResult};
use crate::query::EntityQuery;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContactCategory {
    CareProvider,
    Family,
    Friend,
}

/// A labelled phone number, email address or similar
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabeledValue {
    pub label: String,
    pub value: String,
}

impl LabeledValue {
    pub fn new(label: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostalAddress {
    #[serde(default)]
    pub street: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub postal_code: String,
    #[serde(default)]
    pub country: String,
}

/// Someone involved in a patient's care
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub name: PersonName,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub care_plan_uuid: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<ContactCategory>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub email_addresses: Vec<LabeledValue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub phone_numbers: Vec<LabeledValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<PostalAddress>,
}

impl Contact {
    pub fn new(name: PersonName) -> Self {
        Self {
            name,
            care_plan_uuid: None,
            organization: None,
            title: None,
            role: None,
            category: None,
            email_addresses: Vec::new(),
            phone_numbers: Vec::new(),
            address: None,
        }
    }

    pub fn in_care_plan(mut self, care_plan_uuid: Uuid) -> Self {
        self.care_plan_uuid = Some(care_plan_uuid);
        self
    }
}

impl Payload for Contact {
    const KIND: EntityKind = EntityKind::Contact;

    impl_payload_conversions!(Contact);

    fn validate(&self) -> StoreResult<()> {
        if self.name.is_empty() {
            return Err(StoreError::InvalidValue("Contact name is empty".to_string()));
        }
        Ok(())
    }

    fn matches(&self, query: &EntityQuery) -> bool {
        query.care_plan_uuids.is_empty()
            || self
                .care_plan_uuid
                .map_or(false, |uuid| query.care_plan_uuids.contains(&uuid))
    }
}
