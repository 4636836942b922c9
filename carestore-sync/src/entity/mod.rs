//! Versioned care entities
//!
//! Every stored record is a [`Versioned`] envelope around a kind-specific
//! payload. The envelope carries the version-chain linkage (own UUID,
//! previous/next UUIDs, tombstone date) and the knowledge stamp; the payload
//! is the only part that differs between kinds. [`Entity`] is the sum type
//! used wherever kinds are mixed, such as revision records and the store's
//! working set.

pub mod care_plan;
pub mod contact;
pub mod outcome;
pub mod patient;
pub mod task;

pub use care_plan::CarePlan;
pub use contact::{Contact, ContactCategory, LabeledValue, PostalAddress};
pub use outcome::{Outcome, OutcomeValue, TypedValue};
pub use patient::{BiologicalSex, Patient, PersonName};
pub use task::Task;

use crate::error::{StoreError, StoreResult};
use crate::knowledge::KnowledgeVector;
use crate::query::EntityQuery;
use chrono::{DateTime, Utc};
use serde::de::{DeserializeOwned, Error as _};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Entity kinds, in revision export order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Patient,
    CarePlan,
    Contact,
    Task,
    Outcome,
}

impl EntityKind {
    pub const ALL: [EntityKind; 5] = [
        EntityKind::Patient,
        EntityKind::CarePlan,
        EntityKind::Contact,
        EntityKind::Task,
        EntityKind::Outcome,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Patient => "patient",
            EntityKind::CarePlan => "care_plan",
            EntityKind::Contact => "contact",
            EntityKind::Task => "task",
            EntityKind::Outcome => "outcome",
        }
    }

    /// Outcomes are versioned by replacement, everything else by chain.
    pub fn is_chain_versioned(&self) -> bool {
        !matches!(self, EntityKind::Outcome)
    }
}

impl FromStr for EntityKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "patient" => Ok(EntityKind::Patient),
            "care_plan" => Ok(EntityKind::CarePlan),
            "contact" => Ok(EntityKind::Contact),
            "task" => Ok(EntityKind::Task),
            "outcome" => Ok(EntityKind::Outcome),
            _ => Err(StoreError::InvalidValue(format!("Unknown entity kind: {}", s))),
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Free-form note attached to an entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub content: String,
}

/// Denormalized bookkeeping copied verbatim between versions and replicas
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_identifier: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub user_info: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<Note>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
}

/// Identity, linkage and bookkeeping shared by every version
#[derive(Debug, Clone, PartialEq)]
pub struct VersionHeader {
    /// Logical id shared by all versions of one entity
    pub id: String,
    /// Version id, unique per version (nil until the store assigns one)
    pub uuid: Uuid,
    pub effective_date: DateTime<Utc>,
    pub created_date: DateTime<Utc>,
    pub updated_date: DateTime<Utc>,
    pub deleted_date: Option<DateTime<Utc>>,
    pub previous_version_uuids: Vec<Uuid>,
    pub next_version_uuids: Vec<Uuid>,
    /// Knowledge of the replica(s) that wrote this version
    pub stamp: KnowledgeVector,
    pub metadata: Metadata,
}

impl VersionHeader {
    fn draft(id: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            uuid: Uuid::nil(),
            effective_date: now,
            created_date: now,
            updated_date: now,
            deleted_date: None,
            previous_version_uuids: Vec::new(),
            next_version_uuids: Vec::new(),
            stamp: KnowledgeVector::new(),
            metadata: Metadata::default(),
        }
    }

    pub fn is_tombstoned(&self) -> bool {
        self.deleted_date.is_some()
    }

    /// Live head of its chain: not superseded and not deleted.
    pub fn is_head(&self) -> bool {
        self.next_version_uuids.is_empty() && self.deleted_date.is_none()
    }
}

/// A payload plus its version header
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub header: VersionHeader,
    pub value: T,
}

impl<T: Payload> Versioned<T> {
    /// Draft version for `id`, effective now. The store assigns the UUID.
    pub fn new(id: impl Into<String>, value: T) -> Self {
        let id = value.derived_id().unwrap_or_else(|| id.into());
        Self {
            header: VersionHeader::draft(id),
            value,
        }
    }

    pub fn effective_from(mut self, date: DateTime<Utc>) -> Self {
        self.header.effective_date = date;
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.header.metadata = metadata;
        self
    }

    pub fn id(&self) -> &str {
        &self.header.id
    }

    pub fn uuid(&self) -> Uuid {
        self.header.uuid
    }

    pub fn into_entity(self) -> Entity {
        T::into_entity(self)
    }
}

/// Kind-specific content of a versioned entity
pub trait Payload:
    Clone + fmt::Debug + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
    const KIND: EntityKind;

    fn into_entity(version: Versioned<Self>) -> Entity;

    fn from_entity(entity: Entity) -> Option<Versioned<Self>>;

    fn from_entity_ref(entity: &Entity) -> Option<&Versioned<Self>>;

    /// Logical id computed from the payload itself, if the kind has one.
    fn derived_id(&self) -> Option<String> {
        None
    }

    /// Schema-level checks run before every write.
    fn validate(&self) -> StoreResult<()> {
        Ok(())
    }

    /// Kind-specific query filters (care plan, patient, task references).
    fn matches(&self, _query: &EntityQuery) -> bool {
        true
    }
}

/// Any stored version, tagged with its kind
#[derive(Debug, Clone, PartialEq)]
pub enum Entity {
    Patient(Versioned<Patient>),
    CarePlan(Versioned<CarePlan>),
    Contact(Versioned<Contact>),
    Task(Versioned<Task>),
    Outcome(Versioned<Outcome>),
}

macro_rules! with_version {
    ($entity:expr, $version:ident => $body:expr) => {
        match $entity {
            Entity::Patient($version) => $body,
            Entity::CarePlan($version) => $body,
            Entity::Contact($version) => $body,
            Entity::Task($version) => $body,
            Entity::Outcome($version) => $body,
        }
    };
}

impl Entity {
    pub fn kind(&self) -> EntityKind {
        match self {
            Entity::Patient(_) => EntityKind::Patient,
            Entity::CarePlan(_) => EntityKind::CarePlan,
            Entity::Contact(_) => EntityKind::Contact,
            Entity::Task(_) => EntityKind::Task,
            Entity::Outcome(_) => EntityKind::Outcome,
        }
    }

    pub fn header(&self) -> &VersionHeader {
        with_version!(self, version => &version.header)
    }

    pub fn header_mut(&mut self) -> &mut VersionHeader {
        with_version!(self, version => &mut version.header)
    }

    pub fn uuid(&self) -> Uuid {
        self.header().uuid
    }

    pub fn id(&self) -> &str {
        &self.header().id
    }

    pub fn is_tombstoned(&self) -> bool {
        self.header().is_tombstoned()
    }

    pub fn as_task(&self) -> Option<&Versioned<Task>> {
        Task::from_entity_ref(self)
    }

    pub fn as_outcome(&self) -> Option<&Versioned<Outcome>> {
        Outcome::from_entity_ref(self)
    }

    pub fn validate(&self) -> StoreResult<()> {
        with_version!(self, version => version.value.validate())
    }

    /// Kinds whose logical id is derived from the payload must carry exactly
    /// that id.
    pub fn check_identity(&self) -> StoreResult<()> {
        let derived = with_version!(self, version => version.value.derived_id());
        match derived {
            Some(derived) if derived != self.id() => Err(StoreError::InvalidValue(format!(
                "{} {} is stored under '{}' but its payload addresses '{}'",
                self.kind(),
                self.uuid(),
                self.id(),
                derived
            ))),
            _ => Ok(()),
        }
    }

    /// Same kind and equal payload, ignoring headers.
    pub fn same_content(&self, other: &Entity) -> bool {
        match (self, other) {
            (Entity::Patient(a), Entity::Patient(b)) => a.value == b.value,
            (Entity::CarePlan(a), Entity::CarePlan(b)) => a.value == b.value,
            (Entity::Contact(a), Entity::Contact(b)) => a.value == b.value,
            (Entity::Task(a), Entity::Task(b)) => a.value == b.value,
            (Entity::Outcome(a), Entity::Outcome(b)) => a.value == b.value,
            _ => false,
        }
    }

    /// Order used for "latest wins" comparisons: creation date, then UUID.
    pub fn recency_key(&self) -> (DateTime<Utc>, Uuid) {
        (self.header().created_date, self.uuid())
    }

    pub(crate) fn matches(&self, query: &EntityQuery) -> bool {
        with_version!(self, version => version.value.matches(query))
    }
}

// Wire encoding: `{kind, payload, uuid, previousVersionUUIDs, nextVersionUUIDs, deletedDate?}`
// where `payload` holds the rest of the header next to the kind-specific fields.

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WirePayloadRef<'a, T> {
    id: &'a str,
    effective_date: DateTime<Utc>,
    created_date: DateTime<Utc>,
    updated_date: DateTime<Utc>,
    stamp: &'a KnowledgeVector,
    metadata: &'a Metadata,
    #[serde(flatten)]
    value: &'a T,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireEntityRef<'a, T> {
    kind: EntityKind,
    payload: WirePayloadRef<'a, T>,
    uuid: Uuid,
    #[serde(rename = "previousVersionUUIDs")]
    previous_version_uuids: &'a [Uuid],
    #[serde(rename = "nextVersionUUIDs")]
    next_version_uuids: &'a [Uuid],
    #[serde(skip_serializing_if = "Option::is_none")]
    deleted_date: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePayload<T> {
    id: String,
    effective_date: DateTime<Utc>,
    created_date: DateTime<Utc>,
    updated_date: DateTime<Utc>,
    #[serde(default)]
    stamp: KnowledgeVector,
    #[serde(default)]
    metadata: Metadata,
    #[serde(flatten)]
    value: T,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireEntity {
    kind: EntityKind,
    payload: serde_json::Value,
    uuid: Uuid,
    #[serde(rename = "previousVersionUUIDs", default)]
    previous_version_uuids: Vec<Uuid>,
    #[serde(rename = "nextVersionUUIDs", default)]
    next_version_uuids: Vec<Uuid>,
    #[serde(default)]
    deleted_date: Option<DateTime<Utc>>,
}

impl WireEntity {
    fn decode<T: Payload>(self) -> Result<Entity, serde_json::Error> {
        let payload: WirePayload<T> = serde_json::from_value(self.payload)?;
        let header = VersionHeader {
            id: payload.id,
            uuid: self.uuid,
            effective_date: payload.effective_date,
            created_date: payload.created_date,
            updated_date: payload.updated_date,
            deleted_date: self.deleted_date,
            previous_version_uuids: self.previous_version_uuids,
            next_version_uuids: self.next_version_uuids,
            stamp: payload.stamp,
            metadata: payload.metadata,
        };
        Ok(T::into_entity(Versioned { header, value: payload.value }))
    }
}

impl<T: Payload> Versioned<T> {
    fn wire(&self) -> WireEntityRef<'_, T> {
        let header = &self.header;
        WireEntityRef {
            kind: T::KIND,
            payload: WirePayloadRef {
                id: &header.id,
                effective_date: header.effective_date,
                created_date: header.created_date,
                updated_date: header.updated_date,
                stamp: &header.stamp,
                metadata: &header.metadata,
                value: &self.value,
            },
            uuid: header.uuid,
            previous_version_uuids: &header.previous_version_uuids,
            next_version_uuids: &header.next_version_uuids,
            deleted_date: header.deleted_date,
        }
    }
}

impl Serialize for Entity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        with_version!(self, version => version.wire().serialize(serializer))
    }
}

impl<'de> Deserialize<'de> for Entity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let wire = WireEntity::deserialize(deserializer)?;
        let decoded = match wire.kind {
            EntityKind::Patient => wire.decode::<Patient>(),
            EntityKind::CarePlan => wire.decode::<CarePlan>(),
            EntityKind::Contact => wire.decode::<Contact>(),
            EntityKind::Task => wire.decode::<Task>(),
            EntityKind::Outcome => wire.decode::<Outcome>(),
        };
        decoded.map_err(D::Error::custom)
    }
}

macro_rules! impl_payload_conversions {
    ($variant:ident) => {
        fn into_entity(version: Versioned<Self>) -> Entity {
            Entity::$variant(version)
        }

        fn from_entity(entity: Entity) -> Option<Versioned<Self>> {
            match entity {
                Entity::$variant(version) => Some(version),
                _ => None,
            }
        }

        fn from_entity_ref(entity: &Entity) -> Option<&Versioned<Self>> {
            match entity {
                Entity::$variant(version) => Some(version),
                _ => None,
            }
        }
    };
}

pub(crate) use impl_payload_conversions;
