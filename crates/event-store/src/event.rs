use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use uuid::Uuid;

use crate::AggregateId;
use crate::query::EventCursor;

/// Unique identifier for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    /// Creates a new random event ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates an event ID from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for EventId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Version number for an aggregate, used for optimistic concurrency control.
///
/// Version 0 means "no history". The first event carries version 1 and each
/// subsequent event on the same aggregate increments it by exactly 1.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Version(i64);

impl Version {
    /// Creates a new version from a raw value.
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// Returns the initial version (0) for an aggregate without history.
    pub fn initial() -> Self {
        Self(0)
    }

    /// Returns the first version (1) for the first event.
    pub fn first() -> Self {
        Self(1)
    }

    /// Returns the next version.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns the raw version value.
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Version {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<Version> for i64 {
    fn from(version: Version) -> Self {
        version.0
    }
}

/// Whether an event leaves the bounded context through the publisher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Visibility {
    /// Delivered to the publisher after commit.
    #[default]
    Public,
    /// Kept inside the event log only.
    Private,
}

/// Trait for typed event payloads.
///
/// The name is the stable tag written to the log and used as the routing key
/// when the event is published.
pub trait DomainEvent: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Tag identifying this event type in storage.
    const EVENT_NAME: &'static str;

    /// Visibility of every event of this type.
    const VISIBILITY: Visibility = Visibility::Public;
}

/// An immutable fact about a state change of one aggregate.
///
/// Only two fields are ever set after construction: the aggregate version,
/// assigned by the aggregate when the event is applied, and the event id,
/// restored from storage on rehydration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    event_id: EventId,
    aggregate_id: AggregateId,
    event_name: String,
    payload: serde_json::Value,
    aggregate_version: Version,
    visibility: Visibility,
}

impl Event {
    /// Creates a new unversioned event with a fresh id.
    pub fn new(
        aggregate_id: AggregateId,
        event_name: impl Into<String>,
        payload: serde_json::Value,
        visibility: Visibility,
    ) -> Self {
        Self {
            event_id: EventId::new(),
            aggregate_id,
            event_name: event_name.into(),
            payload,
            aggregate_version: Version::initial(),
            visibility,
        }
    }

    /// Creates a new unversioned event from a typed payload.
    pub fn from_domain<E: DomainEvent>(
        aggregate_id: AggregateId,
        payload: &E,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(
            aggregate_id,
            E::EVENT_NAME,
            serde_json::to_value(payload)?,
            E::VISIBILITY,
        ))
    }

    /// Returns this event with the given version. Used when replaying or
    /// seeding stores directly.
    pub fn with_version(mut self, version: Version) -> Self {
        self.aggregate_version = version;
        self
    }

    /// Assigns the aggregate version. Called by the aggregate when applying.
    pub fn assign_version(&mut self, version: Version) {
        self.aggregate_version = version;
    }

    pub fn event_id(&self) -> EventId {
        self.event_id
    }

    pub fn aggregate_id(&self) -> &AggregateId {
        &self.aggregate_id
    }

    pub fn event_name(&self) -> &str {
        &self.event_name
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    pub fn aggregate_version(&self) -> Version {
        self.aggregate_version
    }

    pub fn visibility(&self) -> Visibility {
        self.visibility
    }

    pub fn is_public(&self) -> bool {
        self.visibility == Visibility::Public
    }

    /// Decodes the payload into its typed form.
    pub fn decode<E: DomainEvent>(&self) -> Result<E, serde_json::Error> {
        E::deserialize(&self.payload)
    }
}

/// Persisted form of an event.
///
/// Visibility is not stored; it is a property of the event type and is
/// restored by the registry when the record is read back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub event_id: EventId,
    pub aggregate_id: AggregateId,
    pub event_name: String,
    pub payload: serde_json::Value,
    pub aggregate_version: Version,
}

impl From<&Event> for EventRecord {
    fn from(event: &Event) -> Self {
        Self {
            event_id: event.event_id,
            aggregate_id: event.aggregate_id.clone(),
            event_name: event.event_name.clone(),
            payload: event.payload.clone(),
            aggregate_version: event.aggregate_version,
        }
    }
}

impl EventRecord {
    /// Rebuilds the event, restoring the stored id and version.
    pub(crate) fn into_event(self, visibility: Visibility) -> Event {
        Event {
            event_id: self.event_id,
            aggregate_id: self.aggregate_id,
            event_name: self.event_name,
            payload: self.payload,
            aggregate_version: self.aggregate_version,
            visibility,
        }
    }
}

/// An event read back from the log together with its storage position.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEvent {
    /// Global position in insertion order; usable as a feed cursor.
    pub cursor: EventCursor,

    /// The rehydrated event.
    pub event: Event,

    /// When the record was durably appended.
    pub recorded_at: DateTime<Utc>,
}

impl StoredEvent {
    /// Discards the storage metadata.
    pub fn into_event(self) -> Event {
        self.event
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Renamed {
        name: String,
    }

    impl DomainEvent for Renamed {
        const EVENT_NAME: &'static str = "Renamed";
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Audited {}

    impl DomainEvent for Audited {
        const EVENT_NAME: &'static str = "Audited";
        const VISIBILITY: Visibility = Visibility::Private;
    }

    #[test]
    fn event_id_new_creates_unique_ids() {
        let id1 = EventId::new();
        let id2 = EventId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn version_initial_and_first() {
        assert_eq!(Version::initial().as_i64(), 0);
        assert_eq!(Version::first().as_i64(), 1);
        assert_eq!(Version::initial().next(), Version::first());
        assert!(Version::new(1) < Version::new(2));
    }

    #[test]
    fn from_domain_is_unversioned_and_tagged() {
        let event = Event::from_domain(
            AggregateId::new("a-1"),
            &Renamed {
                name: "renamed".to_string(),
            },
        )
        .unwrap();

        assert_eq!(event.event_name(), "Renamed");
        assert_eq!(event.aggregate_version(), Version::initial());
        assert!(event.is_public());
        assert_eq!(event.payload(), &serde_json::json!({"name": "renamed"}));
    }

    #[test]
    fn private_events_carry_their_visibility() {
        let event = Event::from_domain(AggregateId::new("a-1"), &Audited {}).unwrap();
        assert!(!event.is_public());
        assert_eq!(event.visibility(), Visibility::Private);
    }

    #[test]
    fn decode_returns_typed_payload() {
        let event = Event::from_domain(
            AggregateId::new("a-1"),
            &Renamed {
                name: "x".to_string(),
            },
        )
        .unwrap();

        let decoded: Renamed = event.decode().unwrap();
        assert_eq!(decoded.name, "x");
    }

    #[test]
    fn record_keeps_id_and_version_but_not_visibility() {
        let event = Event::new(
            AggregateId::new("a-1"),
            "Audited",
            serde_json::json!({}),
            Visibility::Private,
        )
        .with_version(Version::new(3));

        let record = EventRecord::from(&event);
        assert_eq!(record.event_id, event.event_id());
        assert_eq!(record.aggregate_version, Version::new(3));

        let restored = record.into_event(Visibility::Private);
        assert_eq!(restored, event);
    }
}
