//! Mapping from stored event names to their registered types.

use std::collections::HashMap;

use crate::event::{DomainEvent, Event, EventRecord, Visibility};
use crate::{EventStoreError, Result};

type PayloadCheck = fn(&serde_json::Value) -> std::result::Result<(), serde_json::Error>;

fn check_payload<E: DomainEvent>(
    payload: &serde_json::Value,
) -> std::result::Result<(), serde_json::Error> {
    E::deserialize(payload).map(drop)
}

#[derive(Clone, Copy)]
struct EventDescriptor {
    visibility: Visibility,
    check: PayloadCheck,
}

/// Registry of the event types a store knows how to read and write.
///
/// Passed to a store at construction. Records whose name is not registered
/// fail with [`EventStoreError::UnknownEventType`].
#[derive(Clone, Default)]
pub struct EventRegistry {
    descriptors: HashMap<&'static str, EventDescriptor>,
}

impl EventRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an event type, builder style.
    pub fn register<E: DomainEvent>(mut self) -> Self {
        self.insert::<E>();
        self
    }

    /// Registers an event type.
    pub fn insert<E: DomainEvent>(&mut self) {
        self.descriptors.insert(
            E::EVENT_NAME,
            EventDescriptor {
                visibility: E::VISIBILITY,
                check: check_payload::<E>,
            },
        );
    }

    /// Returns true if an event type is registered under this name.
    pub fn contains(&self, event_name: &str) -> bool {
        self.descriptors.contains_key(event_name)
    }

    /// Returns the visibility registered for this name.
    pub fn visibility(&self, event_name: &str) -> Option<Visibility> {
        self.descriptors.get(event_name).map(|d| d.visibility)
    }

    /// Returns the number of registered event types.
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Checks that an incoming event names a registered type.
    pub fn ensure_known(&self, event: &Event) -> Result<()> {
        if self.contains(event.event_name()) {
            Ok(())
        } else {
            Err(EventStoreError::UnknownEventType(
                event.event_name().to_string(),
            ))
        }
    }

    /// Reconstructs a domain event from its persisted record.
    ///
    /// The payload must decode into the registered type; visibility comes
    /// from the registration.
    pub fn rehydrate(&self, record: EventRecord) -> Result<Event> {
        let descriptor = self
            .descriptors
            .get(record.event_name.as_str())
            .ok_or_else(|| EventStoreError::UnknownEventType(record.event_name.clone()))?;

        (descriptor.check)(&record.payload)?;
        Ok(record.into_event(descriptor.visibility))
    }
}

impl std::fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.descriptors.keys().collect();
        names.sort();
        f.debug_struct("EventRegistry").field("events", &names).finish()
    }
}
