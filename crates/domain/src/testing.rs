//! Test fixtures: a small aggregate with creation, change, uniqueness and
//! deletion events.
//!
//! Available to downstream test suites through the `test-util` feature.

use std::sync::LazyLock;

use common::AggregateId;
use event_store::{DomainEvent, EventRegistry, Visibility};
use serde::{Deserialize, Serialize};

use crate::aggregate::{Aggregate, AggregateCore, Snapshotable, TransitionTable};
use crate::error::AggregateError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateCreated {
    pub description: String,
}

impl DomainEvent for AggregateCreated {
    const EVENT_NAME: &'static str = "AggregateCreated";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateChanged {
    pub description: String,
}

impl DomainEvent for AggregateChanged {
    const EVENT_NAME: &'static str = "AggregateChanged";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateDeleted {}

impl DomainEvent for AggregateDeleted {
    const EVENT_NAME: &'static str = "AggregateDeleted";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateUnique {
    pub unique_attribute: String,
}

impl DomainEvent for AggregateUnique {
    const EVENT_NAME: &'static str = "AggregateUnique";
}

/// Internal note; stored but never published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateAnnotated {
    pub note: String,
}

impl DomainEvent for AggregateAnnotated {
    const EVENT_NAME: &'static str = "AggregateAnnotated";
    const VISIBILITY: Visibility = Visibility::Private;
}

/// Registered with the store but deliberately missing from the aggregate's
/// transition table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateArchived {}

impl DomainEvent for AggregateArchived {
    const EVENT_NAME: &'static str = "AggregateArchived";
}

/// Registry with every fixture event.
pub fn registry() -> EventRegistry {
    EventRegistry::new()
        .register::<AggregateCreated>()
        .register::<AggregateChanged>()
        .register::<AggregateDeleted>()
        .register::<AggregateUnique>()
        .register::<AggregateAnnotated>()
        .register::<AggregateArchived>()
}

#[derive(Debug, Clone, PartialEq)]
pub struct TestAggregate {
    core: AggregateCore,
    pub description: Option<String>,
    pub unique_attribute: Option<String>,
    pub notes: Vec<String>,
}

/// Snapshot projection of [`TestAggregate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestAggregateState {
    pub description: Option<String>,
    pub unique_attribute: Option<String>,
}

static TRANSITIONS: LazyLock<TransitionTable<TestAggregate>> = LazyLock::new(|| {
    TransitionTable::new()
        .on(TestAggregate::on_created)
        .on(TestAggregate::on_changed)
        .on(TestAggregate::on_unique)
        .on(TestAggregate::on_annotated)
        .on(TestAggregate::on_deleted)
});

impl TestAggregate {
    pub fn create(&mut self, description: impl Into<String>) -> Result<(), AggregateError> {
        self.apply(AggregateCreated {
            description: description.into(),
        })
    }

    pub fn change(&mut self, description: impl Into<String>) -> Result<(), AggregateError> {
        self.apply(AggregateChanged {
            description: description.into(),
        })
    }

    pub fn unique(&mut self, value: impl Into<String>) -> Result<(), AggregateError> {
        self.apply(AggregateUnique {
            unique_attribute: value.into(),
        })
    }

    pub fn annotate(&mut self, note: impl Into<String>) -> Result<(), AggregateError> {
        self.apply(AggregateAnnotated { note: note.into() })
    }

    pub fn delete(&mut self) -> Result<(), AggregateError> {
        self.apply(AggregateDeleted {})
    }

    pub fn archive(&mut self) -> Result<(), AggregateError> {
        self.apply(AggregateArchived {})
    }

    fn on_created(&mut self, event: AggregateCreated) {
        self.description = Some(event.description);
    }

    fn on_changed(&mut self, event: AggregateChanged) {
        self.description = Some(event.description);
    }

    fn on_unique(&mut self, event: AggregateUnique) {
        self.unique_attribute = Some(event.unique_attribute);
    }

    fn on_annotated(&mut self, event: AggregateAnnotated) {
        self.notes.push(event.note);
    }

    fn on_deleted(&mut self, _event: AggregateDeleted) {
        self.core.mark_deleted();
    }
}

impl Aggregate for TestAggregate {
    fn aggregate_type() -> &'static str {
        "TestAggregate"
    }

    fn new(id: AggregateId) -> Self {
        Self {
            core: AggregateCore::new(id),
            description: None,
            unique_attribute: None,
            notes: Vec::new(),
        }
    }

    fn core(&self) -> &AggregateCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut AggregateCore {
        &mut self.core
    }

    fn transitions() -> &'static TransitionTable<Self> {
        &TRANSITIONS
    }
}

impl Snapshotable for TestAggregate {
    type State = TestAggregateState;

    fn snapshot_state(&self) -> TestAggregateState {
        TestAggregateState {
            description: self.description.clone(),
            unique_attribute: self.unique_attribute.clone(),
        }
    }
}
