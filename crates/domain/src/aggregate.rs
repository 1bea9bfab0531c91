//! Core aggregate contract.

use std::collections::HashMap;

use common::AggregateId;
use event_store::{DomainEvent, Event, Version};
use serde::{Serialize, de::DeserializeOwned};

use crate::error::AggregateError;

type Transition<A> =
    Box<dyn Fn(&mut A, &serde_json::Value) -> Result<(), serde_json::Error> + Send + Sync>;

/// Explicit mapping from event name to state transition for one aggregate
/// type.
///
/// Built once per aggregate type, usually in a `LazyLock` static:
///
/// ```ignore
/// static TRANSITIONS: LazyLock<TransitionTable<Account>> = LazyLock::new(|| {
///     TransitionTable::new()
///         .on(Account::on_opened)
///         .on(Account::on_closed)
/// });
/// ```
pub struct TransitionTable<A> {
    handlers: HashMap<&'static str, Transition<A>>,
}

impl<A: 'static> TransitionTable<A> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Registers the transition for event type `E`.
    ///
    /// Handlers mutate the aggregate's own fields only; they must not fail
    /// and must not perform I/O.
    pub fn on<E, F>(mut self, handler: F) -> Self
    where
        E: DomainEvent,
        F: Fn(&mut A, E) + Send + Sync + 'static,
    {
        self.handlers.insert(
            E::EVENT_NAME,
            Box::new(move |aggregate, payload| {
                let event = E::deserialize(payload)?;
                handler(aggregate, event);
                Ok(())
            }),
        );
        self
    }

    /// Returns true if a transition is registered for this event name.
    pub fn handles(&self, event_name: &str) -> bool {
        self.handlers.contains_key(event_name)
    }

    /// Names of every event with a registered transition, sorted.
    pub fn event_names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.handlers.keys().copied().collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Runs the transition for `event`. The payload is decoded before the
    /// handler runs, so a failure leaves the aggregate untouched.
    fn transition(
        &self,
        aggregate_type: &'static str,
        aggregate: &mut A,
        event: &Event,
    ) -> Result<(), AggregateError> {
        let handler =
            self.handlers
                .get(event.event_name())
                .ok_or_else(|| AggregateError::MissingHandler {
                    aggregate_type,
                    event_name: event.event_name().to_string(),
                })?;

        handler(aggregate, event.payload()).map_err(|source| AggregateError::InvalidPayload {
            event_name: event.event_name().to_string(),
            source,
        })
    }
}

impl<A: 'static> Default for TransitionTable<A> {
    fn default() -> Self {
        Self::new()
    }
}

/// Bookkeeping shared by every aggregate: identity, version, the soft-delete
/// flag and the buffer of uncommitted changes.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateCore {
    id: AggregateId,
    version: Version,
    deleted: bool,
    uncommitted: Vec<Event>,
}

impl AggregateCore {
    /// Creates the core of an aggregate with no history.
    pub fn new(id: AggregateId) -> Self {
        Self {
            id,
            version: Version::initial(),
            deleted: false,
            uncommitted: Vec::new(),
        }
    }

    pub fn id(&self) -> &AggregateId {
        &self.id
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// Flags the aggregate as deleted. Called from a deletion transition.
    pub fn mark_deleted(&mut self) {
        self.deleted = true;
    }
}

/// Trait for event-sourced aggregates.
///
/// State is only ever changed through [`Aggregate::apply_change`] (new
/// events) or [`Aggregate::load_from_history`] (replay). Both dispatch
/// through the same [`TransitionTable`], so replaying a history always
/// yields the state produced when the events were first applied.
pub trait Aggregate: Send + Sync + Sized + 'static {
    /// Returns the aggregate type name.
    fn aggregate_type() -> &'static str;

    /// Creates an aggregate with no history.
    fn new(id: AggregateId) -> Self;

    fn core(&self) -> &AggregateCore;

    fn core_mut(&mut self) -> &mut AggregateCore;

    /// Returns the transition table of this aggregate type.
    fn transitions() -> &'static TransitionTable<Self>;

    fn id(&self) -> &AggregateId {
        self.core().id()
    }

    /// Version of the last applied or replayed event; 0 without history.
    fn version(&self) -> Version {
        self.core().version()
    }

    fn is_deleted(&self) -> bool {
        self.core().is_deleted()
    }

    /// Applies a new event.
    ///
    /// Assigns the next version to the event, runs its transition and
    /// buffers it as uncommitted. On error nothing changes.
    fn apply_change(&mut self, mut event: Event) -> Result<(), AggregateError> {
        if event.aggregate_id() != self.id() {
            return Err(AggregateError::ForeignEvent {
                expected: self.id().clone(),
                found: event.aggregate_id().clone(),
            });
        }

        let version = self.version().next();
        Self::transitions().transition(Self::aggregate_type(), self, &event)?;
        event.assign_version(version);

        let core = self.core_mut();
        core.version = version;
        core.uncommitted.push(event);
        Ok(())
    }

    /// Builds an event from a typed payload and applies it.
    fn apply<E: DomainEvent>(&mut self, payload: E) -> Result<(), AggregateError> {
        let event = Event::from_domain(self.id().clone(), &payload).map_err(|source| {
            AggregateError::InvalidPayload {
                event_name: E::EVENT_NAME.to_string(),
                source,
            }
        })?;
        self.apply_change(event)
    }

    /// Replays persisted events without buffering them.
    ///
    /// Events must continue the current version with no gaps.
    fn load_from_history<I>(&mut self, history: I) -> Result<(), AggregateError>
    where
        I: IntoIterator<Item = Event>,
    {
        for event in history {
            if event.aggregate_id() != self.id() {
                return Err(AggregateError::ForeignEvent {
                    expected: self.id().clone(),
                    found: event.aggregate_id().clone(),
                });
            }

            let expected = self.version().next();
            if event.aggregate_version() != expected {
                return Err(AggregateError::OutOfOrderHistory {
                    expected,
                    found: event.aggregate_version(),
                });
            }

            Self::transitions().transition(Self::aggregate_type(), self, &event)?;
            self.core_mut().version = expected;
        }
        Ok(())
    }

    /// Events applied since the last commit, in application order.
    fn uncommitted_changes(&self) -> &[Event] {
        &self.core().uncommitted
    }

    /// Clears the uncommitted buffer. Idempotent.
    fn mark_changes_as_committed(&mut self) {
        self.core_mut().uncommitted.clear();
    }
}

/// Aggregates that project their current state into a snapshot.
///
/// The state type lists exactly the fields that are persisted; identity,
/// version and the deleted flag are carried next to it by the snapshot cache.
pub trait Snapshotable: Aggregate {
    type State: Serialize + DeserializeOwned + Clone + Send + Sync + 'static;

    /// Builds the projection of the current state.
    fn snapshot_state(&self) -> Self::State;
}
