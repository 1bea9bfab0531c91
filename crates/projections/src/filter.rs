//! Filters and options for snapshot queries.

use std::cmp::Ordering;

use chrono::DateTime;
use common::AggregateId;
use serde_json::{Map, Value};

/// How soft-deleted snapshots are treated by a query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeletedFilter {
    /// Hide deleted snapshots.
    #[default]
    Exclude,
    /// Return deleted and live snapshots.
    Include,
    /// Return only deleted snapshots.
    Only,
}

impl DeletedFilter {
    /// Required value of the `deleted` flag, if any.
    pub fn required_flag(&self) -> Option<bool> {
        match self {
            DeletedFilter::Exclude => Some(false),
            DeletedFilter::Include => None,
            DeletedFilter::Only => Some(true),
        }
    }
}

/// Filter over the snapshot cache.
///
/// Deleted snapshots are excluded unless the filter says otherwise. State
/// matching uses containment: a snapshot matches when its state contains
/// every field of the pattern with an equal value (objects recursively,
/// arrays by element).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SnapshotFilter {
    pub id: Option<AggregateId>,
    pub state: Map<String, Value>,
    pub deleted: DeletedFilter,
}

impl SnapshotFilter {
    /// Matches every live snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Matches the snapshot with this id.
    pub fn by_id(id: impl Into<AggregateId>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::default()
        }
    }

    /// Requires a state field to equal `value`. Dotted paths address nested
    /// objects (`address.city`).
    pub fn state_eq(mut self, field: &str, value: impl Into<Value>) -> Self {
        let mut segments = field.rsplit('.');
        let leaf = segments.next().unwrap_or(field);

        let mut pattern = Map::new();
        pattern.insert(leaf.to_string(), value.into());
        for segment in segments {
            let mut outer = Map::new();
            outer.insert(segment.to_string(), Value::Object(pattern));
            pattern = outer;
        }

        merge_patterns(&mut self.state, pattern);
        self
    }

    pub fn include_deleted(mut self) -> Self {
        self.deleted = DeletedFilter::Include;
        self
    }

    pub fn only_deleted(mut self) -> Self {
        self.deleted = DeletedFilter::Only;
        self
    }

    /// The state pattern as a JSON object.
    pub fn state_pattern(&self) -> Value {
        Value::Object(self.state.clone())
    }

    /// Evaluates the filter against a stored snapshot document.
    pub(crate) fn matches(&self, document: &Value) -> bool {
        if let Some(required) = self.deleted.required_flag()
            && document.get("deleted").and_then(Value::as_bool) != Some(required)
        {
            return false;
        }

        if let Some(id) = &self.id
            && document.get("id").and_then(Value::as_str) != Some(id.as_str())
        {
            return false;
        }

        match document.get("state") {
            Some(state) => json_contains(state, &self.state_pattern()),
            None => self.state.is_empty(),
        }
    }
}

fn merge_patterns(target: &mut Map<String, Value>, source: Map<String, Value>) {
    for (key, value) in source {
        match value {
            Value::Object(nested) if target.get(&key).is_some_and(Value::is_object) => {
                if let Some(Value::Object(existing)) = target.get_mut(&key) {
                    merge_patterns(existing, nested);
                }
            }
            value => {
                target.insert(key, value);
            }
        }
    }
}

/// JSON containment with the semantics of PostgreSQL's `jsonb @>`.
pub(crate) fn json_contains(value: &Value, pattern: &Value) -> bool {
    match (value, pattern) {
        (Value::Object(value), Value::Object(pattern)) => pattern
            .iter()
            .all(|(key, expected)| value.get(key).is_some_and(|v| json_contains(v, expected))),
        (Value::Array(values), Value::Array(patterns)) => patterns
            .iter()
            .all(|expected| values.iter().any(|v| json_contains(v, expected))),
        (Value::Array(values), scalar) if !scalar.is_object() && !scalar.is_array() => {
            values.contains(scalar)
        }
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        (value, pattern) => value == pattern,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SortKey {
    Id,
    Version,
    UpdatedAt,
    /// A state field; dotted paths address nested objects.
    Field(String),
}

impl SortKey {
    /// Path of the key inside a stored snapshot document.
    pub(crate) fn document_path(&self) -> Vec<String> {
        match self {
            SortKey::Id => vec!["id".to_string()],
            SortKey::Version => vec!["version".to_string()],
            SortKey::UpdatedAt => vec!["updated_at".to_string()],
            SortKey::Field(field) => std::iter::once("state")
                .chain(field.split('.'))
                .map(str::to_string)
                .collect(),
        }
    }
}

/// Paging and ordering of a snapshot query.
///
/// Without sort keys results are ordered by id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
    pub skip: usize,
    pub limit: Option<usize>,
    pub sort: Vec<(SortKey, SortOrder)>,
}

impl FindOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn skip(mut self, skip: usize) -> Self {
        self.skip = skip;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Appends a sort key; earlier keys take precedence.
    pub fn sort_by(mut self, key: SortKey, order: SortOrder) -> Self {
        self.sort.push((key, order));
        self
    }

    /// Sort keys with the id tiebreaker appended.
    pub(crate) fn effective_sort(&self) -> Vec<(SortKey, SortOrder)> {
        let mut sort = self.sort.clone();
        if !sort.iter().any(|(key, _)| *key == SortKey::Id) {
            sort.push((SortKey::Id, SortOrder::Ascending));
        }
        sort
    }
}

fn lookup<'a>(document: &'a Value, path: &[String]) -> Option<&'a Value> {
    path.iter()
        .try_fold(document, |current, segment| current.get(segment))
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::String(_) => 1,
        Value::Number(_) => 2,
        Value::Bool(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Total order over JSON values following PostgreSQL's jsonb ordering.
fn compare_json(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::String(a), Value::String(b)) => a.cmp(b),
        (Value::Number(a), Value::Number(b)) => a
            .as_f64()
            .partial_cmp(&b.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
        (Value::Array(a), Value::Array(b)) => a
            .len()
            .cmp(&b.len())
            .then_with(|| {
                a.iter()
                    .zip(b)
                    .map(|(x, y)| compare_json(x, y))
                    .find(|o| o.is_ne())
                    .unwrap_or(Ordering::Equal)
            }),
        (Value::Object(a), Value::Object(b)) => a.len().cmp(&b.len()).then_with(|| {
            a.iter()
                .zip(b)
                .map(|((ka, va), (kb, vb))| ka.cmp(kb).then_with(|| compare_json(va, vb)))
                .find(|o| o.is_ne())
                .unwrap_or(Ordering::Equal)
        }),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

fn compare_timestamps(a: &Value, b: &Value) -> Option<Ordering> {
    let parse = |value: &Value| {
        value
            .as_str()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
    };
    Some(parse(a)?.cmp(&parse(b)?))
}

/// Orders two snapshot documents. Missing keys sort after present ones in
/// ascending order, like SQL NULLs.
pub(crate) fn compare_documents(
    a: &Value,
    b: &Value,
    sort: &[(SortKey, SortOrder)],
) -> Ordering {
    for (key, order) in sort {
        let path = key.document_path();
        let ordering = match (lookup(a, &path), lookup(b, &path)) {
            (Some(a), Some(b)) if *key == SortKey::UpdatedAt => {
                compare_timestamps(a, b).unwrap_or_else(|| compare_json(a, b))
            }
            (Some(a), Some(b)) => compare_json(a, b),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        let ordering = match order {
            SortOrder::Ascending => ordering,
            SortOrder::Descending => ordering.reverse(),
        };
        if ordering.is_ne() {
            return ordering;
        }
    }
    Ordering::Equal
}
