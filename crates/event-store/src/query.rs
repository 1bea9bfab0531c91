use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Opaque position of a stored event in the global feed.
///
/// Cursors only support "strictly after" paging; there is no way to page
/// backwards from one.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct EventCursor(i64);

impl EventCursor {
    pub(crate) fn from_sequence(sequence: i64) -> Self {
        Self(sequence)
    }

    pub(crate) fn sequence(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for EventCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Error returned when parsing a cursor token fails.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid event cursor: {0}")]
pub struct InvalidCursor(String);

impl FromStr for EventCursor {
    type Err = InvalidCursor;

    fn from_str(token: &str) -> Result<Self, Self::Err> {
        token
            .parse::<i64>()
            .ok()
            .filter(|sequence| *sequence > 0)
            .map(Self)
            .ok_or_else(|| InvalidCursor(token.to_string()))
    }
}

/// Query over the global event feed.
///
/// Filters are applied first, then `skip` and `limit`. Results are always in
/// insertion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventFeedQuery {
    /// Number of matching events to skip.
    pub skip: usize,

    /// Maximum number of events to return.
    pub limit: Option<usize>,

    /// Restrict to these event names (any of them).
    pub event_names: Option<Vec<String>>,

    /// Only return events strictly after this cursor.
    pub after: Option<EventCursor>,
}

impl EventFeedQuery {
    /// Creates a query over the whole feed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a query for one page of the feed.
    pub fn page(skip: usize, limit: usize) -> Self {
        Self {
            skip,
            limit: Some(limit),
            ..Default::default()
        }
    }

    /// Skips this many matching events.
    pub fn skip(mut self, skip: usize) -> Self {
        self.skip = skip;
        self
    }

    /// Limits the number of events returned.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Restricts the feed to the given event names.
    pub fn event_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.event_names = Some(names.into_iter().map(Into::into).collect());
        self
    }

    /// Resumes the feed strictly after the given cursor.
    pub fn after(mut self, cursor: EventCursor) -> Self {
        self.after = Some(cursor);
        self
    }

    pub(crate) fn matches_name(&self, event_name: &str) -> bool {
        self.event_names
            .as_ref()
            .is_none_or(|names| names.iter().any(|name| name == event_name))
    }

    pub(crate) fn matches_cursor(&self, cursor: EventCursor) -> bool {
        self.after.is_none_or(|after| cursor > after)
    }
}

/// Options for scans over the whole log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanOptions {
    /// Opt in to scans that may exceed normal memory bounds of the storage
    /// engine.
    pub allow_large_scan: bool,
}

impl ScanOptions {
    /// Scan with the engine's default memory bounds.
    pub fn bounded() -> Self {
        Self::default()
    }

    /// Scan allowing the engine to use its large-scan budget.
    pub fn large() -> Self {
        Self {
            allow_large_scan: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_sets_skip_and_limit() {
        let query = EventFeedQuery::page(10, 5);
        assert_eq!(query.skip, 10);
        assert_eq!(query.limit, Some(5));
        assert!(query.event_names.is_none());
        assert!(query.after.is_none());
    }

    #[test]
    fn builder_chain() {
        let cursor = EventCursor::from_sequence(7);
        let query = EventFeedQuery::new()
            .event_names(["Created", "Deleted"])
            .after(cursor)
            .skip(1)
            .limit(2);

        assert_eq!(
            query.event_names,
            Some(vec!["Created".to_string(), "Deleted".to_string()])
        );
        assert_eq!(query.after, Some(cursor));
        assert!(query.matches_name("Deleted"));
        assert!(!query.matches_name("Changed"));
        assert!(!query.matches_cursor(EventCursor::from_sequence(7)));
        assert!(query.matches_cursor(EventCursor::from_sequence(8)));
    }

    #[test]
    fn cursor_token_parses_back() {
        let cursor = EventCursor::from_sequence(42);
        let parsed: EventCursor = cursor.to_string().parse().unwrap();
        assert_eq!(parsed, cursor);
    }

    #[test]
    fn cursor_rejects_garbage() {
        assert!("abc".parse::<EventCursor>().is_err());
        assert!("0".parse::<EventCursor>().is_err());
        assert!("-3".parse::<EventCursor>().is_err());
    }
}
