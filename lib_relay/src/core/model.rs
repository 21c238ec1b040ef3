//! # Data Model
//!
//! The three value types every other core component speaks:
//!
//! - [`Record`]: one flat field-name → value map, tagged with a topic.
//! - [`Snapshot`]: an ordered, immutable batch of records plus a revision.
//! - [`TopicSelector`]: what a subscriber asked for, one topic or all.

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Default record field carrying the topic identifier.
pub const TOPIC_FIELD: &str = "topic_id";

/// Default record field carrying the advisory row identifier.
pub const ROW_ID_FIELD: &str = "row_id";

/// A serialized, ready-to-send outbound message. Shared between every
/// subscriber of the same selector within one delivery pass.
pub type Payload = Arc<str>;

/// # Record
///
/// A flat mapping of field name to JSON value. The topic field may be
/// missing or null, in which case the record belongs to no topic and only
/// wildcard subscribers see it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(Map<String, Value>);

impl Record {
    /// An empty record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Value of `field`, if present.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    /// Sets `field`, returning the previous value.
    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(field.into(), value.into())
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// `true` when the record has no fields.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Topic identifier stored under `field`, rendered as a string.
    ///
    /// Strings are returned as-is and numbers in their decimal form. Null,
    /// booleans, nested values and a missing field all mean "no topic".
    pub fn topic(&self, field: &str) -> Option<Cow<'_, str>> {
        self.0.get(field).and_then(scalar_text)
    }

    /// Fills `row_id_field` with `"<topic>_<row>"` when the record lacks it.
    /// Missing parts render as `unknown`. Returns `true` if a value was added.
    pub fn ensure_row_id(&mut self, topic_field: &str, row_field: &str, row_id_field: &str) -> bool {
        if self.0.contains_key(row_id_field) {
            return false;
        }
        let topic = self.topic(topic_field).unwrap_or(Cow::Borrowed("unknown"));
        let row = self
            .0
            .get(row_field)
            .and_then(scalar_text)
            .unwrap_or(Cow::Borrowed("unknown"));
        let row_id = format!("{topic}_{row}");
        self.0.insert(row_id_field.to_string(), Value::String(row_id));
        true
    }

    /// Consumes the record, returning the underlying map.
    pub fn into_inner(self) -> Map<String, Value> {
        self.0
    }
}

impl From<Map<String, Value>> for Record {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl TryFrom<Value> for Record {
    type Error = serde_json::Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        serde_json::from_value(value)
    }
}

impl FromIterator<(String, Value)> for Record {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Text form of a scalar used for topic matching and labels.
pub(crate) fn scalar_text(value: &Value) -> Option<Cow<'_, str>> {
    match value {
        Value::String(s) => Some(Cow::Borrowed(s.as_str())),
        Value::Number(n) => Some(Cow::Owned(n.to_string())),
        _ => None,
    }
}

/// # Snapshot
///
/// The full dataset at one point in time. A snapshot is never mutated after
/// construction: refreshing builds a new one and the store swaps the
/// reference, so a reader holding an `Arc<Snapshot>` keeps a consistent view
/// for as long as it likes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    records: Vec<Record>,
    revision: u64,
    published_at: Option<DateTime<Utc>>,
}

impl Snapshot {
    /// The placeholder served before anything is published: no records,
    /// revision 0.
    pub fn empty() -> Self {
        Self::default()
    }

    /// A snapshot of `records` at `revision`, stamped with the current time.
    pub fn new(records: Vec<Record>, revision: u64) -> Self {
        Self {
            records,
            revision,
            published_at: Some(Utc::now()),
        }
    }

    /// Records in source order.
    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// Monotonic revision assigned on publish.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// When the snapshot was built; `None` for the empty placeholder.
    pub fn published_at(&self) -> Option<DateTime<Utc>> {
        self.published_at
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// `true` when there are no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// # Topic Selector
///
/// Bound once per subscription. A client wanting another topic reconnects.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub enum TopicSelector {
    /// Every record, unfiltered.
    #[default]
    All,
    /// Only records whose topic equals this identifier.
    Topic(String),
}

impl TopicSelector {
    /// Selector for a single topic.
    pub fn topic(id: impl Into<String>) -> Self {
        Self::Topic(id.into())
    }

    /// `true` for the wildcard.
    pub fn is_wildcard(&self) -> bool {
        matches!(self, Self::All)
    }

    /// The topic identifier, `None` for the wildcard.
    pub fn as_topic(&self) -> Option<&str> {
        match self {
            Self::All => None,
            Self::Topic(id) => Some(id),
        }
    }
}

impl fmt::Display for TopicSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("*"),
            Self::Topic(id) => f.write_str(id),
        }
    }
}
