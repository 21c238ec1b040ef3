//! # Topic Filter
//!
//! Pure projection of a [`Snapshot`] onto a [`TopicSelector`]. No I/O, no
//! shared state: the delivery engine calls it once per distinct selector per
//! tick, and tests call it directly.

use serde::{Deserialize, Serialize};

use crate::core::model::{scalar_text, Record, Snapshot, TopicSelector, TOPIC_FIELD};

/// Default record field carrying a topic's display label.
pub const LABEL_FIELD: &str = "topic_name";

/// One entry of the topic listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicEntry {
    /// The identifier subscribers pass as `topic_id`.
    pub topic_id: String,
    /// Display label, `Topic <id>` when the records carry none.
    pub topic_name: String,
}

/// # Topic Filter
///
/// Knows which record field holds the topic; everything else is derived
/// from the selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicFilter {
    field: String,
}

impl Default for TopicFilter {
    fn default() -> Self {
        Self::new(TOPIC_FIELD)
    }
}

impl TopicFilter {
    /// A filter keyed on `field`.
    pub fn new(field: impl Into<String>) -> Self {
        Self { field: field.into() }
    }

    /// The topic field name.
    pub fn field(&self) -> &str {
        &self.field
    }

    /// `true` when `record` belongs in the view for `selector`.
    pub fn matches(&self, record: &Record, selector: &TopicSelector) -> bool {
        match selector {
            TopicSelector::All => true,
            TopicSelector::Topic(id) => record
                .topic(&self.field)
                .is_some_and(|topic| topic == id.as_str()),
        }
    }

    /// The records of `snapshot` visible to `selector`, in snapshot order.
    ///
    /// The wildcard returns every record. A topic nobody publishes yields an
    /// empty view, which is a normal outcome rather than an error.
    pub fn filter<'a>(&self, snapshot: &'a Snapshot, selector: &TopicSelector) -> Vec<&'a Record> {
        match selector {
            TopicSelector::All => snapshot.records().iter().collect(),
            TopicSelector::Topic(_) => snapshot
                .records()
                .iter()
                .filter(|record| self.matches(record, selector))
                .collect(),
        }
    }

    /// Distinct topics of `snapshot` in first-seen order. The label is the
    /// first non-empty `label_field` value seen for the topic.
    pub fn distinct_topics(&self, snapshot: &Snapshot, label_field: &str) -> Vec<TopicEntry> {
        let mut entries: Vec<TopicEntry> = Vec::new();
        let mut labelled: Vec<bool> = Vec::new();

        for record in snapshot.records() {
            let Some(topic) = record.topic(&self.field) else {
                continue;
            };
            let label = record
                .get(label_field)
                .and_then(scalar_text)
                .filter(|label| !label.is_empty());

            match entries.iter().position(|e| e.topic_id == topic) {
                Some(idx) => {
                    if let (false, Some(label)) = (labelled[idx], label) {
                        entries[idx].topic_name = label.into_owned();
                        labelled[idx] = true;
                    }
                }
                None => {
                    labelled.push(label.is_some());
                    entries.push(TopicEntry {
                        topic_name: label
                            .map(|l| l.into_owned())
                            .unwrap_or_else(|| format!("Topic {topic}")),
                        topic_id: topic.into_owned(),
                    });
                }
            }
        }
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn snapshot(values: Vec<Value>) -> Snapshot {
        let records = values
            .into_iter()
            .map(|v| Record::try_from(v).unwrap())
            .collect();
        Snapshot::new(records, 1)
    }

    fn mixed() -> Snapshot {
        snapshot(vec![
            json!({"topic_id": "G1", "score": 10}),
            json!({"topic_id": "G2", "score": 20}),
            json!({"topic_id": "G1", "score": 11}),
            json!({"topic_id": null, "score": 0}),
            json!({"score": -1}),
        ])
    }

    #[test]
    fn test_filter_specific_topic_preserves_order() {
        let snap = mixed();
        let view = TopicFilter::default().filter(&snap, &TopicSelector::topic("G1"));
        let scores: Vec<_> = view.iter().map(|r| r.get("score").cloned().unwrap()).collect();
        assert_eq!(scores, vec![json!(10), json!(11)]);
    }

    #[test]
    fn test_filter_contains_exactly_the_matching_records() {
        let snap = mixed();
        let filter = TopicFilter::default();
        for topic in ["G1", "G2"] {
            let selector = TopicSelector::topic(topic);
            let view = filter.filter(&snap, &selector);
            let expected: Vec<&Record> = snap
                .records()
                .iter()
                .filter(|r| r.get("topic_id") == Some(&json!(topic)))
                .collect();
            assert_eq!(view, expected);
        }
    }

    #[test]
    fn test_wildcard_returns_snapshot_unchanged() {
        let snap = mixed();
        let view = TopicFilter::default().filter(&snap, &TopicSelector::All);
        let owned: Vec<Record> = view.into_iter().cloned().collect();
        assert_eq!(owned.as_slice(), snap.records());
    }

    #[test]
    fn test_unknown_topic_is_empty_not_error() {
        let snap = mixed();
        assert!(TopicFilter::default()
            .filter(&snap, &TopicSelector::topic("G404"))
            .is_empty());
    }

    #[test]
    fn test_unassigned_records_never_match_a_topic() {
        let snap = mixed();
        let filter = TopicFilter::default();
        let unassigned = &snap.records()[3];
        assert!(!filter.matches(unassigned, &TopicSelector::topic("null")));
        assert!(!filter.matches(unassigned, &TopicSelector::topic("")));
        assert!(filter.matches(unassigned, &TopicSelector::All));
    }

    #[test]
    fn test_numeric_topics_match_their_decimal_form() {
        let snap = snapshot(vec![json!({"game_ID": 7, "x": 1}), json!({"game_ID": "7", "x": 2})]);
        let view = TopicFilter::new("game_ID").filter(&snap, &TopicSelector::topic("7"));
        assert_eq!(view.len(), 2);
    }

    #[test]
    fn test_distinct_topics_first_seen_order_and_labels() {
        let snap = snapshot(vec![
            json!({"topic_id": "G2"}),
            json!({"topic_id": "G1", "topic_name": "Heat @ Knicks"}),
            json!({"topic_id": "G2", "topic_name": "Lakers @ Celtics"}),
            json!({"topic_id": "G2", "topic_name": "ignored later label"}),
            json!({"score": 3}),
        ]);
        let topics = TopicFilter::default().distinct_topics(&snap, LABEL_FIELD);
        assert_eq!(
            topics,
            vec![
                TopicEntry { topic_id: "G2".into(), topic_name: "Lakers @ Celtics".into() },
                TopicEntry { topic_id: "G1".into(), topic_name: "Heat @ Knicks".into() },
            ]
        );
    }
}
