//! # Data Source Contract
//!
//! The scheduler only needs "give me the current full record set" and,
//! optionally, "has anything changed since last time". Concrete sources
//! (local file, remote HTTP) live in `crate::ingestors`; the ingest-only
//! source below is for deployments where producers push instead.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::core::model::{Record, ROW_ID_FIELD};

/// Every way a fetch can fail. The scheduler treats them all the same:
/// keep the previous snapshot, log, carry on.
#[derive(Debug, Error)]
pub enum SourceError {
    /// Reading a local file failed.
    #[error("failed to read {path}: {source}")]
    Io {
        /// The file being read.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The document is not a record array or an accepted envelope.
    #[error("malformed source payload: {0}")]
    Malformed(String),

    /// The request failed before a response arrived.
    #[error("http request failed: {0}")]
    Http(String),

    /// The remote answered with a non-success status.
    #[error("source answered with status {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body text.
        body: String,
    },

    /// The fetch exceeded the configured bound.
    #[error("source did not answer within {0:?}")]
    Timeout(Duration),

    /// The source cannot perform the operation.
    #[error("operation not supported: {0}")]
    Unsupported(String),
}

/// # Data Source
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// The complete current record set.
    async fn fetch(&self) -> Result<Vec<Record>, SourceError>;

    /// Cheap change probe run before every fetch. `Ok(false)` skips the
    /// fetch and redelivers the current snapshot.
    async fn has_changed(&self) -> Result<bool, SourceError> {
        Ok(true)
    }
}

/// Source for push-only deployments: it never reports a change, so ticks
/// simply redeliver whatever the last ingestion published.
#[derive(Debug, Default, Clone, Copy)]
pub struct IngestOnlySource;

#[async_trait]
impl DataSource for IngestOnlySource {
    fn name(&self) -> &str {
        "ingest"
    }

    async fn fetch(&self) -> Result<Vec<Record>, SourceError> {
        Err(SourceError::Unsupported(
            "ingest-only source has nothing to fetch".to_string(),
        ))
    }

    async fn has_changed(&self) -> Result<bool, SourceError> {
        Ok(false)
    }
}

/// The producer envelope: `{ "predictions": [...] }`, `records` accepted as
/// an alias.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestPayload {
    /// The new snapshot's records.
    #[serde(alias = "records")]
    pub predictions: Vec<Record>,
}

/// Decodes either a bare record array or an [`IngestPayload`] envelope.
pub fn decode_value(value: Value) -> Result<Vec<Record>, serde_json::Error> {
    match value {
        Value::Array(_) => serde_json::from_value(value),
        other => serde_json::from_value::<IngestPayload>(other).map(|p| p.predictions),
    }
}

/// [`decode_value`] over raw bytes.
pub fn decode_records(bytes: &[u8]) -> Result<Vec<Record>, serde_json::Error> {
    decode_value(serde_json::from_slice(bytes)?)
}

/// Adds `row_id = "<topic>_<row>"` to records lacking one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowIdRule {
    /// Field holding the topic.
    pub topic_field: String,
    /// Field holding the row number.
    pub row_field: String,
    /// Field written, `row_id` by default.
    pub row_id_field: String,
}

impl RowIdRule {
    /// A rule writing `row_id`.
    pub fn new(topic_field: impl Into<String>, row_field: impl Into<String>) -> Self {
        Self {
            topic_field: topic_field.into(),
            row_field: row_field.into(),
            row_id_field: ROW_ID_FIELD.to_string(),
        }
    }

    /// Returns how many records were enriched.
    pub fn apply(&self, records: &mut [Record]) -> usize {
        let mut added = 0;
        for record in records.iter_mut() {
            if record.ensure_row_id(&self.topic_field, &self.row_field, &self.row_id_field) {
                added += 1;
            }
        }
        added
    }
}
