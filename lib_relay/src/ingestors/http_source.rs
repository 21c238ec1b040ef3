//! # HTTP Source
//!
//! Polls a remote JSON document through the retrying
//! [`ApiClient`](crate::retrieve::ApiClient). Non-2xx answers become
//! [`SourceError::Status`]; bodies that do not decode become
//! [`SourceError::Malformed`].

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::core::model::Record;
use crate::core::source::{decode_value, DataSource, RowIdRule, SourceError};
use crate::retrieve::{ApiClient, RetrieveError};

/// # HTTP Source
///
/// Fetches the full document from one URL on every tick. There is no cheap
/// change probe, so every tick is a full fetch.
pub struct HttpSource {
    client: ApiClient,
    row_ids: Option<RowIdRule>,
}

impl HttpSource {
    /// `url` must be absolute. Each attempt is bounded by `timeout`; the
    /// scheduler bounds the whole fetch separately.
    pub fn new(url: &str, auth_token: Option<String>, timeout: Duration) -> Result<Self, RetrieveError> {
        Ok(Self {
            client: ApiClient::with_timeout(url, auth_token, timeout)?,
            row_ids: None,
        })
    }

    /// Enrich fetched records with row ids.
    pub fn with_row_ids(mut self, rule: RowIdRule) -> Self {
        self.row_ids = Some(rule);
        self
    }

    /// The URL being polled.
    pub fn url(&self) -> &str {
        self.client.base_url().as_str()
    }
}

fn source_error(e: RetrieveError) -> SourceError {
    match e {
        RetrieveError::Json(e) => SourceError::Malformed(e.to_string()),
        other => SourceError::Http(other.to_string()),
    }
}

#[async_trait]
impl DataSource for HttpSource {
    fn name(&self) -> &str {
        "http"
    }

    async fn fetch(&self) -> Result<Vec<Record>, SourceError> {
        let response = self.client.get::<Value>("").await.map_err(source_error)?;
        if !response.success {
            return Err(SourceError::Status {
                status: response.status,
                body: response.error_body.unwrap_or_default(),
            });
        }
        let document = response
            .data
            .ok_or_else(|| SourceError::Malformed("empty response body".to_string()))?;
        let mut records = decode_value(document).map_err(|e| SourceError::Malformed(e.to_string()))?;

        if let Some(rule) = &self.row_ids {
            rule.apply(&mut records);
        }
        tracing::debug!(url = self.url(), records = records.len(), "http source fetched");
        Ok(records)
    }
}
