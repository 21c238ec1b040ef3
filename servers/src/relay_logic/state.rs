use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use lib_relay::core::{DataSource, IngestHandle, IngestOnlySource, RefreshScheduler, Relay, RowIdRule};
use lib_relay::ingestors::{HttpSource, JsonFileSource};
use tokio_util::sync::CancellationToken;

use crate::relay_logic::config::{Config, SourceKind};

/// Shared by every handler. Cloning is cheap.
#[derive(Clone)]
pub struct AppState {
    pub relay: Relay,
    pub scheduler: Arc<RefreshScheduler>,
    pub ingest: IngestHandle,
    /// Cancelled once on shutdown; sessions and the scheduler watch it.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(relay: Relay, source: Arc<dyn DataSource>, shutdown: CancellationToken) -> Self {
        let scheduler = Arc::new(relay.scheduler(source));
        let ingest = scheduler.ingest_handle();
        Self {
            relay,
            scheduler,
            ingest,
            shutdown,
        }
    }

    pub fn from_config(config: &Config, shutdown: CancellationToken) -> anyhow::Result<Self> {
        config.validate()?;
        let relay = Relay::new(config.settings());
        let source = build_source(config)?;
        tracing::info!(source = source.name(), "data source configured");
        Ok(Self::new(relay, source, shutdown))
    }
}

/// The data source selected by `config.source`.
pub fn build_source(config: &Config) -> anyhow::Result<Arc<dyn DataSource>> {
    let settings = config.settings();
    let row_ids = config
        .row_field
        .as_ref()
        .map(|row_field| RowIdRule::new(settings.topic_field.clone(), row_field.clone()));

    let source: Arc<dyn DataSource> = match config.source() {
        SourceKind::File => {
            let mut source = JsonFileSource::new(config.source_path());
            if let Some(rule) = row_ids {
                source = source.with_row_ids(rule);
            }
            Arc::new(source)
        }
        SourceKind::Http => {
            let url = config
                .source_url
                .as_deref()
                .context("source \"http\" requires --source-url / RELAY_SOURCE_URL")?;
            let attempt_timeout = settings.fetch_timeout.max(Duration::from_millis(1));
            let mut source = HttpSource::new(url, config.source_token.clone(), attempt_timeout)
                .with_context(|| format!("invalid source url {url}"))?;
            if let Some(rule) = row_ids {
                source = source.with_row_ids(rule);
            }
            Arc::new(source)
        }
        SourceKind::Ingest => Arc::new(IngestOnlySource),
    };
    Ok(source)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_source_by_kind() {
        let file = Config {
            source: Some(SourceKind::File),
            ..Config::defaults()
        };
        assert_eq!(build_source(&file).unwrap().name(), "file");

        let ingest = Config {
            source: Some(SourceKind::Ingest),
            ..Config::defaults()
        };
        assert_eq!(build_source(&ingest).unwrap().name(), "ingest");

        let http = Config {
            source: Some(SourceKind::Http),
            source_url: Some("http://127.0.0.1:1/feed.json".to_string()),
            ..Config::defaults()
        };
        assert_eq!(build_source(&http).unwrap().name(), "http");
    }

    #[test]
    fn test_from_config_rejects_zero_refresh_interval() {
        let config = Config {
            source: Some(SourceKind::Ingest),
            refresh_interval_ms: Some(0),
            ..Config::defaults()
        };
        assert!(AppState::from_config(&config, CancellationToken::new()).is_err());

        let ok = Config {
            source: Some(SourceKind::Ingest),
            ..Config::defaults()
        };
        assert!(AppState::from_config(&ok, CancellationToken::new()).is_ok());
    }

    #[test]
    fn test_http_source_requires_url() {
        let http = Config {
            source: Some(SourceKind::Http),
            ..Config::defaults()
        };
        let err = build_source(&http).err().unwrap();
        assert!(err.to_string().contains("source-url"));
    }
}
