use anyhow::bail;
use clap::{Parser, ValueEnum};
use lib_relay::core::RelaySettings;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_CONFIG_PATH: &str = "server_relay.conf";
const DEFAULT_LOG_DIR: &str = "./logs";
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_SOURCE_PATH: &str = "predictions.json";

/// Where snapshots come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Poll a local JSON file.
    #[default]
    File,
    /// Poll a remote URL.
    Http,
    /// Only accept pushed snapshots.
    Ingest,
}

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[command(name = "server_relay", about = "Topic-filtered websocket relay server", version)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    #[arg(long, env = "RELAY_PORT", help = "Port to listen on for client connections.")]
    pub port: Option<u16>,

    #[arg(long, env = "RELAY_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[arg(long, env = "RELAY_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[arg(long, env = "RELAY_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[arg(long, env = "RELAY_LOG_JSON", help = "Write the log file as JSON lines.")]
    pub log_json: Option<bool>,

    #[arg(long, env = "RELAY_SOURCE", value_enum, help = "Snapshot source: file, http or ingest.")]
    pub source: Option<SourceKind>,

    #[arg(long, env = "RELAY_SOURCE_PATH", help = "JSON file polled by the file source.")]
    pub source_path: Option<PathBuf>,

    #[arg(long, env = "RELAY_SOURCE_URL", help = "URL polled by the http source.")]
    pub source_url: Option<String>,

    #[arg(long, env = "RELAY_SOURCE_TOKEN", help = "Bearer token sent to the http source.")]
    pub source_token: Option<String>,

    #[arg(long, env = "RELAY_TOPIC_FIELD", help = "Record field holding the topic id.")]
    pub topic_field: Option<String>,

    #[arg(long, env = "RELAY_LABEL_FIELD", help = "Record field holding the topic display name.")]
    pub label_field: Option<String>,

    #[arg(long, env = "RELAY_ROW_FIELD", help = "Record field combined with the topic into row_id.")]
    pub row_field: Option<String>,

    #[arg(long, env = "RELAY_REFRESH_INTERVAL_MS", help = "Milliseconds between refresh ticks.")]
    pub refresh_interval_ms: Option<u64>,

    #[arg(long, env = "RELAY_FETCH_TIMEOUT_MS", help = "Upper bound in milliseconds for one source fetch.")]
    pub fetch_timeout_ms: Option<u64>,

    #[arg(long, env = "RELAY_CLIENT_QUEUE_CAPACITY", help = "Pending payloads per client before it is dropped.")]
    pub client_queue_capacity: Option<usize>,

    #[arg(long, env = "RELAY_HANDSHAKE_TIMEOUT_MS", help = "Milliseconds to wait for the subscription message.")]
    pub handshake_timeout_ms: Option<u64>,

    #[arg(long, env = "RELAY_KEEPALIVE_INTERVAL_SECS", help = "Seconds between pings to clients (0 disables).")]
    pub keepalive_interval_secs: Option<u64>,

    #[arg(long, env = "RELAY_SEND_INITIAL_SNAPSHOT", help = "Push the current snapshot right after subscribing.")]
    pub send_initial_snapshot: Option<bool>,

    #[arg(long, env = "TLS_CERT_PATH", help = "Path to the TLS certificate file.")]
    pub tls_cert_path: Option<PathBuf>,

    #[arg(long, env = "TLS_KEY_PATH", help = "Path to the TLS private key file.")]
    pub tls_key_path: Option<PathBuf>,
}

impl Config {
    /// Built-in defaults, the lowest layer.
    pub fn defaults() -> Config {
        let relay = RelaySettings::default();
        Config {
            port: Some(DEFAULT_PORT),
            config_path: Some(PathBuf::from(DEFAULT_CONFIG_PATH)),
            log_dir: Some(PathBuf::from(DEFAULT_LOG_DIR)),
            log_level: Some(DEFAULT_LOG_LEVEL.to_string()),
            log_json: Some(false),
            source: Some(SourceKind::File),
            source_path: Some(PathBuf::from(DEFAULT_SOURCE_PATH)),
            topic_field: Some(relay.topic_field),
            label_field: Some(relay.label_field),
            refresh_interval_ms: Some(relay.refresh_interval.as_millis() as u64),
            fetch_timeout_ms: Some(relay.fetch_timeout.as_millis() as u64),
            client_queue_capacity: Some(relay.client_queue_capacity),
            handshake_timeout_ms: Some(relay.handshake_timeout.as_millis() as u64),
            keepalive_interval_secs: Some(relay.keepalive_interval.map_or(0, |d| d.as_secs())),
            send_initial_snapshot: Some(relay.send_initial_snapshot),
            ..Default::default()
        }
    }

    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            port: other.port.or(self.port),
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            log_json: other.log_json.or(self.log_json),
            source: other.source.or(self.source),
            source_path: other.source_path.or(self.source_path),
            source_url: other.source_url.or(self.source_url),
            source_token: other.source_token.or(self.source_token),
            topic_field: other.topic_field.or(self.topic_field),
            label_field: other.label_field.or(self.label_field),
            row_field: other.row_field.or(self.row_field),
            refresh_interval_ms: other.refresh_interval_ms.or(self.refresh_interval_ms),
            fetch_timeout_ms: other.fetch_timeout_ms.or(self.fetch_timeout_ms),
            client_queue_capacity: other.client_queue_capacity.or(self.client_queue_capacity),
            handshake_timeout_ms: other.handshake_timeout_ms.or(self.handshake_timeout_ms),
            keepalive_interval_secs: other.keepalive_interval_secs.or(self.keepalive_interval_secs),
            send_initial_snapshot: other.send_initial_snapshot.or(self.send_initial_snapshot),
            tls_cert_path: other.tls_cert_path.or(self.tls_cert_path),
            tls_key_path: other.tls_key_path.or(self.tls_key_path),
        }
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_DIR))
    }

    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or(DEFAULT_LOG_LEVEL)
    }

    pub fn log_json(&self) -> bool {
        self.log_json.unwrap_or(false)
    }

    pub fn source(&self) -> SourceKind {
        self.source.unwrap_or_default()
    }

    pub fn source_path(&self) -> PathBuf {
        self.source_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SOURCE_PATH))
    }

    /// Both TLS paths, when both are configured.
    pub fn tls_paths(&self) -> Option<(&Path, &Path)> {
        match (&self.tls_cert_path, &self.tls_key_path) {
            (Some(cert), Some(key)) => Some((cert.as_path(), key.as_path())),
            _ => None,
        }
    }

    /// Rejects values the relay cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.refresh_interval_ms == Some(0) {
            bail!("refreshIntervalMs / RELAY_REFRESH_INTERVAL_MS must be at least 1");
        }
        Ok(())
    }

    /// The core tunables carried by this configuration.
    pub fn settings(&self) -> RelaySettings {
        let defaults = RelaySettings::default();
        RelaySettings {
            topic_field: self.topic_field.clone().unwrap_or(defaults.topic_field),
            label_field: self.label_field.clone().unwrap_or(defaults.label_field),
            refresh_interval: self
                .refresh_interval_ms
                .map_or(defaults.refresh_interval, Duration::from_millis),
            fetch_timeout: self
                .fetch_timeout_ms
                .map_or(defaults.fetch_timeout, Duration::from_millis),
            client_queue_capacity: self
                .client_queue_capacity
                .unwrap_or(defaults.client_queue_capacity),
            handshake_timeout: self
                .handshake_timeout_ms
                .map_or(defaults.handshake_timeout, Duration::from_millis),
            keepalive_interval: match self.keepalive_interval_secs {
                Some(0) => None,
                Some(secs) => Some(Duration::from_secs(secs)),
                None => defaults.keepalive_interval,
            },
            send_initial_snapshot: self
                .send_initial_snapshot
                .unwrap_or(defaults.send_initial_snapshot),
            ingest_queue_capacity: defaults.ingest_queue_capacity,
        }
    }
}

/// Layers defaults < config file < environment / CLI. Problems with the
/// config file are returned as warnings, to be logged once tracing is up.
pub fn load_config() -> (Config, Vec<String>) {
    load_config_from(Config::parse())
}

/// [`load_config`] with already parsed CLI / environment values.
pub fn load_config_from(cli: Config) -> (Config, Vec<String>) {
    let mut warnings = Vec::new();
    let mut current = Config::defaults();

    let config_file_path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    if config_file_path.exists() {
        match fs::read_to_string(&config_file_path) {
            Ok(text) => match serde_json::from_str::<Config>(&text) {
                Ok(file_config) => current = current.merge(file_config),
                Err(e) => warnings.push(format!(
                    "Failed to parse config file {}: {e}. Falling back to other sources.",
                    config_file_path.display()
                )),
            },
            Err(e) => warnings.push(format!(
                "Failed to read config file {}: {e}. Falling back to other sources.",
                config_file_path.display()
            )),
        }
    }

    (current.merge(cli), warnings)
}
