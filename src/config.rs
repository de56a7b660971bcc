use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::engine::DEFAULT_LOCK_TIMEOUT;

/// Server settings, read from `WARDBOOK_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// WAL appends since the last compaction that trigger the next one.
    pub compact_threshold: u64,
    pub lock_timeout: Duration,
    /// Cancelled reservations dated more than this many days ago are
    /// dropped at compaction.
    pub tombstone_retention_days: u32,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "wardbook".into(),
            max_connections: 256,
            compact_threshold: 1000,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            tombstone_retention_days: 90,
            metrics_port: None,
            tls_cert: None,
            tls_key: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset or unparsable values keep their default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            port: parsed(&lookup, "WARDBOOK_PORT").unwrap_or(defaults.port),
            bind: lookup("WARDBOOK_BIND").unwrap_or(defaults.bind),
            data_dir: lookup("WARDBOOK_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            password: lookup("WARDBOOK_PASSWORD").unwrap_or(defaults.password),
            max_connections: parsed(&lookup, "WARDBOOK_MAX_CONNECTIONS").unwrap_or(defaults.max_connections),
            compact_threshold: parsed(&lookup, "WARDBOOK_COMPACT_THRESHOLD")
                .unwrap_or(defaults.compact_threshold),
            lock_timeout: parsed(&lookup, "WARDBOOK_LOCK_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.lock_timeout),
            tombstone_retention_days: parsed(&lookup, "WARDBOOK_TOMBSTONE_RETENTION_DAYS")
                .unwrap_or(defaults.tombstone_retention_days),
            metrics_port: parsed(&lookup, "WARDBOOK_METRICS_PORT"),
            tls_cert: lookup("WARDBOOK_TLS_CERT"),
            tls_key: lookup("WARDBOOK_TLS_KEY"),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("wardbook.wal")
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let value = lookup(key)?;
    match value.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("ignoring {key}={value:?}: not a valid value");
            None
        }
    }
}
