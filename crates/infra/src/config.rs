//! Worker configuration.
//!
//! Loaded once at startup into an explicit [`WorkerSettings`] value and handed
//! to each component constructor. Nothing reads the environment after that.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::workers::projection_worker::{AckPolicy, IndexScope, WorkerConfig};

pub const DEFAULT_STREAM: &str = "todo.events";
pub const DEFAULT_CONSUMER_GROUP: &str = "projection-worker";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Where projected records are written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProjectionTarget {
    /// Relational table reachable through a Postgres connection string.
    Postgres { url: String },
    /// Embedded single-writer full-text index file.
    SearchIndex { path: PathBuf },
}

impl ProjectionTarget {
    fn parse(value: &str) -> Self {
        if value.starts_with("postgres://") || value.starts_with("postgresql://") {
            Self::Postgres {
                url: value.to_string(),
            }
        } else {
            Self::SearchIndex {
                path: PathBuf::from(value),
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerSettings {
    pub url: String,
    pub stream: String,
    pub consumer_group: String,
    pub consumer_name: String,
    pub visibility_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSettings {
    pub broker: BrokerSettings,
    pub projection: ProjectionTarget,
    pub index_lock_timeout: Duration,
    pub worker: WorkerConfig,
    pub log_level: String,
    pub metrics_addr: Option<SocketAddr>,
}

impl WorkerSettings {
    /// Load from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an explicit key/value map.
    pub fn from_map(values: &HashMap<String, String>) -> Result<Self, ConfigError> {
        Self::from_lookup(|key| values.get(key).cloned())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let broker_url = get("BROKER_URL")
            .or_else(|| get("REDIS_URL"))
            .ok_or(ConfigError::Missing("BROKER_URL"))?;
        let projection = get("PROJECTION_URL")
            .map(|v| ProjectionTarget::parse(&v))
            .ok_or(ConfigError::Missing("PROJECTION_URL"))?;

        let consumer_name = get("CONSUMER_NAME")
            .unwrap_or_else(|| format!("{DEFAULT_CONSUMER_GROUP}-{}", uuid::Uuid::now_v7()));

        let broker = BrokerSettings {
            url: broker_url,
            stream: get("EVENT_STREAM").unwrap_or_else(|| DEFAULT_STREAM.to_string()),
            consumer_group: get("CONSUMER_GROUP")
                .unwrap_or_else(|| DEFAULT_CONSUMER_GROUP.to_string()),
            consumer_name,
            visibility_timeout: millis(&get, "VISIBILITY_TIMEOUT_MS", 30_000)?,
        };

        let defaults = WorkerConfig::default();
        let batch_size = parse_or(&get, "FETCH_BATCH_SIZE", defaults.batch_size)?;
        if batch_size == 0 {
            return Err(invalid("FETCH_BATCH_SIZE", "0", "must be at least 1"));
        }
        let max_deliveries = parse_or(&get, "MAX_DELIVERIES", defaults.max_deliveries)?;
        if max_deliveries == 0 {
            return Err(invalid("MAX_DELIVERIES", "0", "must be at least 1"));
        }

        let worker = WorkerConfig {
            batch_size,
            fetch_wait: millis(&get, "FETCH_WAIT_MS", 2_000)?,
            idle_backoff: millis(&get, "IDLE_BACKOFF_MS", 500)?,
            ack_policy: parse_or(&get, "ACK_POLICY", defaults.ack_policy)?,
            max_deliveries,
            index_scope: parse_or(&get, "INDEX_SCOPE", defaults.index_scope)?,
        };

        let metrics_addr = match get("METRICS_ADDR") {
            Some(raw) => Some(
                raw.parse::<SocketAddr>()
                    .map_err(|e| invalid("METRICS_ADDR", &raw, e))?,
            ),
            None => None,
        };

        Ok(Self {
            broker,
            projection,
            index_lock_timeout: millis(&get, "INDEX_LOCK_TIMEOUT_MS", 5_000)?,
            worker,
            log_level: get("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            metrics_addr,
        })
    }
}

fn invalid(key: &'static str, value: &str, reason: impl ToString) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_or<T>(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: ToString,
{
    match get(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| invalid(key, &raw, e)),
        None => Ok(default),
    }
}

fn millis(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default_ms: u64,
) -> Result<Duration, ConfigError> {
    parse_or(get, key, default_ms).map(Duration::from_millis)
}

impl FromStr for AckPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fail-safe" | "failsafe" | "ack-on-success" => Ok(Self::FailSafe),
            "fail-open" | "failopen" | "always-ack" => Ok(Self::FailOpen),
            other => Err(format!("unknown ack policy `{other}` (expected fail-safe or fail-open)")),
        }
    }
}

impl FromStr for IndexScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "batch" | "per-batch" => Ok(Self::PerBatch),
            "message" | "per-message" => Ok(Self::PerMessage),
            other => Err(format!("unknown index scope `{other}` (expected batch or message)")),
        }
    }
}
