//! Sync engine configuration.
//!
//! Values come from the environment (`WARD_*`); `EngineConfig::from_lookup`
//! takes any lookup function so parsing can be exercised without touching
//! the process environment.

use std::collections::HashMap;
use std::env;
use std::time::Duration;

use thiserror::Error;

use crate::util::{is_http_url, normalize_text_option};

/// Default push cadence for the outbox drain
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(30);
/// Default cadence of device heartbeats
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);
/// Attempts after which a pending entry is forced to `failed_fatal`
pub const DEFAULT_MAX_RETRY_COUNT: u32 = 5;
/// How long `synced` entries are kept before cleanup (7 days)
pub const DEFAULT_WAL_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);
/// Transport timeout for remote RPCs
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Base URL of the remote API; `None` runs offline-only
    pub remote_url: Option<String>,
    /// Account the device acts for
    pub user: String,
    pub flush_interval: Duration,
    pub heartbeat_interval: Duration,
    pub max_retry_count: u32,
    pub wal_retention: Duration,
    pub request_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            remote_url: None,
            user: "default".to_string(),
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            max_retry_count: DEFAULT_MAX_RETRY_COUNT,
            wal_retention: DEFAULT_WAL_RETENTION,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let remote_url = match normalize_text_option(lookup("WARD_REMOTE_URL")) {
            Some(url) if is_http_url(&url) => Some(url.trim_end_matches('/').to_string()),
            Some(_) => {
                return Err(ConfigError::Invalid(
                    "WARD_REMOTE_URL must start with http:// or https://".to_string(),
                ))
            }
            None => None,
        };

        let user = normalize_text_option(lookup("WARD_USER")).unwrap_or(defaults.user);

        let flush_interval = Duration::from_secs(parse_bounded(
            &lookup,
            "WARD_FLUSH_INTERVAL_SECS",
            defaults.flush_interval.as_secs(),
            1,
        )?);
        let heartbeat_interval = Duration::from_secs(parse_bounded(
            &lookup,
            "WARD_HEARTBEAT_INTERVAL_SECS",
            defaults.heartbeat_interval.as_secs(),
            1,
        )?);
        let max_retry_count = u32::try_from(parse_bounded(
            &lookup,
            "WARD_MAX_RETRY_COUNT",
            u64::from(defaults.max_retry_count),
            1,
        )?)
        .map_err(|_| ConfigError::Invalid("WARD_MAX_RETRY_COUNT is too large".to_string()))?;
        let wal_retention = Duration::from_secs(
            parse_bounded(
                &lookup,
                "WARD_WAL_RETENTION_HOURS",
                defaults.wal_retention.as_secs() / 3600,
                0,
            )?
            .saturating_mul(3600),
        );
        let request_timeout = Duration::from_secs(parse_bounded(
            &lookup,
            "WARD_REQUEST_TIMEOUT_SECS",
            defaults.request_timeout.as_secs(),
            1,
        )?);

        Ok(Self {
            remote_url,
            user,
            flush_interval,
            heartbeat_interval,
            max_retry_count,
            wal_retention,
            request_timeout,
        })
    }

    pub const fn is_remote_configured(&self) -> bool {
        self.remote_url.is_some()
    }

    /// Retention window in milliseconds, for queue cleanup
    pub fn wal_retention_ms(&self) -> i64 {
        i64::try_from(self.wal_retention.as_millis()).unwrap_or(i64::MAX)
    }
}

fn parse_bounded(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: u64,
    min: u64,
) -> Result<u64, ConfigError> {
    let Some(raw) = normalize_text_option(lookup(name)) else {
        return Ok(default);
    };
    let value = raw
        .parse::<u64>()
        .map_err(|_| ConfigError::Invalid(format!("{name} must be an integer >= {min}")))?;
    if value < min {
        return Err(ConfigError::Invalid(format!("{name} must be >= {min}")));
    }
    Ok(value)
}
