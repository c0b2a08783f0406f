use std::collections::HashMap;
use std::env;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    /// How often expired trash is swept from every account
    pub sweep_interval: Duration,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let bind_addr = value_or_default(&lookup, "WARD_API_BIND_ADDR", "127.0.0.1:8787");

        let sweep_interval_secs = value_or_default(&lookup, "WARD_API_SWEEP_INTERVAL_SECS", "3600")
            .parse::<u64>()
            .map_err(|_| {
                ConfigError::Invalid(
                    "WARD_API_SWEEP_INTERVAL_SECS must be an integer in [60, 86400]".to_string(),
                )
            })?;
        if !(60..=86_400).contains(&sweep_interval_secs) {
            return Err(ConfigError::Invalid(
                "WARD_API_SWEEP_INTERVAL_SECS must be in [60, 86400]".to_string(),
            ));
        }

        Ok(Self {
            bind_addr,
            sweep_interval: Duration::from_secs(sweep_interval_secs),
        })
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8787".to_string(),
            sweep_interval: Duration::from_secs(3_600),
        }
    }
}

fn value_or_default(lookup: impl Fn(&str) -> Option<String>, name: &str, default: &str) -> String {
    lookup(name)
        .and_then(|value| {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
        .unwrap_or_else(|| default.to_string())
}
