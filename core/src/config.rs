//! Client configuration.
//!
//! Values are supplied by the host application; the data layer only reads
//! them. Durations are carried as milliseconds so the struct deserializes
//! from flat JSON/TOML or environment variables without custom formats.

use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Origin of the REST backend, e.g. `https://api.example.com`.
    pub base_url: String,
    pub timeout_ms: u64,
    pub retry_count: u32,
    pub backoff_base_ms: u64,
    pub backoff_jitter_ms: u64,
    pub backoff_max_ms: u64,
    /// Default per-query TTL.
    pub stale_time_ms: u64,
    /// Default background revalidation period for mounted queries.
    pub refetch_interval_ms: Option<u64>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            timeout_ms: 10_000,
            retry_count: 2,
            backoff_base_ms: 1_000,
            backoff_jitter_ms: 250,
            backoff_max_ms: 30_000,
            stale_time_ms: 30_000,
            refetch_interval_ms: None,
        }
    }
}

impl ClientConfig {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            ..Self::default()
        }
    }

    /// Read settings from `DASHBOARD_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let base_url = lookup("DASHBOARD_API_URL").ok_or(ConfigError::Missing("DASHBOARD_API_URL"))?;
        let mut config = Self::new(&base_url);
        if let Some(raw) = lookup("DASHBOARD_TIMEOUT_MS") {
            config.timeout_ms = parse("DASHBOARD_TIMEOUT_MS", &raw)?;
        }
        if let Some(raw) = lookup("DASHBOARD_RETRY_COUNT") {
            config.retry_count = parse("DASHBOARD_RETRY_COUNT", &raw)?;
        }
        if let Some(raw) = lookup("DASHBOARD_STALE_TIME_MS") {
            config.stale_time_ms = parse("DASHBOARD_STALE_TIME_MS", &raw)?;
        }
        if let Some(raw) = lookup("DASHBOARD_REFETCH_INTERVAL_MS") {
            config.refetch_interval_ms = Some(parse("DASHBOARD_REFETCH_INTERVAL_MS", &raw)?);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_url.is_empty() {
            return Err(ConfigError::Missing("base_url"));
        }
        if reqwest::Url::parse(&self.base_url).is_err() {
            return Err(ConfigError::Invalid {
                name: "base_url",
                value: self.base_url.clone(),
            });
        }
        if self.timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                name: "timeout_ms",
                value: "0".into(),
            });
        }
        if self.refetch_interval_ms == Some(0) {
            return Err(ConfigError::Invalid {
                name: "refetch_interval_ms",
                value: "0".into(),
            });
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn stale_time(&self) -> Duration {
        Duration::from_millis(self.stale_time_ms)
    }

    pub fn refetch_interval(&self) -> Option<Duration> {
        self.refetch_interval_ms.map(Duration::from_millis)
    }
}

fn parse<T: std::str::FromStr>(name: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::Invalid {
        name,
        value: raw.to_string(),
    })
}
