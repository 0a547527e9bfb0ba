//! Runtime configuration read from the environment.
//!
//! | Variable | Default |
//! |----------|---------|
//! | `DOCKET_BIND_ADDR` | `0.0.0.0:8080` |
//! | `DOCKET_STORE` | `sqlite` (`sqlite` or `memory`) |
//! | `DOCKET_DATABASE_URL` | `sqlite://./docket.db` |
//! | `DOCKET_WORKERS` | `4` |
//! | `DOCKET_QUEUE_CAPACITY` | `256` |
//! | `DOCKET_MAX_RETRIES` | `2` |
//! | `DOCKET_BACKOFF_BASE_MS` | `5000` |
//! | `DOCKET_BACKOFF_MAX_MS` | `60000` |
//! | `DOCKET_ATTEMPT_TIMEOUT_SECS` | `600` |
//! | `DOCKET_STALE_AFTER_SECS` | `900` |
//! | `DOCKET_ANALYZER_URL` | `http://127.0.0.1:5000/analyze` |
//! | `DOCKET_SYNC_WAIT_SECS` | `600` |
//!
//! Empty values count as unset.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::jobs::{JobSystemConfig, RetryPolicy};

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Which job store backs the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreKind {
    #[default]
    Sqlite,
    Memory,
}

impl std::fmt::Display for StoreKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sqlite => write!(f, "sqlite"),
            Self::Memory => write!(f, "memory"),
        }
    }
}

impl FromStr for StoreKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sqlite" => Ok(Self::Sqlite),
            "memory" | "in-memory" | "mem" => Ok(Self::Memory),
            _ => Err(format!("unknown store '{s}', expected 'sqlite' or 'memory'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DocketConfig {
    pub bind_addr: SocketAddr,
    pub store: StoreKind,
    pub database_url: String,
    pub workers: usize,
    pub queue_capacity: usize,
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub attempt_timeout: Duration,
    pub stale_after: Duration,
    pub analyzer_url: String,
    /// Longest the synchronous analyze endpoint waits for a result.
    pub sync_wait: Duration,
}

impl Default for DocketConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            store: StoreKind::Sqlite,
            database_url: "sqlite://./docket.db".to_string(),
            workers: 4,
            queue_capacity: 256,
            max_retries: 2,
            backoff_base: Duration::from_millis(5000),
            backoff_max: Duration::from_millis(60_000),
            attempt_timeout: Duration::from_secs(600),
            stale_after: Duration::from_secs(900),
            analyzer_url: "http://127.0.0.1:5000/analyze".to_string(),
            sync_wait: Duration::from_secs(600),
        }
    }
}

impl DocketConfig {
    /// Read the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through `lookup` (the environment, or a map in tests).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Lookup(lookup);
        let defaults = Self::default();

        let config = Self {
            bind_addr: env.parse("DOCKET_BIND_ADDR", defaults.bind_addr)?,
            store: env.parse("DOCKET_STORE", defaults.store)?,
            database_url: env.string("DOCKET_DATABASE_URL", defaults.database_url),
            workers: env.parse("DOCKET_WORKERS", defaults.workers)?,
            queue_capacity: env.parse("DOCKET_QUEUE_CAPACITY", defaults.queue_capacity)?,
            max_retries: env.parse("DOCKET_MAX_RETRIES", defaults.max_retries)?,
            backoff_base: env.millis("DOCKET_BACKOFF_BASE_MS", defaults.backoff_base)?,
            backoff_max: env.millis("DOCKET_BACKOFF_MAX_MS", defaults.backoff_max)?,
            attempt_timeout: env.secs("DOCKET_ATTEMPT_TIMEOUT_SECS", defaults.attempt_timeout)?,
            stale_after: env.secs("DOCKET_STALE_AFTER_SECS", defaults.stale_after)?,
            analyzer_url: env.string("DOCKET_ANALYZER_URL", defaults.analyzer_url),
            sync_wait: env.secs("DOCKET_SYNC_WAIT_SECS", defaults.sync_wait)?,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(invalid("DOCKET_WORKERS", "must be at least 1"));
        }
        if self.queue_capacity == 0 {
            return Err(invalid("DOCKET_QUEUE_CAPACITY", "must be at least 1"));
        }
        if self.backoff_max < self.backoff_base {
            return Err(invalid(
                "DOCKET_BACKOFF_MAX_MS",
                "must not be smaller than DOCKET_BACKOFF_BASE_MS",
            ));
        }
        if self.attempt_timeout.is_zero() {
            return Err(invalid("DOCKET_ATTEMPT_TIMEOUT_SECS", "must be positive"));
        }
        if self.stale_after <= self.attempt_timeout {
            // A running attempt must never look abandoned to the stale sweep.
            return Err(invalid(
                "DOCKET_STALE_AFTER_SECS",
                "must be greater than DOCKET_ATTEMPT_TIMEOUT_SECS",
            ));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(self.max_retries, self.backoff_base, self.backoff_max)
            .with_attempt_timeout(self.attempt_timeout)
    }

    pub fn job_system(&self) -> JobSystemConfig {
        JobSystemConfig {
            workers: self.workers,
            queue_capacity: self.queue_capacity,
            policy: self.retry_policy(),
            stale_after: self.stale_after,
        }
    }
}

struct Lookup<F>(F);

impl<F: Fn(&str) -> Option<String>> Lookup<F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|v| !v.trim().is_empty())
    }

    fn string(&self, key: &str, default: String) -> String {
        self.get(key).unwrap_or(default)
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.get(key)
            .map(|s| s.trim().parse().map_err(|e| invalid(key, format!("{e}"))))
            .transpose()
            .map(|opt| opt.unwrap_or(default))
    }

    fn millis(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
        self.parse(key, default_ms).map(Duration::from_millis)
    }

    fn secs(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        self.parse(key, default.as_secs()).map(Duration::from_secs)
    }
}

fn invalid(key: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<DocketConfig, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        DocketConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config, DocketConfig::default());

        let policy = config.retry_policy();
        assert_eq!(policy.max_attempts(), 3);
        assert_eq!(policy.base_delay, Duration::from_secs(5));
        assert_eq!(policy.attempt_timeout, Duration::from_secs(600));
    }

    #[test]
    fn values_are_read_and_parsed() {
        let config = config_from(&[
            ("DOCKET_BIND_ADDR", "127.0.0.1:9000"),
            ("DOCKET_STORE", "memory"),
            ("DOCKET_WORKERS", "8"),
            ("DOCKET_MAX_RETRIES", "0"),
            ("DOCKET_BACKOFF_BASE_MS", "250"),
            ("DOCKET_ATTEMPT_TIMEOUT_SECS", "30"),
            ("DOCKET_ANALYZER_URL", "http://analyzer:5000/analyze"),
        ])
        .unwrap();

        assert_eq!(config.bind_addr, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.store, StoreKind::Memory);
        assert_eq!(config.workers, 8);
        assert_eq!(config.max_retries, 0);
        assert_eq!(config.backoff_base, Duration::from_millis(250));
        assert_eq!(config.attempt_timeout, Duration::from_secs(30));
        assert_eq!(config.analyzer_url, "http://analyzer:5000/analyze");

        let jobs = config.job_system();
        assert_eq!(jobs.workers, 8);
        assert_eq!(jobs.policy.max_attempts(), 1);
    }

    #[test]
    fn empty_values_fall_back_to_defaults() {
        let config = config_from(&[("DOCKET_WORKERS", ""), ("DOCKET_STORE", "  ")]).unwrap();
        assert_eq!(config.workers, 4);
        assert_eq!(config.store, StoreKind::Sqlite);
    }

    #[test]
    fn malformed_values_name_the_variable() {
        let err = config_from(&[("DOCKET_WORKERS", "many")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "DOCKET_WORKERS"));

        let err = config_from(&[("DOCKET_STORE", "postgres")]).unwrap_err();
        assert!(err.to_string().contains("DOCKET_STORE"));
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        assert!(config_from(&[("DOCKET_WORKERS", "0")]).is_err());
        assert!(config_from(&[("DOCKET_QUEUE_CAPACITY", "0")]).is_err());
        assert!(config_from(&[("DOCKET_ATTEMPT_TIMEOUT_SECS", "0")]).is_err());
        assert!(config_from(&[("DOCKET_STALE_AFTER_SECS", "0")]).is_err());
        assert!(
            config_from(&[
                ("DOCKET_BACKOFF_BASE_MS", "10000"),
                ("DOCKET_BACKOFF_MAX_MS", "500"),
            ])
            .is_err()
        );
    }

    #[test]
    fn stale_threshold_must_outlast_an_attempt() {
        let err = config_from(&[
            ("DOCKET_ATTEMPT_TIMEOUT_SECS", "1200"),
            ("DOCKET_STALE_AFTER_SECS", "1"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "DOCKET_STALE_AFTER_SECS"));

        assert!(
            config_from(&[
                ("DOCKET_ATTEMPT_TIMEOUT_SECS", "60"),
                ("DOCKET_STALE_AFTER_SECS", "60"),
            ])
            .is_err()
        );

        let config = config_from(&[
            ("DOCKET_ATTEMPT_TIMEOUT_SECS", "60"),
            ("DOCKET_STALE_AFTER_SECS", "61"),
        ])
        .unwrap();
        assert_eq!(config.job_system().stale_after, Duration::from_secs(61));
    }
}
