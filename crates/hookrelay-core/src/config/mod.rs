//! Configuration system for hookrelay.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{RelayError, RelayResult};
use crate::queue::DEFAULT_QUEUE_CAPACITY;
use crate::retry::RetryPolicy;
use crate::sweep::SweepConfig;
use crate::worker::DeliverySettings;

/// Environment variable naming a config file for [`RelayConfig::load`].
pub const CONFIG_FILE_ENV: &str = "HOOKRELAY_CONFIG";

/// Main relay configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// SQLite database path. `None` keeps everything in memory.
    pub database_path: Option<PathBuf>,
    /// Redis URL for a shared subscription cache (requires the `redis` feature).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redis_url: Option<String>,
    /// Dispatch queue capacity before ingestion gets 503.
    pub queue_capacity: usize,
    /// Number of delivery workers.
    pub worker_count: usize,
    /// Retries allowed after the first attempt.
    pub max_tries: u32,
    /// Per-request delivery timeout.
    pub delivery_timeout_secs: u64,
    pub retry_policy: RetryPolicy,
    /// Retry 4xx responses instead of failing them immediately.
    pub retry_client_errors: bool,
    pub sweep: SweepConfig,
    /// Re-schedule retries for pairs left pending by a previous run.
    pub recover_on_start: bool,
    /// How long shutdown waits for workers to drain.
    pub shutdown_timeout_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        let relay_dir = dirs::home_dir()
            .map(|h| h.join(".hookrelay"))
            .unwrap_or_else(|| PathBuf::from(".hookrelay"));

        Self {
            database_path: Some(relay_dir.join("hookrelay.db")),
            redis_url: None,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            worker_count: 4,
            max_tries: 5,
            delivery_timeout_secs: 10,
            retry_policy: RetryPolicy::default(),
            retry_client_errors: true,
            sweep: SweepConfig::default(),
            recover_on_start: true,
            shutdown_timeout_secs: 30,
        }
    }
}

impl RelayConfig {
    /// Configuration with an in-memory database and no periodic sweep.
    pub fn in_memory() -> Self {
        Self {
            database_path: None,
            sweep: SweepConfig {
                enabled: false,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Load configuration from a file (TOML, JSON, or YAML).
    pub fn from_file(path: impl AsRef<Path>) -> RelayResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let ext = path.as_ref().extension().and_then(|e| e.to_str());

        match ext {
            Some("toml") => {
                toml::from_str(&content).map_err(|e| RelayError::Configuration(e.to_string()))
            }
            Some("json") => serde_json::from_str(&content)
                .map_err(|e| RelayError::Configuration(e.to_string())),
            Some("yaml" | "yml") => serde_yaml::from_str(&content)
                .map_err(|e| RelayError::Configuration(e.to_string())),
            _ => Err(RelayError::Configuration(
                "Unsupported config file format. Use .toml, .json, or .yaml".to_string(),
            )),
        }
    }

    /// Load configuration from environment variables on top of defaults.
    ///
    /// Reads:
    /// - `HOOKRELAY_DATABASE_PATH` (`:memory:` for an in-memory store)
    /// - `HOOKRELAY_REDIS_URL`
    /// - `HOOKRELAY_QUEUE_CAPACITY`
    /// - `HOOKRELAY_WORKER_COUNT`
    /// - `HOOKRELAY_MAX_TRIES`
    /// - `HOOKRELAY_DELIVERY_TIMEOUT_SECS`
    /// - `HOOKRELAY_RETRY_DELAY_SECS` (fixed retry delay)
    /// - `HOOKRELAY_RETRY_CLIENT_ERRORS` (`true`/`false`)
    /// - `HOOKRELAY_SWEEP_INTERVAL_MINUTES`
    /// - `HOOKRELAY_SUBSCRIPTION_EXPIRY_HOURS`
    /// - `HOOKRELAY_DISABLE_SWEEP`
    /// - `HOOKRELAY_DISABLE_RECOVERY`
    pub fn from_env() -> Self {
        Self::default().with_env()
    }

    /// Load from the file named by `HOOKRELAY_CONFIG` if set, then apply
    /// environment overrides.
    pub fn load() -> RelayResult<Self> {
        let base = match std::env::var(CONFIG_FILE_ENV) {
            Ok(path) => Self::from_file(path)?,
            Err(_) => Self::default(),
        };
        Ok(base.with_env())
    }

    /// Apply environment overrides to this configuration.
    pub fn with_env(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, var: impl Fn(&str) -> Option<String>) -> Self {
        fn parsed<T: std::str::FromStr>(
            var: &impl Fn(&str) -> Option<String>,
            key: &str,
        ) -> Option<T> {
            var(key).and_then(|v| v.trim().parse().ok())
        }

        if let Some(path) = var("HOOKRELAY_DATABASE_PATH") {
            self.database_path = match path.as_str() {
                "" | ":memory:" => None,
                _ => Some(PathBuf::from(path)),
            };
        }
        if let Some(url) = var("HOOKRELAY_REDIS_URL") {
            self.redis_url = Some(url);
        }
        if let Some(capacity) = parsed(&var, "HOOKRELAY_QUEUE_CAPACITY") {
            self.queue_capacity = capacity;
        }
        if let Some(count) = parsed(&var, "HOOKRELAY_WORKER_COUNT") {
            self.worker_count = count;
        }
        if let Some(max_tries) = parsed(&var, "HOOKRELAY_MAX_TRIES") {
            self.max_tries = max_tries;
        }
        if let Some(secs) = parsed(&var, "HOOKRELAY_DELIVERY_TIMEOUT_SECS") {
            self.delivery_timeout_secs = secs;
        }
        if let Some(secs) = parsed::<u64>(&var, "HOOKRELAY_RETRY_DELAY_SECS") {
            self.retry_policy = RetryPolicy::fixed(Duration::from_secs(secs));
        }
        if let Some(retry) = parsed(&var, "HOOKRELAY_RETRY_CLIENT_ERRORS") {
            self.retry_client_errors = retry;
        }
        if let Some(minutes) = parsed(&var, "HOOKRELAY_SWEEP_INTERVAL_MINUTES") {
            self.sweep.interval_minutes = minutes;
        }
        if let Some(hours) = parsed(&var, "HOOKRELAY_SUBSCRIPTION_EXPIRY_HOURS") {
            self.sweep.expiry_hours = hours;
        }
        if var("HOOKRELAY_DISABLE_SWEEP").is_some() {
            self.sweep.enabled = false;
        }
        if var("HOOKRELAY_DISABLE_RECOVERY").is_some() {
            self.recover_on_start = false;
        }
        self
    }

    /// Set the database path.
    pub fn with_database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.database_path = Some(path.into());
        self
    }

    /// Set the retry budget.
    pub fn with_max_tries(mut self, max_tries: u32) -> Self {
        self.max_tries = max_tries;
        self
    }

    /// Set the retry policy.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Set the worker count (minimum 1).
    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count.max(1);
        self
    }

    /// Set the queue capacity (minimum 1).
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    /// Set the delivery timeout.
    pub fn with_delivery_timeout(mut self, timeout: Duration) -> Self {
        self.delivery_timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn with_retry_client_errors(mut self, retry: bool) -> Self {
        self.retry_client_errors = retry;
        self
    }

    pub fn without_sweep(mut self) -> Self {
        self.sweep.enabled = false;
        self
    }

    pub fn without_recovery(mut self) -> Self {
        self.recover_on_start = false;
        self
    }

    /// Settings handed to delivery workers.
    pub fn delivery_settings(&self) -> DeliverySettings {
        DeliverySettings {
            max_tries: self.max_tries,
            retry_policy: self.retry_policy.clone(),
            retry_client_errors: self.retry_client_errors,
            timeout: Duration::from_secs(self.delivery_timeout_secs.max(1)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = RelayConfig::default();
        assert_eq!(config.queue_capacity, 1024);
        assert_eq!(config.max_tries, 5);
        assert_eq!(config.delivery_timeout_secs, 10);
        assert_eq!(config.retry_policy, RetryPolicy::Fixed { delay_ms: 60_000 });
        assert!(config.retry_client_errors);
        assert!(config.recover_on_start);
        assert!(config
            .database_path
            .unwrap()
            .ends_with(".hookrelay/hookrelay.db"));
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("HOOKRELAY_DATABASE_PATH", ":memory:"),
            ("HOOKRELAY_MAX_TRIES", "3"),
            ("HOOKRELAY_RETRY_DELAY_SECS", "5"),
            ("HOOKRELAY_RETRY_CLIENT_ERRORS", "false"),
            ("HOOKRELAY_WORKER_COUNT", "not-a-number"),
            ("HOOKRELAY_DISABLE_SWEEP", "1"),
        ]
        .into_iter()
        .collect();

        let config =
            RelayConfig::default().with_overrides(|k| vars.get(k).map(|v| v.to_string()));
        assert!(config.database_path.is_none());
        assert_eq!(config.max_tries, 3);
        assert_eq!(config.retry_policy, RetryPolicy::fixed(Duration::from_secs(5)));
        assert!(!config.retry_client_errors);
        assert_eq!(config.worker_count, 4);
        assert!(!config.sweep.enabled);
        assert!(config.recover_on_start);
    }

    #[test]
    fn test_from_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hookrelay.toml");
        std::fs::write(
            &path,
            r#"
            max_tries = 2
            worker_count = 8

            [retry_policy]
            kind = "exponential"
            initial_delay_ms = 500
            max_delay_ms = 10000
            multiplier = 2.0

            [sweep]
            expiry_hours = 24
            "#,
        )
        .unwrap();

        let config = RelayConfig::from_file(&path).unwrap();
        assert_eq!(config.max_tries, 2);
        assert_eq!(config.worker_count, 8);
        assert_eq!(config.queue_capacity, 1024);
        assert_eq!(config.sweep.expiry_hours, 24);
        assert_eq!(config.sweep.interval_minutes, 60);
        assert!(matches!(config.retry_policy, RetryPolicy::Exponential { .. }));
    }

    #[test]
    fn test_from_yaml_and_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = dir.path().join("hookrelay.yaml");
        std::fs::write(&yaml, "queue_capacity: 16\nretry_client_errors: false\n").unwrap();
        let config = RelayConfig::from_file(&yaml).unwrap();
        assert_eq!(config.queue_capacity, 16);
        assert!(!config.retry_client_errors);

        let ini = dir.path().join("hookrelay.ini");
        std::fs::write(&ini, "x=1").unwrap();
        assert!(matches!(
            RelayConfig::from_file(&ini),
            Err(RelayError::Configuration(_))
        ));
    }

    #[test]
    fn test_delivery_settings() {
        let settings = RelayConfig::in_memory()
            .with_max_tries(2)
            .with_delivery_timeout(Duration::from_secs(3))
            .delivery_settings();
        assert_eq!(settings.max_tries, 2);
        assert_eq!(settings.timeout, Duration::from_secs(3));
    }
}
