//! Application-level configuration loading: engine tunables from JSON, store selection from the
//! environment.

use std::{env, fs, io::ErrorKind, path::PathBuf, time::Duration};

use serde::Deserialize;
use serde_with::{DurationMilliSeconds, serde_as};
use tracing::{info, warn};

/// Default location on disk where the server looks for the JSON configuration.
const DEFAULT_CONFIG_PATH: &str = "config/app.json";
/// Environment variable that overrides [`DEFAULT_CONFIG_PATH`].
const CONFIG_PATH_ENV: &str = "QUIZ_SYNC_CONFIG_PATH";
/// Environment variable selecting the store backends.
const STORAGE_BACKEND_ENV: &str = "STORAGE_BACKEND";

/// Tunables of the score update queue.
#[serde_as]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Delay between the first enqueue and the scheduled flush.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "flush_delay_ms")]
    pub flush_delay: Duration,
    /// Queued entry count that triggers an immediate flush.
    pub flush_threshold: usize,
    /// Entries written per batch.
    pub batch_size: usize,
    /// Concurrent writes inside one batch.
    pub parallelism: usize,
    /// Pause between two batches of the same flush.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "batch_pause_ms")]
    pub batch_pause: Duration,
    /// Consecutive failed flush cycles before an entry moves to the retry store.
    pub max_flush_failures: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            flush_delay: Duration::from_millis(250),
            flush_threshold: 20,
            batch_size: 10,
            parallelism: 4,
            batch_pause: Duration::from_millis(50),
            max_flush_failures: 3,
        }
    }
}

/// Tunables of the durable retry store and its recovery sweep.
#[serde_as]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Replay attempts allowed per record.
    pub max_attempts: u32,
    /// Whether the engine runs the periodic recovery sweep.
    pub sweep_enabled: bool,
    /// Interval between two recovery sweeps.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "sweep_interval_ms")]
    pub sweep_interval: Duration,
    /// Age after which a `processing` claim is considered abandoned.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "processing_timeout_ms")]
    pub processing_timeout: Duration,
    /// Days completed and failed records are kept.
    pub retention_days: u32,
    /// Sessions created longer ago than this are torn down by the sweep.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "stale_session_age_ms")]
    pub stale_session_age: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            sweep_enabled: true,
            sweep_interval: Duration::from_secs(30),
            processing_timeout: Duration::from_secs(60),
            retention_days: 7,
            stale_session_age: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Shared exponential backoff settings.
#[serde_as]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "initial_delay_ms")]
    pub initial_delay: Duration,
    /// Upper bound for any single delay.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "max_delay_ms")]
    pub max_delay: Duration,
    /// Randomize each delay between half and the full value.
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            jitter: true,
        }
    }
}

/// Change notifier settings.
#[serde_as]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotifierConfig {
    /// Interval of full re-reads when a store offers no change stream.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "poll_interval_ms")]
    pub poll_interval: Duration,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
        }
    }
}

/// Session creation settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionsConfig {
    /// Number of digits in a join code.
    pub code_length: usize,
    /// Code generations tried before giving up on a collision streak.
    pub max_code_attempts: u32,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            code_length: 6,
            max_code_attempts: 10,
        }
    }
}

/// Every tunable of the synchronization engine.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Update queue batching.
    pub queue: QueueConfig,
    /// Retry ledger limits.
    pub retry: RetryConfig,
    /// Delay curve shared by the queue and the retry store.
    pub backoff: BackoffConfig,
    /// Change notifier polling.
    pub notifier: NotifierConfig,
    /// Join code generation.
    pub sessions: SessionsConfig,
}

impl EngineConfig {
    /// Replace values that would stall the engine with their smallest usable counterpart.
    pub fn sanitized(mut self) -> Self {
        self.queue.flush_threshold = self.queue.flush_threshold.max(1);
        self.queue.batch_size = self.queue.batch_size.max(1);
        self.queue.parallelism = self.queue.parallelism.max(1);
        self.queue.max_flush_failures = self.queue.max_flush_failures.max(1);
        self.retry.max_attempts = self.retry.max_attempts.max(1);
        self.backoff.max_attempts = self.backoff.max_attempts.max(1);
        self.sessions.code_length = self.sessions.code_length.clamp(4, 12);
        self.sessions.max_code_attempts = self.sessions.max_code_attempts.max(1);
        if self.notifier.poll_interval.is_zero() {
            self.notifier.poll_interval = NotifierConfig::default().poll_interval;
        }
        if self.retry.sweep_interval.is_zero() {
            self.retry.sweep_interval = RetryConfig::default().sweep_interval;
        }
        self
    }
}

/// Store backends wired by the binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    /// In-process stores; nothing survives a restart.
    Memory,
    /// MongoDB for every store role.
    Mongo,
    /// MongoDB fast store and ledger, CouchDB authoritative store.
    MongoCouch,
}

impl StorageBackend {
    /// Read [`STORAGE_BACKEND_ENV`], defaulting to MongoDB.
    pub fn from_env() -> Self {
        match env::var(STORAGE_BACKEND_ENV) {
            Ok(value) => Self::parse(&value).unwrap_or_else(|| {
                warn!(value = %value, "unknown storage backend; using mongo");
                StorageBackend::Mongo
            }),
            Err(_) => StorageBackend::Mongo,
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "memory" => Some(StorageBackend::Memory),
            "mongo" | "mongodb" => Some(StorageBackend::Mongo),
            "mongo-couch" | "couch" => Some(StorageBackend::MongoCouch),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
/// Immutable runtime configuration shared across the application.
pub struct AppConfig {
    /// Engine tunables.
    pub engine: EngineConfig,
}

impl AppConfig {
    /// Load the application configuration from disk, falling back to built-in defaults.
    pub fn load() -> Self {
        let path = resolve_config_path();
        match fs::read_to_string(&path) {
            Ok(contents) => match Self::from_json(&contents) {
                Ok(app_config) => {
                    info!(path = %path.display(), "loaded engine configuration");
                    app_config
                }
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        error = %err,
                        "failed to parse config; falling back to defaults"
                    );
                    Self::default()
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(
                    path = %path.display(),
                    "config file not found; using built-in defaults"
                );
                Self::default()
            }
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "failed to read config; falling back to defaults"
                );
                Self::default()
            }
        }
    }

    /// Parse a JSON document; absent sections and fields keep their defaults.
    pub fn from_json(contents: &str) -> Result<Self, serde_json::Error> {
        let engine = serde_json::from_str::<EngineConfig>(contents)?;
        Ok(Self {
            engine: engine.sanitized(),
        })
    }
}

/// Resolve the configuration path taking the environment override into account.
fn resolve_config_path() -> PathBuf {
    env::var_os(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .filter(|path| !path.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config = AppConfig::from_json(
            r#"{ "queue": { "flush_delay_ms": 500, "batch_size": 25 }, "sessions": { "code_length": 8 } }"#,
        )
        .unwrap();

        assert_eq!(config.engine.queue.flush_delay, Duration::from_millis(500));
        assert_eq!(config.engine.queue.batch_size, 25);
        assert_eq!(config.engine.queue.parallelism, 4);
        assert_eq!(config.engine.sessions.code_length, 8);
        assert_eq!(config.engine.retry.max_attempts, 3);
    }

    #[test]
    fn zero_values_are_sanitized() {
        let config = AppConfig::from_json(
            r#"{ "queue": { "batch_size": 0, "parallelism": 0 }, "notifier": { "poll_interval_ms": 0 } }"#,
        )
        .unwrap();

        assert_eq!(config.engine.queue.batch_size, 1);
        assert_eq!(config.engine.queue.parallelism, 1);
        assert_eq!(config.engine.notifier.poll_interval, Duration::from_secs(2));
    }

    #[test]
    fn backend_names_parse() {
        assert_eq!(StorageBackend::parse("memory"), Some(StorageBackend::Memory));
        assert_eq!(
            StorageBackend::parse(" Mongo-Couch "),
            Some(StorageBackend::MongoCouch)
        );
        assert_eq!(StorageBackend::parse("sqlite"), None);
    }
}
