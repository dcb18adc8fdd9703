//! Configuration management for Workhorse.
//!
//! Configuration can be built in code, loaded from TOML, or read from
//! `WORKHORSE_*` environment variables layered over either. Durations are
//! written in a human-readable form (`"500ms"`, `"30s"`, `"5m"`, `"1h"`).

use crate::{
    WorkhorseError,
    job::{DEFAULT_QUEUE, DEFAULT_RESULT_TTL, DEFAULT_TIMEOUT, ResultTtl},
    metrics::MetricsConfig,
};
use serde::{Deserialize, Serialize};
use std::{path::Path, time::Duration};

/// Module for serializing std::time::Duration as human-readable strings
pub mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn format_duration(duration: &Duration) -> String {
        if duration.subsec_nanos() != 0 {
            return format!("{}ms", duration.as_millis());
        }
        let secs = duration.as_secs();
        if secs == 0 {
            "0s".to_string()
        } else if secs % 86400 == 0 {
            format!("{}d", secs / 86400)
        } else if secs % 3600 == 0 {
            format!("{}h", secs / 3600)
        } else if secs % 60 == 0 {
            format!("{}m", secs / 60)
        } else {
            format!("{}s", secs)
        }
    }

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format_duration(duration))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;

        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(D::Error::custom)
    }

    /// Parse a duration string like "250ms", "30s", "5m", "1h", "90", etc.
    pub fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();

        // Handle just numbers (assume seconds)
        if let Ok(secs) = s.parse::<u64>() {
            return Ok(Duration::from_secs(secs));
        }

        if let Some(millis) = s.strip_suffix("ms") {
            return millis
                .parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|_| format!("Invalid number in duration: {}", millis));
        }

        for (suffix, factor) in [("s", 1u64), ("m", 60), ("h", 3600), ("d", 86400)] {
            if let Some(num_str) = s.strip_suffix(suffix) {
                let num: u64 = num_str
                    .parse()
                    .map_err(|_| format!("Invalid number in duration: {}", num_str))?;
                return num
                    .checked_mul(factor)
                    .map(Duration::from_secs)
                    .ok_or_else(|| format!("Duration out of range: {}", s));
            }
        }

        Err(format!(
            "Invalid duration format: {}. Use ms, s, m, h, or d",
            s
        ))
    }
}

/// Result retention as either `"forever"` or a duration string.
mod result_ttl {
    use super::duration_secs::{format_duration, parse_duration};
    use crate::job::ResultTtl;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(ttl: &ResultTtl, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match ttl {
            ResultTtl::Forever => serializer.serialize_str("forever"),
            ResultTtl::For(duration) => serializer.serialize_str(&format_duration(duration)),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<ResultTtl, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;

        let s = String::deserialize(deserializer)?;
        if s.trim().eq_ignore_ascii_case("forever") {
            return Ok(ResultTtl::Forever);
        }
        parse_duration(&s).map(ResultTtl::For).map_err(D::Error::custom)
    }
}

/// Main configuration for Workhorse.
///
/// # Examples
///
/// ```rust
/// use workhorse::config::{StoreBackend, WorkhorseConfig};
///
/// let config = WorkhorseConfig::new()
///     .with_redis_url("redis://127.0.0.1:6379")
///     .with_worker_pool_size(4)
///     .with_job_timeout(std::time::Duration::from_secs(60));
/// assert_eq!(config.store.backend, StoreBackend::Redis);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct WorkhorseConfig {
    pub store: StoreConfig,
    pub queue: QueueConfig,
    pub worker: WorkerConfig,
    pub scheduler: SchedulerConfig,
    pub logging: LoggingConfig,
    pub metrics: MetricsSettings,
}

impl WorkhorseConfig {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Use the Redis backend at `url`
    pub fn with_redis_url(mut self, url: &str) -> Self {
        self.store.backend = StoreBackend::Redis;
        self.store.url = url.to_string();
        self
    }

    pub fn with_key_prefix(mut self, prefix: &str) -> Self {
        self.store.key_prefix = prefix.to_string();
        self
    }

    pub fn with_worker_pool_size(mut self, size: usize) -> Self {
        self.worker.pool_size = size;
        self
    }

    /// Set the default job timeout
    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.queue.default_timeout = timeout;
        self
    }

    pub fn with_result_ttl(mut self, result_ttl: ResultTtl) -> Self {
        self.queue.default_result_ttl = result_ttl;
        self
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> crate::Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Load configuration from environment variables over the defaults
    pub fn from_env() -> crate::Result<Self> {
        Self::default().with_env_overrides()
    }

    /// Apply `WORKHORSE_*` environment variables on top of this configuration.
    /// Unparseable numbers keep the current value; malformed durations are
    /// errors.
    pub fn with_env_overrides(mut self) -> crate::Result<Self> {
        let var = |name: &str| std::env::var(name).ok();
        let duration = |name: &str, value: String| {
            duration_secs::parse_duration(&value)
                .map_err(|e| WorkhorseError::Config(format!("{}: {}", name, e)))
        };

        // Store configuration
        if let Some(backend) = var("WORKHORSE_STORE_BACKEND") {
            self.store.backend = match backend.to_ascii_lowercase().as_str() {
                "memory" => StoreBackend::Memory,
                "redis" => StoreBackend::Redis,
                other => {
                    return Err(WorkhorseError::Config(format!(
                        "WORKHORSE_STORE_BACKEND: unknown backend {}",
                        other
                    )));
                }
            };
        }
        if let Some(url) = var("WORKHORSE_REDIS_URL") {
            self.store.url = url;
        }
        if let Some(prefix) = var("WORKHORSE_KEY_PREFIX") {
            self.store.key_prefix = prefix;
        }

        // Queue configuration
        if let Some(name) = var("WORKHORSE_DEFAULT_QUEUE") {
            self.queue.default_queue = name;
        }
        if let Some(queues) = var("WORKHORSE_QUEUES") {
            self.queue.queues = queues
                .split(',')
                .map(str::trim)
                .filter(|q| !q.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(timeout) = var("WORKHORSE_JOB_TIMEOUT") {
            self.queue.default_timeout = duration("WORKHORSE_JOB_TIMEOUT", timeout)?;
        }
        if let Some(is_async) = var("WORKHORSE_IS_ASYNC") {
            self.queue.is_async = !matches!(is_async.as_str(), "0" | "false" | "no");
        }

        // Worker configuration
        if let Some(pool_size) = var("WORKHORSE_WORKER_POOL_SIZE") {
            self.worker.pool_size = pool_size.parse().unwrap_or(self.worker.pool_size);
        }
        if let Some(timeout) = var("WORKHORSE_POLL_TIMEOUT") {
            self.worker.poll_timeout = duration("WORKHORSE_POLL_TIMEOUT", timeout)?;
        }

        // Scheduler configuration
        if let Some(interval) = var("WORKHORSE_SCHEDULER_INTERVAL") {
            self.scheduler.interval = duration("WORKHORSE_SCHEDULER_INTERVAL", interval)?;
        }

        // Logging configuration
        if let Some(level) = var("WORKHORSE_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(json) = var("WORKHORSE_LOG_JSON") {
            self.logging.json_format = matches!(json.as_str(), "1" | "true" | "yes");
        }

        self.validate()?;
        Ok(self)
    }

    /// Reject settings the worker and scheduler loops cannot run with.
    pub fn validate(&self) -> crate::Result<()> {
        let positive = [
            ("worker.poll_timeout", self.worker.poll_timeout),
            ("worker.heartbeat_interval", self.worker.heartbeat_interval),
            ("worker.lease_duration", self.worker.lease_duration),
            ("worker.maintenance_interval", self.worker.maintenance_interval),
            ("scheduler.interval", self.scheduler.interval),
        ];
        for (name, value) in positive {
            if value.is_zero() {
                return Err(WorkhorseError::Config(format!(
                    "{} must be greater than zero",
                    name
                )));
            }
        }
        Ok(())
    }

    /// Create a configuration for development use
    pub fn development() -> Self {
        Self {
            store: StoreConfig {
                key_prefix: "workhorse-dev".to_string(),
                ..Default::default()
            },
            worker: WorkerConfig {
                pool_size: 2,
                poll_timeout: Duration::from_secs(1),
                maintenance_interval: Duration::from_secs(10),
                ..Default::default()
            },
            scheduler: SchedulerConfig {
                interval: Duration::from_secs(5),
                ..Default::default()
            },
            logging: LoggingConfig {
                level: "debug".to_string(),
                include_location: true,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Create a configuration for production use
    pub fn production() -> Self {
        Self {
            store: StoreConfig {
                backend: StoreBackend::Redis,
                ..Default::default()
            },
            worker: WorkerConfig {
                pool_size: 8,
                ..Default::default()
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                json_format: true,
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Redis,
}

/// Store configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,

    /// Redis connection URL, used by the redis backend
    pub url: String,

    /// Namespace for every persisted key
    pub key_prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "workhorse".to_string(),
        }
    }
}

/// Queue defaults
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueueConfig {
    /// Queue for jobs submitted without one
    pub default_queue: String,

    /// Queues a worker listens on, in priority order
    pub queues: Vec<String>,

    /// Timeout for jobs that do not set their own
    #[serde(with = "duration_secs")]
    pub default_timeout: Duration,

    /// How long finished and failed job records are kept
    #[serde(with = "result_ttl")]
    pub default_result_ttl: ResultTtl,

    /// When false, submitted jobs run in the submitting process before
    /// `submit_job` returns. Meant for tests and local development.
    pub is_async: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_queue: DEFAULT_QUEUE.to_string(),
            queues: vec![DEFAULT_QUEUE.to_string()],
            default_timeout: DEFAULT_TIMEOUT,
            default_result_ttl: ResultTtl::For(DEFAULT_RESULT_TTL),
            is_async: true,
        }
    }
}

/// Worker configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkerConfig {
    /// Number of workers in the pool
    pub pool_size: usize,

    /// How long a blocking dequeue waits before re-checking for shutdown
    #[serde(with = "duration_secs")]
    pub poll_timeout: Duration,

    #[serde(with = "duration_secs")]
    pub heartbeat_interval: Duration,

    /// How long a lease outlives its last heartbeat
    #[serde(with = "duration_secs")]
    pub lease_duration: Duration,

    #[serde(with = "duration_secs")]
    pub maintenance_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            pool_size: 1,
            poll_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(10),
            lease_duration: Duration::from_secs(60),
            maintenance_interval: Duration::from_secs(60),
        }
    }
}

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Queue for scheduled jobs submitted without one
    pub queue: String,

    /// How often due entries are promoted
    #[serde(with = "duration_secs")]
    pub interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            queue: DEFAULT_QUEUE.to_string(),
            interval: Duration::from_secs(60),
        }
    }
}

/// Logging and tracing configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level or filter directive (trace, debug, info, warn, error)
    pub level: String,

    /// Whether to enable structured JSON logging
    pub json_format: bool,

    /// Whether to include file and line information
    pub include_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            include_location: false,
        }
    }
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MetricsSettings {
    pub enabled: bool,
    pub namespace: String,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            namespace: "workhorse".to_string(),
        }
    }
}

impl MetricsSettings {
    pub fn to_metrics_config(&self) -> MetricsConfig {
        MetricsConfig::new().with_namespace(&self.namespace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_config_creation() {
        let config = WorkhorseConfig::new()
            .with_redis_url("redis://cache:6379/2")
            .with_worker_pool_size(8)
            .with_job_timeout(Duration::from_secs(600));

        assert_eq!(config.store.backend, StoreBackend::Redis);
        assert_eq!(config.store.url, "redis://cache:6379/2");
        assert_eq!(config.worker.pool_size, 8);
        assert_eq!(config.queue.default_timeout, Duration::from_secs(600));
    }

    #[test]
    fn test_defaults() {
        let config = WorkhorseConfig::default();
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.store.key_prefix, "workhorse");
        assert_eq!(config.queue.default_queue, "default");
        assert_eq!(config.queue.default_timeout, Duration::from_secs(180));
        assert_eq!(config.queue.default_result_ttl, ResultTtl::For(Duration::from_secs(500)));
        assert_eq!(config.scheduler.interval, Duration::from_secs(60));
        assert!(config.metrics.enabled);
    }

    #[test]
    fn test_development_config() {
        let config = WorkhorseConfig::development();
        assert_eq!(config.worker.pool_size, 2);
        assert_eq!(config.scheduler.interval, Duration::from_secs(5));
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_production_config() {
        let config = WorkhorseConfig::production();
        assert_eq!(config.store.backend, StoreBackend::Redis);
        assert_eq!(config.worker.pool_size, 8);
        assert!(config.logging.json_format);
    }

    #[test]
    fn test_config_file_operations() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("workhorse.toml");

        let mut config = WorkhorseConfig::new()
            .with_redis_url("redis://localhost:6380")
            .with_worker_pool_size(6)
            .with_result_ttl(ResultTtl::Forever);
        config.queue.queues = vec!["high".to_string(), "default".to_string()];
        config.worker.poll_timeout = Duration::from_millis(250);

        config.save_to_file(&config_path).unwrap();
        let loaded = WorkhorseConfig::from_file(&config_path).unwrap();
        assert_eq!(loaded, config);

        let content = std::fs::read_to_string(&config_path).unwrap();
        assert!(content.contains("default_result_ttl = \"forever\""));
        assert!(content.contains("poll_timeout = \"250ms\""));
        assert!(content.contains("default_timeout = \"3m\""));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: WorkhorseConfig = toml::from_str(
            r#"
[store]
backend = "redis"

[scheduler]
interval = "15s"
"#,
        )
        .unwrap();
        assert_eq!(config.store.backend, StoreBackend::Redis);
        assert_eq!(config.store.url, "redis://127.0.0.1:6379");
        assert_eq!(config.scheduler.interval, Duration::from_secs(15));
        assert_eq!(config.worker, WorkerConfig::default());
    }

    #[test]
    fn test_env_config() {
        unsafe {
            std::env::set_var("WORKHORSE_STORE_BACKEND", "redis");
            std::env::set_var("WORKHORSE_REDIS_URL", "redis://env:6379");
            std::env::set_var("WORKHORSE_WORKER_POOL_SIZE", "12");
            std::env::set_var("WORKHORSE_JOB_TIMEOUT", "15m");
            std::env::set_var("WORKHORSE_QUEUES", "high, default ,low");
        }

        let config = WorkhorseConfig::from_env().unwrap();

        assert_eq!(config.store.backend, StoreBackend::Redis);
        assert_eq!(config.store.url, "redis://env:6379");
        assert_eq!(config.worker.pool_size, 12);
        assert_eq!(config.queue.default_timeout, Duration::from_secs(900));
        assert_eq!(config.queue.queues, vec!["high", "default", "low"]);

        // Clean up
        unsafe {
            std::env::remove_var("WORKHORSE_STORE_BACKEND");
            std::env::remove_var("WORKHORSE_REDIS_URL");
            std::env::remove_var("WORKHORSE_WORKER_POOL_SIZE");
            std::env::remove_var("WORKHORSE_JOB_TIMEOUT");
            std::env::remove_var("WORKHORSE_QUEUES");
        }
    }

    #[test]
    fn test_duration_parsing() {
        let test_durations = [
            ("30", Duration::from_secs(30)),
            ("30s", Duration::from_secs(30)),
            ("250ms", Duration::from_millis(250)),
            ("5m", Duration::from_secs(300)),
            ("2h", Duration::from_secs(7200)),
            ("1d", Duration::from_secs(86400)),
        ];

        for (duration_str, expected) in test_durations.iter() {
            assert_eq!(
                duration_secs::parse_duration(duration_str).unwrap(),
                *expected,
                "Failed to parse duration: {}",
                duration_str
            );
        }
        assert!(duration_secs::parse_duration("5x").is_err());
        assert!(duration_secs::parse_duration("m").is_err());
        assert!(duration_secs::parse_duration("5µ").is_err());
        assert!(duration_secs::parse_duration("µs").is_err());
        assert!(duration_secs::parse_duration("").is_err());
    }

    #[test]
    fn test_zero_intervals_are_rejected() {
        assert!(WorkhorseConfig::default().validate().is_ok());

        for section in [
            "[scheduler]\ninterval = \"0s\"",
            "[worker]\nheartbeat_interval = \"0s\"",
            "[worker]\npoll_timeout = \"0ms\"",
            "[worker]\nmaintenance_interval = \"0\"",
        ] {
            let config: WorkhorseConfig = toml::from_str(section).unwrap();
            assert!(
                matches!(config.validate(), Err(WorkhorseError::Config(_))),
                "accepted {}",
                section
            );
        }

        let dir = tempdir().unwrap();
        let path = dir.path().join("workhorse.toml");
        std::fs::write(&path, "[scheduler]\ninterval = \"0s\"\n").unwrap();
        assert!(matches!(
            WorkhorseConfig::from_file(&path),
            Err(WorkhorseError::Config(_))
        ));
    }

    #[test]
    fn test_is_async_defaults_on() {
        assert!(WorkhorseConfig::default().queue.is_async);
        let config: WorkhorseConfig = toml::from_str("[queue]\nis_async = false").unwrap();
        assert!(!config.queue.is_async);
    }
}
