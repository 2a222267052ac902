//! Service configuration.
//!
//! Every section has a `Default` and a builder. The whole tree can be read
//! from YAML, with durations written in milliseconds:
//!
//! ```yaml
//! http:
//!   bind: 0.0.0.0:8080
//! emitter:
//!   sendTimeoutMs: 500
//!   retry:
//!     maxAttempts: 5
//! writer:
//!   workers: 2
//!   batchSize: 10
//! queue:
//!   visibilityTimeoutMs: 30000
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use roster_core::AttributeLimits;
use roster_queue::QueueConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::RetryPolicy;

/// Largest batch a single receive may request.
pub const MAX_RECEIVE_BATCH: usize = 10;

/// Errors raised while loading or checking configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path being read.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid YAML for this schema.
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// The dead-letter file could not be opened.
    #[error(transparent)]
    DeadLetterSink(#[from] roster_audit::DeadLetterError),

    /// A value is out of range.
    #[error("invalid config value for '{field}': {message}")]
    Invalid {
        /// Offending field path.
        field: &'static str,
        /// What is wrong.
        message: String,
    },
}

/// Serde adapter for durations expressed as whole milliseconds.
pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RosterConfig {
    /// HTTP listener.
    pub http: HttpConfig,

    /// Audit emission on the request path.
    pub emitter: EmitterConfig,

    /// Audit writer workers.
    pub writer: WriterConfig,

    /// Audit event queue.
    #[serde(with = "queue_section")]
    pub queue: QueueConfig,

    /// Request limits.
    pub limits: ServiceLimits,

    /// Retry budget for record store writes.
    pub record_retry: RetryPolicy,
}

impl RosterConfig {
    /// Loads configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    /// Parses configuration from a YAML document.
    ///
    /// # Errors
    ///
    /// Returns an error if the document does not match the schema.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Renders the configuration as YAML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Checks cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field, message: &str| {
            Err(ConfigError::Invalid {
                field,
                message: message.to_string(),
            })
        };

        if self.writer.workers == 0 {
            return invalid("writer.workers", "must be at least 1");
        }
        if self.writer.batch_size == 0 || self.writer.batch_size > MAX_RECEIVE_BATCH {
            return invalid("writer.batchSize", "must be between 1 and 10");
        }
        if self.queue.max_batch == 0 || self.queue.max_batch > MAX_RECEIVE_BATCH {
            return invalid("queue.maxBatch", "must be between 1 and 10");
        }
        if self.emitter.retry.max_attempts == 0 {
            return invalid("emitter.retry.maxAttempts", "must be at least 1");
        }
        if self.writer.store_retry.max_attempts == 0 {
            return invalid("writer.storeRetry.maxAttempts", "must be at least 1");
        }
        if self.record_retry.max_attempts == 0 {
            return invalid("recordRetry.maxAttempts", "must be at least 1");
        }
        if self.emitter.send_timeout.is_zero() {
            return invalid("emitter.sendTimeoutMs", "must be greater than zero");
        }
        if self.queue.visibility_timeout < self.writer.wait_time {
            return invalid(
                "queue.visibilityTimeoutMs",
                "must not be shorter than writer.waitTimeMs",
            );
        }
        if self.queue.max_receive_count == Some(0) {
            return invalid("queue.maxReceiveCount", "must be at least 1 when set");
        }
        if self.limits.max_bulk_delete == 0 {
            return invalid("limits.maxBulkDelete", "must be at least 1");
        }
        Ok(())
    }
}

/// HTTP listener settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HttpConfig {
    /// Listen address.
    pub bind: SocketAddr,

    /// How long shutdown waits for background emissions to finish.
    #[serde(rename = "shutdownGraceMs", with = "millis")]
    pub shutdown_grace: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8080)),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

impl HttpConfig {
    /// Creates a configuration builder.
    #[must_use]
    pub fn builder() -> HttpConfigBuilder {
        HttpConfigBuilder::default()
    }
}

/// Builder for [`HttpConfig`].
#[derive(Debug, Default)]
pub struct HttpConfigBuilder {
    bind: Option<SocketAddr>,
    shutdown_grace: Option<Duration>,
}

impl HttpConfigBuilder {
    /// Sets the listen address.
    #[must_use]
    pub const fn bind(mut self, bind: SocketAddr) -> Self {
        self.bind = Some(bind);
        self
    }

    /// Sets how long shutdown waits for pending emissions.
    #[must_use]
    pub const fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = Some(grace);
        self
    }

    /// Builds the configuration.
    #[must_use]
    pub fn build(self) -> HttpConfig {
        let defaults = HttpConfig::default();
        HttpConfig {
            bind: self.bind.unwrap_or(defaults.bind),
            shutdown_grace: self.shutdown_grace.unwrap_or(defaults.shutdown_grace),
        }
    }
}

/// Settings for enqueueing audit events from the request path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EmitterConfig {
    /// Upper bound on each enqueue attempt.
    #[serde(rename = "sendTimeoutMs", with = "millis")]
    pub send_timeout: Duration,

    /// Budget shared by the inline attempt and the background retries.
    pub retry: RetryPolicy,

    /// JSON-lines file receiving abandoned events, in addition to the log.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dead_letter_file: Option<PathBuf>,
}

impl Default for EmitterConfig {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_millis(500),
            retry: RetryPolicy::default(),
            dead_letter_file: None,
        }
    }
}

impl EmitterConfig {
    /// Creates a configuration builder.
    #[must_use]
    pub fn builder() -> EmitterConfigBuilder {
        EmitterConfigBuilder::default()
    }
}

/// Builder for [`EmitterConfig`].
#[derive(Debug, Default)]
pub struct EmitterConfigBuilder {
    send_timeout: Option<Duration>,
    retry: Option<RetryPolicy>,
    dead_letter_file: Option<PathBuf>,
}

impl EmitterConfigBuilder {
    /// Sets the per-attempt timeout.
    #[must_use]
    pub const fn send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = Some(timeout);
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Also writes dead letters to `path`.
    #[must_use]
    pub fn dead_letter_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.dead_letter_file = Some(path.into());
        self
    }

    /// Builds the configuration.
    #[must_use]
    pub fn build(self) -> EmitterConfig {
        let defaults = EmitterConfig::default();
        EmitterConfig {
            send_timeout: self.send_timeout.unwrap_or(defaults.send_timeout),
            retry: self.retry.unwrap_or(defaults.retry),
            dead_letter_file: self.dead_letter_file.or(defaults.dead_letter_file),
        }
    }
}

/// Audit writer settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WriterConfig {
    /// Independent consumer tasks.
    pub workers: usize,

    /// Messages requested per receive.
    pub batch_size: usize,

    /// Long-poll wait per receive.
    #[serde(rename = "waitTimeMs", with = "millis")]
    pub wait_time: Duration,

    /// Pause after a failed receive before polling again.
    #[serde(rename = "errorBackoffMs", with = "millis")]
    pub error_backoff: Duration,

    /// Inline retries for audit store writes.
    pub store_retry: RetryPolicy,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            batch_size: MAX_RECEIVE_BATCH,
            wait_time: Duration::from_secs(1),
            error_backoff: Duration::from_secs(1),
            store_retry: RetryPolicy {
                max_attempts: 3,
                initial_backoff: Duration::from_millis(50),
                multiplier: 2,
                max_backoff: Duration::from_secs(1),
            },
        }
    }
}

impl WriterConfig {
    /// Creates a configuration builder.
    #[must_use]
    pub fn builder() -> WriterConfigBuilder {
        WriterConfigBuilder::default()
    }
}

/// Builder for [`WriterConfig`].
#[derive(Debug, Default)]
pub struct WriterConfigBuilder {
    workers: Option<usize>,
    batch_size: Option<usize>,
    wait_time: Option<Duration>,
    error_backoff: Option<Duration>,
    store_retry: Option<RetryPolicy>,
}

impl WriterConfigBuilder {
    /// Sets the number of workers.
    #[must_use]
    pub const fn workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    /// Sets the receive batch size.
    #[must_use]
    pub const fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    /// Sets the long-poll wait.
    #[must_use]
    pub const fn wait_time(mut self, wait: Duration) -> Self {
        self.wait_time = Some(wait);
        self
    }

    /// Sets the pause after a failed receive.
    #[must_use]
    pub const fn error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = Some(backoff);
        self
    }

    /// Sets the store retry policy.
    #[must_use]
    pub fn store_retry(mut self, retry: RetryPolicy) -> Self {
        self.store_retry = Some(retry);
        self
    }

    /// Builds the configuration.
    #[must_use]
    pub fn build(self) -> WriterConfig {
        let defaults = WriterConfig::default();
        WriterConfig {
            workers: self.workers.unwrap_or(defaults.workers),
            batch_size: self.batch_size.unwrap_or(defaults.batch_size),
            wait_time: self.wait_time.unwrap_or(defaults.wait_time),
            error_backoff: self.error_backoff.unwrap_or(defaults.error_backoff),
            store_retry: self.store_retry.unwrap_or(defaults.store_retry),
        }
    }
}

/// Limits applied to incoming requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceLimits {
    /// Attribute map limits.
    pub attributes: AttributeLimits,

    /// Most ids accepted by one bulk delete.
    pub max_bulk_delete: usize,
}

impl Default for ServiceLimits {
    fn default() -> Self {
        Self {
            attributes: AttributeLimits::default(),
            max_bulk_delete: 25,
        }
    }
}

impl ServiceLimits {
    /// Creates a limits builder.
    #[must_use]
    pub fn builder() -> ServiceLimitsBuilder {
        ServiceLimitsBuilder::default()
    }
}

/// Builder for [`ServiceLimits`].
#[derive(Debug, Default)]
pub struct ServiceLimitsBuilder {
    attributes: Option<AttributeLimits>,
    max_bulk_delete: Option<usize>,
}

impl ServiceLimitsBuilder {
    /// Sets the attribute limits.
    #[must_use]
    pub const fn attributes(mut self, attributes: AttributeLimits) -> Self {
        self.attributes = Some(attributes);
        self
    }

    /// Sets the bulk delete ceiling.
    #[must_use]
    pub const fn max_bulk_delete(mut self, max: usize) -> Self {
        self.max_bulk_delete = Some(max);
        self
    }

    /// Builds the limits.
    #[must_use]
    pub fn build(self) -> ServiceLimits {
        let defaults = ServiceLimits::default();
        ServiceLimits {
            attributes: self.attributes.unwrap_or(defaults.attributes),
            max_bulk_delete: self.max_bulk_delete.unwrap_or(defaults.max_bulk_delete),
        }
    }
}

/// YAML shape of [`QueueConfig`], with millisecond durations.
mod queue_section {
    use std::time::Duration;

    use roster_queue::QueueConfig;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use super::millis;

    #[derive(Serialize, Deserialize)]
    #[serde(rename_all = "camelCase", default)]
    struct QueueSection {
        #[serde(rename = "visibilityTimeoutMs", with = "millis")]
        visibility_timeout: Duration,
        #[serde(rename = "retentionMs", with = "millis")]
        retention: Duration,
        #[serde(skip_serializing_if = "Option::is_none")]
        max_receive_count: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        capacity: Option<usize>,
        max_batch: usize,
    }

    impl Default for QueueSection {
        fn default() -> Self {
            Self::from(&QueueConfig::default())
        }
    }

    impl From<&QueueConfig> for QueueSection {
        fn from(config: &QueueConfig) -> Self {
            Self {
                visibility_timeout: config.visibility_timeout,
                retention: config.retention,
                max_receive_count: config.max_receive_count,
                capacity: config.capacity,
                max_batch: config.max_batch,
            }
        }
    }

    pub fn serialize<S: Serializer>(value: &QueueConfig, serializer: S) -> Result<S::Ok, S::Error> {
        QueueSection::from(value).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<QueueConfig, D::Error> {
        let section = QueueSection::deserialize(deserializer)?;
        Ok(QueueConfig {
            visibility_timeout: section.visibility_timeout,
            retention: section.retention,
            max_receive_count: section.max_receive_count,
            capacity: section.capacity,
            max_batch: section.max_batch,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = RosterConfig::default();
        config.validate().unwrap();
        assert_eq!(config.emitter.send_timeout, Duration::from_millis(500));
        assert_eq!(config.emitter.retry.max_attempts, 5);
        assert_eq!(config.writer.batch_size, 10);
        assert_eq!(config.limits.max_bulk_delete, 25);
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = RosterConfig::from_yaml(
            r"
http:
  bind: 0.0.0.0:9000
emitter:
  sendTimeoutMs: 250
  retry:
    maxAttempts: 7
writer:
  workers: 4
queue:
  visibilityTimeoutMs: 60000
  maxReceiveCount: 12
",
        )
        .unwrap();

        assert_eq!(config.http.bind.port(), 9000);
        assert_eq!(config.emitter.send_timeout, Duration::from_millis(250));
        assert_eq!(config.emitter.retry.max_attempts, 7);
        assert_eq!(
            config.emitter.retry.initial_backoff,
            Duration::from_millis(100)
        );
        assert_eq!(config.writer.workers, 4);
        assert_eq!(config.writer.batch_size, 10);
        assert_eq!(config.queue.visibility_timeout, Duration::from_secs(60));
        assert_eq!(config.queue.max_receive_count, Some(12));
        assert_eq!(config.queue.retention, QueueConfig::default().retention);
    }

    #[test]
    fn test_yaml_round_trip() {
        let config = RosterConfig::default();
        let yaml = config.to_yaml().unwrap();
        assert!(yaml.contains("sendTimeoutMs: 500"));
        assert_eq!(RosterConfig::from_yaml(&yaml).unwrap(), config);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "writer:\n  batchSize: 5").unwrap();

        let config = RosterConfig::from_file(file.path()).unwrap();
        assert_eq!(config.writer.batch_size, 5);
    }

    #[test]
    fn test_missing_file() {
        let err = RosterConfig::from_file("/nonexistent/roster.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let cases: [(fn(&mut RosterConfig), &str); 6] = [
            (|c| c.writer.workers = 0, "writer.workers"),
            (|c| c.writer.batch_size = 0, "writer.batchSize"),
            (|c| c.writer.batch_size = 11, "writer.batchSize"),
            (|c| c.emitter.retry.max_attempts = 0, "emitter.retry.maxAttempts"),
            (
                |c| c.queue.visibility_timeout = Duration::from_millis(10),
                "queue.visibilityTimeoutMs",
            ),
            (|c| c.limits.max_bulk_delete = 0, "limits.maxBulkDelete"),
        ];

        for (mutate, expected) in cases {
            let mut config = RosterConfig::default();
            mutate(&mut config);
            match config.validate() {
                Err(ConfigError::Invalid { field, .. }) => assert_eq!(field, expected),
                other => panic!("expected {expected} to be rejected, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_builders() {
        let writer = WriterConfig::builder()
            .workers(3)
            .wait_time(Duration::from_millis(200))
            .build();
        assert_eq!(writer.workers, 3);
        assert_eq!(writer.wait_time, Duration::from_millis(200));
        assert_eq!(writer.batch_size, 10);

        let emitter = EmitterConfig::builder()
            .send_timeout(Duration::from_millis(50))
            .retry(RetryPolicy::builder().max_attempts(2).build())
            .build();
        assert_eq!(emitter.send_timeout, Duration::from_millis(50));
        assert_eq!(emitter.retry.max_attempts, 2);

        let http = HttpConfig::builder()
            .bind(SocketAddr::from(([0, 0, 0, 0], 9090)))
            .build();
        assert_eq!(http.bind.port(), 9090);
        assert_eq!(http.shutdown_grace, Duration::from_secs(10));

        let limits = ServiceLimits::builder().max_bulk_delete(5).build();
        assert_eq!(limits.max_bulk_delete, 5);
        assert_eq!(limits.attributes, AttributeLimits::default());
    }
}
