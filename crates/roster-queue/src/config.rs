//! Queue configuration.

use std::time::Duration;

/// Configuration for an [`crate::InMemoryQueue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// How long a received message stays hidden before redelivery.
    pub visibility_timeout: Duration,

    /// How long an unacknowledged message is kept before it is dropped.
    pub retention: Duration,

    /// Receives after which an unacknowledged message moves to the
    /// dead-letter list. `None` redelivers forever (until retention expires).
    pub max_receive_count: Option<u32>,

    /// Maximum number of retained messages. `None` is unbounded.
    pub capacity: Option<usize>,

    /// Upper bound on messages handed out by a single receive.
    pub max_batch: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(30),
            retention: Duration::from_secs(14 * 24 * 60 * 60), // 14 days
            max_receive_count: None,
            capacity: None,
            max_batch: 10,
        }
    }
}

impl QueueConfig {
    /// Creates a configuration builder.
    #[must_use]
    pub fn builder() -> QueueConfigBuilder {
        QueueConfigBuilder::default()
    }
}

/// Builder for [`QueueConfig`].
#[derive(Debug, Default)]
pub struct QueueConfigBuilder {
    visibility_timeout: Option<Duration>,
    retention: Option<Duration>,
    max_receive_count: Option<u32>,
    capacity: Option<usize>,
    max_batch: Option<usize>,
}

impl QueueConfigBuilder {
    /// Sets the visibility timeout.
    #[must_use]
    pub const fn visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = Some(timeout);
        self
    }

    /// Sets the retention window.
    #[must_use]
    pub const fn retention(mut self, retention: Duration) -> Self {
        self.retention = Some(retention);
        self
    }

    /// Enables redrive after `count` receives.
    #[must_use]
    pub const fn max_receive_count(mut self, count: u32) -> Self {
        self.max_receive_count = Some(count);
        self
    }

    /// Bounds the number of retained messages.
    #[must_use]
    pub const fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Sets the per-receive batch limit.
    #[must_use]
    pub const fn max_batch(mut self, max_batch: usize) -> Self {
        self.max_batch = Some(max_batch);
        self
    }

    /// Builds the configuration.
    #[must_use]
    pub fn build(self) -> QueueConfig {
        let defaults = QueueConfig::default();
        QueueConfig {
            visibility_timeout: self
                .visibility_timeout
                .unwrap_or(defaults.visibility_timeout),
            retention: self.retention.unwrap_or(defaults.retention),
            max_receive_count: self.max_receive_count.or(defaults.max_receive_count),
            capacity: self.capacity.or(defaults.capacity),
            max_batch: self.max_batch.unwrap_or(defaults.max_batch),
        }
    }
}
