//! Configuration for the engine.

use std::time::Duration;

/// Network condition required before a sync run may start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NetworkThreshold {
    /// Any online connection is good enough.
    #[default]
    Any,
    /// Only sync on wifi (metered links carry nothing).
    WifiOnly,
    /// Only sync when link quality is good.
    GoodConnectionOnly,
}

/// Configuration for the engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Interval between automatic sync runs.
    pub sync_interval: Duration,
    /// Queue items uploaded per batch.
    pub batch_size: usize,
    /// Delivery attempts before a mutation is dropped terminally.
    pub max_retries: u32,
    /// Base delay for queue retry backoff (`base * 2^retry_count`).
    pub retry_base: Duration,
    /// Cap on the queue retry delay.
    pub retry_max_delay: Duration,
    /// Base delay for realtime reconnect backoff (`base * attempt`).
    pub reconnect_base: Duration,
    /// Reconnect attempts before the subscription goes terminally down.
    pub reconnect_max_attempts: u32,
    /// Cap on the reconnect delay.
    pub reconnect_max_delay: Duration,
    /// Network condition gating sync runs.
    pub network_threshold: NetworkThreshold,
    /// Capacity of each per-collection replay buffer.
    pub buffer_capacity: usize,
    /// Interval between liveness events while a subscription is connected.
    pub heartbeat_interval: Duration,
}

impl EngineConfig {
    /// Creates a configuration with the documented defaults.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sync_interval: Duration::from_secs(30),
            batch_size: 10,
            max_retries: 3,
            retry_base: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(60),
            reconnect_base: Duration::from_secs(1),
            reconnect_max_attempts: 6,
            reconnect_max_delay: Duration::from_secs(30),
            network_threshold: NetworkThreshold::Any,
            buffer_capacity: 1000,
            heartbeat_interval: Duration::from_secs(20),
        }
    }

    /// Sets the automatic sync interval.
    #[must_use]
    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    /// Sets the upload batch size.
    #[must_use]
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Sets the retry limit for queued mutations.
    #[must_use]
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Sets the queue retry backoff base.
    #[must_use]
    pub fn with_retry_base(mut self, base: Duration) -> Self {
        self.retry_base = base;
        self
    }

    /// Sets the reconnect backoff base and attempt limit.
    #[must_use]
    pub fn with_reconnect(mut self, base: Duration, max_attempts: u32) -> Self {
        self.reconnect_base = base;
        self.reconnect_max_attempts = max_attempts;
        self
    }

    /// Sets the network threshold gating sync runs.
    #[must_use]
    pub fn with_network_threshold(mut self, threshold: NetworkThreshold) -> Self {
        self.network_threshold = threshold;
        self
    }

    /// Sets the replay buffer capacity.
    #[must_use]
    pub fn with_buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity;
        self
    }

    /// Sets the heartbeat interval.
    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Queue retry delay for a given retry count: `base * 2^retry_count`,
    /// capped at `retry_max_delay`.
    #[must_use]
    pub fn retry_delay(&self, retry_count: u32) -> Duration {
        let factor = 1u64 << retry_count.min(20);
        let delay = self.retry_base.saturating_mul(factor as u32);
        delay.min(self.retry_max_delay)
    }

    /// Reconnect delay for a given attempt: `base * attempt`, capped at
    /// `reconnect_max_delay`.
    #[must_use]
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let delay = self.reconnect_base.saturating_mul(attempt.max(1));
        delay.min(self.reconnect_max_delay)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}
