//! Configuration for the sync engine.

use docsync_core::{LocalStoreConfig, QueryEngineConfig};
use std::time::Duration;

/// Configuration for exponential backoff between reconnect attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Multiplier applied after each retry.
    pub backoff_factor: f64,
    /// Upper bound on the delay.
    pub max_delay: Duration,
    /// Fraction of the delay added or subtracted at random.
    pub jitter_factor: f64,
}

impl BackoffConfig {
    /// Creates a configuration with the default delays.
    pub fn new() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            backoff_factor: 1.5,
            max_delay: Duration::from_secs(60),
            jitter_factor: 0.5,
        }
    }

    /// Creates a configuration without jitter, for deterministic tests.
    pub fn no_jitter() -> Self {
        Self {
            jitter_factor: 0.0,
            ..Self::new()
        }
    }

    /// Sets the initial delay.
    #[must_use]
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the backoff factor.
    #[must_use]
    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the jitter factor.
    #[must_use]
    pub fn with_jitter_factor(mut self, factor: f64) -> Self {
        self.jitter_factor = factor;
        self
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Timers of the listen and write streams.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    /// How long an idle stream stays open.
    pub idle_timeout: Duration,
    /// How long a stream must stay open before it counts as healthy and
    /// its backoff resets.
    pub health_check_timeout: Duration,
}

impl StreamConfig {
    /// Creates a configuration with the default timers.
    pub fn new() -> Self {
        Self {
            idle_timeout: Duration::from_secs(10),
            health_check_timeout: Duration::from_secs(60),
        }
    }

    /// Sets the idle timeout.
    #[must_use]
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Sets the health check timeout.
    #[must_use]
    pub fn with_health_check_timeout(mut self, timeout: Duration) -> Self {
        self.health_check_timeout = timeout;
        self
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// How quickly the client decides it is offline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnlineStateConfig {
    /// How long the client may go without a response, across failed
    /// connection attempts, before it reports offline.
    pub online_grace_period: Duration,
}

impl OnlineStateConfig {
    /// Creates a configuration with the default thresholds.
    pub fn new() -> Self {
        Self {
            online_grace_period: Duration::from_secs(10),
        }
    }

    /// Sets the grace period.
    #[must_use]
    pub fn with_online_grace_period(mut self, period: Duration) -> Self {
        self.online_grace_period = period;
        self
    }
}

impl Default for OnlineStateConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for the whole engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Local store settings.
    pub local_store: LocalStoreConfig,
    /// Reconnect backoff.
    pub backoff: BackoffConfig,
    /// Stream timers.
    pub stream: StreamConfig,
    /// Offline detection.
    pub online_state: OnlineStateConfig,
    /// Limbo documents resolved at the same time.
    pub max_concurrent_limbo_resolutions: usize,
    /// Mutation batches in flight on the write stream.
    pub max_pending_writes: usize,
    /// Attempts a transaction gets before its error is returned.
    pub max_transaction_attempts: u32,
    /// Whether to use the durable store at all.
    pub persistence_enabled: bool,
}

impl EngineConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self {
            local_store: LocalStoreConfig::default(),
            backoff: BackoffConfig::default(),
            stream: StreamConfig::default(),
            online_state: OnlineStateConfig::default(),
            max_concurrent_limbo_resolutions: 100,
            max_pending_writes: 10,
            max_transaction_attempts: 5,
            persistence_enabled: true,
        }
    }

    /// Sets the backoff configuration.
    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Sets the stream configuration.
    #[must_use]
    pub fn with_stream(mut self, stream: StreamConfig) -> Self {
        self.stream = stream;
        self
    }

    /// Sets the offline detection configuration.
    #[must_use]
    pub fn with_online_state(mut self, online_state: OnlineStateConfig) -> Self {
        self.online_state = online_state;
        self
    }

    /// Sets the query engine configuration.
    #[must_use]
    pub fn with_query_engine(mut self, query_engine: QueryEngineConfig) -> Self {
        self.local_store.query_engine = query_engine;
        self
    }

    /// Sets how long resume tokens may stay unpersisted.
    #[must_use]
    pub fn with_resume_token_max_age(mut self, age: Duration) -> Self {
        self.local_store.resume_token_max_age = age;
        self
    }

    /// Sets the limbo resolution limit.
    #[must_use]
    pub fn with_max_concurrent_limbo_resolutions(mut self, max: usize) -> Self {
        self.max_concurrent_limbo_resolutions = max;
        self
    }

    /// Sets the transaction attempt limit.
    #[must_use]
    pub fn with_max_transaction_attempts(mut self, attempts: u32) -> Self {
        self.max_transaction_attempts = attempts;
        self
    }

    /// Enables or disables the durable store.
    #[must_use]
    pub fn with_persistence(mut self, enabled: bool) -> Self {
        self.persistence_enabled = enabled;
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.backoff.initial_delay, Duration::from_secs(1));
        assert_eq!(config.backoff.max_delay, Duration::from_secs(60));
        assert_eq!(config.stream.idle_timeout, Duration::from_secs(10));
        assert_eq!(config.online_state.online_grace_period, Duration::from_secs(10));
        assert_eq!(config.stream.health_check_timeout, Duration::from_secs(60));
        assert_eq!(config.max_concurrent_limbo_resolutions, 100);
        assert_eq!(config.max_transaction_attempts, 5);
        assert_eq!(config.local_store.resume_token_max_age, Duration::from_millis(300));
        assert!(config.persistence_enabled);
    }

    #[test]
    fn engine_config_builder() {
        let config = EngineConfig::new()
            .with_backoff(BackoffConfig::no_jitter())
            .with_max_concurrent_limbo_resolutions(2)
            .with_persistence(false);
        assert_eq!(config.backoff.jitter_factor, 0.0);
        assert_eq!(config.max_concurrent_limbo_resolutions, 2);
        assert!(!config.persistence_enabled);
    }
}
