//! Configuration for the sync engine.

use std::time::Duration;

/// Tunables for the sync engine and its remote store.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum number of limbo documents resolved at once.
    pub max_concurrent_limbo_resolutions: usize,
    /// Maximum number of mutation batches in flight on the write stream.
    pub max_pending_writes: usize,
    /// How long an open stream may stay idle before it is closed.
    pub idle_timeout: Duration,
    /// How long the watch stream may take to connect before the client is
    /// considered offline.
    pub online_state_timeout: Duration,
    /// Resume tokens older than this are persisted even without changes.
    pub resume_token_max_age: Duration,
    /// Delay between persistence health probes after a failure.
    pub persistence_probe_interval: Duration,
    /// Stream reconnection backoff.
    pub backoff: BackoffConfig,
}

impl EngineConfig {
    /// Creates a configuration with the default limits.
    pub fn new() -> Self {
        Self {
            max_concurrent_limbo_resolutions: 100,
            max_pending_writes: 10,
            idle_timeout: Duration::from_secs(60),
            online_state_timeout: Duration::from_secs(10),
            resume_token_max_age: Duration::from_secs(5 * 60),
            persistence_probe_interval: Duration::from_secs(1),
            backoff: BackoffConfig::default(),
        }
    }

    /// Sets the limbo resolution cap.
    pub fn with_max_concurrent_limbo_resolutions(mut self, max: usize) -> Self {
        self.max_concurrent_limbo_resolutions = max;
        self
    }

    /// Sets the write pipeline depth.
    pub fn with_max_pending_writes(mut self, max: usize) -> Self {
        self.max_pending_writes = max;
        self
    }

    /// Sets the stream idle timeout.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Sets the watch connect timeout.
    pub fn with_online_state_timeout(mut self, timeout: Duration) -> Self {
        self.online_state_timeout = timeout;
        self
    }

    /// Sets the resume token persistence age.
    pub fn with_resume_token_max_age(mut self, age: Duration) -> Self {
        self.resume_token_max_age = age;
        self
    }

    /// Sets the persistence probe interval.
    pub fn with_persistence_probe_interval(mut self, interval: Duration) -> Self {
        self.persistence_probe_interval = interval;
        self
    }

    /// Sets the backoff configuration.
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Exponential backoff parameters for stream reconnection.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay after the first failure.
    pub initial_delay: Duration,
    /// Multiplier applied after each attempt.
    pub backoff_factor: f64,
    /// Upper bound on the base delay.
    pub max_delay: Duration,
    /// Jitter as a fraction of the base delay; 0.5 means ±50 %.
    pub jitter_factor: f64,
}

impl BackoffConfig {
    /// Creates the default backoff: 1 s growing by 1.5x up to 60 s.
    pub fn new() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            backoff_factor: 1.5,
            max_delay: Duration::from_secs(60),
            jitter_factor: 0.5,
        }
    }

    /// Backoff without jitter, for deterministic schedules.
    pub fn without_jitter() -> Self {
        Self::new().with_jitter_factor(0.0)
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the multiplier.
    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the jitter fraction.
    pub fn with_jitter_factor(mut self, jitter: f64) -> Self {
        self.jitter_factor = jitter;
        self
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_config_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_concurrent_limbo_resolutions, 100);
        assert_eq!(config.max_pending_writes, 10);
        assert_eq!(config.idle_timeout, Duration::from_secs(60));
        assert_eq!(config.online_state_timeout, Duration::from_secs(10));
        assert_eq!(config.resume_token_max_age, Duration::from_secs(300));
    }

    #[test]
    fn engine_config_builder() {
        let config = EngineConfig::new()
            .with_max_concurrent_limbo_resolutions(2)
            .with_max_pending_writes(3)
            .with_idle_timeout(Duration::from_secs(5))
            .with_backoff(BackoffConfig::without_jitter());

        assert_eq!(config.max_concurrent_limbo_resolutions, 2);
        assert_eq!(config.max_pending_writes, 3);
        assert_eq!(config.idle_timeout, Duration::from_secs(5));
        assert_eq!(config.backoff.jitter_factor, 0.0);
    }

    #[test]
    fn backoff_config_builder() {
        let backoff = BackoffConfig::new()
            .with_initial_delay(Duration::from_millis(10))
            .with_max_delay(Duration::from_millis(100))
            .with_backoff_factor(2.0);
        assert_eq!(backoff.initial_delay, Duration::from_millis(10));
        assert_eq!(backoff.max_delay, Duration::from_millis(100));
        assert_eq!(backoff.backoff_factor, 2.0);
        assert_eq!(backoff.jitter_factor, 0.5);
    }
}
