//! Exponential backoff for stream reconnection.

use crate::config::BackoffConfig;
use crate::queue::{AsyncQueue, TimerId};
use rand::Rng;
use std::time::Duration;
use tracing::debug;

/// Schedules retries with exponentially growing, jittered delays.
///
/// The first attempt after construction or [`reset`](Self::reset) runs
/// immediately; each later attempt multiplies the base delay by the
/// configured factor, clamped to `[initial_delay, max_delay]`. Time already
/// spent since the previous attempt counts towards the delay.
#[derive(Debug)]
pub struct ExponentialBackoff {
    timer_id: TimerId,
    config: BackoffConfig,
    current_base: Duration,
    last_attempt_time: Duration,
}

impl ExponentialBackoff {
    /// Creates a backoff that schedules `timer_id`.
    #[must_use]
    pub fn new(timer_id: TimerId, config: BackoffConfig) -> Self {
        Self {
            timer_id,
            config,
            current_base: Duration::ZERO,
            last_attempt_time: Duration::ZERO,
        }
    }

    /// The base delay the next attempt waits for, before jitter.
    pub fn current_base(&self) -> Duration {
        self.current_base
    }

    /// Makes the next attempt run without delay.
    pub fn reset(&mut self) {
        self.current_base = Duration::ZERO;
    }

    /// Makes the next attempt wait the maximum delay.
    pub fn reset_to_max(&mut self) {
        self.current_base = self.config.max_delay;
    }

    /// Schedules the next attempt on `queue` and grows the base delay.
    /// Returns the scheduled delay.
    pub fn backoff_and_run(&mut self, queue: &mut AsyncQueue) -> Duration {
        self.cancel(queue);

        let desired = self.jittered(self.current_base);
        let delay_so_far = queue.now().saturating_sub(self.last_attempt_time);
        let remaining = desired.saturating_sub(delay_so_far);
        if !self.current_base.is_zero() {
            debug!(
                timer = %self.timer_id,
                delay_ms = remaining.as_millis() as u64,
                base_ms = self.current_base.as_millis() as u64,
                "backing off"
            );
        }
        queue.enqueue_after_delay(self.timer_id, remaining);

        let grown = self.current_base.mul_f64(self.config.backoff_factor);
        self.current_base = grown.clamp(self.config.initial_delay, self.config.max_delay);
        remaining
    }

    /// Records that the scheduled attempt ran at the queue's current time.
    pub fn mark_attempt(&mut self, queue: &AsyncQueue) {
        self.last_attempt_time = queue.now();
    }

    /// Cancels a scheduled attempt.
    pub fn cancel(&mut self, queue: &mut AsyncQueue) {
        queue.cancel(self.timer_id);
    }

    fn jittered(&self, base: Duration) -> Duration {
        if base.is_zero() || self.config.jitter_factor <= 0.0 {
            return base;
        }
        let spread = rand::thread_rng().gen_range(-1.0..=1.0) * self.config.jitter_factor;
        let secs = base.as_secs_f64() * (1.0 + spread);
        Duration::from_secs_f64(secs.max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn backoff(config: BackoffConfig) -> ExponentialBackoff {
        ExponentialBackoff::new(TimerId::ListenStreamConnectionBackoff, config)
    }

    #[test]
    fn first_attempt_is_immediate_then_grows() {
        let mut queue = AsyncQueue::new();
        let mut backoff = backoff(BackoffConfig::without_jitter());

        assert_eq!(backoff.backoff_and_run(&mut queue), Duration::ZERO);
        assert_eq!(backoff.current_base(), Duration::from_secs(1));
        assert_eq!(backoff.backoff_and_run(&mut queue), Duration::from_secs(1));
        assert_eq!(backoff.current_base(), Duration::from_millis(1500));
        assert!(queue.contains_delayed_operation(TimerId::ListenStreamConnectionBackoff));
    }

    #[test]
    fn reset_and_reset_to_max() {
        let mut queue = AsyncQueue::new();
        let mut backoff = backoff(BackoffConfig::without_jitter());
        backoff.backoff_and_run(&mut queue);
        backoff.backoff_and_run(&mut queue);

        backoff.reset_to_max();
        assert_eq!(backoff.backoff_and_run(&mut queue), Duration::from_secs(60));
        assert_eq!(backoff.current_base(), Duration::from_secs(60));

        backoff.reset();
        assert_eq!(backoff.backoff_and_run(&mut queue), Duration::ZERO);
    }

    #[test]
    fn elapsed_time_counts_towards_the_delay() {
        let mut queue = AsyncQueue::new();
        let mut backoff = backoff(BackoffConfig::without_jitter());
        backoff.backoff_and_run(&mut queue);
        backoff.mark_attempt(&queue);

        queue.advance_clock(Duration::from_millis(400));
        assert_eq!(backoff.backoff_and_run(&mut queue), Duration::from_millis(600));
    }

    #[test]
    fn jitter_stays_within_half_the_base() {
        let mut queue = AsyncQueue::new();
        let mut backoff = backoff(BackoffConfig::default());
        backoff.backoff_and_run(&mut queue);
        for _ in 0..20 {
            let base = backoff.current_base();
            let delay = backoff.backoff_and_run(&mut queue);
            assert!(delay >= base.mul_f64(0.5) && delay <= base.mul_f64(1.5));
        }
    }

    proptest! {
        #[test]
        fn base_delay_is_monotonic_up_to_max(attempts in 1usize..40) {
            let mut queue = AsyncQueue::new();
            let mut backoff = backoff(BackoffConfig::default());
            let mut previous = backoff.current_base();
            for _ in 0..attempts {
                backoff.backoff_and_run(&mut queue);
                let base = backoff.current_base();
                prop_assert!(base >= previous);
                prop_assert!(base <= Duration::from_secs(60));
                previous = base;
            }
            backoff.reset();
            prop_assert_eq!(backoff.current_base(), Duration::ZERO);
        }
    }
}
