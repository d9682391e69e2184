//! Exponential backoff with jitter.

use crate::async_queue::{AsyncQueue, DelayedOperation, TimerId};
use crate::config::BackoffConfig;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Schedules retries with exponentially growing delays.
///
/// The first attempt after [`ExponentialBackoff::reset`] runs immediately.
/// Each later attempt waits `base * (1 ± jitter)` where `base` starts at the
/// initial delay and grows by the backoff factor up to the maximum. Time
/// already spent since the previous attempt counts towards the delay.
#[derive(Debug)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
    timer_id: TimerId,
    current_base: Duration,
    last_attempt: Instant,
    timer: Option<DelayedOperation>,
}

impl ExponentialBackoff {
    /// Creates a backoff whose timers carry `timer_id`.
    pub fn new(config: BackoffConfig, timer_id: TimerId) -> Self {
        Self {
            config,
            timer_id,
            current_base: Duration::ZERO,
            last_attempt: Instant::now(),
            timer: None,
        }
    }

    /// Makes the next attempt run immediately.
    pub fn reset(&mut self) {
        self.current_base = Duration::ZERO;
    }

    /// Makes the next attempt wait the maximum delay.
    pub fn reset_to_max(&mut self) {
        self.current_base = self.config.max_delay;
    }

    /// Returns the base delay of the next attempt, without jitter.
    pub fn current_base(&self) -> Duration {
        self.current_base
    }

    /// Computes how long to wait before the next attempt and advances the
    /// base delay.
    pub fn next_delay(&mut self) -> Duration {
        let now = Instant::now();
        let jitter = if self.config.jitter_factor > 0.0 {
            rand::thread_rng().gen_range(-1.0..=1.0) * self.config.jitter_factor
        } else {
            0.0
        };
        let desired = self.current_base.mul_f64((1.0 + jitter).max(0.0));
        let elapsed = now.saturating_duration_since(self.last_attempt);
        let remaining = desired.saturating_sub(elapsed);
        self.last_attempt = now + remaining;

        let next = self.current_base.mul_f64(self.config.backoff_factor);
        self.current_base = next.clamp(self.config.initial_delay, self.config.max_delay);
        remaining
    }

    /// Cancels any pending attempt and schedules `op` after the next delay.
    pub fn backoff_and_run<F>(&mut self, queue: &AsyncQueue, op: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.cancel();
        let delay = self.next_delay();
        if !delay.is_zero() {
            debug!(timer = ?self.timer_id, ?delay, "backing off");
        }
        self.timer = Some(queue.enqueue_after_delay(self.timer_id, delay, op));
    }

    /// Cancels the pending attempt, if any.
    pub fn cancel(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn first_attempt_is_immediate() {
        let mut backoff = ExponentialBackoff::new(BackoffConfig::no_jitter(), TimerId::ListenStreamConnectionBackoff);
        assert_eq!(backoff.next_delay(), Duration::ZERO);
        assert_eq!(backoff.current_base(), Duration::from_secs(1));
    }

    #[test]
    fn reset_to_max_waits_the_maximum() {
        let mut backoff = ExponentialBackoff::new(BackoffConfig::no_jitter(), TimerId::WriteStreamConnectionBackoff);
        backoff.reset_to_max();
        assert!(backoff.next_delay() > Duration::from_secs(59));
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::ZERO);
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let mut backoff = ExponentialBackoff::new(BackoffConfig::default(), TimerId::AsyncQueueRetry);
        backoff.next_delay();
        let delay = backoff.next_delay();
        assert!(delay >= Duration::from_millis(490) && delay <= Duration::from_millis(1500));
    }

    proptest! {
        #[test]
        fn delays_grow_until_capped(attempts in 2usize..40) {
            let mut backoff = ExponentialBackoff::new(BackoffConfig::no_jitter(), TimerId::AsyncQueueRetry);
            let delays: Vec<Duration> = (0..attempts).map(|_| backoff.next_delay()).collect();
            for pair in delays.windows(2) {
                prop_assert!(pair[0] <= pair[1]);
            }
            prop_assert!(delays.iter().all(|d| *d <= Duration::from_secs(60)));
        }
    }
}
