//! Tracks whether the client believes it can reach the backend.

use crate::async_queue::{AsyncQueue, DelayedOperation, TimerId};
use crate::config::OnlineStateConfig;
use std::fmt;
use std::future::Future;
use tracing::{debug, warn};

/// Connectivity as seen by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum OnlineState {
    /// No stream has connected or failed yet; the client waits before
    /// raising offline events.
    #[default]
    Unknown,
    /// The listen stream received a message.
    Online,
    /// The listen stream failed or never connected; reads come from cache.
    Offline,
}

impl fmt::Display for OnlineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OnlineState::Unknown => f.write_str("unknown"),
            OnlineState::Online => f.write_str("online"),
            OnlineState::Offline => f.write_str("offline"),
        }
    }
}

/// Derives the [`OnlineState`] from listen stream activity.
///
/// A failed connection only makes the state `Unknown`. The client reports
/// `Offline` once the grace period passes without any message from the
/// backend, so a single dropped connection does not flap the state.
///
/// Every method returns the new state when it changed.
#[derive(Debug)]
pub struct OnlineStateTracker {
    config: OnlineStateConfig,
    state: OnlineState,
    watch_stream_failures: u32,
    last_failure: Option<String>,
    timer: Option<DelayedOperation>,
    should_warn_offline: bool,
}

impl OnlineStateTracker {
    /// Creates a tracker in the `Unknown` state.
    pub fn new(config: OnlineStateConfig) -> Self {
        Self {
            config,
            state: OnlineState::Unknown,
            watch_stream_failures: 0,
            last_failure: None,
            timer: None,
            should_warn_offline: true,
        }
    }

    /// Returns the current state.
    pub fn state(&self) -> OnlineState {
        self.state
    }

    /// Called when the listen stream starts connecting.
    ///
    /// On a first attempt the state becomes `Unknown` and `on_timeout` is
    /// scheduled after the grace period; it should call
    /// [`OnlineStateTracker::handle_timeout`]. Reconnect attempts after a
    /// failure leave the state and the running timer alone.
    pub fn handle_watch_stream_start<F>(&mut self, queue: &AsyncQueue, on_timeout: F) -> Option<OnlineState>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.watch_stream_failures != 0 {
            return None;
        }
        let change = self.set_and_broadcast(OnlineState::Unknown);
        self.arm_timer(queue, on_timeout);
        change
    }

    /// Called when the grace period elapses.
    pub fn handle_timeout(&mut self) -> Option<OnlineState> {
        self.timer = None;
        if self.state != OnlineState::Unknown {
            return None;
        }
        let details = match &self.last_failure {
            Some(reason) => format!(
                "backend did not respond within {:?}, most recent error: {reason}",
                self.config.online_grace_period
            ),
            None => format!("backend did not respond within {:?}", self.config.online_grace_period),
        };
        self.log_offline(&details);
        self.set_and_broadcast(OnlineState::Offline)
    }

    /// Called when the listen stream fails.
    ///
    /// The state drops to `Unknown` at most; the grace timer keeps running,
    /// or is started with `on_timeout` if none is pending.
    pub fn handle_watch_stream_failure<F>(&mut self, reason: &str, queue: &AsyncQueue, on_timeout: F) -> Option<OnlineState>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.watch_stream_failures += 1;
        self.last_failure = Some(reason.to_string());
        debug!(failures = self.watch_stream_failures, reason, "listen stream failed");
        match self.state {
            OnlineState::Offline => None,
            OnlineState::Online | OnlineState::Unknown => {
                let change = self.set_and_broadcast(OnlineState::Unknown);
                if self.timer.is_none() {
                    self.arm_timer(queue, on_timeout);
                }
                change
            }
        }
    }

    /// Sets the state explicitly, e.g. after a message arrived or the
    /// network was disabled.
    pub fn set(&mut self, state: OnlineState) -> Option<OnlineState> {
        self.clear_timer();
        self.watch_stream_failures = 0;
        self.last_failure = None;
        if state == OnlineState::Online {
            self.should_warn_offline = false;
        }
        self.set_and_broadcast(state)
    }

    fn set_and_broadcast(&mut self, state: OnlineState) -> Option<OnlineState> {
        if state == self.state {
            return None;
        }
        debug!(from = %self.state, to = %state, "online state changed");
        self.state = state;
        Some(state)
    }

    fn log_offline(&mut self, details: &str) {
        if self.should_warn_offline {
            warn!("could not reach the backend, operating in offline mode: {details}");
            self.should_warn_offline = false;
        } else {
            debug!("{details}");
        }
    }

    fn arm_timer<F>(&mut self, queue: &AsyncQueue, on_timeout: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.clear_timer();
        self.timer = Some(queue.enqueue_after_delay(
            TimerId::OnlineStateTimeout,
            self.config.online_grace_period,
            on_timeout,
        ));
    }

    fn clear_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_attempt_goes_offline_after_grace_period() {
        let queue = AsyncQueue::new();
        let mut tracker = OnlineStateTracker::new(OnlineStateConfig::default());
        assert_eq!(tracker.handle_watch_stream_start(&queue, async {}), None);
        assert!(queue.contains_delayed_operation(TimerId::OnlineStateTimeout));
        assert_eq!(tracker.handle_timeout(), Some(OnlineState::Offline));
    }

    #[tokio::test]
    async fn failures_stay_unknown_until_the_grace_period_ends() {
        let queue = AsyncQueue::new();
        let mut tracker = OnlineStateTracker::new(OnlineStateConfig::default());
        tracker.handle_watch_stream_start(&queue, async {});
        assert_eq!(tracker.handle_watch_stream_failure("refused", &queue, async {}), None);
        assert_eq!(tracker.state(), OnlineState::Unknown);
        assert!(queue.contains_delayed_operation(TimerId::OnlineStateTimeout));

        assert_eq!(tracker.handle_watch_stream_start(&queue, async {}), None);
        assert_eq!(tracker.handle_watch_stream_failure("refused", &queue, async {}), None);
        assert_eq!(tracker.state(), OnlineState::Unknown);

        assert_eq!(tracker.handle_timeout(), Some(OnlineState::Offline));
        // Reconnect attempts after going offline keep the offline state.
        assert_eq!(tracker.handle_watch_stream_start(&queue, async {}), None);
        assert_eq!(tracker.handle_watch_stream_failure("refused", &queue, async {}), None);
        assert_eq!(tracker.state(), OnlineState::Offline);
    }

    #[tokio::test]
    async fn losing_an_online_stream_is_unknown_first() {
        let queue = AsyncQueue::new();
        let mut tracker = OnlineStateTracker::new(OnlineStateConfig::default());
        tracker.handle_watch_stream_start(&queue, async {});
        assert_eq!(tracker.set(OnlineState::Online), Some(OnlineState::Online));
        assert!(!queue.contains_delayed_operation(TimerId::OnlineStateTimeout));

        assert_eq!(
            tracker.handle_watch_stream_failure("reset", &queue, async {}),
            Some(OnlineState::Unknown)
        );
        assert!(queue.contains_delayed_operation(TimerId::OnlineStateTimeout));
        assert_eq!(tracker.handle_watch_stream_failure("reset", &queue, async {}), None);
        assert_eq!(tracker.state(), OnlineState::Unknown);
        assert_eq!(tracker.handle_timeout(), Some(OnlineState::Offline));
    }

    #[tokio::test]
    async fn a_message_during_the_grace_period_goes_online() {
        let queue = AsyncQueue::new();
        let mut tracker = OnlineStateTracker::new(OnlineStateConfig::default());
        tracker.handle_watch_stream_start(&queue, async {});
        tracker.handle_watch_stream_failure("refused", &queue, async {});
        assert_eq!(tracker.set(OnlineState::Online), Some(OnlineState::Online));
        assert!(!queue.contains_delayed_operation(TimerId::OnlineStateTimeout));
        assert_eq!(tracker.handle_timeout(), None);
    }

    #[test]
    fn timeout_after_message_is_ignored() {
        let mut tracker = OnlineStateTracker::new(OnlineStateConfig::default());
        tracker.set(OnlineState::Online);
        assert_eq!(tracker.handle_timeout(), None);
        assert_eq!(tracker.state(), OnlineState::Online);
    }
}
