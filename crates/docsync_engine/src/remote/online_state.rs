//! Online state derived from watch stream health.

use crate::queue::{AsyncQueue, TimerId};
use docsync_protocol::RpcStatus;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info};

/// Whether the client believes it can reach the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OnlineState {
    /// Not yet known; the watch stream is connecting or there are no targets.
    Unknown,
    /// The watch stream delivered a message.
    Online,
    /// Connecting failed or timed out.
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

/// Watch failures tolerated before reporting offline.
const MAX_WATCH_STREAM_FAILURES: u32 = 1;

/// Tracks the online state.
///
/// Methods return the new state when it changed, for the owner to
/// broadcast.
#[derive(Debug)]
pub struct OnlineStateTracker {
    state: OnlineState,
    watch_stream_failures: u32,
    timeout: Duration,
    should_warn_offline: bool,
}

impl OnlineStateTracker {
    /// Creates a tracker in the `Unknown` state.
    pub fn new(timeout: Duration) -> Self {
        Self {
            state: OnlineState::Unknown,
            watch_stream_failures: 0,
            timeout,
            should_warn_offline: true,
        }
    }

    /// The current state.
    pub fn state(&self) -> OnlineState {
        self.state
    }

    /// Called when the watch stream starts; arms the connect timeout on the
    /// first attempt.
    pub fn handle_watch_stream_start(&mut self, queue: &mut AsyncQueue) -> Option<OnlineState> {
        if self.watch_stream_failures != 0 {
            return None;
        }
        let changed = self.set_and_broadcast(OnlineState::Unknown);
        if !queue.contains_delayed_operation(TimerId::OnlineStateTimeout) {
            queue.enqueue_after_delay(TimerId::OnlineStateTimeout, self.timeout);
        }
        changed
    }

    /// Fires when the connect timeout elapses.
    pub fn handle_timeout(&mut self) -> Option<OnlineState> {
        if self.state != OnlineState::Unknown {
            return None;
        }
        self.log_offline(&format!(
            "backend did not respond within {} seconds",
            self.timeout.as_secs()
        ));
        self.set_and_broadcast(OnlineState::Offline)
    }

    /// Called when the watch stream failed.
    pub fn handle_watch_stream_failure(&mut self, queue: &mut AsyncQueue, status: &RpcStatus) -> Option<OnlineState> {
        if self.state == OnlineState::Online {
            // A healthy stream dropped; try to reconnect before going offline.
            self.watch_stream_failures = 0;
            queue.cancel(TimerId::OnlineStateTimeout);
            return self.set_and_broadcast(OnlineState::Unknown);
        }
        self.watch_stream_failures += 1;
        if self.watch_stream_failures >= MAX_WATCH_STREAM_FAILURES {
            queue.cancel(TimerId::OnlineStateTimeout);
            self.log_offline(&format!("connection failed {} times: {status}", self.watch_stream_failures));
            return self.set_and_broadcast(OnlineState::Offline);
        }
        None
    }

    /// Explicitly sets the state, clearing failure tracking.
    pub fn set(&mut self, queue: &mut AsyncQueue, state: OnlineState) -> Option<OnlineState> {
        queue.cancel(TimerId::OnlineStateTimeout);
        self.watch_stream_failures = 0;
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
            info!(details, "could not reach the backend, operating in offline mode");
            self.should_warn_offline = false;
        } else {
            debug!(details, "still offline");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_protocol::Code;

    fn unavailable() -> RpcStatus {
        RpcStatus::new(Code::Unavailable, "down")
    }

    #[test]
    fn connect_timeout_goes_offline() {
        let mut queue = AsyncQueue::new();
        let mut tracker = OnlineStateTracker::new(Duration::from_secs(10));
        assert_eq!(tracker.handle_watch_stream_start(&mut queue), None);
        assert_eq!(queue.deadline(TimerId::OnlineStateTimeout), Some(Duration::from_secs(10)));

        assert_eq!(queue.pop_next(), Some(TimerId::OnlineStateTimeout));
        assert_eq!(tracker.handle_timeout(), Some(OnlineState::Offline));
        assert_eq!(tracker.handle_timeout(), None);
    }

    #[test]
    fn one_failure_goes_offline() {
        let mut queue = AsyncQueue::new();
        let mut tracker = OnlineStateTracker::new(Duration::from_secs(10));
        tracker.handle_watch_stream_start(&mut queue);
        assert_eq!(
            tracker.handle_watch_stream_failure(&mut queue, &unavailable()),
            Some(OnlineState::Offline)
        );
        assert!(!queue.contains_delayed_operation(TimerId::OnlineStateTimeout));
        // Restarting after a failure does not go back to unknown.
        assert_eq!(tracker.handle_watch_stream_start(&mut queue), None);
        assert_eq!(tracker.state(), OnlineState::Offline);
    }

    #[test]
    fn failure_while_online_returns_to_unknown() {
        let mut queue = AsyncQueue::new();
        let mut tracker = OnlineStateTracker::new(Duration::from_secs(10));
        assert_eq!(tracker.set(&mut queue, OnlineState::Online), Some(OnlineState::Online));
        assert_eq!(
            tracker.handle_watch_stream_failure(&mut queue, &unavailable()),
            Some(OnlineState::Unknown)
        );
        assert_eq!(tracker.set(&mut queue, OnlineState::Unknown), None);
    }
}
