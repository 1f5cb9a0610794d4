//! Virtual-time delayed operations.
//!
//! The engine runs every operation to completion on one logical queue.
//! Delayed work (backoff retries, idle timeouts, probes) is recorded here
//! under a [`TimerId`] and handed back to the owner when its deadline
//! passes, so a timer can be cancelled or fired early without any other
//! operation interleaving.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;

/// Identifies a kind of delayed operation. At most one is pending per id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimerId {
    /// Closes an idle watch stream.
    ListenStreamIdle,
    /// Restarts the watch stream after a failure.
    ListenStreamConnectionBackoff,
    /// Closes an idle write stream.
    WriteStreamIdle,
    /// Restarts the write stream after a failure.
    WriteStreamConnectionBackoff,
    /// Declares the client offline if the watch stream does not connect.
    OnlineStateTimeout,
    /// Retries persistence after a failure.
    PersistenceProbe,
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TimerId::ListenStreamIdle => "listen_stream_idle",
            TimerId::ListenStreamConnectionBackoff => "listen_stream_connection_backoff",
            TimerId::WriteStreamIdle => "write_stream_idle",
            TimerId::WriteStreamConnectionBackoff => "write_stream_connection_backoff",
            TimerId::OnlineStateTimeout => "online_state_timeout",
            TimerId::PersistenceProbe => "persistence_probe",
        };
        f.write_str(name)
    }
}

/// Delayed operations ordered by deadline on a virtual clock.
///
/// Time is measured from the engine's creation. Ties run in scheduling
/// order.
#[derive(Debug, Default)]
pub struct AsyncQueue {
    now: Duration,
    next_seq: u64,
    delayed: BTreeMap<(Duration, u64), TimerId>,
    by_timer: HashMap<TimerId, (Duration, u64)>,
}

impl AsyncQueue {
    /// Creates an empty queue at time zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The current virtual time.
    pub fn now(&self) -> Duration {
        self.now
    }

    /// Schedules `timer_id` to fire `delay` from now, replacing any pending
    /// operation with the same id. Returns the deadline.
    pub fn enqueue_after_delay(&mut self, timer_id: TimerId, delay: Duration) -> Duration {
        self.cancel(timer_id);
        let deadline = self.now + delay;
        let slot = (deadline, self.next_seq);
        self.next_seq += 1;
        self.delayed.insert(slot, timer_id);
        self.by_timer.insert(timer_id, slot);
        deadline
    }

    /// Cancels the pending operation for `timer_id`, if any.
    pub fn cancel(&mut self, timer_id: TimerId) -> bool {
        match self.by_timer.remove(&timer_id) {
            Some(slot) => {
                self.delayed.remove(&slot);
                true
            }
            None => false,
        }
    }

    /// True if an operation is pending for `timer_id`.
    pub fn contains_delayed_operation(&self, timer_id: TimerId) -> bool {
        self.by_timer.contains_key(&timer_id)
    }

    /// Deadline of the pending operation for `timer_id`.
    pub fn deadline(&self, timer_id: TimerId) -> Option<Duration> {
        self.by_timer.get(&timer_id).map(|(deadline, _)| *deadline)
    }

    /// The earliest pending deadline.
    pub fn next_deadline(&self) -> Option<Duration> {
        self.delayed.keys().next().map(|(deadline, _)| *deadline)
    }

    /// Number of pending operations.
    pub fn len(&self) -> usize {
        self.delayed.len()
    }

    /// True if nothing is scheduled.
    pub fn is_empty(&self) -> bool {
        self.delayed.is_empty()
    }

    /// Removes the earliest operation due at or before `until`, moving the
    /// clock to its deadline.
    pub fn pop_due(&mut self, until: Duration) -> Option<TimerId> {
        let (&slot, _) = self.delayed.iter().next()?;
        if slot.0 > until {
            return None;
        }
        self.take(slot)
    }

    /// Removes the earliest operation regardless of its deadline, moving the
    /// clock forward to it.
    pub fn pop_next(&mut self) -> Option<TimerId> {
        let (&slot, _) = self.delayed.iter().next()?;
        self.take(slot)
    }

    /// Moves the clock to `time`. The clock never runs backwards.
    pub fn advance_clock(&mut self, time: Duration) {
        if time > self.now {
            self.now = time;
        }
    }

    fn take(&mut self, slot: (Duration, u64)) -> Option<TimerId> {
        let timer_id = self.delayed.remove(&slot)?;
        self.by_timer.remove(&timer_id);
        self.advance_clock(slot.0);
        Some(timer_id)
    }
}
