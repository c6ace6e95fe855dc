use std::collections::{binary_heap::PeekMut, BinaryHeap};
use std::time::Instant;

use rustc_hash::FxHashMap;

#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub(crate) enum Timer {
    /// When to run the packetizer again
    WriteReady,
    /// When to close the connection after no activity
    Idle,
    /// When the closing or draining period ends
    Closing,
    /// When to give up on validating a new path to the peer
    PathValidation,
    /// When to run final teardown after entering the closed state
    Shutdown,
}

/// Keeps track of the nearest timeout for each `Timer`
///
/// Advanced with [`TimerTable::expire_before`].
#[derive(Debug, Clone, Default)]
pub(crate) struct TimerTable {
    most_recent_timeout: FxHashMap<Timer, Instant>,
    timeout_queue: BinaryHeap<TimerEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct TimerEntry {
    time: Instant,
    timer: Timer,
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // `timeout_queue` is a max heap so the order is reversed to pop the nearest timeout
        self.time
            .cmp(&other.time)
            .then_with(|| self.timer.cmp(&other.timer))
            .reverse()
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl TimerTable {
    /// Sets the timer unconditionally, superseding any earlier deadline
    pub(crate) fn set(&mut self, timer: Timer, time: Instant) {
        self.most_recent_timeout.insert(timer, time);
        self.timeout_queue.push(TimerEntry { time, timer });
    }

    pub(crate) fn get(&self, timer: Timer) -> Option<Instant> {
        self.most_recent_timeout.get(&timer).copied()
    }

    pub(crate) fn stop(&mut self, timer: Timer) {
        self.most_recent_timeout.remove(&timer);
    }

    /// The next deadline across all armed timers
    ///
    /// Obsolete queue entries are purged as they surface.
    pub(crate) fn next_timeout(&mut self) -> Option<Instant> {
        while let Some(entry) = self.timeout_queue.peek_mut() {
            if self.most_recent_timeout.get(&entry.timer) != Some(&entry.time) {
                PeekMut::pop(entry);
                continue;
            }
            return Some(entry.time);
        }
        None
    }

    /// Remove and return the next timer expiring at or before `now`
    pub(crate) fn expire_before(&mut self, now: Instant) -> Option<Timer> {
        while let Some(entry) = self.timeout_queue.peek_mut() {
            if self.most_recent_timeout.get(&entry.timer) != Some(&entry.time) {
                PeekMut::pop(entry);
                continue;
            }
            if entry.time > now {
                return None;
            }
            let timer = entry.timer;
            let time = entry.time;
            PeekMut::pop(entry);
            self.most_recent_timeout.remove(&timer);
            debug_assert!(time <= now);
            return Some(timer);
        }
        None
    }

    pub(crate) fn reset(&mut self) {
        self.most_recent_timeout.clear();
        self.timeout_queue.clear();
    }
}
