//! Active-client counting and a rolling day of clients served.

use flurry_core::RingBuffer;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Hours covered by [`ClientStats::total_last_day`] (including the current one).
pub const HISTORY_HOURS: usize = 24;

#[derive(Debug)]
struct Hourly {
    current: u64,
    completed: RingBuffer,
}

/// Shared client statistics, updated by sessions and read by the reporter.
#[derive(Debug)]
pub struct ClientStats {
    active: AtomicUsize,
    hourly: Mutex<Hourly>,
}

impl Default for ClientStats {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientStats {
    pub fn new() -> Self {
        Self {
            active: AtomicUsize::new(0),
            hourly: Mutex::new(Hourly {
                current: 0,
                completed: RingBuffer::new(HISTORY_HOURS - 1),
            }),
        }
    }

    /// A client's data channel opened.
    pub fn increase(&self) {
        self.active.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut h) = self.hourly.lock() {
            h.current += 1;
        }
    }

    /// A counted client went away.
    pub fn decrease(&self) {
        let _ = self
            .active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    /// Clients currently being relayed.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Clients served during the last [`HISTORY_HOURS`] hours.
    pub fn total_last_day(&self) -> u64 {
        match self.hourly.lock() {
            Ok(h) => h.completed.sum() + h.current,
            Err(_) => 0,
        }
    }

    /// Close the current hour bucket. Called once an hour by the orchestrator.
    pub fn rotate_hour(&self) {
        if let Ok(mut h) = self.hourly.lock() {
            let finished = std::mem::take(&mut h.current);
            h.completed.push(finished);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_count_never_underflows() {
        let stats = ClientStats::new();
        stats.decrease();
        assert_eq!(stats.active(), 0);
        stats.increase();
        stats.increase();
        stats.decrease();
        assert_eq!(stats.active(), 1);
    }

    #[test]
    fn day_total_rolls_off_old_hours() {
        let stats = ClientStats::new();
        stats.increase();
        stats.increase();
        assert_eq!(stats.total_last_day(), 2);

        stats.rotate_hour();
        stats.increase();
        assert_eq!(stats.total_last_day(), 3);

        for _ in 0..HISTORY_HOURS - 1 {
            stats.rotate_hour();
        }
        // the first hour's two clients have aged out, the second hour's one remains
        assert_eq!(stats.total_last_day(), 1);
        stats.rotate_hour();
        assert_eq!(stats.total_last_day(), 0);
    }
}
