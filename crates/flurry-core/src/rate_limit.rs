//! Aggregate throughput governor shared by every relay session.
//!
//! The token bucket tolerates bursts: queues may always accept data, but
//! forwarding pauses once the bucket is full and resumes as the fill level
//! decays linearly over the averaging window.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// Common contract for the throughput strategies.
pub trait RateLimit: Send {
    /// Record `n` forwarded bytes. Returns `true` if still within capacity.
    fn update(&mut self, n: usize) -> bool;

    /// Whether forwarding should pause.
    fn is_limited(&mut self) -> bool;

    /// Seconds until the limiter stops being limited (negative or zero when
    /// it already isn't).
    fn when(&mut self) -> f64;
}

/// A limiter shared across sessions. Critical sections never await.
pub type SharedRateLimit = Arc<Mutex<Box<dyn RateLimit>>>;

/// Wrap a strategy for sharing.
pub fn shared(limit: impl RateLimit + 'static) -> SharedRateLimit {
    Arc::new(Mutex::new(Box::new(limit)))
}

/// Pick the strategy from an optional bytes-per-second cap.
///
/// * `bytes_per_sec` - Aggregate cap, `None` for unlimited.
/// * `window` - Averaging window of the bucket.
pub fn from_config(bytes_per_sec: Option<u64>, window: Duration) -> SharedRateLimit {
    match bytes_per_sec {
        Some(rate) if rate > 0 && !window.is_zero() => {
            let secs = window.as_secs_f64();
            shared(BucketRateLimit::new(rate as f64 * secs, secs))
        }
        _ => shared(UnlimitedRate),
    }
}

/// No cap configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnlimitedRate;

impl RateLimit for UnlimitedRate {
    fn update(&mut self, _n: usize) -> bool {
        true
    }

    fn is_limited(&mut self) -> bool {
        false
    }

    fn when(&mut self) -> f64 {
        0.0
    }
}

/// Token bucket whose fill drains at `capacity / time` bytes per second.
#[derive(Debug, Clone)]
pub struct BucketRateLimit {
    /// Current fill level in bytes (never negative).
    amount: f64,
    /// Bytes that may be in the bucket before forwarding pauses.
    capacity: f64,
    /// Averaging window in seconds.
    time: f64,
    /// Instant of the last decay.
    last_update: Instant,
}

impl BucketRateLimit {
    /// Create an empty bucket.
    ///
    /// * `capacity` - Bucket size in bytes.
    /// * `time` - Seconds for a full bucket to drain.
    pub fn new(capacity: f64, time: f64) -> Self {
        Self::new_at(capacity, time, Instant::now())
    }

    pub fn new_at(capacity: f64, time: f64, now: Instant) -> Self {
        Self {
            amount: 0.0,
            capacity,
            time,
            last_update: now,
        }
    }

    /// Current fill level.
    pub fn amount(&self) -> f64 {
        self.amount
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    /// Drain the bucket for the whole milliseconds elapsed since the last
    /// decay. Sub-millisecond remainders carry over to the next call.
    fn age(&mut self, now: Instant) {
        let elapsed_ms = now.saturating_duration_since(self.last_update).as_millis() as u64;
        if elapsed_ms == 0 {
            return;
        }
        self.last_update += Duration::from_millis(elapsed_ms);
        self.amount -= elapsed_ms as f64 / 1000.0 * self.capacity / self.time;
        if self.amount < 0.0 {
            self.amount = 0.0;
        }
    }

    pub fn update_at(&mut self, n: usize, now: Instant) -> bool {
        self.age(now);
        self.amount += n as f64;
        self.amount <= self.capacity
    }

    pub fn is_limited_at(&mut self, now: Instant) -> bool {
        self.age(now);
        self.amount >= self.capacity
    }

    pub fn when_at(&mut self, now: Instant) -> f64 {
        self.age(now);
        (self.amount - self.capacity) / (self.capacity / self.time)
    }
}

impl RateLimit for BucketRateLimit {
    fn update(&mut self, n: usize) -> bool {
        self.update_at(n, Instant::now())
    }

    fn is_limited(&mut self) -> bool {
        self.is_limited_at(Instant::now())
    }

    fn when(&mut self) -> f64 {
        self.when_at(Instant::now())
    }
}
