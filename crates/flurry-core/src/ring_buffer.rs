//! Fixed-capacity circular buffer of counters.
//!
//! Used for rolling statistics (e.g. clients served per hour over the last
//! day) without keeping unbounded history.

/// A fixed-capacity ring of `u64` samples; pushing into a full ring
/// overwrites the oldest sample.
#[derive(Debug, Clone)]
pub struct RingBuffer {
    buf: Vec<u64>,
    capacity: usize,
    /// Next write position (wraps around).
    write_pos: usize,
    /// Number of valid samples (saturates at `capacity`).
    len: usize,
}

impl RingBuffer {
    /// Create a ring with room for `capacity` samples.
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity],
            capacity,
            write_pos: 0,
            len: 0,
        }
    }

    /// Append a sample, evicting the oldest one when full.
    pub fn push(&mut self, value: u64) {
        if self.capacity == 0 {
            return;
        }
        self.buf[self.write_pos] = value;
        self.write_pos = (self.write_pos + 1) % self.capacity;
        self.len = (self.len + 1).min(self.capacity);
    }

    /// Sum of all stored samples.
    pub fn sum(&self) -> u64 {
        self.to_vec().iter().sum()
    }

    /// Stored samples, oldest first.
    pub fn to_vec(&self) -> Vec<u64> {
        if self.len < self.capacity {
            // not wrapped yet, data starts at 0
            self.buf[..self.len].to_vec()
        } else {
            let mut out = Vec::with_capacity(self.capacity);
            out.extend_from_slice(&self.buf[self.write_pos..]);
            out.extend_from_slice(&self.buf[..self.write_pos]);
            out
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
