//! Rolling request log for a single category.

use std::collections::VecDeque;

/// A sliding window of request timestamps (seconds since the Unix epoch).
///
/// Entries are kept in ascending order. Unlike a fixed-window counter the
/// window never resets at a boundary: each entry ages out on its own once
/// it is `window_secs` old.
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    /// Request timestamps, oldest first
    entries: VecDeque<f64>,
    /// Maximum entries allowed inside the window
    limit: u32,
    /// Window length in seconds
    window_secs: f64,
}

impl SlidingWindow {
    /// Create an empty window.
    pub fn new(limit: u32, window_secs: u64) -> Self {
        Self {
            entries: VecDeque::new(),
            limit,
            window_secs: window_secs as f64,
        }
    }

    /// Drop every entry with `timestamp <= now - window`.
    ///
    /// Returns how many entries were removed.
    pub fn prune(&mut self, now: f64) -> usize {
        let cutoff = now - self.window_secs;
        let mut removed = 0;
        while let Some(&oldest) = self.entries.front() {
            if oldest > cutoff {
                break;
            }
            self.entries.pop_front();
            removed += 1;
        }
        removed
    }

    /// Append a request made at `now`.
    ///
    /// Does not enforce the limit.
    pub fn record(&mut self, now: f64) {
        match self.entries.back() {
            Some(&last) if now < last => {
                // Wall clock stepped backwards; keep the log sorted.
                let idx = self.entries.partition_point(|&ts| ts <= now);
                self.entries.insert(idx, now);
            }
            _ => self.entries.push_back(now),
        }
    }

    /// Fraction of the limit used by live entries. May exceed 1.0.
    pub fn usage_ratio(&mut self, now: f64) -> f64 {
        self.prune(now);
        if self.limit == 0 {
            return f64::INFINITY;
        }
        self.entries.len() as f64 / self.limit as f64
    }

    /// Whether one more request fits in the window.
    pub fn can_proceed(&mut self, now: f64) -> bool {
        self.usage_ratio(now) < 1.0
    }

    /// Seconds until the oldest live entry expires, freeing one slot.
    pub fn seconds_until_capacity(&mut self, now: f64) -> f64 {
        self.prune(now);
        match self.entries.front() {
            Some(&oldest) => (oldest + self.window_secs - now).max(0.0),
            None => 0.0,
        }
    }

    /// Live entries remaining under the limit (never negative).
    pub fn remaining(&mut self, now: f64) -> u32 {
        self.prune(now);
        self.limit.saturating_sub(self.entries.len() as u32)
    }

    /// Number of entries currently held (call `prune` first for live count).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn window_secs(&self) -> f64 {
        self.window_secs
    }

    /// Snapshot of the held timestamps, oldest first.
    pub fn timestamps(&self) -> Vec<f64> {
        self.entries.iter().copied().collect()
    }

    /// Replace the log with `timestamps`, sorting them ascending.
    pub fn replace(&mut self, mut timestamps: Vec<f64>) {
        timestamps.retain(|ts| ts.is_finite());
        timestamps.sort_by(f64::total_cmp);
        self.entries = timestamps.into();
    }

    /// Keep only the `count` most recent entries.
    ///
    /// Returns how many entries were discarded.
    pub fn retain_most_recent(&mut self, count: usize) -> usize {
        let excess = self.entries.len().saturating_sub(count);
        self.entries.drain(..excess);
        excess
    }
}
