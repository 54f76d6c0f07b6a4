//! Per-category sliding window tracking.

use std::fmt;
use tracing::{debug, info};

use super::backoff::{HIGH_THRESHOLD, LOW_THRESHOLD, MEDIUM_THRESHOLD};
use super::category::{CategoryLimits, RequestCategory};
use super::window::SlidingWindow;

/// Coarse occupancy level of a window, used for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum UsageLevel {
    Low,
    Moderate,
    Medium,
    High,
}

impl UsageLevel {
    pub fn from_ratio(ratio: f64) -> Self {
        if ratio >= HIGH_THRESHOLD {
            UsageLevel::High
        } else if ratio >= MEDIUM_THRESHOLD {
            UsageLevel::Medium
        } else if ratio >= LOW_THRESHOLD {
            UsageLevel::Moderate
        } else {
            UsageLevel::Low
        }
    }
}

impl fmt::Display for UsageLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UsageLevel::Low => "LOW",
            UsageLevel::Moderate => "MODERATE",
            UsageLevel::Medium => "MEDIUM",
            UsageLevel::High => "HIGH",
        };
        f.write_str(s)
    }
}

/// Tracks request timestamps for every [`RequestCategory`].
///
/// Each category's log is only reachable through these operations. All
/// capacity queries prune expired entries first, so they only ever reflect
/// the live window.
///
/// The tracker answers "may I proceed"; it never refuses to record. Callers
/// that record without checking `can_proceed` first go over the local limit
/// on purpose.
#[derive(Debug, Clone)]
pub struct SlidingWindowTracker {
    search: SlidingWindow,
    lookup: SlidingWindow,
    post: SlidingWindow,
}

impl SlidingWindowTracker {
    /// Create an empty tracker with the given limits.
    pub fn new(limits: CategoryLimits) -> Self {
        Self {
            search: SlidingWindow::new(limits.search, limits.window_secs),
            lookup: SlidingWindow::new(limits.lookup, limits.window_secs),
            post: SlidingWindow::new(limits.post, limits.window_secs),
        }
    }

    fn window(&self, category: RequestCategory) -> &SlidingWindow {
        match category {
            RequestCategory::Search => &self.search,
            RequestCategory::Lookup => &self.lookup,
            RequestCategory::Post => &self.post,
        }
    }

    fn window_mut(&mut self, category: RequestCategory) -> &mut SlidingWindow {
        match category {
            RequestCategory::Search => &mut self.search,
            RequestCategory::Lookup => &mut self.lookup,
            RequestCategory::Post => &mut self.post,
        }
    }

    /// Prune expired entries from every category.
    pub fn prune(&mut self, now: f64) {
        for category in RequestCategory::ALL {
            let removed = self.window_mut(category).prune(now);
            if removed > 0 {
                debug!(category = %category, removed, "Pruned expired window entries");
            }
        }
    }

    /// Live entries divided by the category limit.
    pub fn usage_ratio(&mut self, category: RequestCategory, now: f64) -> f64 {
        self.window_mut(category).usage_ratio(now)
    }

    /// True while the category is below its limit.
    pub fn can_proceed(&mut self, category: RequestCategory, now: f64) -> bool {
        self.window_mut(category).can_proceed(now)
    }

    /// Seconds until the oldest live entry of the category expires.
    pub fn seconds_until_capacity(&mut self, category: RequestCategory, now: f64) -> f64 {
        self.window_mut(category).seconds_until_capacity(now)
    }

    /// Record a request of `category` made at `now`.
    pub fn record(&mut self, category: RequestCategory, now: f64) {
        let window = self.window_mut(category);
        window.record(now);
        let ratio = window.usage_ratio(now);
        info!(
            category = %category,
            used = window.len(),
            limit = window.limit(),
            level = %UsageLevel::from_ratio(ratio),
            "Request recorded: {}/{} in window ({:.2}%)",
            window.len(),
            window.limit(),
            ratio * 100.0
        );
    }

    /// Live entry count for the category.
    pub fn live_count(&mut self, category: RequestCategory, now: f64) -> usize {
        let window = self.window_mut(category);
        window.prune(now);
        window.len()
    }

    /// Locally derived remaining quota: `limit - live entries`, floored at 0.
    pub fn remaining(&mut self, category: RequestCategory, now: f64) -> u32 {
        self.window_mut(category).remaining(now)
    }

    pub fn limit(&self, category: RequestCategory) -> u32 {
        self.window(category).limit()
    }

    /// Held timestamps of a category, oldest first.
    pub fn timestamps(&self, category: RequestCategory) -> Vec<f64> {
        self.window(category).timestamps()
    }

    /// Replace a category's log wholesale (used when restoring a snapshot).
    pub fn restore(&mut self, category: RequestCategory, timestamps: Vec<f64>) {
        self.window_mut(category).replace(timestamps);
    }

    /// Keep only the `count` most recent entries of a category.
    pub fn retain_most_recent(&mut self, category: RequestCategory, count: usize) -> usize {
        self.window_mut(category).retain_most_recent(count)
    }
}

impl Default for SlidingWindowTracker {
    fn default() -> Self {
        Self::new(CategoryLimits::default())
    }
}
