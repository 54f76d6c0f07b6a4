//! Monthly read/post counters.

use chrono::{Datelike, NaiveDate};
use tracing::info;

/// Reads and posts made in the current calendar month.
///
/// Counters reset when the calendar month (year and month, UTC) of "today"
/// differs from the anchor. This is a product-level budget and is separate
/// from the 15-minute burst windows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageCounters {
    reads: u64,
    posts: u64,
    /// Date of the last reset; only its year and month matter
    period_anchor: NaiveDate,
}

impl UsageCounters {
    /// Zeroed counters anchored to `today`.
    pub fn new(today: NaiveDate) -> Self {
        Self::from_parts(0, 0, today)
    }

    pub fn from_parts(reads: u64, posts: u64, period_anchor: NaiveDate) -> Self {
        Self {
            reads,
            posts,
            period_anchor,
        }
    }

    /// Reset both counters if `today` is in a different month than the anchor.
    ///
    /// Returns true when a rollover happened.
    pub fn check_reset(&mut self, today: NaiveDate) -> bool {
        let same_period = today.year() == self.period_anchor.year()
            && today.month() == self.period_anchor.month();
        if same_period {
            return false;
        }

        info!(
            previous_reads = self.reads,
            previous_posts = self.posts,
            "Resetting monthly usage counters"
        );
        self.reads = 0;
        self.posts = 0;
        self.period_anchor = today;
        true
    }

    /// Count one read, returning the new total for the month.
    pub fn record_read(&mut self, today: NaiveDate) -> u64 {
        self.check_reset(today);
        self.reads += 1;
        info!(reads = self.reads, "API reads this month: {}", self.reads);
        self.reads
    }

    /// Count one post, returning the new total for the month.
    pub fn record_post(&mut self, today: NaiveDate) -> u64 {
        self.check_reset(today);
        self.posts += 1;
        info!(posts = self.posts, "API posts this month: {}", self.posts);
        self.posts
    }

    pub fn reads(&self) -> u64 {
        self.reads
    }

    pub fn posts(&self) -> u64 {
        self.posts
    }

    pub fn period_anchor(&self) -> NaiveDate {
        self.period_anchor
    }
}
