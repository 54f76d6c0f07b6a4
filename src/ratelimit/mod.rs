//! Rate limiting logic: sliding windows, pacing, backoff and reconciliation.

mod backoff;
mod category;
mod reconcile;
mod tracker;
mod window;

pub use backoff::{
    parse_retry_after, BackoffPolicy, DelayRange, JitterRange, PacingTier, RequestOutcome,
    HIGH_THRESHOLD, LOW_THRESHOLD, MAX_DELAY_SECS, MEDIUM_THRESHOLD,
};
pub use category::{
    CategoryLimits, RequestCategory, DEFAULT_WINDOW_SECS, LOOKUP_LIMIT, POST_LIMIT, SEARCH_LIMIT,
};
pub use reconcile::{
    CategoryCorrection, CategoryQuota, QuotaReport, QuotaStatusSource, ReconcileSummary,
    Reconciler, DRIFT_TOLERANCE,
};
pub use tracker::{SlidingWindowTracker, UsageLevel};
pub use window::SlidingWindow;
