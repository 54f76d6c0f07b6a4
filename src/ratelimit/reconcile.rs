//! Reconciliation of local window tracking against provider-reported quota.
//!
//! The sliding windows are an approximation: requests made by other tools
//! holding the same credentials never show up locally. Every few cycles the
//! provider's own remaining-quota figures are fetched and, where they drift
//! too far from the local estimate, the local log is trimmed to match.
//!
//! The rebuild keeps the most recent local timestamps. Those timestamps do
//! not necessarily correspond to the requests the provider counted, and when
//! the provider reports more usage than the local log holds nothing is
//! invented to fill the gap. Both are accepted limits of the approach.

use async_trait::async_trait;
use std::collections::HashMap;
use tracing::{debug, info, warn};

use super::category::RequestCategory;
use super::tracker::SlidingWindowTracker;
use crate::error::Result;

/// Allowed gap between local and reported remaining quota, as a fraction of
/// the category limit.
pub const DRIFT_TOLERANCE: f64 = 0.05;

/// Provider-reported quota for one category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CategoryQuota {
    pub remaining: u32,
    pub limit: u32,
}

/// Provider-reported quota for any subset of categories.
#[derive(Debug, Clone, Default)]
pub struct QuotaReport {
    quotas: HashMap<RequestCategory, CategoryQuota>,
}

impl QuotaReport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a category's figures.
    pub fn with(mut self, category: RequestCategory, remaining: u32, limit: u32) -> Self {
        self.quotas
            .insert(category, CategoryQuota { remaining, limit });
        self
    }

    pub fn get(&self, category: RequestCategory) -> Option<CategoryQuota> {
        self.quotas.get(&category).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.quotas.is_empty()
    }
}

/// Source of authoritative remaining-quota figures.
///
/// Implementations wrap whatever status endpoint the provider exposes. An
/// error means the collaborator was unreachable; reconciliation is skipped
/// for that cycle.
#[async_trait]
pub trait QuotaStatusSource: Send + Sync {
    /// Fetch the current quota figures.
    async fn quota_status(&self) -> Result<QuotaReport>;
}

/// Correction applied to one category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryCorrection {
    pub category: RequestCategory,
    /// `limit - live entries`; negative when the local log is over its limit
    pub local_remaining: i64,
    pub reported_remaining: u32,
    /// Entries kept after the rebuild
    pub kept: usize,
    /// Entries discarded by the rebuild
    pub discarded: usize,
}

/// Result of one reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileSummary {
    /// No figures could be fetched.
    Skipped { reason: String },
    /// Figures were compared; `corrections` lists the categories rebuilt.
    Checked {
        compared: usize,
        corrections: Vec<CategoryCorrection>,
    },
}

/// Decides when to reconcile and applies corrections.
#[derive(Debug, Clone)]
pub struct Reconciler {
    /// Reconcile every N cycles; 0 disables
    every_cycles: u32,
    cycles_since: u32,
}

impl Reconciler {
    pub fn new(every_cycles: u32) -> Self {
        Self {
            every_cycles,
            cycles_since: 0,
        }
    }

    /// Count one poll cycle. Returns true when a reconciliation is due, and
    /// restarts the count.
    pub fn tick(&mut self) -> bool {
        if self.every_cycles == 0 {
            return false;
        }
        self.cycles_since += 1;
        if self.cycles_since >= self.every_cycles {
            self.cycles_since = 0;
            true
        } else {
            false
        }
    }

    /// Fetch figures from `source` and reconcile. Never fails; an unreachable
    /// source is logged and reported as [`ReconcileSummary::Skipped`].
    pub async fn reconcile<S>(
        &self,
        tracker: &mut SlidingWindowTracker,
        source: &S,
        now: f64,
    ) -> ReconcileSummary
    where
        S: QuotaStatusSource + ?Sized,
    {
        match source.quota_status().await {
            Ok(report) => self.apply(tracker, &report, now),
            Err(e) => {
                warn!(error = %e, "Failed to check provider rate limits, skipping reconciliation");
                ReconcileSummary::Skipped {
                    reason: e.to_string(),
                }
            }
        }
    }

    /// Compare `report` with the tracker and rebuild drifted categories.
    ///
    /// Takes the tracker exclusively so all categories are compared and
    /// corrected against the same generation of state.
    pub fn apply(
        &self,
        tracker: &mut SlidingWindowTracker,
        report: &QuotaReport,
        now: f64,
    ) -> ReconcileSummary {
        tracker.prune(now);

        let mut compared = 0;
        let mut corrections = Vec::new();
        for category in RequestCategory::ALL {
            let Some(reported) = report.get(category) else {
                debug!(category = %category, "No provider figures for category");
                continue;
            };
            compared += 1;

            let limit = tracker.limit(category);
            let local_remaining =
                limit as i64 - tracker.live_count(category, now) as i64;
            info!(
                category = %category,
                "Provider reports {}/{} remaining, local tracking has {}/{} remaining",
                reported.remaining,
                reported.limit,
                local_remaining,
                limit
            );

            let drift = (reported.remaining as f64 - local_remaining as f64).abs();
            if drift <= limit as f64 * DRIFT_TOLERANCE {
                continue;
            }

            let used = limit.saturating_sub(reported.remaining) as usize;
            let discarded = tracker.retain_most_recent(category, used);
            let kept = tracker.live_count(category, now);
            warn!(
                category = %category,
                drift,
                kept,
                discarded,
                "Rate limit tracking discrepancy, adjusting local log to provider figures"
            );
            corrections.push(CategoryCorrection {
                category,
                local_remaining,
                reported_remaining: reported.remaining,
                kept,
                discarded,
            });
        }

        ReconcileSummary::Checked {
            compared,
            corrections,
        }
    }
}
