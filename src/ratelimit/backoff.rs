//! Proactive pacing and reactive backoff.
//!
//! Two separate mechanisms live here:
//!
//! - **Pacing** scales a self-imposed delay with the current usage ratio of a
//!   category, before any limit is hit.
//! - **Reactive backoff** decides how long to wait after the provider has
//!   already answered with a rate-limit signal or a generic failure.
//!
//! All delays are randomized. Every `*_with` method takes the random source
//! explicitly so it can be seeded in tests.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{BackoffConfig, PacingConfig};

/// Below this ratio no pacing delay is applied.
pub const LOW_THRESHOLD: f64 = 0.5;
/// Ratio at which pacing moves to the elevated tier.
pub const MEDIUM_THRESHOLD: f64 = 0.7;
/// Ratio at which pacing moves to the critical tier.
pub const HIGH_THRESHOLD: f64 = 0.9;
/// Upper bound on any single computed delay (one year).
pub const MAX_DELAY_SECS: f64 = 365.0 * 86_400.0;

/// A closed interval of seconds a delay is drawn uniformly from.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DelayRange {
    pub min: f64,
    pub max: f64,
}

impl DelayRange {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn is_valid(&self) -> bool {
        self.min.is_finite() && self.max.is_finite() && 0.0 <= self.min && self.min <= self.max
    }

    /// Draw a value in `[min, max]`.
    ///
    /// Bounds are clamped to `[0, MAX_DELAY_SECS]` first; NaN counts as 0.
    pub fn sample<R: Rng>(&self, rng: &mut R) -> f64 {
        let min = clamp_secs(self.min);
        let max = clamp_secs(self.max);
        if max <= min {
            return min;
        }
        rng.gen_range(min..=max)
    }

    /// Draw a delay in `[min, max]` seconds.
    pub fn sample_duration<R: Rng>(&self, rng: &mut R) -> Duration {
        secs(self.sample(rng))
    }
}

/// An inclusive range of whole seconds used for jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JitterRange {
    pub min: u64,
    pub max: u64,
}

impl JitterRange {
    pub const fn new(min: u64, max: u64) -> Self {
        Self { min, max }
    }

    pub fn sample<R: Rng>(&self, rng: &mut R) -> u64 {
        if self.max <= self.min {
            return self.min;
        }
        rng.gen_range(self.min..=self.max)
    }
}

/// What the transport reported for an attempted request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutcome {
    /// The request succeeded.
    Success,
    /// The provider answered "too many requests".
    ///
    /// `retry_after` is the provider's hint in seconds, when one was sent.
    /// Negative hints are treated as absent.
    RateLimited { retry_after: Option<i64> },
    /// Any other failure.
    Failure { reason: String },
}

impl RequestOutcome {
    /// Build a rate-limited outcome from a raw `Retry-After` header value.
    pub fn rate_limited(header: Option<&str>) -> Self {
        RequestOutcome::RateLimited {
            retry_after: header.and_then(parse_retry_after),
        }
    }

    pub fn failure(reason: impl Into<String>) -> Self {
        RequestOutcome::Failure {
            reason: reason.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RequestOutcome::Success)
    }
}

/// Parse a `Retry-After` value given in whole seconds.
///
/// Anything else (HTTP dates, garbage, empty) yields `None`.
pub fn parse_retry_after(raw: &str) -> Option<i64> {
    raw.trim().parse::<i64>().ok()
}

/// Pacing tier for a usage ratio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PacingTier {
    /// No added delay
    Idle,
    Moderate,
    Elevated,
    Critical,
}

/// Maps utilization and provider signals to concrete wait durations.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pacing: PacingConfig,
    backoff: BackoffConfig,
}

impl BackoffPolicy {
    pub fn new(pacing: PacingConfig, backoff: BackoffConfig) -> Self {
        Self { pacing, backoff }
    }

    /// Which pacing tier a usage ratio falls into.
    pub fn tier(&self, ratio: f64) -> PacingTier {
        if ratio.is_nan() || ratio < self.pacing.low_threshold {
            PacingTier::Idle
        } else if ratio < self.pacing.medium_threshold {
            PacingTier::Moderate
        } else if ratio < self.pacing.high_threshold {
            PacingTier::Elevated
        } else {
            PacingTier::Critical
        }
    }

    /// Delay range of a tier; `None` for [`PacingTier::Idle`].
    pub fn tier_range(&self, tier: PacingTier) -> Option<DelayRange> {
        match tier {
            PacingTier::Idle => None,
            PacingTier::Moderate => Some(self.pacing.moderate_delay),
            PacingTier::Elevated => Some(self.pacing.elevated_delay),
            PacingTier::Critical => Some(self.pacing.critical_delay),
        }
    }

    /// Proactive delay for a request at `ratio`, drawn from `rng`.
    pub fn pacing_delay_with<R: Rng>(&self, ratio: f64, rng: &mut R) -> Duration {
        match self.tier_range(self.tier(ratio)) {
            Some(range) => range.sample_duration(rng),
            None => Duration::ZERO,
        }
    }

    /// Proactive delay for a request at `ratio`.
    pub fn pacing_delay(&self, ratio: f64) -> Duration {
        self.pacing_delay_with(ratio, &mut rand::thread_rng())
    }

    /// How long to wait after `outcome`, with `ratio` the current usage of
    /// the category the request belonged to.
    pub fn reactive_delay_with<R: Rng>(
        &self,
        outcome: &RequestOutcome,
        ratio: f64,
        rng: &mut R,
    ) -> Duration {
        match outcome {
            RequestOutcome::Success => Duration::ZERO,
            RequestOutcome::RateLimited {
                retry_after: Some(hint),
            } if *hint >= 0 => {
                let jitter = self.backoff.retry_after_jitter.sample(rng);
                Duration::from_secs((*hint as u64).saturating_add(jitter))
            }
            RequestOutcome::RateLimited { .. } => {
                let jitter = JitterRange::new(0, self.backoff.cooldown_jitter_secs).sample(rng);
                Duration::from_secs(self.backoff.cooldown_base_secs.saturating_add(jitter))
            }
            RequestOutcome::Failure { .. } => {
                secs(self.backoff.failure_base_secs)
                    .saturating_add(self.pacing_delay_with(ratio, rng))
            }
        }
    }

    /// How long to wait after `outcome`.
    pub fn reactive_delay(&self, outcome: &RequestOutcome, ratio: f64) -> Duration {
        self.reactive_delay_with(outcome, ratio, &mut rand::thread_rng())
    }

    /// Wait after `outcome`, returning how long was slept.
    pub async fn backoff(&self, outcome: &RequestOutcome, ratio: f64) -> Duration {
        let delay = self.reactive_delay(outcome, ratio);
        match outcome {
            RequestOutcome::Success => return delay,
            RequestOutcome::RateLimited {
                retry_after: Some(hint),
            } if *hint >= 0 => {
                warn!(
                    retry_after = hint,
                    "Rate limited by provider, honoring Retry-After: sleeping {:.0}s",
                    delay.as_secs_f64()
                );
            }
            RequestOutcome::RateLimited { retry_after } => {
                warn!(
                    retry_after = ?retry_after,
                    "Rate limited by provider without usable hint, backing off for {:.0}s",
                    delay.as_secs_f64()
                );
            }
            RequestOutcome::Failure { reason } => {
                warn!(
                    reason = %reason,
                    "Request failed, waiting {:.1}s before retry",
                    delay.as_secs_f64()
                );
            }
        }
        tokio::time::sleep(delay).await;
        delay
    }

    /// Wait for a full window to free a slot: `seconds_until_capacity` plus jitter.
    pub fn capacity_wait_with<R: Rng>(
        &self,
        seconds_until_capacity: f64,
        rng: &mut R,
    ) -> Duration {
        let jitter = self.backoff.capacity_wait_jitter.sample(rng);
        secs(seconds_until_capacity).saturating_add(Duration::from_secs(jitter))
    }

    pub fn capacity_wait(&self, seconds_until_capacity: f64) -> Duration {
        self.capacity_wait_with(seconds_until_capacity, &mut rand::thread_rng())
    }

    /// Sleep for the pacing delay of `ratio`, returning how long was slept.
    pub async fn pace(&self, ratio: f64) -> Duration {
        let delay = self.pacing_delay(ratio);
        if delay.is_zero() {
            debug!(ratio, "No pacing delay needed");
            return delay;
        }
        info!(
            ratio,
            "Applying pacing delay of {:.1}s (usage: {:.2}%)",
            delay.as_secs_f64(),
            ratio * 100.0
        );
        tokio::time::sleep(delay).await;
        delay
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(PacingConfig::default(), BackoffConfig::default())
    }
}

/// Seconds to a `Duration`, clamped like [`clamp_secs`].
fn secs(value: f64) -> Duration {
    Duration::from_secs_f64(clamp_secs(value))
}

/// Negative and NaN become 0; anything above [`MAX_DELAY_SECS`] is capped.
fn clamp_secs(value: f64) -> f64 {
    if value.is_nan() || value <= 0.0 {
        0.0
    } else {
        value.min(MAX_DELAY_SECS)
    }
}
