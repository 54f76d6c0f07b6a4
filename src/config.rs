//! Configuration management for Quotaward.
//!
//! Configuration is resolved once at startup into [`QuotawardConfig`] and
//! validated; the rate limiting core only ever sees the typed sections.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::{QuotawardError, Result};
use crate::ratelimit::{CategoryLimits, DelayRange, JitterRange};

/// Prefix for environment overrides, e.g. `QUOTAWARD__LIMITS__SEARCH=100`.
pub const ENV_PREFIX: &str = "QUOTAWARD";

/// Main configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuotawardConfig {
    /// Where durable state lives
    #[serde(default)]
    pub state: StateConfig,

    /// Per-category request limits
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Proactive pacing tiers
    #[serde(default)]
    pub pacing: PacingConfig,

    /// Reactive backoff parameters
    #[serde(default)]
    pub backoff: BackoffConfig,

    /// Monthly read/post budget
    #[serde(default)]
    pub budget: BudgetConfig,

    /// Poll loop cadence
    #[serde(default)]
    pub poll: PollConfig,
}

/// Durable state locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    /// Snapshot of window timestamps and usage counters
    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: PathBuf,

    /// Opt-in / opt-out preference record
    #[serde(default = "default_preferences_path")]
    pub preferences_path: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            snapshot_path: default_snapshot_path(),
            preferences_path: default_preferences_path(),
        }
    }
}

fn default_snapshot_path() -> PathBuf {
    PathBuf::from("data/bot_state.json")
}

fn default_preferences_path() -> PathBuf {
    PathBuf::from("data/user_prefs.json")
}

/// Per-category request limits within one window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_search_limit")]
    pub search: u32,

    #[serde(default = "default_lookup_limit")]
    pub lookup: u32,

    #[serde(default = "default_post_limit")]
    pub post: u32,

    /// Sliding window length in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        CategoryLimits::default().into()
    }
}

impl From<CategoryLimits> for LimitsConfig {
    fn from(limits: CategoryLimits) -> Self {
        Self {
            search: limits.search,
            lookup: limits.lookup,
            post: limits.post,
            window_secs: limits.window_secs,
        }
    }
}

impl From<&LimitsConfig> for CategoryLimits {
    fn from(config: &LimitsConfig) -> Self {
        Self {
            search: config.search,
            lookup: config.lookup,
            post: config.post,
            window_secs: config.window_secs,
        }
    }
}

fn default_search_limit() -> u32 {
    crate::ratelimit::SEARCH_LIMIT
}

fn default_lookup_limit() -> u32 {
    crate::ratelimit::LOOKUP_LIMIT
}

fn default_post_limit() -> u32 {
    crate::ratelimit::POST_LIMIT
}

fn default_window_secs() -> u64 {
    crate::ratelimit::DEFAULT_WINDOW_SECS
}

/// Proactive pacing: utilization thresholds and the delay drawn in each tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacingConfig {
    #[serde(default = "default_low_threshold")]
    pub low_threshold: f64,

    #[serde(default = "default_medium_threshold")]
    pub medium_threshold: f64,

    #[serde(default = "default_high_threshold")]
    pub high_threshold: f64,

    /// Delay between the low and medium thresholds
    #[serde(default = "default_moderate_delay")]
    pub moderate_delay: DelayRange,

    /// Delay between the medium and high thresholds
    #[serde(default = "default_elevated_delay")]
    pub elevated_delay: DelayRange,

    /// Delay at or above the high threshold
    #[serde(default = "default_critical_delay")]
    pub critical_delay: DelayRange,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            low_threshold: default_low_threshold(),
            medium_threshold: default_medium_threshold(),
            high_threshold: default_high_threshold(),
            moderate_delay: default_moderate_delay(),
            elevated_delay: default_elevated_delay(),
            critical_delay: default_critical_delay(),
        }
    }
}

fn default_low_threshold() -> f64 {
    crate::ratelimit::LOW_THRESHOLD
}

fn default_medium_threshold() -> f64 {
    crate::ratelimit::MEDIUM_THRESHOLD
}

fn default_high_threshold() -> f64 {
    crate::ratelimit::HIGH_THRESHOLD
}

fn default_moderate_delay() -> DelayRange {
    DelayRange::new(1.0, 5.0)
}

fn default_elevated_delay() -> DelayRange {
    DelayRange::new(5.0, 30.0)
}

fn default_critical_delay() -> DelayRange {
    DelayRange::new(30.0, 120.0)
}

/// Reactive backoff after the provider signals a problem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Jitter added on top of a usable retry-after hint
    #[serde(default = "default_retry_after_jitter")]
    pub retry_after_jitter: JitterRange,

    /// Flat cooldown when a rate-limit signal carries no usable hint
    #[serde(default = "default_cooldown_base_secs")]
    pub cooldown_base_secs: u64,

    /// Upper bound of the jitter added to the flat cooldown
    #[serde(default = "default_cooldown_jitter_secs")]
    pub cooldown_jitter_secs: u64,

    /// Base wait after a generic failure, before load-based pacing
    #[serde(default = "default_failure_base_secs")]
    pub failure_base_secs: f64,

    /// Jitter added when waiting for a full window to free a slot
    #[serde(default = "default_capacity_wait_jitter")]
    pub capacity_wait_jitter: JitterRange,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            retry_after_jitter: default_retry_after_jitter(),
            cooldown_base_secs: default_cooldown_base_secs(),
            cooldown_jitter_secs: default_cooldown_jitter_secs(),
            failure_base_secs: default_failure_base_secs(),
            capacity_wait_jitter: default_capacity_wait_jitter(),
        }
    }
}

fn default_retry_after_jitter() -> JitterRange {
    JitterRange::new(5, 15)
}

fn default_cooldown_base_secs() -> u64 {
    300
}

fn default_cooldown_jitter_secs() -> u64 {
    60
}

fn default_failure_base_secs() -> f64 {
    5.0
}

fn default_capacity_wait_jitter() -> JitterRange {
    JitterRange::new(5, 20)
}

/// Monthly usage budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Stop issuing reads once this many have been made this month
    #[serde(default = "default_monthly_read_cap")]
    pub monthly_read_cap: u64,

    /// Stop issuing posts once this many have been made this month
    #[serde(default = "default_monthly_post_cap")]
    pub monthly_post_cap: u64,

    /// How long to idle once a cap is reached
    #[serde(default = "default_exhausted_sleep")]
    pub exhausted_sleep: DelayRange,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            monthly_read_cap: default_monthly_read_cap(),
            monthly_post_cap: default_monthly_post_cap(),
            exhausted_sleep: default_exhausted_sleep(),
        }
    }
}

fn default_monthly_read_cap() -> u64 {
    95
}

fn default_monthly_post_cap() -> u64 {
    490
}

fn default_exhausted_sleep() -> DelayRange {
    DelayRange::new(86_400.0 - 300.0, 86_400.0 + 300.0)
}

/// Poll loop cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollConfig {
    /// Reconcile against provider-reported quota every N cycles (0 disables)
    #[serde(default = "default_reconcile_every")]
    pub reconcile_every: u32,

    /// Randomized wait before each cycle
    #[serde(default = "default_cycle_jitter")]
    pub cycle_jitter: DelayRange,

    /// Randomized idle time after a completed cycle
    #[serde(default = "default_cycle_interval")]
    pub cycle_interval: DelayRange,

    /// Cooldown after a cycle fails
    #[serde(default = "default_error_cooldown")]
    pub error_cooldown: DelayRange,

    /// Extra cooldown after a cycle is rate limited, on top of the backoff
    #[serde(default = "default_rate_limited_cooldown")]
    pub rate_limited_cooldown: DelayRange,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            reconcile_every: default_reconcile_every(),
            cycle_jitter: default_cycle_jitter(),
            cycle_interval: default_cycle_interval(),
            error_cooldown: default_error_cooldown(),
            rate_limited_cooldown: default_rate_limited_cooldown(),
        }
    }
}

fn default_reconcile_every() -> u32 {
    10
}

fn default_cycle_jitter() -> DelayRange {
    DelayRange::new(60.0, 300.0)
}

fn default_cycle_interval() -> DelayRange {
    DelayRange::new(3_600.0, 14_400.0)
}

fn default_error_cooldown() -> DelayRange {
    DelayRange::new(300.0, 600.0)
}

fn default_rate_limited_cooldown() -> DelayRange {
    DelayRange::new(900.0, 3_600.0)
}

impl QuotawardConfig {
    /// Load configuration from an optional file layered under
    /// `QUOTAWARD__`-prefixed environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(config::File::from(path));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: QuotawardConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: QuotawardConfig = serde_yaml::from_str(yaml)
            .map_err(|e| QuotawardError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the core cannot operate with.
    pub fn validate(&self) -> Result<()> {
        let limits = &self.limits;
        if limits.search == 0 || limits.lookup == 0 || limits.post == 0 {
            return Err(QuotawardError::Config(
                "category limits must be positive".to_string(),
            ));
        }
        if limits.window_secs == 0 {
            return Err(QuotawardError::Config(
                "window_secs must be positive".to_string(),
            ));
        }

        let pacing = &self.pacing;
        if !(0.0 <= pacing.low_threshold
            && pacing.low_threshold <= pacing.medium_threshold
            && pacing.medium_threshold <= pacing.high_threshold)
        {
            return Err(QuotawardError::Config(format!(
                "pacing thresholds must be ascending, got {} / {} / {}",
                pacing.low_threshold, pacing.medium_threshold, pacing.high_threshold
            )));
        }

        let ranges = [
            ("pacing.moderate_delay", pacing.moderate_delay),
            ("pacing.elevated_delay", pacing.elevated_delay),
            ("pacing.critical_delay", pacing.critical_delay),
            ("budget.exhausted_sleep", self.budget.exhausted_sleep),
            ("poll.cycle_jitter", self.poll.cycle_jitter),
            ("poll.cycle_interval", self.poll.cycle_interval),
            ("poll.error_cooldown", self.poll.error_cooldown),
            ("poll.rate_limited_cooldown", self.poll.rate_limited_cooldown),
        ];
        for (name, range) in ranges {
            if !range.is_valid() {
                return Err(QuotawardError::Config(format!(
                    "{} must satisfy 0 <= min <= max, got {}..{}",
                    name, range.min, range.max
                )));
            }
        }

        let jitters = [
            ("backoff.retry_after_jitter", self.backoff.retry_after_jitter),
            ("backoff.capacity_wait_jitter", self.backoff.capacity_wait_jitter),
        ];
        for (name, jitter) in jitters {
            if jitter.min > jitter.max {
                return Err(QuotawardError::Config(format!(
                    "{} must satisfy min <= max, got {}..{}",
                    name, jitter.min, jitter.max
                )));
            }
        }

        if !(self.backoff.failure_base_secs.is_finite() && self.backoff.failure_base_secs >= 0.0) {
            return Err(QuotawardError::Config(
                "backoff.failure_base_secs must be a non-negative number".to_string(),
            ));
        }

        Ok(())
    }

    /// The resolved category limits.
    pub fn category_limits(&self) -> CategoryLimits {
        (&self.limits).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = QuotawardConfig::default();
        config.validate().unwrap();
        assert_eq!(config.limits.search, 180);
        assert_eq!(config.limits.window_secs, 900);
        assert_eq!(config.poll.reconcile_every, 10);
        assert_eq!(config.budget.monthly_read_cap, 95);
        assert_eq!(config.budget.monthly_post_cap, 490);
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = r#"
limits:
  search: 90
pacing:
  critical_delay:
    min: 60
    max: 90
"#;
        let config = QuotawardConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.limits.search, 90);
        assert_eq!(config.limits.lookup, 300);
        assert_eq!(config.pacing.critical_delay, DelayRange::new(60.0, 90.0));
        assert_eq!(config.pacing.moderate_delay, DelayRange::new(1.0, 5.0));
        assert_eq!(config.category_limits().search, 90);
    }

    #[test]
    fn test_rejects_zero_limit() {
        let err = QuotawardConfig::from_yaml("limits:\n  post: 0\n").unwrap_err();
        assert!(matches!(err, QuotawardError::Config(_)));
    }

    #[test]
    fn test_rejects_unordered_thresholds() {
        let yaml = "pacing:\n  low_threshold: 0.8\n  medium_threshold: 0.7\n";
        assert!(QuotawardConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_rejects_inverted_range() {
        let yaml = "poll:\n  cycle_interval:\n    min: 100\n    max: 10\n";
        assert!(QuotawardConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quotaward.yaml");
        std::fs::write(
            &path,
            "state:\n  snapshot_path: /tmp/snap.json\nbudget:\n  monthly_read_cap: 50\n",
        )
        .unwrap();

        let config = QuotawardConfig::load(Some(&path)).unwrap();
        assert_eq!(config.state.snapshot_path, PathBuf::from("/tmp/snap.json"));
        assert_eq!(config.budget.monthly_read_cap, 50);
        assert_eq!(config.budget.monthly_post_cap, 490);
    }
}
