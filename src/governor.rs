//! The rate-limiting state aggregate.
//!
//! [`Governor`] owns the sliding windows, the monthly counters, the
//! preference cache and the stores backing them. It is constructed once by
//! the orchestrator and passed by `&mut` to whatever drives requests; there
//! is no global state. The transport never runs through here: callers ask
//! before a request ([`Governor::prepare`], [`Governor::can_proceed`]) and
//! report the outcome afterwards ([`Governor::complete`]).

use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::{BudgetConfig, QuotawardConfig};
use crate::ratelimit::{
    BackoffPolicy, CategoryLimits, QuotaStatusSource, ReconcileSummary, Reconciler,
    RequestCategory, RequestOutcome, SlidingWindowTracker, UsageLevel,
};
use crate::state::{
    LoadOutcome, PersistedSnapshot, Preference, PreferenceStore, StateStore, UsageCounters,
};

/// Which monthly cap has been reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetExhausted {
    Reads { used: u64, cap: u64 },
    Posts { used: u64, cap: u64 },
}

impl fmt::Display for BudgetExhausted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BudgetExhausted::Reads { used, cap } => {
                write!(f, "monthly read limit reached ({}/{})", used, cap)
            }
            BudgetExhausted::Posts { used, cap } => {
                write!(f, "monthly post limit reached ({}/{})", used, cap)
            }
        }
    }
}

/// Point-in-time view of one category's window.
#[derive(Debug, Clone, PartialEq)]
pub struct CategoryStatus {
    pub category: RequestCategory,
    pub used: usize,
    pub limit: u32,
    pub ratio: f64,
    pub level: UsageLevel,
    pub seconds_until_capacity: f64,
}

/// Rate limiting, backoff and durable state for one poller process.
pub struct Governor {
    limits: CategoryLimits,
    tracker: SlidingWindowTracker,
    usage: UsageCounters,
    last_check: DateTime<Utc>,
    store: StateStore,
    preferences: PreferenceStore,
    policy: BackoffPolicy,
    reconciler: Reconciler,
    budget: BudgetConfig,
    clock: Arc<dyn Clock>,
    load_outcome: LoadOutcome,
}

impl Governor {
    /// Build the aggregate from configuration, loading both state files.
    pub fn open(config: &QuotawardConfig, clock: Arc<dyn Clock>) -> Self {
        let store = StateStore::new(&config.state.snapshot_path);
        let preferences = PreferenceStore::load(&config.state.preferences_path);
        let now = clock.now();

        let limits = config.category_limits();
        let mut governor = Self {
            limits,
            tracker: SlidingWindowTracker::new(limits),
            usage: UsageCounters::new(now.date_naive()),
            last_check: now,
            store,
            preferences,
            policy: BackoffPolicy::new(config.pacing.clone(), config.backoff.clone()),
            reconciler: Reconciler::new(config.poll.reconcile_every),
            budget: config.budget.clone(),
            clock,
            load_outcome: LoadOutcome::Fresh,
        };
        governor.reload();
        governor
    }

    fn now_secs(&self) -> f64 {
        self.clock.now_secs()
    }

    /// Replace in-memory state with what is on disk.
    pub fn reload(&mut self) -> &LoadOutcome {
        let now = self.clock.now();
        let loaded = self.store.load(now);

        let mut tracker = SlidingWindowTracker::new(self.limits);
        loaded.snapshot.restore_into(&mut tracker);
        tracker.prune(self.now_secs());

        self.tracker = tracker;
        self.usage = loaded.snapshot.usage();
        self.last_check = loaded.snapshot.last_check;
        self.load_outcome = loaded.outcome;
        if self.usage.check_reset(now.date_naive()) {
            self.save();
        }
        &self.load_outcome
    }

    /// How the last load went.
    pub fn load_outcome(&self) -> &LoadOutcome {
        &self.load_outcome
    }

    /// Persist the current snapshot. Failures are logged, never raised.
    pub fn save(&mut self) -> bool {
        let snapshot = PersistedSnapshot::capture(&self.tracker, &self.usage, self.last_check);
        self.store.save(&snapshot)
    }

    pub fn can_proceed(&mut self, category: RequestCategory) -> bool {
        let now = self.now_secs();
        self.tracker.can_proceed(category, now)
    }

    /// Record an attempted request and save. Does not check capacity.
    pub fn record_request(&mut self, category: RequestCategory) {
        self.track(category);
        self.save();
    }

    fn track(&mut self, category: RequestCategory) {
        let now = self.now_secs();
        self.tracker.record(category, now);
    }

    pub fn usage_ratio(&mut self, category: RequestCategory) -> f64 {
        let now = self.now_secs();
        self.tracker.usage_ratio(category, now)
    }

    pub fn seconds_until_capacity(&mut self, category: RequestCategory) -> f64 {
        let now = self.now_secs();
        self.tracker.seconds_until_capacity(category, now)
    }

    /// Proactive delay for the next request of `category`, without sleeping.
    pub fn pacing_delay(&mut self, category: RequestCategory) -> Duration {
        let ratio = self.usage_ratio(category);
        self.policy.pacing_delay(ratio)
    }

    /// Sleep for the proactive delay of `category`.
    pub async fn pace(&mut self, category: RequestCategory) -> Duration {
        let ratio = self.usage_ratio(category);
        self.policy.pace(ratio).await
    }

    /// If `category` is at its limit, sleep until its oldest entry expires
    /// plus jitter. Returns how long was slept.
    pub async fn wait_for_capacity(&mut self, category: RequestCategory) -> Duration {
        if self.can_proceed(category) {
            return Duration::ZERO;
        }
        let until = self.seconds_until_capacity(category);
        let wait = self.policy.capacity_wait(until);
        warn!(
            category = %category,
            "Rate limit reached, waiting {:.0}s for window to reset",
            wait.as_secs_f64()
        );
        tokio::time::sleep(wait).await;
        wait
    }

    /// Everything to do before attempting a request: pacing, then waiting
    /// for capacity if the window is full.
    pub async fn prepare(&mut self, category: RequestCategory) -> Duration {
        let paced = self.pace(category).await;
        paced + self.wait_for_capacity(category).await
    }

    /// Everything to do after an attempt: record it, count successes toward
    /// the monthly budget, back off on failure and save.
    ///
    /// Returns the backoff slept, zero on success.
    pub async fn complete(
        &mut self,
        category: RequestCategory,
        outcome: &RequestOutcome,
    ) -> Duration {
        self.track(category);
        let slept = if outcome.is_success() {
            let today = self.clock.now().date_naive();
            if category.is_read() {
                self.usage.record_read(today);
            } else {
                self.usage.record_post(today);
            }
            Duration::ZERO
        } else {
            self.reactive_backoff(category, outcome).await
        };
        self.save();
        slept
    }

    /// Sleep as the provider's signal for a `category` request demands.
    pub async fn reactive_backoff(
        &mut self,
        category: RequestCategory,
        outcome: &RequestOutcome,
    ) -> Duration {
        let ratio = self.usage_ratio(category);
        self.policy.backoff(outcome, ratio).await
    }

    /// Count one read toward the monthly budget and save.
    pub fn record_read(&mut self) -> u64 {
        let today = self.clock.now().date_naive();
        let reads = self.usage.record_read(today);
        self.save();
        reads
    }

    /// Count one post toward the monthly budget and save.
    pub fn record_post(&mut self) -> u64 {
        let today = self.clock.now().date_naive();
        let posts = self.usage.record_post(today);
        self.save();
        posts
    }

    pub fn usage(&self) -> &UsageCounters {
        &self.usage
    }

    /// The monthly cap currently reached, if any. Rolls the counters over
    /// first when the month has changed.
    pub fn budget_exhausted(&mut self) -> Option<BudgetExhausted> {
        if self.usage.check_reset(self.clock.now().date_naive()) {
            self.save();
        }
        if self.usage.reads() >= self.budget.monthly_read_cap {
            return Some(BudgetExhausted::Reads {
                used: self.usage.reads(),
                cap: self.budget.monthly_read_cap,
            });
        }
        if self.usage.posts() >= self.budget.monthly_post_cap {
            return Some(BudgetExhausted::Posts {
                used: self.usage.posts(),
                cap: self.budget.monthly_post_cap,
            });
        }
        None
    }

    pub fn budget(&self) -> &BudgetConfig {
        &self.budget
    }

    /// Mark that a check against the provider just completed, and save.
    pub fn touch_check_time(&mut self) {
        self.last_check = self.clock.now();
        debug!(last_check = %self.last_check, "Updated last check time");
        self.save();
    }

    pub fn last_check_time(&self) -> DateTime<Utc> {
        self.last_check
    }

    pub fn is_opted_out(&self, identity: &str) -> bool {
        self.preferences.is_opted_out(identity)
    }

    pub fn preference(&self, identity: &str) -> Option<Preference> {
        self.preferences.preference(identity)
    }

    /// Record a user's preference. Returns whether it reached disk.
    pub fn set_preference(&mut self, identity: &str, preference: Preference) -> bool {
        self.preferences.set_preference(identity, preference)
    }

    pub fn preferences(&self) -> &PreferenceStore {
        &self.preferences
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Count a poll cycle and reconcile against `source` when due.
    pub async fn reconcile_if_due<S>(&mut self, source: &S) -> Option<ReconcileSummary>
    where
        S: QuotaStatusSource + ?Sized,
    {
        if !self.reconciler.tick() {
            return None;
        }
        Some(self.reconcile(source).await)
    }

    /// Reconcile against `source` now, saving if anything was corrected.
    pub async fn reconcile<S>(&mut self, source: &S) -> ReconcileSummary
    where
        S: QuotaStatusSource + ?Sized,
    {
        info!("Checking provider rate limit status");
        let now = self.now_secs();
        let summary = self.reconciler.reconcile(&mut self.tracker, source, now).await;
        if let ReconcileSummary::Checked { corrections, .. } = &summary {
            if !corrections.is_empty() {
                self.save();
            }
        }
        summary
    }

    /// Current occupancy of every category.
    pub fn status(&mut self) -> Vec<CategoryStatus> {
        let now = self.now_secs();
        RequestCategory::ALL
            .into_iter()
            .map(|category| {
                let ratio = self.tracker.usage_ratio(category, now);
                CategoryStatus {
                    category,
                    used: self.tracker.live_count(category, now),
                    limit: self.tracker.limit(category),
                    ratio,
                    level: UsageLevel::from_ratio(ratio),
                    seconds_until_capacity: self.tracker.seconds_until_capacity(category, now),
                }
            })
            .collect()
    }
}

impl fmt::Debug for Governor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Governor")
            .field("tracker", &self.tracker)
            .field("usage", &self.usage)
            .field("last_check", &self.last_check)
            .field("store", &self.store)
            .field("load_outcome", &self.load_outcome)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::{QuotawardError, Result};
    use crate::ratelimit::QuotaReport;
    use crate::state::SnapshotSource;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};

    const START: i64 = 1_717_200_000; // 2024-06-01T00:00:00Z

    fn config_in(dir: &tempfile::TempDir) -> QuotawardConfig {
        let mut config = QuotawardConfig::default();
        config.state.snapshot_path = dir.path().join("bot_state.json");
        config.state.preferences_path = dir.path().join("user_prefs.json");
        config
    }

    fn open(dir: &tempfile::TempDir) -> (Governor, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::at_secs(START));
        let governor = Governor::open(&config_in(dir), clock.clone());
        (governor, clock)
    }

    struct FixedSource(QuotaReport);

    #[async_trait]
    impl QuotaStatusSource for FixedSource {
        async fn quota_status(&self) -> Result<QuotaReport> {
            Ok(self.0.clone())
        }
    }

    struct Unreachable;

    #[async_trait]
    impl QuotaStatusSource for Unreachable {
        async fn quota_status(&self) -> Result<QuotaReport> {
            Err(QuotawardError::QuotaStatus("connection refused".to_string()))
        }
    }

    #[test]
    fn test_open_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let (mut governor, _) = open(&dir);
        assert_eq!(governor.load_outcome(), &LoadOutcome::Fresh);
        assert!(governor.can_proceed(RequestCategory::Search));
        assert_eq!(governor.usage_ratio(RequestCategory::Post), 0.0);
        assert_eq!(governor.budget_exhausted(), None);
    }

    #[test]
    fn test_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let (mut governor, clock) = open(&dir);
        for _ in 0..3 {
            governor.record_request(RequestCategory::Lookup);
        }
        governor.record_read();
        governor.record_post();

        clock.advance(Duration::from_secs(60));
        let mut reopened = Governor::open(&config_in(&dir), clock.clone());
        assert_eq!(
            reopened.load_outcome(),
            &LoadOutcome::Recovered {
                source: SnapshotSource::Live,
                rejected: 0
            }
        );
        assert_eq!(reopened.usage().reads(), 1);
        assert_eq!(reopened.usage().posts(), 1);
        assert_eq!(reopened.status()[1].used, 3);
    }

    #[test]
    fn test_record_request_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let (mut governor, clock) = open(&dir);
        governor.record_request(RequestCategory::Post);
        drop(governor);

        let mut reopened = Governor::open(&config_in(&dir), clock);
        assert_eq!(reopened.status()[2].used, 1);
    }

    #[test]
    fn test_budget_caps() {
        let dir = tempfile::tempdir().unwrap();
        let (mut governor, _) = open(&dir);
        for _ in 0..95 {
            governor.record_read();
        }
        assert_eq!(
            governor.budget_exhausted(),
            Some(BudgetExhausted::Reads { used: 95, cap: 95 })
        );
    }

    #[test]
    fn test_budget_resets_with_month() {
        let dir = tempfile::tempdir().unwrap();
        let (mut governor, clock) = open(&dir);
        for _ in 0..95 {
            governor.record_read();
        }
        clock.set(Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 1).unwrap());
        assert_eq!(governor.budget_exhausted(), None);
        assert_eq!(governor.usage().reads(), 0);
    }

    #[test]
    fn test_touch_check_time() {
        let dir = tempfile::tempdir().unwrap();
        let (mut governor, clock) = open(&dir);
        clock.advance(Duration::from_secs(3_600));
        governor.touch_check_time();
        assert_eq!(governor.last_check_time(), clock.now());

        let reopened = Governor::open(&config_in(&dir), clock.clone());
        assert_eq!(reopened.last_check_time(), clock.now());
    }

    #[test]
    fn test_preferences_through_governor() {
        let dir = tempfile::tempdir().unwrap();
        let (mut governor, _) = open(&dir);
        assert!(governor.set_preference("42", Preference::OptOut));
        assert!(governor.is_opted_out("42"));
        assert!(governor.set_preference("42", Preference::OptIn));
        assert!(!governor.is_opted_out("42"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_complete_counts_success_toward_budget() {
        let dir = tempfile::tempdir().unwrap();
        let (mut governor, _) = open(&dir);

        let slept = governor
            .complete(RequestCategory::Search, &RequestOutcome::Success)
            .await;
        assert_eq!(slept, Duration::ZERO);
        governor
            .complete(RequestCategory::Post, &RequestOutcome::Success)
            .await;

        assert_eq!(governor.usage().reads(), 1);
        assert_eq!(governor.usage().posts(), 1);
        assert!(dir.path().join("bot_state.json").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_complete_rate_limited_backs_off_without_counting() {
        let dir = tempfile::tempdir().unwrap();
        let (mut governor, _) = open(&dir);

        let outcome = RequestOutcome::rate_limited(Some("30"));
        let slept = governor.complete(RequestCategory::Lookup, &outcome).await;

        assert!(slept >= Duration::from_secs(35) && slept <= Duration::from_secs(45));
        assert_eq!(governor.usage().reads(), 0);
        assert_eq!(governor.status()[1].used, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_capacity_when_full() {
        let dir = tempfile::tempdir().unwrap();
        let (mut governor, clock) = open(&dir);
        for _ in 0..200 {
            governor.record_request(RequestCategory::Post);
        }
        clock.advance(Duration::from_secs(100));

        let waited = governor.wait_for_capacity(RequestCategory::Post).await;
        assert!(waited >= Duration::from_secs(805) && waited <= Duration::from_secs(820));

        assert_eq!(
            governor.wait_for_capacity(RequestCategory::Search).await,
            Duration::ZERO
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_prepare_idle_category_is_immediate() {
        let dir = tempfile::tempdir().unwrap();
        let (mut governor, _) = open(&dir);
        assert_eq!(governor.prepare(RequestCategory::Search).await, Duration::ZERO);
    }

    #[tokio::test]
    async fn test_reconcile_on_cadence() {
        let dir = tempfile::tempdir().unwrap();
        let (mut governor, _) = open(&dir);
        for _ in 0..100 {
            governor.record_request(RequestCategory::Search);
        }
        let source = FixedSource(QuotaReport::new().with(RequestCategory::Search, 150, 180));

        for _ in 0..9 {
            assert!(governor.reconcile_if_due(&source).await.is_none());
        }
        let summary = governor.reconcile_if_due(&source).await.unwrap();
        match summary {
            ReconcileSummary::Checked { corrections, .. } => {
                assert_eq!(corrections.len(), 1);
                assert_eq!(corrections[0].kept, 30);
            }
            other => panic!("unexpected summary: {:?}", other),
        }
        assert_eq!(governor.status()[0].used, 30);
    }

    #[tokio::test]
    async fn test_unreachable_source_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let (mut governor, _) = open(&dir);
        governor.record_request(RequestCategory::Search);

        let summary = governor.reconcile(&Unreachable).await;
        assert!(matches!(summary, ReconcileSummary::Skipped { .. }));
        assert_eq!(governor.status()[0].used, 1);
    }
}
