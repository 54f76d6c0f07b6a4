//! Poll cycle driver.
//!
//! One cycle: randomized pre-cycle wait, monthly budget guard, periodic
//! reconciliation, then the task itself, followed by a randomized idle
//! interval (or an error cooldown when the task failed). Cycles run
//! sequentially on one task; only the sleeps are suspension points.

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::config::PollConfig;
use crate::error::{QuotawardError, Result};
use crate::governor::{BudgetExhausted, Governor};
use crate::ratelimit::{DelayRange, QuotaStatusSource, RequestOutcome};

/// The work done in each poll cycle.
///
/// Implementations issue their own requests, asking the governor before
/// each one ([`Governor::prepare`]) and reporting afterwards
/// ([`Governor::complete`]). Returning [`QuotawardError::RateLimited`]
/// makes the poller back off and apply the longer rate-limit cooldown.
#[async_trait]
pub trait PollTask: Send {
    async fn run_cycle(&mut self, governor: &mut Governor) -> Result<()>;
}

/// What happened in one cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// The task ran to completion.
    Completed,
    /// A monthly cap was reached; the cycle idled instead of running the task.
    BudgetExhausted(BudgetExhausted),
    /// The provider rate limited the task; backoff and cooldown were applied.
    RateLimited { retry_after: Option<i64> },
    /// The task failed and the error cooldown was applied.
    Failed { reason: String },
}

/// Runs a [`PollTask`] forever, or until told to stop.
pub struct Poller<T> {
    governor: Governor,
    task: T,
    quota_source: Option<Box<dyn QuotaStatusSource>>,
    config: PollConfig,
    cycles: u64,
}

impl<T: PollTask> Poller<T> {
    pub fn new(governor: Governor, task: T, config: PollConfig) -> Self {
        Self {
            governor,
            task,
            quota_source: None,
            config,
            cycles: 0,
        }
    }

    /// Reconcile against `source` every `reconcile_every` cycles.
    pub fn with_quota_source(mut self, source: Box<dyn QuotaStatusSource>) -> Self {
        self.quota_source = Some(source);
        self
    }

    pub fn governor(&self) -> &Governor {
        &self.governor
    }

    pub fn governor_mut(&mut self) -> &mut Governor {
        &mut self.governor
    }

    pub fn task(&self) -> &T {
        &self.task
    }

    /// Cycles started so far.
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn into_governor(self) -> Governor {
        self.governor
    }

    /// Run a single cycle, including its trailing idle time.
    pub async fn run_cycle(&mut self) -> CycleOutcome {
        self.cycles += 1;
        sleep_in(self.config.cycle_jitter).await;

        if let Some(exhausted) = self.governor.budget_exhausted() {
            warn!("Approaching {}, sleeping for a day", exhausted);
            sleep_in(self.governor.budget().exhausted_sleep).await;
            return CycleOutcome::BudgetExhausted(exhausted);
        }

        if let Some(source) = self.quota_source.as_deref() {
            self.governor.reconcile_if_due(source).await;
        }

        match self.task.run_cycle(&mut self.governor).await {
            Ok(()) => {
                let idle = sleep_in(self.config.cycle_interval).await;
                info!(cycle = self.cycles, "Cycle finished, idled {:.0}s", idle.as_secs_f64());
                CycleOutcome::Completed
            }
            Err(QuotawardError::RateLimited { retry_after }) => {
                warn!(cycle = self.cycles, "Rate limited, cooling off");
                let outcome = RequestOutcome::RateLimited { retry_after };
                self.governor.policy().backoff(&outcome, 0.0).await;
                sleep_in(self.config.rate_limited_cooldown).await;
                CycleOutcome::RateLimited { retry_after }
            }
            Err(e) => {
                error!(cycle = self.cycles, error = %e, "Cycle failed, cooling down");
                sleep_in(self.config.error_cooldown).await;
                CycleOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        }
    }

    /// Run cycles until `shutdown` resolves, then save state.
    ///
    /// A cycle in progress when shutdown fires is abandoned at its current
    /// suspension point. Returns the number of cycles started.
    pub async fn run_until<F>(&mut self, shutdown: F) -> u64
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!(cycles = self.cycles, "Shutdown requested, stopping poll loop");
                    break;
                }
                _ = self.run_cycle() => {}
            }
        }
        self.governor.save();
        self.cycles
    }
}

/// Sleep for a duration drawn from `range`, returning it.
async fn sleep_in(range: DelayRange) -> Duration {
    let delay = range.sample_duration(&mut rand::thread_rng());
    tokio::time::sleep(delay).await;
    delay
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::QuotawardConfig;
    use crate::ratelimit::{QuotaReport, RequestCategory};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    struct SearchTask {
        runs: usize,
        fail: bool,
        retry_after: Option<Option<i64>>,
    }

    #[async_trait]
    impl PollTask for SearchTask {
        async fn run_cycle(&mut self, governor: &mut Governor) -> Result<()> {
            self.runs += 1;
            if let Some(retry_after) = self.retry_after {
                return Err(QuotawardError::RateLimited { retry_after });
            }
            if self.fail {
                return Err(QuotawardError::Task("search endpoint returned 500".to_string()));
            }
            governor.prepare(RequestCategory::Search).await;
            governor
                .complete(RequestCategory::Search, &RequestOutcome::Success)
                .await;
            governor.touch_check_time();
            Ok(())
        }
    }

    struct CountingSource(Arc<AtomicUsize>);

    #[async_trait]
    impl QuotaStatusSource for CountingSource {
        async fn quota_status(&self) -> Result<QuotaReport> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(QuotaReport::new())
        }
    }

    fn poller(dir: &tempfile::TempDir, fail: bool) -> Poller<SearchTask> {
        let mut config = QuotawardConfig::default();
        config.state.snapshot_path = dir.path().join("bot_state.json");
        config.state.preferences_path = dir.path().join("user_prefs.json");
        let clock = Arc::new(ManualClock::at_secs(1_717_200_000));
        let governor = Governor::open(&config, clock);
        let task = SearchTask {
            runs: 0,
            fail,
            retry_after: None,
        };
        Poller::new(governor, task, config.poll)
    }

    #[tokio::test(start_paused = true)]
    async fn test_completed_cycle_runs_task_and_idles() {
        let dir = tempfile::tempdir().unwrap();
        let mut poller = poller(&dir, false);

        let started = Instant::now();
        assert_eq!(poller.run_cycle().await, CycleOutcome::Completed);

        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(60 + 3_600));
        assert!(elapsed <= Duration::from_secs(300 + 14_400 + 1));
        assert_eq!(poller.task().runs, 1);
        assert_eq!(poller.governor().usage().reads(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_cycle_cools_down() {
        let dir = tempfile::tempdir().unwrap();
        let mut poller = poller(&dir, true);

        let started = Instant::now();
        let outcome = poller.run_cycle().await;
        assert!(matches!(outcome, CycleOutcome::Failed { .. }));

        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(60 + 300));
        assert!(elapsed <= Duration::from_secs(300 + 600 + 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_cycle_backs_off_then_cools_down() {
        let dir = tempfile::tempdir().unwrap();
        let mut poller = poller(&dir, false);
        poller.task.retry_after = Some(Some(120));

        let started = Instant::now();
        let outcome = poller.run_cycle().await;
        assert_eq!(
            outcome,
            CycleOutcome::RateLimited {
                retry_after: Some(120)
            }
        );

        // jitter 60..300, Retry-After 120 + 5..15, cooldown 900..3600
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(60 + 125 + 900));
        assert!(elapsed <= Duration::from_secs(300 + 135 + 3_600 + 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_without_hint_uses_flat_backoff() {
        let dir = tempfile::tempdir().unwrap();
        let mut poller = poller(&dir, false);
        poller.task.retry_after = Some(None);

        let started = Instant::now();
        let outcome = poller.run_cycle().await;
        assert_eq!(outcome, CycleOutcome::RateLimited { retry_after: None });

        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(60 + 300 + 900));
        assert!(elapsed <= Duration::from_secs(300 + 360 + 3_600 + 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_budget_skips_task() {
        let dir = tempfile::tempdir().unwrap();
        let mut poller = poller(&dir, false);
        for _ in 0..95 {
            poller.governor_mut().record_read();
        }

        let started = Instant::now();
        let outcome = poller.run_cycle().await;
        assert_eq!(
            outcome,
            CycleOutcome::BudgetExhausted(BudgetExhausted::Reads { used: 95, cap: 95 })
        );
        assert_eq!(poller.task().runs, 0);
        assert!(started.elapsed() >= Duration::from_secs(60 + 86_100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconciles_every_tenth_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let mut poller =
            poller(&dir, false).with_quota_source(Box::new(CountingSource(calls.clone())));

        for _ in 0..9 {
            poller.run_cycle().await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        poller.run_cycle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_until_stops_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let mut poller = poller(&dir, false);

        // Shorter than the smallest possible first cycle.
        let shutdown = tokio::time::sleep(Duration::from_secs(30));
        assert_eq!(poller.run_until(shutdown).await, 1);
        assert_eq!(poller.task().runs, 0);
        assert!(dir.path().join("bot_state.json").exists());
    }
}
