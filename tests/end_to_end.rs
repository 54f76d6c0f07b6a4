use std::sync::Arc;
use std::time::Duration;

use quotaward::clock::ManualClock;
use quotaward::config::QuotawardConfig;
use quotaward::ratelimit::{RequestCategory, RequestOutcome};
use quotaward::state::{LoadOutcome, SnapshotSource};
use quotaward::Governor;

fn config_in(dir: &tempfile::TempDir) -> QuotawardConfig {
    let mut config = QuotawardConfig::default();
    config.state.snapshot_path = dir.path().join("data").join("bot_state.json");
    config.state.preferences_path = dir.path().join("data").join("user_prefs.json");
    config
}

#[test]
fn full_window_blocks_until_it_slides() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::at_secs(1_700_000_000));
    let mut governor = Governor::open(&config_in(&dir), clock.clone());
    assert_eq!(governor.load_outcome(), &LoadOutcome::Fresh);

    for _ in 0..180 {
        governor.record_request(RequestCategory::Search);
    }
    assert!(!governor.can_proceed(RequestCategory::Search));
    assert_eq!(governor.seconds_until_capacity(RequestCategory::Search), 900.0);
    assert!(governor.can_proceed(RequestCategory::Lookup));

    clock.advance(Duration::from_secs(901));
    assert!(governor.can_proceed(RequestCategory::Search));
    assert_eq!(governor.seconds_until_capacity(RequestCategory::Search), 0.0);
}

#[test]
fn restart_remembers_recent_usage() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::at_secs(1_700_000_000));
    let mut governor = Governor::open(&config_in(&dir), clock.clone());

    for _ in 0..180 {
        governor.record_request(RequestCategory::Search);
    }
    assert!(governor.save());
    drop(governor);

    clock.advance(Duration::from_secs(120));
    let mut restarted = Governor::open(&config_in(&dir), clock.clone());
    assert_eq!(
        restarted.load_outcome(),
        &LoadOutcome::Recovered {
            source: SnapshotSource::Live,
            rejected: 0
        }
    );
    assert!(!restarted.can_proceed(RequestCategory::Search));
    assert_eq!(restarted.seconds_until_capacity(RequestCategory::Search), 780.0);
}

#[tokio::test(start_paused = true)]
async fn request_lifecycle_through_governor() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::at_secs(1_700_000_000));
    let mut governor = Governor::open(&config_in(&dir), clock.clone());

    assert_eq!(governor.prepare(RequestCategory::Lookup).await, Duration::ZERO);
    governor
        .complete(RequestCategory::Lookup, &RequestOutcome::Success)
        .await;

    let failure = RequestOutcome::failure("connection reset");
    let slept = governor.complete(RequestCategory::Lookup, &failure).await;
    assert!(slept >= Duration::from_secs(5) && slept < Duration::from_secs(6));

    let no_hint = RequestOutcome::rate_limited(Some("soon"));
    let slept = governor.complete(RequestCategory::Lookup, &no_hint).await;
    assert!(slept >= Duration::from_secs(300) && slept <= Duration::from_secs(360));

    assert_eq!(governor.usage().reads(), 1);
    let reopened = Governor::open(&config_in(&dir), clock);
    assert_eq!(reopened.usage().reads(), 1);
}
