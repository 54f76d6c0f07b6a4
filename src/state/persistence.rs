//! Crash-safe snapshot of window timestamps and monthly usage.
//!
//! The snapshot is one JSON document:
//!
//! ```json
//! {
//!   "reads_today": 12,
//!   "posts_today": 3,
//!   "last_reset_date": "2024-05-01",
//!   "last_check_time": "2024-05-17T09:30:00.000Z",
//!   "search_timestamps": [1715938200.5],
//!   "tweet_lookup_timestamps": [],
//!   "post_tweet_timestamps": []
//! }
//! ```
//!
//! Saving writes a `.tmp` sibling, copies the live file to a `.bak` sibling
//! and renames the temporary file over the live one, so the live path only
//! ever holds a complete document. Loading validates every field on its own
//! and falls back to the backup, then to defaults, instead of failing.

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

use super::usage::UsageCounters;
use super::{ensure_parent, sibling_path, write_synced};
use crate::clock::epoch_secs;
use crate::error::{QuotawardError, Result};
use crate::ratelimit::{RequestCategory, SlidingWindowTracker};

/// Timestamps older than this (relative to load time) are rejected.
const MAX_TIMESTAMP_AGE_SECS: f64 = 86_400.0;
/// Timestamps further than this in the future are rejected.
const MAX_CLOCK_SKEW_SECS: f64 = 60.0;

/// Everything persisted per cycle, as one atomic unit.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedSnapshot {
    pub reads: u64,
    pub posts: u64,
    pub period_anchor: NaiveDate,
    pub last_check: DateTime<Utc>,
    pub search: Vec<f64>,
    pub lookup: Vec<f64>,
    pub post: Vec<f64>,
}

impl PersistedSnapshot {
    /// Zero counters and empty windows.
    pub fn empty(now: DateTime<Utc>) -> Self {
        Self {
            reads: 0,
            posts: 0,
            period_anchor: now.date_naive(),
            last_check: now,
            search: Vec::new(),
            lookup: Vec::new(),
            post: Vec::new(),
        }
    }

    /// Capture the current in-memory state.
    pub fn capture(
        tracker: &SlidingWindowTracker,
        usage: &UsageCounters,
        last_check: DateTime<Utc>,
    ) -> Self {
        Self {
            reads: usage.reads(),
            posts: usage.posts(),
            period_anchor: usage.period_anchor(),
            last_check,
            search: tracker.timestamps(RequestCategory::Search),
            lookup: tracker.timestamps(RequestCategory::Lookup),
            post: tracker.timestamps(RequestCategory::Post),
        }
    }

    pub fn timestamps(&self, category: RequestCategory) -> &[f64] {
        match category {
            RequestCategory::Search => &self.search,
            RequestCategory::Lookup => &self.lookup,
            RequestCategory::Post => &self.post,
        }
    }

    fn timestamps_mut(&mut self, category: RequestCategory) -> &mut Vec<f64> {
        match category {
            RequestCategory::Search => &mut self.search,
            RequestCategory::Lookup => &mut self.lookup,
            RequestCategory::Post => &mut self.post,
        }
    }

    pub fn usage(&self) -> UsageCounters {
        UsageCounters::from_parts(self.reads, self.posts, self.period_anchor)
    }

    /// Load every category's timestamps into `tracker`.
    pub fn restore_into(&self, tracker: &mut SlidingWindowTracker) {
        for category in RequestCategory::ALL {
            tracker.restore(category, self.timestamps(category).to_vec());
        }
    }

    fn to_document(&self) -> SnapshotDocument<'_> {
        SnapshotDocument {
            reads_today: self.reads,
            posts_today: self.posts,
            last_reset_date: self.period_anchor.format("%Y-%m-%d").to_string(),
            last_check_time: self.last_check.to_rfc3339_opts(SecondsFormat::Millis, true),
            search_timestamps: &self.search,
            tweet_lookup_timestamps: &self.lookup,
            post_tweet_timestamps: &self.post,
        }
    }
}

/// On-disk layout of a snapshot.
#[derive(Serialize)]
struct SnapshotDocument<'a> {
    reads_today: u64,
    posts_today: u64,
    last_reset_date: String,
    last_check_time: String,
    search_timestamps: &'a [f64],
    tweet_lookup_timestamps: &'a [f64],
    post_tweet_timestamps: &'a [f64],
}

fn timestamp_field(category: RequestCategory) -> &'static str {
    match category {
        RequestCategory::Search => "search_timestamps",
        RequestCategory::Lookup => "tweet_lookup_timestamps",
        RequestCategory::Post => "post_tweet_timestamps",
    }
}

/// Which file a loaded snapshot came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotSource {
    Live,
    Backup,
}

/// How [`StateStore::load`] arrived at its snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    /// Nothing on disk; defaults in use.
    Fresh,
    /// Something on disk could not be used; defaults in use.
    Defaulted { reason: String },
    /// A snapshot was read. `rejected` counts timestamps dropped by validation.
    Recovered {
        source: SnapshotSource,
        rejected: usize,
    },
}

/// A loaded snapshot together with how it was obtained.
#[derive(Debug, Clone)]
pub struct LoadedSnapshot {
    pub snapshot: PersistedSnapshot,
    pub outcome: LoadOutcome,
}

/// Reads and writes the snapshot file.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
    backup_path: PathBuf,
    temp_path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            backup_path: sibling_path(&path, "bak"),
            temp_path: sibling_path(&path, "tmp"),
            path,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn backup_path(&self) -> &Path {
        &self.backup_path
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    /// Load the snapshot, never failing.
    ///
    /// Order of preference: the live file, the `.bak` sibling, defaults.
    pub fn load(&self, now: DateTime<Utc>) -> LoadedSnapshot {
        let live_error = match read_snapshot(&self.path, now) {
            Ok(Some((snapshot, rejected))) => {
                return self.recovered(snapshot, SnapshotSource::Live, rejected);
            }
            Ok(None) => None,
            Err(e) => {
                error!(path = %self.path.display(), error = %e, "Failed loading state");
                Some(e)
            }
        };

        match read_snapshot(&self.backup_path, now) {
            Ok(Some((snapshot, rejected))) => {
                warn!(
                    path = %self.backup_path.display(),
                    "Live state unusable, recovered from backup"
                );
                return self.recovered(snapshot, SnapshotSource::Backup, rejected);
            }
            Ok(None) => {}
            Err(e) => {
                warn!(path = %self.backup_path.display(), error = %e, "Backup state unusable");
            }
        }

        let outcome = match live_error {
            Some(e) => {
                warn!("Using default state due to loading error");
                LoadOutcome::Defaulted {
                    reason: e.to_string(),
                }
            }
            None => {
                info!(path = %self.path.display(), "No saved state, starting fresh");
                LoadOutcome::Fresh
            }
        };
        LoadedSnapshot {
            snapshot: PersistedSnapshot::empty(now),
            outcome,
        }
    }

    fn recovered(
        &self,
        snapshot: PersistedSnapshot,
        source: SnapshotSource,
        rejected: usize,
    ) -> LoadedSnapshot {
        if rejected > 0 {
            warn!(rejected, "Some invalid timestamps were filtered from saved state");
        }
        info!(
            search = snapshot.search.len(),
            lookup = snapshot.lookup.len(),
            post = snapshot.post.len(),
            reads = snapshot.reads,
            posts = snapshot.posts,
            "Loaded saved state"
        );
        LoadedSnapshot {
            snapshot,
            outcome: LoadOutcome::Recovered { source, rejected },
        }
    }

    /// Persist `snapshot`, never failing.
    ///
    /// Returns true when the new snapshot became the live file. On failure
    /// the live file is restored from the backup if it went missing.
    pub fn save(&self, snapshot: &PersistedSnapshot) -> bool {
        match self.try_save(snapshot) {
            Ok(()) => {
                debug!(path = %self.path.display(), "Saved state");
                true
            }
            Err(e) => {
                error!(path = %self.path.display(), error = %e, "Failed saving state");
                let _ = fs::remove_file(&self.temp_path);
                self.restore_backup();
                false
            }
        }
    }

    fn try_save(&self, snapshot: &PersistedSnapshot) -> Result<()> {
        self.write_temp(snapshot)?;
        self.backup_live();
        fs::rename(&self.temp_path, &self.path)?;
        Ok(())
    }

    /// First save step: the complete document lands in the `.tmp` sibling.
    fn write_temp(&self, snapshot: &PersistedSnapshot) -> Result<()> {
        ensure_parent(&self.path)?;
        let json = serde_json::to_vec_pretty(&snapshot.to_document())?;
        write_synced(&self.temp_path, &json)
    }

    /// Copy the live file to `.bak`. Best effort.
    fn backup_live(&self) {
        if !self.path.exists() {
            return;
        }
        if let Err(e) = fs::copy(&self.path, &self.backup_path) {
            warn!(error = %e, "Failed to create backup state file");
        }
    }

    fn restore_backup(&self) {
        if self.path.exists() || !self.backup_path.exists() {
            return;
        }
        match fs::copy(&self.backup_path, &self.path) {
            Ok(_) => info!("Restored state file from backup after failed save"),
            Err(e) => error!(error = %e, "Failed to restore state from backup"),
        }
    }
}

/// Read and validate one snapshot file. `Ok(None)` when it does not exist.
fn read_snapshot(path: &Path, now: DateTime<Utc>) -> Result<Option<(PersistedSnapshot, usize)>> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    parse_snapshot(&raw, now).map(Some)
}

/// Parse a snapshot document, dropping invalid timestamps individually.
///
/// Returns the snapshot and how many timestamps were rejected. Structural
/// problems (not JSON, not an object, fields of the wrong type) are errors.
fn parse_snapshot(raw: &str, now: DateTime<Utc>) -> Result<(PersistedSnapshot, usize)> {
    let value: Value = serde_json::from_str(raw)?;
    let doc = value
        .as_object()
        .ok_or_else(|| QuotawardError::Snapshot("document is not an object".to_string()))?;

    let mut snapshot = PersistedSnapshot::empty(now);
    snapshot.reads = counter(doc, "reads_today")?;
    snapshot.posts = counter(doc, "posts_today")?;

    match doc.get("last_reset_date").and_then(Value::as_str).and_then(parse_date) {
        Some(date) => snapshot.period_anchor = date,
        None => warn!("Invalid last_reset_date in state file, using current date"),
    }
    match doc.get("last_check_time").and_then(Value::as_str).and_then(parse_datetime) {
        Some(time) => snapshot.last_check = time,
        None => warn!("Invalid last_check_time in state file, using current time"),
    }

    let now_secs = epoch_secs(now);
    let mut rejected = 0;
    for category in RequestCategory::ALL {
        let field = timestamp_field(category);
        let entries = match doc.get(field) {
            None | Some(Value::Null) => continue,
            Some(Value::Array(entries)) => entries,
            Some(_) => {
                return Err(QuotawardError::Snapshot(format!("{} is not an array", field)));
            }
        };

        let valid: Vec<f64> = entries
            .iter()
            .filter_map(|entry| timestamp_value(entry, now_secs))
            .collect();
        rejected += entries.len() - valid.len();
        *snapshot.timestamps_mut(category) = valid;
    }

    Ok((snapshot, rejected))
}

/// A non-negative counter. Missing means zero; negatives clamp to zero.
fn counter(doc: &Map<String, Value>, field: &str) -> Result<u64> {
    let value = match doc.get(field) {
        None | Some(Value::Null) => return Ok(0),
        Some(value) => value,
    };
    let number = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match number {
        Some(n) if n.is_finite() => Ok(n.max(0.0) as u64),
        _ => Err(QuotawardError::Snapshot(format!("{} is not a number", field))),
    }
}

/// A timestamp within `(now - 24h, now + 60s]`, or `None`.
fn timestamp_value(entry: &Value, now: f64) -> Option<f64> {
    let ts = match entry {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    let valid = ts.is_finite() && now - MAX_TIMESTAMP_AGE_SECS < ts && ts <= now + MAX_CLOCK_SKEW_SECS;
    valid.then_some(ts)
}

fn parse_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .or_else(|| parse_datetime(raw).map(|t| t.date_naive()))
}

/// RFC 3339, or a naive ISO-8601 datetime taken as UTC.
fn parse_datetime(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(time) = DateTime::parse_from_rfc3339(raw) {
        return Some(time.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}
