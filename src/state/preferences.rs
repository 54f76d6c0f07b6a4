//! Durable opt-in / opt-out record keyed by hashed identity.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

use super::write_atomic;
use crate::error::{QuotawardError, Result};
use crate::identity::{hash_identity, redact};

/// A user's stated preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preference {
    OptIn,
    OptOut,
}

impl std::fmt::Display for Preference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Preference::OptIn => write!(f, "opted in"),
            Preference::OptOut => write!(f, "opted out"),
        }
    }
}

/// On-disk layout: two lists of identity digests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreferenceRecord {
    #[serde(default)]
    pub opt_out: Vec<String>,
    #[serde(default)]
    pub opt_in: Vec<String>,
}

impl PreferenceRecord {
    /// Move `digest` into the set named by `preference`, leaving the lists
    /// disjoint and free of duplicates. Returns true if anything changed.
    fn apply(&mut self, digest: &str, preference: Preference) -> bool {
        let (target, other) = match preference {
            Preference::OptOut => (&mut self.opt_out, &mut self.opt_in),
            Preference::OptIn => (&mut self.opt_in, &mut self.opt_out),
        };
        let before = other.len();
        other.retain(|d| d != digest);
        let mut changed = other.len() != before;
        if !target.iter().any(|d| d == digest) {
            target.push(digest.to_string());
            changed = true;
        }
        changed
    }

    /// Drop duplicates, and drop opt-in entries that are also opted out.
    fn normalize(&mut self) {
        let mut seen = HashSet::new();
        self.opt_out.retain(|d| seen.insert(d.clone()));
        let opted_out = seen;
        let mut seen = HashSet::new();
        self.opt_in
            .retain(|d| !opted_out.contains(d) && seen.insert(d.clone()));
    }
}

/// Opt-in / opt-out sets with an in-memory cache.
///
/// Lookups only touch the cache. Mutations re-read the file, apply the
/// change and write it back, so entries added by someone else since the
/// last load are kept (last writer wins on the same identity). Changes
/// whose write failed are replayed onto every later re-read until one
/// write succeeds.
#[derive(Debug)]
pub struct PreferenceStore {
    path: PathBuf,
    opted_out: HashSet<String>,
    opted_in: HashSet<String>,
    /// Digest -> preference for changes not yet on disk
    unsaved: HashMap<String, Preference>,
}

impl PreferenceStore {
    /// Load preferences from `path`. An unreadable file yields empty sets.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let record = match read_record(&path) {
            Ok(Some(record)) => record,
            Ok(None) => {
                debug!(path = %path.display(), "No preferences file, starting empty");
                PreferenceRecord::default()
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "Failed loading preferences, starting empty");
                PreferenceRecord::default()
            }
        };

        let mut store = Self {
            path,
            opted_out: HashSet::new(),
            opted_in: HashSet::new(),
            unsaved: HashMap::new(),
        };
        store.replace_cache(&record);
        info!(
            opted_out = store.opted_out.len(),
            opted_in = store.opted_in.len(),
            "Loaded user preferences"
        );
        store
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record that `identity` opted out. Returns true if the change was persisted.
    pub fn opt_out(&mut self, identity: &str) -> bool {
        self.set_preference(identity, Preference::OptOut)
    }

    /// Record that `identity` opted in. Returns true if the change was persisted.
    pub fn opt_in(&mut self, identity: &str) -> bool {
        self.set_preference(identity, Preference::OptIn)
    }

    /// Record `preference` for `identity`.
    ///
    /// The cache reflects the change even when writing the file fails;
    /// the return value says whether it reached disk.
    pub fn set_preference(&mut self, identity: &str, preference: Preference) -> bool {
        let digest = hash_identity(identity);

        let mut record = match read_record(&self.path) {
            Ok(Some(record)) => record,
            Ok(None) => self.cached_record(),
            Err(e) => {
                warn!(error = %e, "Preferences file unreadable, rewriting from memory");
                self.cached_record()
            }
        };
        for (pending, pending_preference) in &self.unsaved {
            record.apply(pending, *pending_preference);
        }
        let changed = record.apply(&digest, preference);
        record.normalize();
        self.replace_cache(&record);

        let persisted = match write_record(&self.path, &record) {
            Ok(()) => {
                self.unsaved.clear();
                true
            }
            Err(e) => {
                error!(path = %self.path.display(), error = %e, "Failed saving preferences");
                self.unsaved.insert(digest, preference);
                false
            }
        };

        if changed {
            info!(user = %redact(identity), "User {}", preference);
        } else {
            debug!(user = %redact(identity), "User already {}", preference);
        }
        persisted
    }

    /// Cache-only check.
    pub fn is_opted_out(&self, identity: &str) -> bool {
        self.opted_out.contains(&hash_identity(identity))
    }

    /// The recorded preference for `identity`, if any.
    pub fn preference(&self, identity: &str) -> Option<Preference> {
        let digest = hash_identity(identity);
        if self.opted_out.contains(&digest) {
            Some(Preference::OptOut)
        } else if self.opted_in.contains(&digest) {
            Some(Preference::OptIn)
        } else {
            None
        }
    }

    pub fn opted_out_count(&self) -> usize {
        self.opted_out.len()
    }

    pub fn opted_in_count(&self) -> usize {
        self.opted_in.len()
    }

    fn cached_record(&self) -> PreferenceRecord {
        let mut opt_out: Vec<String> = self.opted_out.iter().cloned().collect();
        let mut opt_in: Vec<String> = self.opted_in.iter().cloned().collect();
        opt_out.sort();
        opt_in.sort();
        PreferenceRecord { opt_out, opt_in }
    }

    fn replace_cache(&mut self, record: &PreferenceRecord) {
        self.opted_out = record.opt_out.iter().cloned().collect();
        self.opted_in = record
            .opt_in
            .iter()
            .filter(|d| !self.opted_out.contains(*d))
            .cloned()
            .collect();
    }
}

fn write_record(path: &Path, record: &PreferenceRecord) -> Result<()> {
    let json = serde_json::to_vec_pretty(record)?;
    write_atomic(path, &json)
}

/// Read the preferences file, dropping elements that are neither strings
/// nor integers. `Ok(None)` when the file does not exist.
fn read_record(path: &Path) -> Result<Option<PreferenceRecord>> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let value: Value = serde_json::from_str(&raw)?;
    let doc = value.as_object().ok_or_else(|| {
        QuotawardError::Snapshot("preferences document is not an object".to_string())
    })?;

    let mut record = PreferenceRecord {
        opt_out: digests(doc.get("opt_out")),
        opt_in: digests(doc.get("opt_in")),
    };
    record.normalize();
    Ok(Some(record))
}

fn digests(value: Option<&Value>) -> Vec<String> {
    let Some(Value::Array(entries)) = value else {
        return Vec::new();
    };
    entries
        .iter()
        .filter_map(|entry| match entry {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) if n.is_i64() || n.is_u64() => Some(n.to_string()),
            _ => None,
        })
        .collect()
}
