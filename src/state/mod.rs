//! Durable state: window snapshot, monthly usage and user preferences.
//!
//! Both state files are owned by a single process. Writes go through a
//! temporary sibling and an atomic rename; there is no locking beyond that,
//! and two processes sharing the same files is undefined behavior.

mod persistence;
mod preferences;
mod usage;

pub use persistence::{LoadOutcome, LoadedSnapshot, PersistedSnapshot, SnapshotSource, StateStore};
pub use preferences::{Preference, PreferenceRecord, PreferenceStore};
pub use usage::UsageCounters;

use std::ffi::OsString;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// `path` with `.suffix` appended to its file name (`state.json` -> `state.json.bak`).
pub(crate) fn sibling_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| OsString::from("state"));
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

/// Create the parent directory of `path` if it has one.
pub(crate) fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

/// Write `contents` to `path` and flush it to disk.
pub(crate) fn write_synced(path: &Path, contents: &[u8]) -> Result<()> {
    let mut file = File::create(path)?;
    file.write_all(contents)?;
    file.sync_all()?;
    Ok(())
}

/// Replace `path` with `contents` via a `.tmp` sibling and a rename.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    ensure_parent(path)?;
    let temp = sibling_path(path, "tmp");
    if let Err(e) = write_synced(&temp, contents).and_then(|_| Ok(fs::rename(&temp, path)?)) {
        let _ = fs::remove_file(&temp);
        return Err(e);
    }
    Ok(())
}
