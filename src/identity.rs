//! One-way hashing of user identifiers.
//!
//! Raw identifiers are never persisted or compared; only their SHA-256 hex
//! digest is. Logs see at most the last few characters of the raw value.

use sha2::{Digest, Sha256};

/// Characters of the raw identifier revealed by [`redact`].
const VISIBLE_SUFFIX: usize = 4;

/// Hash a user identifier into a 64-character lowercase hex digest.
pub fn hash_identity(identity: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(identity.as_bytes());
    hex::encode(hasher.finalize())
}

/// Log-safe form of a raw identifier: `...` followed by its last 4 characters.
pub fn redact(identity: &str) -> String {
    let count = identity.chars().count();
    let suffix: String = identity
        .chars()
        .skip(count.saturating_sub(VISIBLE_SUFFIX))
        .collect();
    format!("...{}", suffix)
}
