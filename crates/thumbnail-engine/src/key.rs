//! Cache keys and content signatures.
//!
//! A `CacheKey` is a normalized absolute path: two raw spellings of the same
//! file fold to the same key. A `ContentSignature` is derived from the
//! file's size and modification time and is the only invalidation oracle —
//! a stored timestamp is never trusted on its own, because timestamp
//! precision and formatting differ across stores.

use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::Metadata;
use std::path::Path;
use std::time::UNIX_EPOCH;

/// Normalized cache key for a file path.
///
/// Normalization: canonicalized absolute path, backslashes folded to `/`,
/// case folded. Distinct raw paths referring to the same file compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn from_path(path: &Path) -> Self {
        let absolute = path.canonicalize().unwrap_or_else(|_| {
            // Nonexistent or unresolvable paths still need a stable key so
            // failures can be tracked against them.
            match std::env::current_dir() {
                Ok(cwd) => cwd.join(path),
                Err(_) => path.to_path_buf(),
            }
        });
        let folded = absolute
            .to_string_lossy()
            .replace('\\', "/")
            .to_lowercase();
        CacheKey(folded)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Content signature derived from `(file_size, mtime)`.
///
/// Two reads of an unmodified file produce identical signatures; any write
/// that changes size or mtime changes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentSignature(String);

impl ContentSignature {
    /// Compute from a fresh stat of the live file. Falls back to hashing the
    /// key itself when the stat fails, which can never collide with a real
    /// size/mtime signature for the same file.
    pub fn probe(path: &Path, key: &CacheKey) -> Self {
        match std::fs::metadata(path) {
            Ok(meta) => Self::from_metadata(&meta),
            Err(_) => Self::of_key(key),
        }
    }

    pub fn from_metadata(meta: &Metadata) -> Self {
        let mtime_millis = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis())
            .unwrap_or(0);
        Self::from_parts(meta.len(), mtime_millis)
    }

    pub fn from_parts(file_size: u64, mtime_millis: u128) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"size+mtime:");
        hasher.update(file_size.to_le_bytes());
        hasher.update(mtime_millis.to_le_bytes());
        Self::finish(hasher)
    }

    fn of_key(key: &CacheKey) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"key-fallback:");
        hasher.update(key.as_str().as_bytes());
        Self::finish(hasher)
    }

    fn finish(hasher: Sha256) -> Self {
        let digest = hasher.finalize();
        // First 16 bytes (32 hex chars): compact but collision-resistant.
        ContentSignature(hex::encode(&digest[..16]))
    }

    /// Rehydrate a signature loaded from the persistent tier.
    pub fn from_stored(value: String) -> Self {
        ContentSignature(value)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
