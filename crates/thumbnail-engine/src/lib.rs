//! Two-tier thumbnail caching engine for Viewfinder
//!
//! Turns an arbitrary image file path into a decoded, size-bounded preview
//! bitmap. Results are cached in memory (LRU bounded by entry count and
//! bytes) and on disk (SQLite, survives restarts), validated against a
//! content signature derived from file size and mtime, with decode-failure
//! containment and background space reclamation.
//!
//! # Features
//!
//! - **Dual caching**: in-memory LRU with count and byte budgets + a
//!   persistent SQLite tier
//! - **Signature invalidation**: modified files regenerate instead of
//!   serving stale previews
//! - **Multi-strategy decoding**: extension-driven fast path with EXIF
//!   auto-orientation, content-sniffing fallback with color normalization
//! - **Failure containment**: a bounded known-bad set short-circuits
//!   repeated decode failures until the path is invalidated
//! - **Background reclamation**: stale rows are purged on a schedule, or
//!   aggressively when the backing file outgrows its ceiling
//! - **Parallel warming**: batch generation across the rayon pool

pub mod bitmap;
pub mod decode;
pub mod error;
pub mod key;
pub mod memory;
pub mod reclaim;
pub mod service;
pub mod store;

pub use bitmap::{Bitmap, RESIDENT_OVERHEAD_FACTOR};
pub use error::DecodeFailure;
pub use key::{CacheKey, ContentSignature};
pub use memory::{MemoryCache, MemoryEntry};
pub use reclaim::{ReclaimSettings, ReclamationWorker};
pub use service::{DiagnosticReport, StatsReport, ThumbnailService};
pub use store::ThumbnailStore;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Memory tier: maximum resident entries.
    pub memory_capacity: usize,
    /// Memory tier: maximum cumulative estimated bytes.
    pub memory_byte_budget: usize,
    /// Persistent tier database file. `None` uses the per-user default.
    pub db_path: Option<PathBuf>,
    /// Backing-file size that triggers aggressive reclamation.
    pub db_size_ceiling: u64,
    /// How often the reclamation loop wakes to check for size pressure.
    pub reclaim_poll_interval: Duration,
    /// How often the scheduled reclamation pass runs.
    pub reclaim_interval: Duration,
    /// Row age deleted by the scheduled pass.
    pub scheduled_max_age: Duration,
    /// Row age deleted under size pressure.
    pub pressure_max_age: Duration,
    /// Quality for the lossy stored encoding.
    pub jpeg_quality: u8,
    /// Default wall-clock decode budget per request.
    pub decode_timeout: Duration,
    /// Maximum tracked decode failures before the oldest half is dropped.
    pub known_bad_ceiling: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            memory_capacity: 1024,
            memory_byte_budget: 200 * 1024 * 1024, // 200MB
            db_path: None,
            db_size_ceiling: 512 * 1024 * 1024, // 512MB
            reclaim_poll_interval: Duration::from_secs(30),
            reclaim_interval: Duration::from_secs(6 * 60 * 60),
            scheduled_max_age: Duration::from_secs(30 * 24 * 60 * 60),
            pressure_max_age: Duration::from_secs(3 * 24 * 60 * 60),
            jpeg_quality: 85,
            decode_timeout: Duration::from_secs(10),
            known_bad_ceiling: 256,
        }
    }
}
