//! Thumbnail service: orchestrates the memory tier, persistent tier, and
//! decode pipeline, and tracks paths that recently failed to decode so
//! repeated failures stay cheap.
//!
//! Lookup order for `(path, height)`: known-bad set → memory tier →
//! persistent tier → decode, populating both tiers on a full miss. Decoding
//! runs fully parallel across callers; only the persistent-tier row
//! operations serialize.

use crate::bitmap::Bitmap;
use crate::decode;
use crate::error::DecodeFailure;
use crate::key::{CacheKey, ContentSignature};
use crate::memory::{MemoryCache, MemoryEntry};
use crate::reclaim::{ReclaimSettings, ReclamationWorker};
use crate::store::ThumbnailStore;
use crate::EngineConfig;
use anyhow::Result;
use image::{ImageDecoder, ImageReader};
use parking_lot::Mutex;
use rayon::prelude::*;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Two-tier thumbnail cache service.
///
/// Construct one per process, share it by `Arc`, and call [`shutdown`]
/// (or drop it) to stop the background reclamation loop.
///
/// [`shutdown`]: ThumbnailService::shutdown
pub struct ThumbnailService {
    config: EngineConfig,
    memory: MemoryCache,
    store: Arc<ThumbnailStore>,
    known_bad: Mutex<KnownBad>,
    decode_attempts: AtomicU64,
    store_failures: AtomicU64,
    reclaimer: Mutex<Option<ReclamationWorker>>,
}

/// Bounded record of paths that recently failed to decode, with the failure
/// classification kept for diagnostics. Exceeding the ceiling drops the
/// oldest half.
struct KnownBad {
    order: VecDeque<CacheKey>,
    kinds: HashMap<CacheKey, DecodeFailure>,
    ceiling: usize,
}

impl KnownBad {
    fn new(ceiling: usize) -> Self {
        Self {
            order: VecDeque::new(),
            kinds: HashMap::new(),
            ceiling: ceiling.max(1),
        }
    }

    fn contains(&self, key: &CacheKey) -> bool {
        self.kinds.contains_key(key)
    }

    fn record(&mut self, key: CacheKey, kind: DecodeFailure) {
        if !self.kinds.contains_key(&key) {
            self.order.push_back(key.clone());
        }
        self.kinds.insert(key, kind);

        if self.kinds.len() > self.ceiling {
            let drop_count = self.kinds.len() / 2;
            for _ in 0..drop_count {
                if let Some(old) = self.order.pop_front() {
                    self.kinds.remove(&old);
                }
            }
        }
    }

    fn remove(&mut self, key: &CacheKey) {
        if self.kinds.remove(key).is_some() {
            self.order.retain(|k| k != key);
        }
    }

    fn clear(&mut self) {
        self.order.clear();
        self.kinds.clear();
    }

    fn len(&self) -> usize {
        self.kinds.len()
    }
}

impl ThumbnailService {
    pub fn new(config: EngineConfig) -> Result<Self> {
        let store = Arc::new(match &config.db_path {
            Some(path) => ThumbnailStore::open(path)?,
            None => ThumbnailStore::open_default()?,
        });

        let reclaimer = ReclamationWorker::spawn(
            Arc::clone(&store),
            ReclaimSettings {
                poll_interval: config.reclaim_poll_interval,
                schedule_interval: config.reclaim_interval,
                scheduled_max_age: config.scheduled_max_age,
                pressure_max_age: config.pressure_max_age,
                size_ceiling_bytes: config.db_size_ceiling,
            },
        );

        Ok(Self {
            memory: MemoryCache::new(config.memory_capacity, config.memory_byte_budget),
            known_bad: Mutex::new(KnownBad::new(config.known_bad_ceiling)),
            store,
            decode_attempts: AtomicU64::new(0),
            store_failures: AtomicU64::new(0),
            reclaimer: Mutex::new(Some(reclaimer)),
            config,
        })
    }

    /// Produce a thumbnail no taller than `height` for the file at `path`,
    /// using the configured decode budget. Returns `None` for any failure —
    /// the classification lands in the known-bad set and statistics, never
    /// in the caller's lap.
    pub fn get_thumbnail(&self, path: &Path, height: u32) -> Option<Arc<Bitmap>> {
        self.get_thumbnail_with_timeout(path, height, self.config.decode_timeout)
    }

    pub fn get_thumbnail_with_timeout(
        &self,
        path: &Path,
        height: u32,
        timeout: Duration,
    ) -> Option<Arc<Bitmap>> {
        let key = CacheKey::from_path(path);

        if self.known_bad.lock().contains(&key) {
            debug!(key = %key, "short-circuiting known-bad path");
            return None;
        }

        let meta = match std::fs::metadata(path) {
            Ok(meta) => meta,
            Err(err) => {
                debug!(path = %path.display(), %err, "stat failed");
                return None;
            }
        };
        let signature = ContentSignature::from_metadata(&meta);

        if let Some(entry) = self.memory.get(&key) {
            if entry.signature == signature {
                return Some(entry.bitmap);
            }
            debug!(key = %key, "memory entry stale, regenerating");
        }

        if let Some(bitmap) = self.store.get(&key, &signature, height) {
            let bitmap = Arc::new(bitmap);
            self.memory.put(
                key,
                MemoryEntry {
                    bitmap: Arc::clone(&bitmap),
                    signature,
                },
            );
            return Some(bitmap);
        }

        self.decode_attempts.fetch_add(1, Ordering::Relaxed);
        match decode::decode(path, height, timeout) {
            Ok(bitmap) => {
                if let Err(err) =
                    self.store
                        .store(&key, &signature, &bitmap, self.config.jpeg_quality)
                {
                    // The decoded bitmap is still served; only persistence
                    // failed.
                    self.store_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(key = %key, %err, "failed to persist thumbnail");
                }
                let bitmap = Arc::new(bitmap);
                self.memory.put(
                    key,
                    MemoryEntry {
                        bitmap: Arc::clone(&bitmap),
                        signature,
                    },
                );
                Some(bitmap)
            }
            Err(failure) => {
                debug!(key = %key, failure = failure.label(), "decode failed");
                self.known_bad.lock().record(key, failure);
                None
            }
        }
    }

    /// Warm both tiers for many paths in parallel. Decode runs across the
    /// rayon pool; only the persistent-tier stores serialize. Returns each
    /// path with whether a thumbnail was produced.
    pub fn warm_batch<F>(&self, paths: &[PathBuf], height: u32, progress: F) -> Vec<(PathBuf, bool)>
    where
        F: Fn(usize, usize) + Send + Sync,
    {
        let total = paths.len();
        let completed = AtomicUsize::new(0);

        paths
            .par_iter()
            .map(|path| {
                let produced = self.get_thumbnail(path, height).is_some();
                let done = completed.fetch_add(1, Ordering::Relaxed) + 1;
                progress(done, total);
                (path.clone(), produced)
            })
            .collect()
    }

    /// Drop every trace of `path`: memory entry, persistent row, and its
    /// known-bad record, so a fixed or replaced file is retried. Safe to
    /// call for paths that were never cached.
    pub fn invalidate(&self, path: &Path) {
        let key = CacheKey::from_path(path);
        let removed_memory = self.memory.invalidate(&key);
        let removed_row = match self.store.invalidate(&key) {
            Ok(removed) => removed,
            Err(err) => {
                warn!(key = %key, %err, "persistent tier invalidate failed");
                false
            }
        };
        self.known_bad.lock().remove(&key);
        debug!(key = %key, removed_memory, removed_row, "invalidated");
    }

    /// Empty both tiers, the known-bad set, and all counters.
    pub fn clear_all(&self) {
        self.memory.clear();
        if let Err(err) = self.store.clear() {
            warn!(%err, "persistent tier clear failed");
        }
        self.known_bad.lock().clear();
        self.decode_attempts.store(0, Ordering::Relaxed);
        self.store_failures.store(0, Ordering::Relaxed);
    }

    /// Snapshot of cache health. A plain report, not a live handle.
    pub fn statistics(&self) -> StatsReport {
        StatsReport {
            memory_entries: self.memory.len(),
            memory_bytes: self.memory.total_bytes(),
            memory_byte_budget: self.memory.max_bytes(),
            memory_entry_capacity: self.memory.max_entries(),
            hits: self.memory.hits(),
            misses: self.memory.misses(),
            store_rows: self.store.row_count().unwrap_or(0),
            store_data_bytes: self.store.data_bytes().unwrap_or(0),
            store_file_bytes: self.store.file_size_bytes(),
            known_bad: self.known_bad.lock().len(),
            decode_attempts: self.decode_attempts.load(Ordering::Relaxed),
            store_failures: self.store_failures.load(Ordering::Relaxed),
        }
    }

    /// Inspect a single path for support tooling: existence, readability,
    /// header dimensions, decodability, and everything that went wrong.
    pub fn diagnose(&self, path: &Path) -> DiagnosticReport {
        let key = CacheKey::from_path(path);
        let mut report = DiagnosticReport {
            path: path.display().to_string(),
            exists: false,
            readable: false,
            file_size: 0,
            known_bad: self.known_bad.lock().contains(&key),
            decodable: false,
            width: None,
            height: None,
            color: None,
            errors: Vec::new(),
        };

        match std::fs::metadata(path) {
            Ok(meta) => {
                report.exists = true;
                report.file_size = meta.len();
            }
            Err(err) => {
                report.errors.push(format!("stat failed: {err}"));
                return report;
            }
        }

        match std::fs::File::open(path) {
            Ok(_) => report.readable = true,
            Err(err) => report.errors.push(format!("open failed: {err}")),
        }

        match ImageReader::open(path).map_err(anyhow::Error::from).and_then(|r| {
            let decoder = r.with_guessed_format()?.into_decoder()?;
            let (width, height) = decoder.dimensions();
            Ok((width, height, decoder.color_type()))
        }) {
            Ok((width, height, color)) => {
                report.width = Some(width);
                report.height = Some(height);
                report.color = Some(format!("{color:?}"));
            }
            Err(err) => report.errors.push(format!("header parse failed: {err}")),
        }

        match decode::decode(path, 256, self.config.decode_timeout) {
            Ok(_) => report.decodable = true,
            Err(failure) => report.errors.push(failure.to_string()),
        }

        report
    }

    /// Stop the background reclamation loop and wait for it. Idempotent;
    /// also runs on drop.
    pub fn shutdown(&self) {
        if let Some(mut worker) = self.reclaimer.lock().take() {
            worker.stop();
        }
    }
}

impl Drop for ThumbnailService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Point-in-time cache statistics.
#[derive(Debug, Clone, Serialize)]
pub struct StatsReport {
    pub memory_entries: usize,
    pub memory_bytes: usize,
    pub memory_byte_budget: usize,
    pub memory_entry_capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub store_rows: u64,
    pub store_data_bytes: u64,
    pub store_file_bytes: u64,
    pub known_bad: usize,
    pub decode_attempts: u64,
    pub store_failures: u64,
}

impl StatsReport {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    pub fn memory_usage_percent(&self) -> f64 {
        if self.memory_byte_budget == 0 {
            0.0
        } else {
            (self.memory_bytes as f64 / self.memory_byte_budget as f64) * 100.0
        }
    }
}

/// Per-path inspection result for support tooling.
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticReport {
    pub path: String,
    pub exists: bool,
    pub readable: bool,
    pub file_size: u64,
    pub known_bad: bool,
    pub decodable: bool,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub color: Option<String>,
    pub errors: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::DynamicImage;
    use std::fs;
    use tempfile::tempdir;

    fn test_service(dir: &Path) -> ThumbnailService {
        test_service_with(dir, |_| {})
    }

    fn test_service_with(dir: &Path, tweak: impl FnOnce(&mut EngineConfig)) -> ThumbnailService {
        let mut config = EngineConfig {
            db_path: Some(dir.join("thumbs.db")),
            ..EngineConfig::default()
        };
        tweak(&mut config);
        ThumbnailService::new(config).unwrap()
    }

    fn write_png(path: &Path, width: u32, height: u32) {
        DynamicImage::new_rgb8(width, height).save(path).unwrap();
    }

    #[test]
    fn test_full_miss_populates_both_tiers() {
        let dir = tempdir().unwrap();
        let service = test_service(dir.path());
        let file = dir.path().join("img.png");
        write_png(&file, 100, 80);

        let bm = service.get_thumbnail(&file, 40).unwrap();
        assert_eq!(bm.height(), 40);

        let stats = service.statistics();
        assert_eq!(stats.memory_entries, 1);
        assert_eq!(stats.store_rows, 1);
        assert_eq!(stats.decode_attempts, 1);
    }

    #[test]
    fn test_repeat_request_hits_memory_without_decoding() {
        let dir = tempdir().unwrap();
        let service = test_service(dir.path());
        let file = dir.path().join("img.png");
        write_png(&file, 100, 80);

        let first = service.get_thumbnail(&file, 40).unwrap();
        let second = service.get_thumbnail(&file, 40).unwrap();
        assert_eq!(first, second);

        let stats = service.statistics();
        assert_eq!(stats.decode_attempts, 1);
        assert_eq!(stats.hits, 1);
    }

    #[test]
    fn test_persistent_tier_serves_across_restart() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("img.png");
        write_png(&file, 100, 80);

        {
            let service = test_service(dir.path());
            service.get_thumbnail(&file, 40).unwrap();
            service.shutdown();
        }

        // Fresh service, same database: no decode needed.
        let service = test_service(dir.path());
        assert!(service.get_thumbnail(&file, 40).is_some());
        assert_eq!(service.statistics().decode_attempts, 0);
    }

    #[test]
    fn test_modified_file_regenerates() {
        let dir = tempdir().unwrap();
        let service = test_service(dir.path());
        let file = dir.path().join("img.png");
        write_png(&file, 100, 80);

        let before = service.get_thumbnail(&file, 1000).unwrap();
        assert_eq!(before.width(), 100);

        std::thread::sleep(Duration::from_millis(10));
        write_png(&file, 200, 80);

        let after = service.get_thumbnail(&file, 1000).unwrap();
        assert_eq!(after.width(), 200);
        assert_eq!(service.statistics().decode_attempts, 2);
    }

    #[test]
    fn test_known_bad_short_circuits_second_request() {
        let dir = tempdir().unwrap();
        let service = test_service(dir.path());
        let file = dir.path().join("corrupt.jpg");
        fs::write(&file, b"not an image at all").unwrap();

        assert!(service.get_thumbnail(&file, 100).is_none());
        assert!(service.get_thumbnail(&file, 100).is_none());
        // The second request did no decode work.
        assert_eq!(service.statistics().decode_attempts, 1);
        assert_eq!(service.statistics().known_bad, 1);
    }

    #[test]
    fn test_invalidate_allows_retry_after_fix() {
        let dir = tempdir().unwrap();
        let service = test_service(dir.path());
        let file = dir.path().join("photo.jpg");
        fs::write(&file, b"broken").unwrap();

        assert!(service.get_thumbnail(&file, 50).is_none());
        assert_eq!(service.statistics().known_bad, 1);

        // Replace with real content and invalidate: the path is retried.
        write_png(&file, 80, 60);
        service.invalidate(&file);
        assert_eq!(service.statistics().known_bad, 0);
        assert!(service.get_thumbnail(&file, 50).is_some());
    }

    #[test]
    fn test_invalidate_never_cached_path_is_safe() {
        let dir = tempdir().unwrap();
        let service = test_service(dir.path());
        service.invalidate(&dir.path().join("never-seen.png"));
        service.invalidate(&dir.path().join("never-seen.png"));
    }

    #[test]
    fn test_known_bad_pruning_respects_ceiling() {
        let dir = tempdir().unwrap();
        let service = test_service_with(dir.path(), |c| c.known_bad_ceiling = 8);

        for i in 0..20 {
            let file = dir.path().join(format!("bad_{i}.jpg"));
            fs::write(&file, b"junk").unwrap();
            service.get_thumbnail(&file, 50);
        }
        assert!(service.statistics().known_bad <= 8);
    }

    #[test]
    fn test_clear_all_resets_everything() {
        let dir = tempdir().unwrap();
        let service = test_service(dir.path());
        let good = dir.path().join("img.png");
        write_png(&good, 100, 80);
        let bad = dir.path().join("bad.jpg");
        fs::write(&bad, b"junk").unwrap();

        service.get_thumbnail(&good, 40);
        service.get_thumbnail(&good, 40);
        service.get_thumbnail(&bad, 40);

        service.clear_all();
        let stats = service.statistics();
        assert_eq!(stats.memory_entries, 0);
        assert_eq!(stats.store_rows, 0);
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.misses, 0);
        assert_eq!(stats.known_bad, 0);
        assert_eq!(stats.decode_attempts, 0);
    }

    #[test]
    fn test_warm_batch_reports_per_path_results() {
        let dir = tempdir().unwrap();
        let service = test_service(dir.path());
        let good = dir.path().join("good.png");
        write_png(&good, 64, 64);
        let bad = dir.path().join("bad.jpg");
        fs::write(&bad, b"junk").unwrap();

        let seen = AtomicUsize::new(0);
        let results = service.warm_batch(&[good.clone(), bad.clone()], 32, |_, _| {
            seen.fetch_add(1, Ordering::Relaxed);
        });

        assert_eq!(seen.load(Ordering::Relaxed), 2);
        let produced: HashMap<_, _> = results.into_iter().collect();
        assert_eq!(produced[&good], true);
        assert_eq!(produced[&bad], false);
    }

    #[test]
    fn test_diagnose_reports_fields() {
        let dir = tempdir().unwrap();
        let service = test_service(dir.path());
        let file = dir.path().join("img.png");
        write_png(&file, 120, 90);

        let report = service.diagnose(&file);
        assert!(report.exists);
        assert!(report.readable);
        assert!(report.decodable);
        assert_eq!(report.width, Some(120));
        assert_eq!(report.height, Some(90));
        assert!(report.errors.is_empty());

        let missing = service.diagnose(&dir.path().join("gone.png"));
        assert!(!missing.exists);
        assert!(!missing.decodable);
        assert!(!missing.errors.is_empty());
    }

    #[test]
    fn test_hit_rate_math() {
        let report = StatsReport {
            memory_entries: 0,
            memory_bytes: 0,
            memory_byte_budget: 100,
            memory_entry_capacity: 10,
            hits: 3,
            misses: 1,
            store_rows: 0,
            store_data_bytes: 0,
            store_file_bytes: 0,
            known_bad: 0,
            decode_attempts: 0,
            store_failures: 0,
        };
        assert_eq!(report.hit_rate(), 0.75);
        assert_eq!(report.memory_usage_percent(), 0.0);
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let dir = tempdir().unwrap();
        let service = test_service(dir.path());
        service.shutdown();
        service.shutdown();
    }
}
