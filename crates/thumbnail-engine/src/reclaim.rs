//! Background reclamation of persistent-tier rows.
//!
//! A dedicated thread wakes on a short poll cadence. Under size pressure
//! (backing file over its ceiling) it purges with a short age cutoff right
//! away; otherwise it runs a long-cutoff purge each time the schedule
//! interval elapses. The worker owns its thread and is joined on stop, so
//! teardown never leaves a detached loop behind.

use crate::store::ThumbnailStore;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Tuning for the reclamation loop, copied out of the engine config.
#[derive(Debug, Clone)]
pub struct ReclaimSettings {
    /// How often the loop wakes to check for size pressure.
    pub poll_interval: Duration,
    /// How often the scheduled (long-cutoff) purge runs.
    pub schedule_interval: Duration,
    /// Age cutoff for the scheduled purge.
    pub scheduled_max_age: Duration,
    /// Age cutoff when the backing file is over its ceiling.
    pub pressure_max_age: Duration,
    /// Backing-file size that triggers the aggressive purge.
    pub size_ceiling_bytes: u64,
}

struct Shared {
    stop: Mutex<bool>,
    wake: Condvar,
}

/// Owned handle to the reclamation thread. Stopping signals the loop and
/// joins it; dropping the handle stops it too.
pub struct ReclamationWorker {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl ReclamationWorker {
    pub fn spawn(store: Arc<ThumbnailStore>, settings: ReclaimSettings) -> Self {
        let shared = Arc::new(Shared {
            stop: Mutex::new(false),
            wake: Condvar::new(),
        });
        let thread_shared = Arc::clone(&shared);
        let handle = thread::spawn(move || run(store, settings, thread_shared));
        Self {
            shared,
            handle: Some(handle),
        }
    }

    /// Signal the loop to exit and wait for it to finish.
    pub fn stop(&mut self) {
        {
            let mut stop = self.shared.stop.lock();
            *stop = true;
            self.shared.wake.notify_all();
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }
}

impl Drop for ReclamationWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(store: Arc<ThumbnailStore>, settings: ReclaimSettings, shared: Arc<Shared>) {
    debug!(?settings, "reclamation worker started");
    let mut last_scheduled = Instant::now();

    loop {
        {
            let mut stop = shared.stop.lock();
            if !*stop {
                let _ = shared.wake.wait_for(&mut stop, settings.poll_interval);
            }
            if *stop {
                break;
            }
        }

        let file_size = store.file_size_bytes();
        if file_size > settings.size_ceiling_bytes {
            warn!(
                file_size,
                ceiling = settings.size_ceiling_bytes,
                "cache file over size ceiling, purging aggressively"
            );
            purge(&store, settings.pressure_max_age);
            last_scheduled = Instant::now();
        } else if last_scheduled.elapsed() >= settings.schedule_interval {
            purge(&store, settings.scheduled_max_age);
            last_scheduled = Instant::now();
        }
    }
    debug!("reclamation worker stopped");
}

fn purge(store: &ThumbnailStore, max_age: Duration) {
    match store.purge_stale(max_age) {
        Ok(0) => debug!("reclamation pass deleted nothing"),
        Ok(deleted) => info!(deleted, "reclamation pass deleted stale thumbnails"),
        Err(err) => warn!(%err, "reclamation pass failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmap::Bitmap;
    use crate::key::{CacheKey, ContentSignature};
    use image::DynamicImage;
    use std::path::Path;
    use tempfile::tempdir;

    fn settings(poll: Duration) -> ReclaimSettings {
        ReclaimSettings {
            poll_interval: poll,
            schedule_interval: Duration::from_secs(3600),
            scheduled_max_age: Duration::from_secs(3600),
            pressure_max_age: Duration::from_secs(60),
            size_ceiling_bytes: u64::MAX,
        }
    }

    #[test]
    fn test_stop_joins_promptly() {
        let dir = tempdir().unwrap();
        let store = Arc::new(ThumbnailStore::open(&dir.path().join("t.db")).unwrap());

        // A long poll interval: stop must not wait for it to elapse.
        let mut worker = ReclamationWorker::spawn(store, settings(Duration::from_secs(60)));
        let started = Instant::now();
        worker.stop();
        assert!(!worker.is_running());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_double_stop_is_safe() {
        let dir = tempdir().unwrap();
        let store = Arc::new(ThumbnailStore::open(&dir.path().join("t.db")).unwrap());
        let mut worker = ReclamationWorker::spawn(store, settings(Duration::from_secs(60)));
        worker.stop();
        worker.stop();
    }

    #[test]
    fn test_size_pressure_purges_old_rows() {
        let dir = tempdir().unwrap();
        let store = Arc::new(ThumbnailStore::open(&dir.path().join("t.db")).unwrap());

        let k = CacheKey::from_path(Path::new("/t/old.jpg"));
        let bitmap = Bitmap::from_dynamic(DynamicImage::new_rgb8(8, 8));
        store
            .store(&k, &ContentSignature::from_parts(1, 1), &bitmap, 85)
            .unwrap();
        // Make the row old enough for the pressure cutoff.
        store
            .conn_for_tests()
            .execute("UPDATE thumbnails SET stored_at = stored_at - 600", [])
            .unwrap();

        let mut worker = ReclamationWorker::spawn(
            Arc::clone(&store),
            ReclaimSettings {
                poll_interval: Duration::from_millis(10),
                schedule_interval: Duration::from_secs(3600),
                scheduled_max_age: Duration::from_secs(3600),
                pressure_max_age: Duration::from_secs(60),
                // Any nonempty database file exceeds this.
                size_ceiling_bytes: 1,
            },
        );

        let deadline = Instant::now() + Duration::from_secs(5);
        while store.row_count().unwrap() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        worker.stop();
        assert_eq!(store.row_count().unwrap(), 0);
    }
}
