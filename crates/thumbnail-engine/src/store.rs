//! Persistent cache tier backed by SQLite.
//!
//! One row per key: `(key, signature, width, height, format, data,
//! stored_at)`. Rows are validated against a freshly computed content
//! signature on read; a stale row is skipped, not deleted — deletion happens
//! only through invalidation or reclamation. All row operations serialize
//! through one connection behind one lock; repeat-read throughput comes from
//! the memory tier, not from here.

use crate::bitmap::Bitmap;
use crate::decode::scale_to_height;
use crate::key::{CacheKey, ContentSignature};
use anyhow::{Context, Result};
use chrono::Utc;
use image::codecs::jpeg::JpegEncoder;
use image::ImageFormat;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

pub struct ThumbnailStore {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl ThumbnailStore {
    /// Open or create the backing database at the given path, creating
    /// parent directories as needed.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create cache dir: {}", parent.display()))?;
        }
        let conn = Connection::open(db_path)
            .with_context(|| format!("failed to open database: {}", db_path.display()))?;

        // WAL keeps the reclamation thread's deletes from blocking readers
        // for longer than a single row operation.
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch("PRAGMA synchronous=NORMAL;")?;

        let store = Self {
            conn: Mutex::new(conn),
            db_path: db_path.to_path_buf(),
        };
        store.create_tables()?;
        Ok(store)
    }

    /// Open at the default per-user location.
    pub fn open_default() -> Result<Self> {
        let home = dirs::home_dir().context("unable to find home directory")?;
        Self::open(&home.join(".viewfinder").join("cache").join("thumbs.db"))
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn create_tables(&self) -> Result<()> {
        self.conn.lock().execute_batch(
            "
            CREATE TABLE IF NOT EXISTS thumbnails (
                key TEXT PRIMARY KEY,
                signature TEXT NOT NULL,
                width INTEGER NOT NULL,
                height INTEGER NOT NULL,
                format TEXT NOT NULL,
                data BLOB NOT NULL,
                stored_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_thumbnails_stored_at ON thumbnails(stored_at);
            ",
        )?;
        Ok(())
    }

    /// Fetch the row for `key` and return its bitmap, but only when the
    /// stored signature matches the live one. The bitmap is downscaled to
    /// `max_height` when the stored asset is taller.
    pub fn get(
        &self,
        key: &CacheKey,
        live_signature: &ContentSignature,
        max_height: u32,
    ) -> Option<Bitmap> {
        match self.try_get(key, live_signature, max_height) {
            Ok(hit) => hit,
            Err(err) => {
                warn!(key = %key, %err, "persistent tier read failed");
                None
            }
        }
    }

    fn try_get(
        &self,
        key: &CacheKey,
        live_signature: &ContentSignature,
        max_height: u32,
    ) -> Result<Option<Bitmap>> {
        let row: Option<(String, String, Vec<u8>)> = self
            .conn
            .lock()
            .query_row(
                "SELECT signature, format, data FROM thumbnails WHERE key = ?1",
                params![key.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let Some((stored_signature, format, data)) = row else {
            return Ok(None);
        };
        if ContentSignature::from_stored(stored_signature) != *live_signature {
            debug!(key = %key, "stored thumbnail is stale, treating as miss");
            return Ok(None);
        }

        let img = match parse_format(&format) {
            Some(fmt) => image::load_from_memory_with_format(&data, fmt),
            None => image::load_from_memory(&data),
        }
        .with_context(|| format!("failed to decode stored thumbnail for {key}"))?;

        Ok(Some(Bitmap::from_dynamic(scale_to_height(img, max_height))))
    }

    /// Serialize and upsert, replacing any prior row for the same key.
    pub fn store(
        &self,
        key: &CacheKey,
        signature: &ContentSignature,
        bitmap: &Bitmap,
        jpeg_quality: u8,
    ) -> Result<()> {
        let (data, format) = encode_bitmap(bitmap, jpeg_quality)?;
        self.conn.lock().execute(
            "INSERT OR REPLACE INTO thumbnails
                (key, signature, width, height, format, data, stored_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                key.as_str(),
                signature.as_str(),
                bitmap.width(),
                bitmap.height(),
                format,
                data,
                Utc::now().timestamp(),
            ],
        )?;
        Ok(())
    }

    /// Delete the row if present; reports whether anything was removed.
    pub fn invalidate(&self, key: &CacheKey) -> Result<bool> {
        let deleted = self.conn.lock().execute(
            "DELETE FROM thumbnails WHERE key = ?1",
            params![key.as_str()],
        )?;
        Ok(deleted > 0)
    }

    /// Delete all rows older than `max_age`; returns the number deleted.
    pub fn purge_stale(&self, max_age: Duration) -> Result<usize> {
        let cutoff = Utc::now().timestamp() - max_age.as_secs() as i64;
        let deleted = self
            .conn
            .lock()
            .execute("DELETE FROM thumbnails WHERE stored_at < ?1", params![cutoff])?;
        Ok(deleted)
    }

    /// Delete everything and give the space back to the filesystem.
    pub fn clear(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM thumbnails", [])?;
        conn.execute_batch("VACUUM;")?;
        Ok(())
    }

    pub fn row_count(&self) -> Result<u64> {
        let count: i64 =
            self.conn
                .lock()
                .query_row("SELECT COUNT(*) FROM thumbnails", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Total bytes of stored (compressed) thumbnail data.
    pub fn data_bytes(&self) -> Result<u64> {
        let bytes: i64 = self.conn.lock().query_row(
            "SELECT COALESCE(SUM(LENGTH(data)), 0) FROM thumbnails",
            [],
            |row| row.get(0),
        )?;
        Ok(bytes as u64)
    }

    /// On-disk size of the backing file. Zero when it cannot be statted.
    pub fn file_size_bytes(&self) -> u64 {
        std::fs::metadata(&self.db_path).map(|m| m.len()).unwrap_or(0)
    }

    #[cfg(test)]
    pub(crate) fn conn_for_tests(&self) -> parking_lot::MutexGuard<'_, Connection> {
        self.conn.lock()
    }
}

fn parse_format(format: &str) -> Option<ImageFormat> {
    match format {
        "jpeg" => Some(ImageFormat::Jpeg),
        "png" => Some(ImageFormat::Png),
        _ => None,
    }
}

/// Lossy JPEG when the bitmap is fully opaque; lossless PNG otherwise,
/// since the lossy encoding cannot carry an alpha channel.
fn encode_bitmap(bitmap: &Bitmap, jpeg_quality: u8) -> Result<(Vec<u8>, &'static str)> {
    if !bitmap.has_alpha() {
        match encode_jpeg(bitmap, jpeg_quality) {
            Ok(data) => return Ok((data, "jpeg")),
            Err(err) => debug!(%err, "lossy encode failed, falling back to lossless"),
        }
    }
    Ok((encode_png(bitmap)?, "png"))
}

fn encode_jpeg(bitmap: &Bitmap, quality: u8) -> Result<Vec<u8>> {
    let rgb = bitmap.to_dynamic().to_rgb8();
    let mut data = Vec::new();
    JpegEncoder::new_with_quality(&mut Cursor::new(&mut data), quality)
        .encode_image(&rgb)
        .context("failed to encode JPEG")?;
    Ok(data)
}

fn encode_png(bitmap: &Bitmap) -> Result<Vec<u8>> {
    let mut cursor = Cursor::new(Vec::new());
    bitmap
        .to_dynamic()
        .write_to(&mut cursor, ImageFormat::Png)
        .context("failed to encode PNG")?;
    Ok(cursor.into_inner())
}
