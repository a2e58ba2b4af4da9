//! Operator CLI for the Viewfinder thumbnail engine: generate and inspect
//! cached thumbnails, report cache health, and run maintenance.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use thumbnail_engine::{EngineConfig, ThumbnailService, ThumbnailStore};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "viewfinder")]
#[command(about = "Thumbnail cache tooling for the Viewfinder photo organizer")]
struct Cli {
    /// Cache database path (defaults to ~/.viewfinder/cache/thumbs.db)
    #[arg(long, global = true)]
    cache_db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate (or fetch from cache) a thumbnail for one file
    Thumb {
        /// Path to the image file
        #[arg(short, long)]
        path: PathBuf,

        /// Target thumbnail height in pixels
        #[arg(long, default_value = "300")]
        height: u32,

        /// Decode budget in seconds
        #[arg(long, default_value = "10")]
        timeout_secs: u64,

        /// Where to write the thumbnail (defaults to <stem>_thumb.png)
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Warm the cache for every file in a folder
    Batch {
        /// Folder to scan (non-recursive)
        #[arg(short, long)]
        dir: PathBuf,

        /// Target thumbnail height in pixels
        #[arg(long, default_value = "300")]
        height: u32,
    },

    /// Inspect a file: existence, dimensions, decodability, failures
    Diagnose {
        /// Path to the image file
        #[arg(short, long)]
        path: PathBuf,
    },

    /// Print cache statistics
    Stats,

    /// Empty both cache tiers and reset counters
    Clear,

    /// Delete persistent-tier rows older than the given age
    Purge {
        /// Maximum age in days; older rows are deleted
        #[arg(long, default_value = "30")]
        max_age_days: u64,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Thumb {
            path,
            height,
            timeout_secs,
            out,
        } => thumb(cli.cache_db, path, height, timeout_secs, out),
        Commands::Batch { dir, height } => batch(cli.cache_db, dir, height),
        Commands::Diagnose { path } => diagnose(cli.cache_db, path),
        Commands::Stats => stats(cli.cache_db),
        Commands::Clear => clear(cli.cache_db),
        Commands::Purge { max_age_days } => purge(cli.cache_db, max_age_days),
    }
}

fn open_service(cache_db: Option<PathBuf>) -> Result<ThumbnailService> {
    ThumbnailService::new(EngineConfig {
        db_path: cache_db,
        ..EngineConfig::default()
    })
}

fn thumb(
    cache_db: Option<PathBuf>,
    path: PathBuf,
    height: u32,
    timeout_secs: u64,
    out: Option<PathBuf>,
) -> Result<()> {
    let service = open_service(cache_db)?;
    let bitmap =
        service.get_thumbnail_with_timeout(&path, height, Duration::from_secs(timeout_secs));
    service.shutdown();

    let Some(bitmap) = bitmap else {
        bail!(
            "no thumbnail produced for {} (run `viewfinder diagnose` for details)",
            path.display()
        );
    };

    let out = out.unwrap_or_else(|| {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "thumbnail".to_string());
        PathBuf::from(format!("{stem}_thumb.png"))
    });
    bitmap
        .to_rgba_image()
        .save(&out)
        .with_context(|| format!("failed to write {}", out.display()))?;
    println!(
        "{} -> {} ({}x{})",
        path.display(),
        out.display(),
        bitmap.width(),
        bitmap.height()
    );
    Ok(())
}

fn batch(cache_db: Option<PathBuf>, dir: PathBuf, height: u32) -> Result<()> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(&dir)
        .with_context(|| format!("failed to read folder: {}", dir.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .collect();
    files.sort();

    if files.is_empty() {
        println!("No files found in {}", dir.display());
        return Ok(());
    }
    println!("Warming cache for {} files...", files.len());

    let service = open_service(cache_db)?;
    let results = service.warm_batch(&files, height, |done, total| {
        print!("\rProcessed {done}/{total}");
        let _ = std::io::stdout().flush();
    });
    println!();

    let produced = results.iter().filter(|(_, ok)| *ok).count();
    let failed = results.len() - produced;
    println!("Done: {produced} thumbnails, {failed} failures");
    if failed > 0 {
        for (path, _) in results.iter().filter(|(_, ok)| !*ok) {
            println!("  failed: {}", path.display());
        }
    }

    let stats = service.statistics();
    println!(
        "Cache: {} in memory ({:.1}% of budget), {} rows on disk",
        stats.memory_entries,
        stats.memory_usage_percent(),
        stats.store_rows
    );
    service.shutdown();
    Ok(())
}

fn diagnose(cache_db: Option<PathBuf>, path: PathBuf) -> Result<()> {
    let service = open_service(cache_db)?;
    let report = service.diagnose(&path);
    service.shutdown();
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn stats(cache_db: Option<PathBuf>) -> Result<()> {
    let service = open_service(cache_db)?;
    let report = service.statistics();
    service.shutdown();
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn clear(cache_db: Option<PathBuf>) -> Result<()> {
    let service = open_service(cache_db)?;
    service.clear_all();
    service.shutdown();
    println!("Cache cleared");
    Ok(())
}

fn purge(cache_db: Option<PathBuf>, max_age_days: u64) -> Result<()> {
    // Maintenance runs against the store directly; no service (or its
    // reclamation loop) is needed for a one-shot purge.
    let store = match cache_db {
        Some(path) => ThumbnailStore::open(&path)?,
        None => ThumbnailStore::open_default()?,
    };
    let deleted = store.purge_stale(Duration::from_secs(max_age_days * 24 * 60 * 60))?;
    println!(
        "Deleted {deleted} rows older than {max_age_days} days ({} remain)",
        store.row_count()?
    );
    Ok(())
}
