//! NVCache CLI - Operator command line interface
//!
//! Inspects and recovers persistent regions, and moves files through the
//! engine to exercise its read and write paths.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use nvcache_common::{MAX_FILES, NvCacheConfig};
use nvcache_core::{
    FileTable, NvCache, NvLog, PendingEntry, PersistentRegion, RegionState, Untracked, scan, stored_capacity,
};
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Transfer size of `copy` and `cat`
const IO_CHUNK: usize = 64 * 1024;

#[derive(Parser, Debug)]
#[command(name = "nvcache-cli")]
#[command(about = "NVCache operator CLI")]
#[command(version)]
struct Args {
    /// Configuration file (TOML, same keys as the engine configuration)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Persistent region file or DAX device
    #[arg(long)]
    log_path: Option<PathBuf>,

    /// Number of entries in the persistent log
    #[arg(long)]
    log_entries: Option<u64>,

    /// Number of pages in the RAM cache
    #[arg(long)]
    ram_cache_pages: Option<usize>,

    /// Replay the log if the previous run did not shut down cleanly
    #[arg(long)]
    enable_recovery: bool,

    /// Drain the log from the calling thread only
    #[arg(long)]
    no_flush_thread: bool,

    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Describe a persistent region without modifying it
    Inspect {
        /// Region file
        region: PathBuf,
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Replay a region left behind by a crash and mark it clean
    Recover {
        /// Region file
        region: PathBuf,
    },
    /// Copy a file through the engine and print its statistics
    Copy {
        /// Source file
        src: PathBuf,
        /// Destination file, created or truncated
        dst: PathBuf,
    },
    /// Read a file through the engine to stdout
    Cat {
        /// File to read
        path: PathBuf,
    },
}

#[derive(Debug, Serialize)]
struct OpenFileSummary {
    fd: u32,
    path: PathBuf,
    flags: i32,
    mode: u32,
}

#[derive(Debug, Serialize)]
struct RegionSummary {
    path: PathBuf,
    capacity: u64,
    state: &'static str,
    tail: Option<u64>,
    open_files: Vec<OpenFileSummary>,
    pending: usize,
    committed: usize,
    written: usize,
    entries: Vec<PendingEntry>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match &args.command {
        Commands::Inspect { region, json } => inspect(region, *json),
        Commands::Recover { region } => recover(region, &load_config(&args)?),
        Commands::Copy { src, dst } => copy(load_config(&args)?, src, dst),
        Commands::Cat { path } => cat(load_config(&args)?, path),
    }
}

/// Environment first, then the configuration file, then command line flags
fn load_config(args: &Args) -> Result<NvCacheConfig> {
    let mut config = NvCacheConfig::from_env();

    if let Some(path) = &args.config {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read configuration {}", path.display()))?;
        config = merge_toml(&config, &text)
            .with_context(|| format!("invalid configuration {}", path.display()))?;
    }

    if let Some(path) = &args.log_path {
        config.log_path = Some(path.clone());
    }
    if let Some(entries) = args.log_entries {
        config.log_entries = entries;
    }
    if let Some(pages) = args.ram_cache_pages {
        config.ram_cache_pages = pages;
    }
    if args.enable_recovery {
        config.enable_recovery = true;
    }
    if args.no_flush_thread {
        config.flush_thread = false;
    }

    config.validate()?;
    Ok(config)
}

/// Overlay the keys of a TOML document on `base`
fn merge_toml(base: &NvCacheConfig, text: &str) -> Result<NvCacheConfig> {
    let overrides: toml::Table = toml::from_str(text)?;
    let toml::Value::Table(mut table) = toml::Value::try_from(base)? else {
        bail!("configuration does not serialize to a table");
    };
    table.extend(overrides);
    Ok(toml::Value::Table(table).try_into()?)
}

fn region_capacity(region: &Path) -> Result<u64> {
    stored_capacity(region)?.with_context(|| format!("{} is not a formatted region", region.display()))
}

fn inspect(region_path: &Path, json: bool) -> Result<()> {
    let (region, state) = PersistentRegion::open_read_only(region_path)
        .with_context(|| format!("cannot inspect {}", region_path.display()))?;
    let capacity = region.capacity();

    let (label, tail) = match state {
        RegionState::Fresh => ("fresh", None),
        RegionState::Clean => ("clean", None),
        RegionState::Unclean { tail } => ("unclean", Some(tail)),
    };
    let entries = tail.map(|t| scan(&region, t)).unwrap_or_default();
    let open_files = region
        .opened_files()
        .into_iter()
        .map(|(fd, record)| OpenFileSummary {
            fd: fd.as_raw(),
            path: record.path,
            flags: record.flags,
            mode: record.mode,
        })
        .collect();

    let summary = RegionSummary {
        path: region_path.to_path_buf(),
        capacity,
        state: label,
        tail,
        open_files,
        pending: entries.iter().filter(|e| !e.written).count(),
        committed: entries.iter().filter(|e| e.settled).count(),
        written: entries.iter().filter(|e| e.written).count(),
        entries,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!("Region:    {}", summary.path.display());
    println!("Capacity:  {} entries", summary.capacity);
    match summary.tail {
        Some(tail) => println!("State:     {} (tail {})", summary.state, tail),
        None => println!("State:     {}", summary.state),
    }
    println!(
        "Entries:   {} occupied, {} committed, {} written, {} pending",
        summary.entries.len(),
        summary.committed,
        summary.written,
        summary.pending
    );
    if !summary.open_files.is_empty() {
        println!();
        println!("{:<6} {:<10} {:<8} PATH", "FD", "FLAGS", "MODE");
        for file in &summary.open_files {
            println!(
                "{:<6} {:<#10x} {:<#8o} {}",
                file.fd,
                file.flags,
                file.mode,
                file.path.display()
            );
        }
    }
    Ok(())
}

fn recover(region_path: &Path, config: &NvCacheConfig) -> Result<()> {
    let capacity = region_capacity(region_path)?;
    let files = Arc::new(FileTable::new(MAX_FILES));
    let (log, report) = NvLog::open(Some(region_path), capacity, true, files)
        .with_context(|| format!("failed to recover {}", region_path.display()))?;
    log.final_flush(&Untracked, config.max_batch)?;

    match report {
        Some(report) => {
            info!("Recovered {}", region_path.display());
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        None => println!("{} was shut down cleanly, nothing to replay", region_path.display()),
    }
    Ok(())
}

fn copy(config: NvCacheConfig, src: &Path, dst: &Path) -> Result<()> {
    let engine = NvCache::new(config).context("failed to start engine")?;
    let input = engine
        .open_file(src, libc::O_RDONLY, 0)
        .with_context(|| format!("failed to open {}", src.display()))?;
    let output = engine
        .open_file(dst, libc::O_RDWR | libc::O_CREAT | libc::O_TRUNC, 0o644)
        .with_context(|| format!("failed to create {}", dst.display()))?;

    let mut buf = vec![0u8; IO_CHUNK];
    let mut total = 0u64;
    loop {
        let n = engine.read(input, &mut buf)?;
        if n == 0 {
            break;
        }
        let mut done = 0;
        while done < n {
            let written = engine.write(output, &buf[done..n])?;
            if written == 0 {
                bail!("write to {} made no progress", dst.display());
            }
            done += written;
        }
        total += n as u64;
    }

    engine.close(output)?;
    engine.close(input)?;
    let stats = engine.stats();
    engine.shutdown()?;

    info!("Copied {} bytes from {} to {}", total, src.display(), dst.display());
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

fn cat(config: NvCacheConfig, path: &Path) -> Result<()> {
    let engine = NvCache::new(config).context("failed to start engine")?;
    let fd = engine
        .open_file(path, libc::O_RDONLY, 0)
        .with_context(|| format!("failed to open {}", path.display()))?;

    let mut buf = vec![0u8; IO_CHUNK];
    let mut stdout = std::io::stdout().lock();
    loop {
        let n = engine.read(fd, &mut buf)?;
        if n == 0 {
            break;
        }
        stdout.write_all(&buf[..n])?;
    }
    stdout.flush()?;

    engine.close(fd)?;
    engine.shutdown()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    fn small_config(dir: &Path) -> NvCacheConfig {
        NvCacheConfig {
            ram_cache_pages: 4,
            log_entries: 16,
            max_batch: 8,
            min_batch: 2,
            flush_core: None,
            log_path: Some(dir.join("nvlog")),
            ..NvCacheConfig::default()
        }
    }

    #[test]
    fn test_merge_toml_keeps_unset_keys() {
        let base = NvCacheConfig {
            log_entries: 64,
            enable_recovery: true,
            ..NvCacheConfig::default()
        };
        let merged = merge_toml(&base, "ram_cache_pages = 8\nflush_idle = 500\n").unwrap();
        assert_eq!(merged.ram_cache_pages, 8);
        assert_eq!(merged.flush_idle, Duration::from_micros(500));
        assert_eq!(merged.log_entries, 64);
        assert!(merged.enable_recovery);
    }

    #[test]
    fn test_merge_toml_rejects_bad_types() {
        let base = NvCacheConfig::default();
        assert!(merge_toml(&base, "log_entries = \"many\"").is_err());
    }

    #[test]
    fn test_copy_through_engine() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        let data: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&src, &data).unwrap();

        copy(small_config(dir.path()), &src, &dst).unwrap();
        assert_eq!(std::fs::read(&dst).unwrap(), data);

        // The engine left the region clean.
        let capacity = region_capacity(&dir.path().join("nvlog")).unwrap();
        let (_, state) = PersistentRegion::open(Some(&dir.path().join("nvlog")), capacity).unwrap();
        assert_eq!(state, RegionState::Clean);
    }

    #[test]
    fn test_inspect_leaves_region_untouched() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nvlog");
        let (region, _) = PersistentRegion::open(Some(&path), 8).unwrap();
        region.set_tail(2);
        region.sync().unwrap();
        drop(region);
        let before = std::fs::read(&path).unwrap();

        inspect(&path, true).unwrap();
        inspect(&path, false).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), before);

        let (_, state) = PersistentRegion::open(Some(&path), 8).unwrap();
        assert_eq!(state, RegionState::Unclean { tail: 2 });
    }

    #[test]
    fn test_inspect_rejects_unformatted_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("blank");
        std::fs::write(&path, b"").unwrap();
        assert!(inspect(&path, false).is_err());
        assert!(std::fs::read(&path).unwrap().is_empty());
    }

    #[test]
    fn test_region_capacity_of_unformatted_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("blank");
        std::fs::write(&path, b"").unwrap();
        assert!(region_capacity(&path).is_err());
    }
}
