//! Configuration types for NVCache
//!
//! The engine is configured once at startup, either from the process
//! environment ([`NvCacheConfig::from_env`]) or from a TOML document whose
//! keys mirror the struct fields.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

pub const ENV_RAM_CACHE_SIZE: &str = "NVCACHE_RAM_CACHE_SIZE";
pub const ENV_LOG_SIZE: &str = "NVCACHE_LOG_SIZE";
pub const ENV_ENABLE_RECOVER: &str = "NVCACHE_ENABLE_RECOVER";
pub const ENV_FLUSH_THREAD: &str = "NVCACHE_FLUSH_THREAD";
pub const ENV_MAX_BATCH_SIZE: &str = "NVCACHE_MAX_BATCH_SIZE";
pub const ENV_MIN_BATCH_SIZE: &str = "NVCACHE_MIN_BATCH_SIZE";
pub const ENV_LOG_PATH: &str = "NVCACHE_LOG_PATH";

/// Engine configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NvCacheConfig {
    /// Number of pages in the RAM cache pool (default: 250000, about 1 GB)
    pub ram_cache_pages: usize,
    /// Number of entries in the persistent log (default: 8000000, about 32 GB)
    pub log_entries: u64,
    /// Replay the log after an unclean shutdown
    pub enable_recovery: bool,
    /// Drain the log from a background thread
    pub flush_thread: bool,
    /// Upper bound of entries drained per batch
    pub max_batch: usize,
    /// The flush thread only drains once more than this many entries are pending
    pub min_batch: usize,
    /// File or DAX device holding the persistent region. When unset the log
    /// lives in anonymous memory and nothing survives the process.
    pub log_path: Option<PathBuf>,
    /// CPU the flush thread is pinned to
    pub flush_core: Option<usize>,
    /// How long the flush thread parks when there is nothing to drain
    #[serde(with = "duration_micros")]
    pub flush_idle: Duration,
}

impl Default for NvCacheConfig {
    fn default() -> Self {
        Self {
            ram_cache_pages: 250_000,
            log_entries: 8_000_000,
            enable_recovery: false,
            flush_thread: true,
            max_batch: 1000,
            min_batch: 400,
            log_path: None,
            flush_core: Some(0),
            flush_idle: Duration::from_micros(100),
        }
    }
}

impl NvCacheConfig {
    /// Build a configuration from the `NVCACHE_*` environment variables.
    ///
    /// Sizes that are missing, unparsable or not positive keep their default.
    /// Flags accept any integer, zero meaning off.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`Self::from_env`] with an injectable variable source
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let number = |name: &str| -> Option<i64> {
            let raw = lookup(name)?;
            match raw.trim().parse::<i64>() {
                Ok(v) => Some(v),
                Err(_) => {
                    warn!("Ignoring {}={:?}: not an integer", name, raw);
                    None
                }
            }
        };
        let positive = |name: &str| number(name).filter(|v| *v > 0);

        if let Some(v) = positive(ENV_RAM_CACHE_SIZE) {
            config.ram_cache_pages = usize::try_from(v).unwrap_or(config.ram_cache_pages);
        }
        if let Some(v) = positive(ENV_LOG_SIZE) {
            config.log_entries = v.unsigned_abs();
        }
        if let Some(v) = number(ENV_ENABLE_RECOVER).filter(|v| *v >= 0) {
            config.enable_recovery = v > 0;
        }
        if let Some(v) = number(ENV_FLUSH_THREAD).filter(|v| *v >= 0) {
            config.flush_thread = v > 0;
        }
        if let Some(v) = positive(ENV_MAX_BATCH_SIZE) {
            config.max_batch = usize::try_from(v).unwrap_or(config.max_batch);
        }
        if let Some(v) = positive(ENV_MIN_BATCH_SIZE) {
            config.min_batch = usize::try_from(v).unwrap_or(config.min_batch);
        }
        if let Some(path) = lookup(ENV_LOG_PATH).filter(|p| !p.is_empty()) {
            config.log_path = Some(PathBuf::from(path));
        }
        config
    }

    /// Check the configuration for values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.ram_cache_pages == 0 {
            return Err(Error::configuration("ram_cache_pages must be positive"));
        }
        // One block always stays free, so a log needs two entries to admit anything.
        if self.log_entries < 2 {
            return Err(Error::configuration(format!(
                "log_entries must be at least 2, got {}",
                self.log_entries
            )));
        }
        if self.max_batch == 0 {
            return Err(Error::configuration("max_batch must be positive"));
        }
        if self.min_batch > self.max_batch {
            return Err(Error::configuration(format!(
                "min_batch ({}) exceeds max_batch ({})",
                self.min_batch, self.max_batch
            )));
        }
        Ok(())
    }
}

mod duration_micros {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_micros()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_micros(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = NvCacheConfig::default();
        assert_eq!(config.ram_cache_pages, 250_000);
        assert_eq!(config.log_entries, 8_000_000);
        assert!(!config.enable_recovery);
        assert!(config.flush_thread);
        assert_eq!(config.max_batch, 1000);
        assert_eq!(config.min_batch, 400);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let config = NvCacheConfig::from_lookup(lookup(&[
            (ENV_RAM_CACHE_SIZE, "64"),
            (ENV_LOG_SIZE, "128"),
            (ENV_ENABLE_RECOVER, "1"),
            (ENV_FLUSH_THREAD, "0"),
            (ENV_MAX_BATCH_SIZE, "16"),
            (ENV_MIN_BATCH_SIZE, "4"),
            (ENV_LOG_PATH, "/mnt/pmem/nvlog"),
        ]));
        assert_eq!(config.ram_cache_pages, 64);
        assert_eq!(config.log_entries, 128);
        assert!(config.enable_recovery);
        assert!(!config.flush_thread);
        assert_eq!(config.max_batch, 16);
        assert_eq!(config.min_batch, 4);
        assert_eq!(config.log_path, Some(PathBuf::from("/mnt/pmem/nvlog")));
    }

    #[test]
    fn test_env_non_positive_keeps_default() {
        let config = NvCacheConfig::from_lookup(lookup(&[
            (ENV_RAM_CACHE_SIZE, "0"),
            (ENV_LOG_SIZE, "-5"),
            (ENV_MAX_BATCH_SIZE, "lots"),
            (ENV_FLUSH_THREAD, "-1"),
        ]));
        assert_eq!(config, NvCacheConfig::default());
    }

    #[test]
    fn test_validate_rejects_bad_batches() {
        let config = NvCacheConfig {
            min_batch: 10,
            max_batch: 5,
            ..NvCacheConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));

        let config = NvCacheConfig {
            log_entries: 1,
            ..NvCacheConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_partial_document() {
        let config: NvCacheConfig = toml::from_str(
            r#"
            ram_cache_pages = 2
            log_entries = 4
            flush_idle = 250
            "#,
        )
        .unwrap();
        assert_eq!(config.ram_cache_pages, 2);
        assert_eq!(config.log_entries, 4);
        assert_eq!(config.flush_idle, Duration::from_micros(250));
        assert_eq!(config.max_batch, 1000);
    }
}
