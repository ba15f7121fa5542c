//! Configuration for the registry and the allocator.
//!
//! Process-level settings come from the environment with static defaults.
//! The allocation range itself is stored in the registry's `config` table so
//! every process sharing the registry agrees on it.

use std::path::PathBuf;
use std::time::Duration;

use crate::slot::SlotRange;

/// Registry config key holding the first slot of the allocation range.
pub const RANGE_START_KEY: &str = "range_start";
/// Registry config key holding the last slot of the allocation range.
pub const RANGE_END_KEY: &str = "range_end";

/// Range used when the registry's configured range is missing or unreadable.
pub const DEFAULT_RANGE: SlotRange = SlotRange::new(10, 99);

/// Seeded into the `config` table on first initialization only.
pub const CONFIG_DEFAULTS: &[(&str, &str)] = &[(RANGE_START_KEY, "10"), (RANGE_END_KEY, "99")];

const DB_FILE_NAME: &str = "registry.db";
const APP_DIR_NAME: &str = "aliaspool";

/// Default staleness threshold in days.
pub const DEFAULT_STALE_AFTER_DAYS: u32 = 7;

/// Resolve the default registry path.
///
/// `ALIASPOOL_DB` wins, then `$XDG_DATA_HOME/aliaspool/registry.db`, then
/// `$HOME/.local/share/aliaspool/registry.db`. Falls back to the working
/// directory when no home is known.
pub fn default_registry_path() -> PathBuf {
    if let Ok(path) = std::env::var("ALIASPOOL_DB")
        && !path.is_empty()
    {
        return PathBuf::from(path);
    }

    let data_dir = std::env::var_os("XDG_DATA_HOME")
        .filter(|dir| !dir.is_empty())
        .map(PathBuf::from)
        .or_else(|| {
            std::env::var_os("HOME")
                .filter(|dir| !dir.is_empty())
                .map(|home| PathBuf::from(home).join(".local").join("share"))
        });

    match data_dir {
        Some(dir) => dir.join(APP_DIR_NAME).join(DB_FILE_NAME),
        None => PathBuf::from(DB_FILE_NAME),
    }
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub path: PathBuf,
    /// How long a blocked writer waits for another process before failing.
    pub busy_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            path: default_registry_path(),
            busy_timeout: Duration::from_secs(5),
        }
    }
}

impl RegistryConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }
}

#[derive(Debug, Clone)]
pub struct AllocatorConfig {
    /// Minimum age in days of `last_seen_at` before an allocation may be reclaimed.
    pub stale_after_days: u32,
    /// Attempts at an allocation decision before a cross-process conflict is surfaced.
    pub max_attempts: u32,
    /// Range used when the registry's configured range cannot be read.
    pub fallback_range: SlotRange,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            stale_after_days: std::env::var("ALIASPOOL_STALE_DAYS")
                .ok()
                .and_then(|s| s.trim().parse::<u32>().ok())
                .unwrap_or(DEFAULT_STALE_AFTER_DAYS),
            max_attempts: 3,
            fallback_range: DEFAULT_RANGE,
        }
    }
}

impl AllocatorConfig {
    pub fn with_stale_after_days(mut self, days: u32) -> Self {
        self.stale_after_days = days;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_fallback_range(mut self, range: SlotRange) -> Self {
        self.fallback_range = range;
        self
    }
}
