//! Engine configuration, built once at startup and handed to every component.

use std::path::PathBuf;
use std::time::Duration;

use bytesize::ByteSize;

/// Tunables shared by the cache, the evictor and the attribute resolver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Root of the on-disk cache; the mirror tree lives in `<cache_root>/root`.
    pub cache_root: PathBuf,

    /// A cached directory is refreshed once both its mtime and ctime are older than this.
    pub freshness_window: Duration,

    /// Permission bits reported when the remote store reports none.
    pub default_permission: u32,

    /// Eviction starts once usage exceeds this percentage of capacity.
    pub high_water_percent: u8,

    /// Eviction stops once usage falls to this percentage of capacity.
    pub low_water_percent: u8,

    /// Period of the evictor loop.
    pub evict_interval: Duration,

    /// Byte budget of the cache. `None` measures the cache's host filesystem instead.
    pub cache_capacity: Option<ByteSize>,

    /// Clean, closed files untouched for longer than this are evicted regardless of pressure.
    pub stale_after: Option<Duration>,

    /// Page size passed to remote listing calls.
    pub list_page_size: usize,

    /// Maximum retries of an empty page carrying a continuation token during emptiness probes.
    pub empty_probe_retry_cap: usize,

    /// Owner reported for every entry.
    pub uid: u32,

    /// Group reported for every entry.
    pub gid: u32,
}

impl EngineConfig {
    pub const DEFAULT_PERMISSION: u32 = 0o770;
    pub const ALLOW_OTHER_PERMISSION: u32 = 0o777;

    /// Defaults for a cache rooted at `cache_root`.
    #[must_use]
    pub fn new(cache_root: impl Into<PathBuf>) -> Self {
        Self {
            cache_root: cache_root.into(),
            freshness_window: Duration::from_secs(120),
            default_permission: Self::DEFAULT_PERMISSION,
            high_water_percent: 90,
            low_water_percent: 80,
            evict_interval: Duration::from_secs(1),
            cache_capacity: None,
            stale_after: None,
            list_page_size: 5000,
            empty_probe_retry_cap: 20,
            uid: nix::unistd::Uid::current().as_raw(),
            gid: nix::unistd::Gid::current().as_raw(),
        }
    }

    /// Widen the default permission so other users can reach the mount.
    #[must_use]
    pub fn with_allow_other(mut self, allow_other: bool) -> Self {
        if allow_other {
            self.default_permission = Self::ALLOW_OTHER_PERMISSION;
        }
        self
    }

    /// Check the tunables for consistency, returning every problem found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        for (name, value) in [
            ("high-water-percent", self.high_water_percent),
            ("low-water-percent", self.low_water_percent),
        ] {
            if value == 0 || value > 100 {
                errors.push(format!("{name} must be within 1..=100, got {value}."));
            }
        }
        if self.low_water_percent >= self.high_water_percent {
            errors.push(format!(
                "low-water-percent ({}) must be below high-water-percent ({}).",
                self.low_water_percent, self.high_water_percent
            ));
        }
        if self.list_page_size == 0 {
            errors.push("list page size must be positive.".to_owned());
        }
        if self.evict_interval.is_zero() {
            errors.push("evict-interval must be positive.".to_owned());
        }
        if self.default_permission & !0o7777 != 0 {
            errors.push(format!(
                "default permission {:o} has bits outside 0o7777.",
                self.default_permission
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
