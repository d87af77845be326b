//! Background reclamation of cache disk space.
//!
//! Once usage crosses the high-water mark the least recently used clean, closed files are removed
//! until usage falls to the low-water mark. Eviction only touches the local mirror; the remote
//! object stays put and is downloaded again on the next open.

use std::os::unix::fs::MetadataExt as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, trace, warn};

use super::advisory;
use super::layout::CacheTree;
use super::usage::CacheUsage;
use crate::config::EngineConfig;
use crate::error::FsResult;
use crate::io;
use crate::lock::PathLocks;

/// What one eviction pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictionReport {
    pub evicted: usize,
    pub bytes: u64,
}

/// Bytes in use against the capacity they are measured against.
#[derive(Debug, Clone, Copy)]
struct Pressure {
    used: u64,
    capacity: u64,
}

impl Pressure {
    fn exceeds(self, percent: u8) -> bool {
        self.capacity > 0
            && u128::from(self.used) * 100 > u128::from(self.capacity) * u128::from(percent)
    }
}

/// The later of the access and modification times.
fn recency(meta: &std::fs::Metadata) -> SystemTime {
    let secs = meta.atime().max(meta.mtime());
    u64::try_from(secs).map_or(SystemTime::UNIX_EPOCH, |s| {
        SystemTime::UNIX_EPOCH + Duration::from_secs(s)
    })
}

/// Periodically removes cold files from the cache.
pub struct Evictor {
    cache: Arc<CacheTree>,
    usage: Arc<CacheUsage>,
    locks: Arc<PathLocks>,
    config: EngineConfig,
}

impl Evictor {
    #[must_use]
    pub fn new(
        cache: Arc<CacheTree>,
        usage: Arc<CacheUsage>,
        locks: Arc<PathLocks>,
        config: EngineConfig,
    ) -> Self {
        Self {
            cache,
            usage,
            locks,
            config,
        }
    }

    fn measure(&self) -> FsResult<Pressure> {
        if let Some(capacity) = self.config.cache_capacity {
            return Ok(Pressure {
                used: self.usage.total_bytes(),
                capacity: capacity.as_u64(),
            });
        }
        let stats = nix::sys::statvfs::statvfs(self.cache.root())?;
        let fragment = u64::from(stats.fragment_size());
        let blocks = u64::from(stats.blocks());
        let free = u64::from(stats.blocks_free());
        Ok(Pressure {
            used: blocks.saturating_sub(free).saturating_mul(fragment),
            capacity: blocks.saturating_mul(fragment),
        })
    }

    /// Run a single eviction pass.
    #[instrument(name = "Evictor::run_once", skip(self))]
    pub async fn run_once(&self) -> FsResult<EvictionReport> {
        let mut pressure = self.measure()?;
        let under_pressure = pressure.exceeds(self.config.high_water_percent);
        let stale_cutoff = self
            .config
            .stale_after
            .and_then(|age| SystemTime::now().checked_sub(age));
        if !under_pressure && stale_cutoff.is_none() {
            return Ok(EvictionReport::default());
        }

        let mut candidates: Vec<(PathBuf, std::fs::Metadata)> =
            io::regular_files(self.cache.mirror()).await?;
        candidates.sort_by_key(|(_, meta)| recency(meta));
        debug!(
            used = pressure.used,
            capacity = pressure.capacity,
            candidates = candidates.len(),
            under_pressure,
            "scanning cache for eviction"
        );

        let mut report = EvictionReport::default();
        for (local, meta) in candidates {
            let needs_space =
                under_pressure && pressure.exceeds(self.config.low_water_percent);
            let expired = stale_cutoff.is_some_and(|cutoff| recency(&meta) < cutoff);
            if !needs_space && !expired {
                // Sorted oldest first: nothing later can be expired either.
                break;
            }
            let Some(path) = self.cache.fs_path_of(&local) else {
                continue;
            };

            let _guard = self.locks.acquire(&path).await;
            if self.usage.is_dirty(&path) {
                trace!(%path, "skipping dirty file");
                continue;
            }
            match advisory::with_exclusive(&local, || std::fs::remove_file(&local)) {
                Ok(Some(Ok(()))) => {
                    self.usage.untrack(&path);
                    pressure.used = pressure.used.saturating_sub(meta.len());
                    report.evicted += 1;
                    report.bytes += meta.len();
                    trace!(%path, size = meta.len(), "evicted");
                }
                Ok(None) => trace!(%path, "skipping file held open"),
                Ok(Some(Err(e))) | Err(crate::error::FsError::LocalIo(e))
                    if e.kind() == std::io::ErrorKind::NotFound =>
                {
                    self.usage.untrack(&path);
                }
                Ok(Some(Err(e))) => warn!(%path, error = %e, "failed to evict cache file"),
                Err(e) => warn!(%path, error = %e, "failed to probe cache file"),
            }
        }

        if report.evicted > 0 {
            info!(
                evicted = report.evicted,
                bytes = report.bytes,
                "evicted files from cache"
            );
        }
        Ok(report)
    }

    /// Run [`run_once`](Self::run_once) every `evict_interval` until stopped.
    #[must_use]
    pub fn spawn(self) -> EvictorHandle {
        let shutdown = Arc::new(Notify::new());
        let signal = Arc::clone(&shutdown);
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.evict_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = signal.notified() => break,
                    _ = interval.tick() => {
                        if let Err(e) = self.run_once().await {
                            warn!(error = %e, "eviction pass failed");
                        }
                    }
                }
            }
            debug!("evictor stopped");
        });
        EvictorHandle { shutdown, task }
    }
}

/// Owns the background evictor task.
pub struct EvictorHandle {
    shutdown: Arc<Notify>,
    task: JoinHandle<()>,
}

impl EvictorHandle {
    /// Stop the loop and wait for the current pass to finish.
    pub async fn stop(self) {
        self.shutdown.notify_one();
        if let Err(e) = self.task.await {
            warn!(error = %e, "evictor task ended abnormally");
        }
    }
}
