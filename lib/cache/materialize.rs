//! Bringing remote entries into the local cache.
//!
//! The materializer makes sure a local copy or placeholder exists before a path is handed out as
//! an open file or directory handle. Callers hold the path's lock.

use std::os::unix::fs::PermissionsExt as _;
use std::path::PathBuf;
use std::time::SystemTime;

use filetime::FileTime;
use tracing::{debug, instrument, warn};

use super::advisory::{self, Probe};
use super::layout::CacheTree;
use super::usage::CacheUsage;
use crate::config::EngineConfig;
use crate::error::{FsError, FsResult};
use crate::fs::InodePerms;
use crate::path::FsPath;
use crate::remote::lister::{self, DirStatus};
use crate::remote::{RemoteEntry, RemoteStore};

/// Page size used when probing whether a directory has children.
pub(crate) const PROBE_PAGE_SIZE: usize = 2;

/// Removes a partially materialized local entry, and the parent directories created for it,
/// unless defused.
struct PartialGuard {
    path: PathBuf,
    is_dir: bool,
    parents: Vec<PathBuf>,
    armed: bool,
}

impl PartialGuard {
    fn new(path: PathBuf, is_dir: bool) -> Self {
        Self {
            path,
            is_dir,
            parents: Vec::new(),
            armed: true,
        }
    }

    /// Also remove `parents` (shallowest first) when the guard fires.
    fn with_parents(mut self, parents: Vec<PathBuf>) -> Self {
        self.parents = parents;
        self
    }

    fn defuse(&mut self) {
        self.armed = false;
    }
}

impl Drop for PartialGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let result = if self.is_dir {
            std::fs::remove_dir(&self.path)
        } else {
            std::fs::remove_file(&self.path)
        };
        if let Err(e) = result
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %self.path.display(), error = %e, "failed to remove partial cache entry");
        }
        // A parent that gained other children meanwhile belongs to someone else now.
        for dir in self.parents.iter().rev() {
            match std::fs::remove_dir(dir) {
                Ok(()) => {}
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::NotFound | std::io::ErrorKind::DirectoryNotEmpty
                    ) => {}
                Err(e) => {
                    warn!(path = %dir.display(), error = %e, "failed to remove cache directory");
                }
            }
        }
    }
}

fn is_stale(meta: &std::fs::Metadata, window: std::time::Duration) -> bool {
    use std::os::unix::fs::MetadataExt as _;

    let window = i64::try_from(window.as_secs()).unwrap_or(i64::MAX);
    let now = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX));
    now.saturating_sub(meta.mtime()) > window && now.saturating_sub(meta.ctime()) > window
}

/// Borrowed view over everything needed to materialize a path.
pub struct Materializer<'a, S: RemoteStore> {
    pub(crate) store: &'a S,
    pub(crate) cache: &'a CacheTree,
    pub(crate) usage: &'a CacheUsage,
    pub(crate) config: &'a EngineConfig,
}

impl<S: RemoteStore> Materializer<'_, S> {
    /// Local mode bits for an entry. The daemon keeps owner access so the cache stays writable.
    fn mode_for(&self, entry: Option<&RemoteEntry>, owner: InodePerms) -> u32 {
        let perms = entry.map_or_else(InodePerms::empty, RemoteEntry::perms);
        let mode = if perms.is_empty() {
            self.config.default_permission
        } else {
            u32::from(perms.bits())
        };
        mode | u32::from(owner.bits())
    }

    /// Make sure the file `path` has a local copy, downloading it if absent.
    #[instrument(name = "Materializer::file", skip(self))]
    pub async fn file(&self, path: &FsPath) -> FsResult<PathBuf> {
        let local = self.cache.local_path(path);
        match tokio::fs::symlink_metadata(&local).await {
            Ok(meta) if meta.is_dir() => return Err(FsError::IsADirectory),
            Ok(_) => return Ok(local),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let parents = self.cache.create_missing_parents(path).await?;
        let mut partial = PartialGuard::new(local.clone(), false).with_parents(parents);
        let entry = self.store.download(path.remote_name(), &local).await?;
        if entry.is_directory() {
            return Err(FsError::IsADirectory);
        }

        tokio::fs::set_permissions(
            &local,
            std::fs::Permissions::from_mode(
                self.mode_for(Some(&entry), InodePerms::OWNER_READ | InodePerms::OWNER_WRITE),
            ),
        )
        .await?;
        filetime::set_file_mtime(&local, FileTime::from_system_time(entry.last_modified))?;
        partial.defuse();

        self.usage.track(path, entry.size);
        debug!(size = entry.size, "downloaded into cache");
        Ok(local)
    }

    /// Make sure the directory `path` has a fresh local placeholder.
    ///
    /// An existing placeholder is refreshed only once both its mtime and ctime are older than the
    /// freshness window, and only while no handle holds it open.
    #[instrument(name = "Materializer::directory", skip(self))]
    pub async fn directory(&self, path: &FsPath) -> FsResult<PathBuf> {
        let local = self.cache.local_path(path);
        let existing = match tokio::fs::symlink_metadata(&local).await {
            Ok(meta) if !meta.is_dir() => return Err(FsError::NotADirectory),
            Ok(meta) => Some(meta),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        if path.is_root() {
            return Ok(local);
        }

        if let Some(meta) = &existing {
            if !is_stale(meta, self.config.freshness_window) {
                return Ok(local);
            }
            if advisory::probe(&local)? == Probe::Held {
                debug!("placeholder is held open, skipping refresh");
                return Ok(local);
            }
        }

        let entry = match self.store.get_properties(path.remote_name()).await {
            Ok(entry) if entry.is_directory() => Some(entry),
            Ok(_) => return Err(FsError::NotADirectory),
            Err(fault) if fault.is_not_found() => {
                let status = lister::probe_directory(
                    self.store,
                    path.remote_name(),
                    PROBE_PAGE_SIZE,
                    self.config.empty_probe_retry_cap,
                )
                .await?;
                if status == DirStatus::NotExist && existing.is_none() {
                    return Err(FsError::NotFound);
                }
                None
            }
            Err(fault) => return Err(fault.into()),
        };

        let mode = self.mode_for(entry.as_ref(), InodePerms::OWNER_RWX);
        let mut partial = PartialGuard::new(local.clone(), true);
        if existing.is_some() {
            partial.defuse();
        } else {
            partial = partial.with_parents(self.cache.create_missing_parents(path).await?);
            match tokio::fs::create_dir(&local).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => partial.defuse(),
                Err(e) => return Err(e.into()),
            }
        }
        tokio::fs::set_permissions(&local, std::fs::Permissions::from_mode(mode)).await?;
        let modified = entry
            .as_ref()
            .map_or_else(SystemTime::now, |e| e.last_modified);
        filetime::set_file_mtime(&local, FileTime::from_system_time(modified))?;
        partial.defuse();

        debug!(mode = format!("{mode:o}"), "placeholder refreshed");
        Ok(local)
    }
}
