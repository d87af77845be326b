//! The filesystem engine.
//!
//! [`BlobFs`] owns the cache, the lock registry and the handle table, and exposes the full call
//! surface of the filesystem driver. Every operation touching cache or remote state for a path
//! holds that path's lock for its critical section.

use std::os::unix::fs::{FileExt as _, PermissionsExt as _};
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, error, info, instrument, warn};

use super::handles::{FileHandle, HandleId, HandleTable};
use super::{EntryKind, FileAttr, FsStats, InodePerms, OpenFlags};
use crate::cache::advisory;
use crate::cache::evict::Evictor;
use crate::cache::layout::{CacheTree, InvalidCacheRootError};
use crate::cache::materialize::Materializer;
use crate::cache::usage::CacheUsage;
use crate::config::EngineConfig;
use crate::error::{FsError, FsResult};
use crate::io;
use crate::lock::{PathGuard, PathLocks};
use crate::path::FsPath;
use crate::remote::lister::DirStatus;
use crate::remote::{FORMER_DIRECTORY_MARKER, Namespace, RemoteStore, acl};

/// A mounted view of a remote store.
pub struct BlobFs<S: RemoteStore> {
    pub(crate) store: Arc<S>,
    pub(crate) config: EngineConfig,
    pub(crate) cache: Arc<CacheTree>,
    pub(crate) locks: Arc<PathLocks>,
    pub(crate) usage: Arc<CacheUsage>,
    pub(crate) handles: HandleTable,
}

async fn blocking_io<T: Send + 'static>(
    f: impl FnOnce() -> std::io::Result<T> + Send + 'static,
) -> FsResult<T> {
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| FsError::LocalIo(std::io::Error::other(e)))?
        .map_err(FsError::from)
}

impl<S: RemoteStore> BlobFs<S> {
    /// Open the cache described by `config` in front of `store`.
    pub async fn new(store: S, config: EngineConfig) -> Result<Self, InvalidCacheRootError> {
        let cache = CacheTree::open(&config.cache_root).await?;
        info!(
            cache = %cache.root().display(),
            namespace = ?store.namespace(),
            "cache ready"
        );
        Ok(Self {
            store: Arc::new(store),
            config,
            cache: Arc::new(cache),
            locks: Arc::new(PathLocks::new()),
            usage: Arc::new(CacheUsage::new()),
            handles: HandleTable::new(),
        })
    }

    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn cache(&self) -> &CacheTree {
        &self.cache
    }

    #[must_use]
    pub fn usage(&self) -> &CacheUsage {
        &self.usage
    }

    #[must_use]
    pub fn locks(&self) -> &PathLocks {
        &self.locks
    }

    #[must_use]
    pub fn handles(&self) -> &HandleTable {
        &self.handles
    }

    #[must_use]
    pub fn materializer(&self) -> Materializer<'_, S> {
        Materializer {
            store: &*self.store,
            cache: &self.cache,
            usage: &self.usage,
            config: &self.config,
        }
    }

    /// An evictor sharing this engine's cache, counters and locks.
    #[must_use]
    pub fn evictor(&self) -> Evictor {
        Evictor::new(
            Arc::clone(&self.cache),
            Arc::clone(&self.usage),
            Arc::clone(&self.locks),
            self.config.clone(),
        )
    }

    /// Make sure `path` has a local copy or placeholder and return where it lives.
    #[instrument(name = "BlobFs::ensure_local", skip(self))]
    pub async fn ensure_local(&self, path: &FsPath) -> FsResult<PathBuf> {
        let _guard = self.locks.acquire(path).await;
        self.ensure_local_locked(path).await
    }

    async fn ensure_local_locked(&self, path: &FsPath) -> FsResult<PathBuf> {
        match self.stat_locked(path).await?.kind {
            EntryKind::Directory => self.materializer().directory(path).await,
            EntryKind::RegularFile => self.materializer().file(path).await,
        }
    }

    /// Lock the path a handle refers to, following renames that race the acquisition.
    async fn lock_handle_path(&self, handle: &FileHandle) -> (FsPath, PathGuard) {
        loop {
            let path = handle.path();
            let guard = self.locks.acquire(&path).await;
            if handle.path() == path {
                return (path, guard);
            }
        }
    }

    /// Open a directory, holding a shared advisory lock for the life of the handle.
    #[instrument(name = "BlobFs::opendir", skip(self))]
    pub async fn opendir(&self, path: &FsPath) -> FsResult<HandleId> {
        let _guard = self.locks.acquire(path).await;
        let local = self.materializer().directory(path).await?;
        let file = tokio::fs::File::open(&local).await?.into_std().await;
        let lock = advisory::lock_shared(file, false).await?;
        let handle = self
            .handles
            .insert(path.clone(), EntryKind::Directory, lock, false);
        debug!(handle = handle.id(), "opened directory");
        Ok(handle.id())
    }

    #[instrument(name = "BlobFs::releasedir", skip(self))]
    pub fn releasedir(&self, handle: HandleId) -> FsResult<()> {
        let handle = self.handles.remove(handle)?;
        if handle.kind() != EntryKind::Directory {
            warn!(id = handle.id(), "releasedir on a file handle");
        }
        Ok(())
    }

    /// Open a file, downloading it into the cache first if needed.
    #[instrument(name = "BlobFs::open", skip(self))]
    pub async fn open(&self, path: &FsPath, flags: OpenFlags) -> FsResult<HandleId> {
        let _guard = self.locks.acquire(path).await;
        let local = self.materializer().file(path).await?;
        let writable = flags.intersects(OpenFlags::WRONLY | OpenFlags::RDWR);

        let file = tokio::fs::OpenOptions::new()
            .read(true)
            .write(writable)
            .open(&local)
            .await?;
        if writable && flags.contains(OpenFlags::TRUNC) {
            file.set_len(0).await?;
            self.usage.track(path, 0);
            self.usage.mark_dirty(path);
        }
        let lock =
            advisory::lock_shared(file.into_std().await, flags.contains(OpenFlags::NONBLOCK))
                .await?;
        let handle = self
            .handles
            .insert(path.clone(), EntryKind::RegularFile, lock, writable);
        debug!(handle = handle.id(), writable, "opened file");
        Ok(handle.id())
    }

    /// Create an empty file and open it for writing. It reaches the remote store on release.
    #[instrument(name = "BlobFs::create", skip(self))]
    pub async fn create(&self, path: &FsPath, mode: u32) -> FsResult<(HandleId, FileAttr)> {
        let _guard = self.locks.acquire(path).await;
        let local = self.cache.local_path(path);
        self.cache.ensure_parent_chain(path).await?;

        let file = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&local)
            .await?;
        let mode = InodePerms::from_mode(mode) | InodePerms::OWNER_READ | InodePerms::OWNER_WRITE;
        tokio::fs::set_permissions(
            &local,
            std::fs::Permissions::from_mode(u32::from(mode.bits())),
        )
        .await?;
        let attr = FileAttr::from_local(&file.metadata().await?);

        self.usage.track(path, 0);
        self.usage.mark_dirty(path);
        let lock = advisory::lock_shared(file.into_std().await, true).await?;
        let handle = self
            .handles
            .insert(path.clone(), EntryKind::RegularFile, lock, true);
        debug!(handle = handle.id(), "created file");
        Ok((handle.id(), attr))
    }

    /// Read up to `size` bytes at `offset`. Short reads only happen at end of file.
    pub async fn read(&self, handle: HandleId, offset: u64, size: u32) -> FsResult<Bytes> {
        let handle = self.handles.get(handle)?;
        if handle.kind() == EntryKind::Directory {
            return Err(FsError::IsADirectory);
        }
        blocking_io(move || {
            let mut buf = vec![0u8; size as usize];
            let mut filled = 0usize;
            while filled < buf.len() {
                let n = handle
                    .file()
                    .read_at(&mut buf[filled..], offset + filled as u64)?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            buf.truncate(filled);
            Ok(Bytes::from(buf))
        })
        .await
    }

    /// Write `data` at `offset` into the local copy and mark the path dirty.
    pub async fn write(&self, handle: HandleId, offset: u64, data: &[u8]) -> FsResult<u32> {
        let handle = self.handles.get(handle)?;
        if handle.kind() == EntryKind::Directory {
            return Err(FsError::IsADirectory);
        }
        if !handle.upload_on_close() {
            return Err(FsError::BadHandle(handle.id()));
        }
        let written = u32::try_from(data.len()).map_err(|_| FsError::InvalidArgument)?;
        let (path, _guard) = self.lock_handle_path(&handle).await;

        let data = data.to_vec();
        let writer = Arc::clone(&handle);
        let len = blocking_io(move || {
            writer.file().write_all_at(&data, offset)?;
            Ok(writer.file().metadata()?.len())
        })
        .await?;

        if !handle.is_deferred_delete() {
            self.usage.track(&path, len);
            self.usage.mark_dirty(&path);
        }
        Ok(written)
    }

    /// Upload the local copy of `path` if it holds changes. The caller holds the path's lock.
    async fn upload_locked(&self, path: &FsPath) -> FsResult<()> {
        if !self.usage.is_dirty(path) {
            return Ok(());
        }
        let local = self.cache.local_path(path);
        self.store.upload(path.remote_name(), &local).await?;
        self.usage.clear_dirty(path);
        debug!(%path, "uploaded");
        Ok(())
    }

    async fn upload_handle(&self, handle: &FileHandle) -> FsResult<()> {
        if !handle.upload_on_close() || handle.is_deferred_delete() {
            return Ok(());
        }
        let (path, _guard) = self.lock_handle_path(handle).await;
        self.upload_locked(&path).await.inspect_err(|e| {
            error!(%path, error = %e, "upload failed");
        })
    }

    #[instrument(name = "BlobFs::flush", skip(self))]
    pub async fn flush(&self, handle: HandleId) -> FsResult<()> {
        let handle = self.handles.get(handle)?;
        self.upload_handle(&handle).await
    }

    /// Close a handle, uploading its changes unless the path was unlinked while open.
    #[instrument(name = "BlobFs::release", skip(self))]
    pub async fn release(&self, handle: HandleId) -> FsResult<()> {
        let handle = self.handles.remove(handle)?;
        self.upload_handle(&handle).await
    }

    /// Set the length of `path`, uploading right away unless a write handle is open on it.
    #[instrument(name = "BlobFs::truncate", skip(self))]
    pub async fn truncate(&self, path: &FsPath, size: u64) -> FsResult<()> {
        let _guard = self.locks.acquire(path).await;
        let local = self.materializer().file(path).await?;
        let file = tokio::fs::OpenOptions::new().write(true).open(&local).await?;
        file.set_len(size).await?;
        drop(file);

        self.usage.track(path, size);
        self.usage.mark_dirty(path);
        let writers = self
            .handles
            .open_on(path)
            .iter()
            .any(|h| h.upload_on_close());
        if writers {
            debug!("write handle open, deferring upload to release");
            return Ok(());
        }
        self.upload_locked(path).await
    }

    /// Remove a file remotely and locally. Descriptors already open stay usable until released.
    #[instrument(name = "BlobFs::unlink", skip(self))]
    pub async fn unlink(&self, path: &FsPath) -> FsResult<()> {
        let _guard = self.locks.acquire(path).await;
        let local = self.cache.local_path(path);
        let has_local = match tokio::fs::symlink_metadata(&local).await {
            Ok(meta) if meta.is_dir() => return Err(FsError::IsADirectory),
            Ok(_) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };
        if !has_local && self.stat_locked(path).await?.is_dir() {
            return Err(FsError::IsADirectory);
        }

        match self.store.delete_object(path.remote_name()).await {
            Ok(()) => {}
            Err(fault) if fault.is_not_found() && has_local => {
                debug!("file was never uploaded");
            }
            Err(fault) => return Err(fault.into()),
        }

        if has_local {
            match tokio::fs::remove_file(&local).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        self.usage.untrack(path);
        let deferred = self.handles.mark_deferred(path);
        if deferred > 0 {
            debug!(deferred, "unlinked while open");
        }
        Ok(())
    }

    /// Create a directory remotely, then its local placeholder.
    #[instrument(name = "BlobFs::mkdir", skip(self))]
    pub async fn mkdir(&self, path: &FsPath, mode: u32) -> FsResult<FileAttr> {
        if path.is_root() {
            return Err(FsError::AlreadyExists);
        }
        let _guard = self.locks.acquire(path).await;
        match self.stat_locked(path).await {
            Ok(_) => return Err(FsError::AlreadyExists),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        self.store.create_directory_marker(path.remote_name()).await?;
        let perms = InodePerms::from_mode(mode);
        if self.store.namespace() == Namespace::Hierarchical
            && let Err(fault) = self
                .store
                .set_access_control(path.remote_name(), &acl::mode_to_acl(perms))
                .await
        {
            warn!(error = %fault, "failed to apply directory permissions remotely");
        }

        self.cache.ensure_parent_chain(path).await?;
        let local = self.cache.local_path(path);
        match tokio::fs::create_dir(&local).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e.into()),
        }
        tokio::fs::set_permissions(
            &local,
            std::fs::Permissions::from_mode(u32::from((perms | InodePerms::OWNER_RWX).bits())),
        )
        .await?;
        Ok(FileAttr::from_local(
            &tokio::fs::symlink_metadata(&local).await?,
        ))
    }

    /// Remove an empty directory locally and remotely.
    #[instrument(name = "BlobFs::rmdir", skip(self))]
    pub async fn rmdir(&self, path: &FsPath) -> FsResult<()> {
        if path.is_root() {
            return Err(FsError::InvalidArgument);
        }
        let _guard = self.locks.acquire(path).await;
        let local = self.cache.local_path(path);
        let has_local = match tokio::fs::symlink_metadata(&local).await {
            Ok(meta) if !meta.is_dir() => return Err(FsError::NotADirectory),
            Ok(_) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };
        if has_local && !self.local_children(path).await?.is_empty() {
            return Err(FsError::NotEmpty);
        }

        let status = match self.probe(path).await? {
            DirStatus::NotEmpty => return Err(FsError::NotEmpty),
            DirStatus::NotExist if !has_local => {
                match self.store.get_properties(path.remote_name()).await {
                    Ok(entry) if entry.is_directory() => DirStatus::Empty,
                    Ok(_) => return Err(FsError::NotADirectory),
                    Err(fault) => return Err(fault.into()),
                }
            }
            status => status,
        };

        if has_local {
            io::remove_dir_contents(&local).await?;
            tokio::fs::remove_dir(&local).await?;
        }

        let sentinel = path.join(FORMER_DIRECTORY_MARKER)?;
        if let Err(fault) = self.store.delete_object(sentinel.remote_name()).await
            && !fault.is_not_found()
        {
            return Err(fault.into());
        }
        match self
            .store
            .delete_directory(path.remote_name(), false)
            .await
        {
            Ok(()) => Ok(()),
            Err(fault) if fault.is_not_found() && (has_local || status != DirStatus::NotExist) => {
                debug!("directory had no remote marker");
                Ok(())
            }
            Err(fault) => Err(fault.into()),
        }
    }

    /// Apply mode bits remotely and to any cached copy.
    #[instrument(name = "BlobFs::chmod", skip(self))]
    pub async fn chmod(&self, path: &FsPath, mode: u32) -> FsResult<()> {
        let _guard = self.locks.acquire(path).await;
        let perms = InodePerms::from_mode(mode);
        let local = self.cache.local_path(path);
        let has_local = tokio::fs::try_exists(&local).await?;

        if !path.is_root() {
            match self
                .store
                .set_access_control(path.remote_name(), &acl::mode_to_acl(perms))
                .await
            {
                Ok(()) => {}
                Err(fault) if fault.is_not_found() && has_local => {}
                Err(fault) if fault.is_not_found() => {
                    // Implicit directories have no object to carry an access list.
                    self.stat_locked(path).await?;
                }
                Err(fault) => return Err(fault.into()),
            }
        }

        if has_local {
            tokio::fs::set_permissions(
                &local,
                std::fs::Permissions::from_mode(u32::from(perms.bits())),
            )
            .await?;
        }
        Ok(())
    }

    /// Ownership is fixed by configuration; always accepted.
    pub fn chown(&self, _path: &FsPath, _uid: Option<u32>, _gid: Option<u32>) -> FsResult<()> {
        Ok(())
    }

    /// Accepted without effect.
    pub fn utimens(&self, _path: &FsPath) -> FsResult<()> {
        Ok(())
    }

    /// Accepted without effect; data reaches the remote store on flush and release.
    pub fn fsync(&self, handle: HandleId) -> FsResult<()> {
        self.handles.get(handle).map(|_| ())
    }

    pub fn symlink(&self, _link: &FsPath, _target: &str) -> FsResult<()> {
        Err(FsError::Unsupported)
    }

    pub fn link(&self, _src: &FsPath, _dst: &FsPath) -> FsResult<()> {
        Err(FsError::Unsupported)
    }

    pub fn mknod(&self, _path: &FsPath, _mode: u32) -> FsResult<()> {
        Err(FsError::Unsupported)
    }

    pub fn readlink(&self, _path: &FsPath) -> FsResult<()> {
        Err(FsError::InvalidArgument)
    }

    /// Extended attributes are not supported.
    pub fn xattr(&self, _path: &FsPath) -> FsResult<()> {
        Err(FsError::Unsupported)
    }

    /// Statistics of the filesystem holding the cache.
    pub fn statfs(&self) -> FsResult<FsStats> {
        let stats = nix::sys::statvfs::statvfs(self.cache.root())?;
        Ok(FsStats {
            block_size: u32::try_from(stats.block_size()).unwrap_or(4096),
            fragment_size: u32::try_from(stats.fragment_size()).unwrap_or(4096),
            total_blocks: u64::from(stats.blocks()),
            free_blocks: u64::from(stats.blocks_free()),
            available_blocks: u64::from(stats.blocks_available()),
            total_inodes: u64::from(stats.files()),
            free_inodes: u64::from(stats.files_free()),
            max_filename_length: u32::try_from(stats.name_max()).unwrap_or(255),
        })
    }

    /// Wipe the local mirror. Called once at unmount.
    #[instrument(name = "BlobFs::destroy", skip(self))]
    pub async fn destroy(&self) {
        let open = self.handles.len();
        if open > 0 {
            warn!(open, "destroying cache with handles still open");
        }
        match self.cache.destroy().await {
            Ok(()) => info!("cache cleared"),
            Err(e) => error!(error = %e, "failed to clear cache"),
        }
    }
}
