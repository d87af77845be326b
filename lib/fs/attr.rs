//! Attribute resolution: what a path is, consulting the cache before the remote store.

use tracing::{debug, instrument};

use super::{BlobFs, EntryKind, FileAttr, InodePerms};
use crate::cache::materialize::PROBE_PAGE_SIZE;
use crate::error::{FsError, FsResult};
use crate::path::FsPath;
use crate::remote::lister::{self, DirStatus};
use crate::remote::{RemoteEntry, RemoteStore};

impl<S: RemoteStore> BlobFs<S> {
    /// Resolve `path` to a file or directory.
    ///
    /// A local cache entry is authoritative once present, even when the remote disagrees.
    #[instrument(name = "BlobFs::stat", skip(self))]
    pub async fn stat(&self, path: &FsPath) -> FsResult<FileAttr> {
        if path.is_root() {
            return Ok(self.root_attr());
        }
        let _guard = self.locks.acquire(path).await;
        self.stat_locked(path).await
    }

    /// [`stat`](Self::stat) for callers already holding the path's lock.
    pub(crate) async fn stat_locked(&self, path: &FsPath) -> FsResult<FileAttr> {
        if path.is_root() {
            return Ok(self.root_attr());
        }

        let local = self.cache.local_path(path);
        match tokio::fs::symlink_metadata(&local).await {
            Ok(meta) => return Ok(FileAttr::from_local(&meta)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        match self.store.get_properties(path.remote_name()).await {
            Ok(entry) if entry.is_directory() => {
                let status = self.probe(path).await?;
                Ok(self.remote_attr(Some(&entry), EntryKind::Directory, status))
            }
            Ok(entry) => Ok(self.remote_attr(Some(&entry), EntryKind::RegularFile, DirStatus::Empty)),
            Err(fault) if fault.is_not_found() => match self.probe(path).await? {
                DirStatus::NotExist => Err(FsError::NotFound),
                status => {
                    debug!(?status, "resolved implicit directory");
                    Ok(self.remote_attr(None, EntryKind::Directory, status))
                }
            },
            Err(fault) => Err(fault.into()),
        }
    }

    /// Whether the directory `path` has children remotely.
    pub(crate) async fn probe(&self, path: &FsPath) -> FsResult<DirStatus> {
        Ok(lister::probe_directory(
            &*self.store,
            path.remote_name(),
            PROBE_PAGE_SIZE,
            self.config.empty_probe_retry_cap,
        )
        .await?)
    }

    pub(crate) fn root_attr(&self) -> FileAttr {
        FileAttr::root(
            InodePerms::from_mode(self.config.default_permission),
            self.config.uid,
            self.config.gid,
        )
    }

    fn remote_attr(
        &self,
        entry: Option<&RemoteEntry>,
        kind: EntryKind,
        status: DirStatus,
    ) -> FileAttr {
        let perms = entry
            .map(RemoteEntry::perms)
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| InodePerms::from_mode(self.config.default_permission));
        let (size, nlink) = match kind {
            EntryKind::Directory if status == DirStatus::NotEmpty => (4096, 3),
            EntryKind::Directory => (4096, 2),
            EntryKind::RegularFile => (entry.map_or(0, |e| e.size), 1),
        };
        let mut attr = FileAttr::root(perms, self.config.uid, self.config.gid);
        attr.kind = kind;
        attr.size = size;
        attr.nlink = nlink;
        if let Some(entry) = entry {
            attr.mtime = entry.last_modified;
            attr.ctime = entry.last_modified;
            attr.atime = entry.last_modified;
        }
        attr
    }
}
