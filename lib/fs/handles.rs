//! Open file and directory handles.
//!
//! A handle owns the local descriptor together with the shared advisory lock that keeps the
//! evictor and the directory refresher away from the entry while it is open.

use std::fs::File;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::trace;

use super::EntryKind;
use crate::cache::advisory::SharedLock;
use crate::error::{FsError, FsResult};
use crate::path::FsPath;

/// Identifier handed to the driver for an open handle.
pub type HandleId = u64;

/// An open local file or directory.
#[derive(Debug)]
pub struct FileHandle {
    id: HandleId,
    path: Mutex<FsPath>,
    kind: EntryKind,
    lock: SharedLock,
    upload_on_close: bool,
    deferred_delete: AtomicBool,
}

impl FileHandle {
    #[must_use]
    pub fn id(&self) -> HandleId {
        self.id
    }

    /// The path this handle currently refers to. Renames rewrite it.
    #[must_use]
    pub fn path(&self) -> FsPath {
        self.path.lock().clone()
    }

    #[must_use]
    pub fn kind(&self) -> EntryKind {
        self.kind
    }

    /// The locked local descriptor.
    #[must_use]
    pub fn file(&self) -> &File {
        &self.lock
    }

    /// Opened for writing: the local copy is uploaded when the handle closes.
    #[must_use]
    pub fn upload_on_close(&self) -> bool {
        self.upload_on_close
    }

    /// The path was unlinked while this handle was open.
    #[must_use]
    pub fn is_deferred_delete(&self) -> bool {
        self.deferred_delete.load(Ordering::Acquire)
    }

    fn mark_deferred_delete(&self) {
        self.deferred_delete.store(true, Ordering::Release);
    }
}

/// Every open handle, keyed by id.
pub struct HandleTable {
    handles: scc::HashMap<HandleId, Arc<FileHandle>>,
    next_id: AtomicU64,
}

impl Default for HandleTable {
    fn default() -> Self {
        Self {
            handles: scc::HashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }
}

impl HandleTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new handle and return it.
    pub fn insert(
        &self,
        path: FsPath,
        kind: EntryKind,
        lock: SharedLock,
        upload_on_close: bool,
    ) -> Arc<FileHandle> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = Arc::new(FileHandle {
            id,
            path: Mutex::new(path),
            kind,
            lock,
            upload_on_close,
            deferred_delete: AtomicBool::new(false),
        });
        let _ = self.handles.insert_sync(id, Arc::clone(&handle));
        trace!(id, "registered handle");
        handle
    }

    pub fn get(&self, id: HandleId) -> FsResult<Arc<FileHandle>> {
        self.handles
            .read_sync(&id, |_, h| Arc::clone(h))
            .ok_or(FsError::BadHandle(id))
    }

    /// Unregister a handle. The advisory lock is released once the last reference drops.
    pub fn remove(&self, id: HandleId) -> FsResult<Arc<FileHandle>> {
        self.handles
            .remove_sync(&id)
            .map(|(_, h)| h)
            .ok_or(FsError::BadHandle(id))
    }

    /// Handles currently open on exactly `path`.
    #[must_use]
    pub fn open_on(&self, path: &FsPath) -> Vec<Arc<FileHandle>> {
        let mut found = Vec::new();
        self.handles.iter_sync(|_, handle| {
            if *handle.path.lock() == *path {
                found.push(Arc::clone(handle));
            }
            true
        });
        found
    }

    /// Flag every handle open on `path` for deletion at release. Returns how many were flagged.
    pub fn mark_deferred(&self, path: &FsPath) -> usize {
        let open = self.open_on(path);
        for handle in &open {
            handle.mark_deferred_delete();
        }
        open.len()
    }

    /// Point handles at or below `from` to the matching path below `to`.
    pub fn rebase(&self, from: &FsPath, to: &FsPath) {
        self.handles.iter_sync(|_, handle| {
            let mut path = handle.path.lock();
            if let Some(moved) = path.rebase(from, to) {
                trace!(id = handle.id, from = %*path, to = %moved, "handle follows rename");
                *path = moved;
            }
            true
        });
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use nix::fcntl::{Flock, FlockArg};

    use super::*;

    fn p(s: &str) -> FsPath {
        FsPath::new(s).unwrap_or_else(|e| panic!("{e}"))
    }

    fn locked(dir: &tempfile::TempDir, name: &str) -> SharedLock {
        let path = dir.path().join(name);
        std::fs::write(&path, b"x").unwrap();
        Flock::lock(File::open(&path).unwrap(), FlockArg::LockShared).unwrap()
    }

    #[test]
    fn ids_are_unique_and_removable() {
        let tmp = tempfile::tempdir().unwrap();
        let table = HandleTable::new();
        let a = table.insert(p("/a"), EntryKind::RegularFile, locked(&tmp, "a"), false);
        let b = table.insert(p("/b"), EntryKind::RegularFile, locked(&tmp, "b"), true);
        assert_ne!(a.id(), b.id());
        assert!(table.remove(a.id()).is_ok());
        assert!(matches!(table.get(a.id()), Err(FsError::BadHandle(_))));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn rebase_rewrites_descendants_only() {
        let tmp = tempfile::tempdir().unwrap();
        let table = HandleTable::new();
        let inner = table.insert(p("/docs/a.txt"), EntryKind::RegularFile, locked(&tmp, "a"), true);
        let outer = table.insert(p("/docsx"), EntryKind::RegularFile, locked(&tmp, "b"), false);

        table.rebase(&p("/docs"), &p("/papers"));

        assert_eq!(inner.path(), p("/papers/a.txt"));
        assert_eq!(outer.path(), p("/docsx"));
    }

    #[test]
    fn deferred_delete_flags_open_handles() {
        let tmp = tempfile::tempdir().unwrap();
        let table = HandleTable::new();
        let h = table.insert(p("/f"), EntryKind::RegularFile, locked(&tmp, "f"), false);
        assert_eq!(table.mark_deferred(&p("/f")), 1);
        assert!(h.is_deferred_delete());
        assert_eq!(table.mark_deferred(&p("/g")), 0);
    }
}
