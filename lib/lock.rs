//! Per-path mutual exclusion.
//!
//! [`PathLocks`] hands out one lazily-created async mutex per exact path string. Distinct paths
//! never contend, and parent/child paths are unrelated keys. Entries are retained for the life of
//! the registry.

use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;

use crate::path::FsPath;

/// Holds a path's lock until dropped.
#[must_use = "the path is unlocked as soon as the guard is dropped"]
pub struct PathGuard {
    path: FsPath,
    _guard: OwnedMutexGuard<()>,
}

impl PathGuard {
    /// The path this guard serializes.
    #[must_use]
    pub fn path(&self) -> &FsPath {
        &self.path
    }
}

impl std::fmt::Debug for PathGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PathGuard").field("path", &self.path).finish()
    }
}

/// Guards held over two paths at once, e.g. both ends of a rename.
///
/// When both paths are equal only one lock is taken.
#[must_use = "the paths are unlocked as soon as the guard is dropped"]
#[derive(Debug)]
pub struct PairGuard {
    _first: PathGuard,
    _second: Option<PathGuard>,
}

/// Registry of per-path locks.
#[derive(Default)]
pub struct PathLocks {
    map: scc::HashMap<FsPath, Arc<Mutex<()>>>,
}

impl PathLocks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn mutex_for(&self, path: &FsPath) -> Arc<Mutex<()>> {
        if let Some(existing) = self.map.read_sync(path, |_, m| Arc::clone(m)) {
            return existing;
        }
        // Lookup-or-insert under the bucket lock so two racing first accesses share one mutex.
        Arc::clone(
            self.map
                .entry_sync(path.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .get(),
        )
    }

    /// Wait until `path` is free and lock it.
    pub async fn acquire(&self, path: &FsPath) -> PathGuard {
        let mutex = self.mutex_for(path);
        let guard = mutex.lock_owned().await;
        trace!(%path, "path locked");
        PathGuard {
            path: path.clone(),
            _guard: guard,
        }
    }

    /// Lock `path` only if nobody holds it right now.
    #[must_use]
    pub fn try_acquire(&self, path: &FsPath) -> Option<PathGuard> {
        let guard = self.mutex_for(path).try_lock_owned().ok()?;
        Some(PathGuard {
            path: path.clone(),
            _guard: guard,
        })
    }

    /// Lock two paths in lexicographic order so concurrent pairs cannot deadlock.
    pub async fn acquire_pair(&self, a: &FsPath, b: &FsPath) -> PairGuard {
        if a == b {
            return PairGuard {
                _first: self.acquire(a).await,
                _second: None,
            };
        }
        let (lo, hi) = if a < b { (a, b) } else { (b, a) };
        let first = self.acquire(lo).await;
        let second = self.acquire(hi).await;
        PairGuard {
            _first: first,
            _second: Some(second),
        }
    }

    /// Number of paths that have ever been locked and are still registered.
    #[must_use]
    pub fn registered(&self) -> usize {
        self.map.len()
    }
}
