//! Inode numbers for the kernel driver.
//!
//! The engine is path-based while the kernel speaks inode numbers. [`InodeTable`] hands out one
//! stable number per path while the kernel holds a reference to it, counting lookups the way the
//! kernel does, and rewrites paths when a subtree is renamed.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use super::InodeAddr;
use crate::path::FsPath;

/// Inode number of the mount root.
pub const ROOT_INO: InodeAddr = 1;

struct Node {
    path: FsPath,
    lookups: u64,
}

/// Bidirectional inode number <-> path mapping.
///
/// Reads go straight to the concurrent maps. Mutations touching both maps are serialized by a
/// coordination lock so no reader observes one map updated without the other.
pub struct InodeTable {
    by_ino: scc::HashMap<InodeAddr, Node>,
    by_path: scc::HashMap<FsPath, InodeAddr>,
    next_ino: AtomicU64,
    mu: Mutex<()>,
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl InodeTable {
    /// A table holding only the root, which is never forgotten.
    #[must_use]
    pub fn new() -> Self {
        let table = Self {
            by_ino: scc::HashMap::new(),
            by_path: scc::HashMap::new(),
            next_ino: AtomicU64::new(ROOT_INO + 1),
            mu: Mutex::new(()),
        };
        let root = Node {
            path: FsPath::root(),
            lookups: 1,
        };
        let _ = table.by_ino.insert_sync(ROOT_INO, root);
        let _ = table.by_path.insert_sync(FsPath::root(), ROOT_INO);
        table
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ()> {
        self.mu
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// The path an inode number stands for.
    #[must_use]
    pub fn path_of(&self, ino: InodeAddr) -> Option<FsPath> {
        self.by_ino.read_sync(&ino, |_, node| node.path.clone())
    }

    /// The inode number of `path`, if the kernel currently knows it.
    #[must_use]
    pub fn get(&self, path: &FsPath) -> Option<InodeAddr> {
        self.by_path.read_sync(path, |_, &ino| ino)
    }

    /// Hand `path` to the kernel: allocate its number on first sight and count one lookup.
    ///
    /// Every call must eventually be balanced by [`forget`](Self::forget).
    #[must_use]
    pub fn lookup(&self, path: &FsPath) -> InodeAddr {
        let _guard = self.lock();
        let ino = match self.by_path.entry_sync(path.clone()) {
            scc::hash_map::Entry::Occupied(occ) => *occ.get(),
            scc::hash_map::Entry::Vacant(vac) => {
                let ino = self.next_ino.fetch_add(1, Ordering::Relaxed);
                vac.insert_entry(ino);
                let node = Node {
                    path: path.clone(),
                    lookups: 0,
                };
                let _ = self.by_ino.insert_sync(ino, node);
                ino
            }
        };
        let _ = self.by_ino.update_sync(&ino, |_, node| node.lookups += 1);
        ino
    }

    /// Number to report for a directory entry the kernel has not looked up.
    ///
    /// Unknown paths get a fresh number that is not retained; a later lookup assigns the lasting
    /// one.
    #[must_use]
    pub fn listing_ino(&self, path: &FsPath) -> InodeAddr {
        self.get(path)
            .unwrap_or_else(|| self.next_ino.fetch_add(1, Ordering::Relaxed))
    }

    /// Drop `nlookup` kernel references to `ino`, reaping the mapping once none remain.
    pub fn forget(&self, ino: InodeAddr, nlookup: u64) {
        if ino == ROOT_INO {
            return;
        }
        let _guard = self.lock();
        let reaped = match self.by_ino.entry_sync(ino) {
            scc::hash_map::Entry::Occupied(mut occ) => {
                let node = occ.get_mut();
                node.lookups = node.lookups.saturating_sub(nlookup);
                (node.lookups == 0).then(|| occ.remove().path)
            }
            scc::hash_map::Entry::Vacant(_) => None,
        };
        if let Some(path) = reaped {
            let _ = self.by_path.remove_if_sync(&path, |mapped| *mapped == ino);
        }
    }

    /// Drop `path` and everything below it, regardless of outstanding lookups.
    pub fn remove_subtree(&self, path: &FsPath) {
        let _guard = self.lock();
        self.by_path
            .retain_sync(|p, _| !(p == path || p.is_descendant_of(path)));
        self.by_ino
            .retain_sync(|_, node| !(node.path == *path || node.path.is_descendant_of(path)));
    }

    /// Re-point `from` and its descendants to the matching paths below `to`.
    ///
    /// Inode numbers previously assigned to paths at or below `to` are dropped, since those
    /// entries were replaced.
    pub fn rebase(&self, from: &FsPath, to: &FsPath) {
        let _guard = self.lock();
        let mut moved = Vec::new();
        self.by_ino.iter_sync(|&ino, node| {
            if let Some(target) = node.path.rebase(from, to) {
                moved.push((ino, target));
            }
            true
        });

        let replaced = |p: &FsPath| p == to || p.is_descendant_of(to);
        let is_moved = |p: &FsPath| p == from || p.is_descendant_of(from);
        self.by_ino
            .retain_sync(|_, node| !replaced(&node.path) || is_moved(&node.path));
        self.by_path.retain_sync(|p, _| !replaced(p) && !is_moved(p));

        for (ino, target) in moved {
            let _ = self
                .by_ino
                .update_sync(&ino, |_, node| node.path = target.clone());
            let _ = self.by_path.upsert_sync(target, ino);
        }
    }

    /// Number of mapped inodes, the root included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_ino.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_ino.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> FsPath {
        FsPath::new(s).unwrap_or_else(|e| panic!("{e}"))
    }

    #[test]
    fn root_is_preseeded() {
        let table = InodeTable::new();
        assert_eq!(table.path_of(ROOT_INO), Some(FsPath::root()));
        assert_eq!(table.get(&FsPath::root()), Some(ROOT_INO));
        table.forget(ROOT_INO, 100);
        assert_eq!(table.path_of(ROOT_INO), Some(FsPath::root()));
    }

    #[test]
    fn numbers_are_stable_per_path() {
        let table = InodeTable::new();
        let a = table.lookup(&p("/a"));
        let b = table.lookup(&p("/b"));
        assert_ne!(a, b);
        assert_eq!(table.lookup(&p("/a")), a);
        assert_eq!(table.path_of(b), Some(p("/b")));
    }

    #[test]
    fn mapping_lives_until_every_lookup_is_forgotten() {
        let table = InodeTable::new();
        let ino = table.lookup(&p("/a"));
        let _ = table.lookup(&p("/a"));

        table.forget(ino, 1);
        assert_eq!(table.path_of(ino), Some(p("/a")));

        table.forget(ino, 1);
        assert_eq!(table.path_of(ino), None);
        assert_eq!(table.get(&p("/a")), None);
        assert_eq!(table.len(), 1);
        assert_ne!(table.lookup(&p("/a")), ino);
    }

    #[test]
    fn listing_numbers_are_not_retained() {
        let table = InodeTable::new();
        let known = table.lookup(&p("/known"));

        assert_eq!(table.listing_ino(&p("/known")), known);
        let first = table.listing_ino(&p("/unseen"));
        assert_ne!(first, table.listing_ino(&p("/unseen")));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn forgetting_a_stale_number_keeps_the_new_mapping() {
        let table = InodeTable::new();
        let old = table.lookup(&p("/a"));
        table.remove_subtree(&p("/a"));
        let new = table.lookup(&p("/a"));

        table.forget(old, 1);

        assert_eq!(table.get(&p("/a")), Some(new));
    }

    #[test]
    fn rebase_keeps_numbers_and_drops_replaced() {
        let table = InodeTable::new();
        let docs = table.lookup(&p("/docs"));
        let file = table.lookup(&p("/docs/a.txt"));
        let old_target = table.lookup(&p("/papers"));

        table.rebase(&p("/docs"), &p("/papers"));

        assert_eq!(table.path_of(docs), Some(p("/papers")));
        assert_eq!(table.path_of(file), Some(p("/papers/a.txt")));
        assert_eq!(table.path_of(old_target), None);
        assert_eq!(table.get(&p("/papers/a.txt")), Some(file));
        assert_eq!(table.get(&p("/docs")), None);
    }

    #[test]
    fn remove_subtree_drops_descendants() {
        let table = InodeTable::new();
        let dir = table.lookup(&p("/d"));
        let child = table.lookup(&p("/d/x"));
        table.remove_subtree(&p("/d"));
        assert_eq!(table.path_of(dir), None);
        assert_eq!(table.path_of(child), None);
        assert_eq!(table.len(), 1);
    }
}
