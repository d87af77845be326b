//! Process-wide cache usage counters.
//!
//! [`CacheUsage`] records the size of every cached file and which files hold local changes that
//! have not reached the remote store yet. Foreground operations and the evictor both mutate it,
//! so every method takes `&self`.

use std::sync::atomic::{AtomicU64, Ordering};

use scc::HashMap as ConcurrentHashMap;
use scc::HashSet as ConcurrentHashSet;

use crate::path::FsPath;

/// Bytes and files currently cached, plus the set of dirty paths.
#[derive(Default)]
pub struct CacheUsage {
    sizes: ConcurrentHashMap<FsPath, u64>,
    total_bytes: AtomicU64,
    dirty: ConcurrentHashSet<FsPath>,
}

impl CacheUsage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn adjust(&self, old: u64, new: u64) {
        if old <= new {
            self.total_bytes.fetch_add(new - old, Ordering::Relaxed);
        } else {
            self.total_bytes.fetch_sub(old - new, Ordering::Relaxed);
        }
    }

    /// Record `path` as cached with `size` bytes, replacing any previous size.
    pub fn track(&self, path: &FsPath, size: u64) {
        use scc::hash_map::Entry;

        match self.sizes.entry_sync(path.clone()) {
            Entry::Vacant(vac) => {
                vac.insert_entry(size);
                self.total_bytes.fetch_add(size, Ordering::Relaxed);
            }
            Entry::Occupied(mut occ) => {
                let old = *occ.get();
                *occ.get_mut() = size;
                self.adjust(old, size);
            }
        }
    }

    /// Forget `path`. A no-op when it is not tracked.
    pub fn untrack(&self, path: &FsPath) {
        if let Some((_, size)) = self.sizes.remove_sync(path) {
            self.total_bytes.fetch_sub(size, Ordering::Relaxed);
        }
        self.dirty.remove_sync(path);
    }

    /// Move the records of `from` and everything below it under `to`.
    pub fn rebase(&self, from: &FsPath, to: &FsPath) {
        let mut moved = Vec::new();
        self.sizes.retain_sync(|path, size| match path.rebase(from, to) {
            Some(target) => {
                moved.push((target, *size));
                false
            }
            None => true,
        });
        for (target, size) in moved {
            self.total_bytes.fetch_sub(size, Ordering::Relaxed);
            self.track(&target, size);
        }

        let mut dirty_moved = Vec::new();
        self.dirty.retain_sync(|path| match path.rebase(from, to) {
            Some(target) => {
                dirty_moved.push(target);
                false
            }
            None => true,
        });
        for target in dirty_moved {
            let _ = self.dirty.insert_sync(target);
        }
    }

    /// Flag `path` as holding changes not yet uploaded.
    pub fn mark_dirty(&self, path: &FsPath) {
        let _ = self.dirty.insert_sync(path.clone());
    }

    pub fn clear_dirty(&self, path: &FsPath) {
        self.dirty.remove_sync(path);
    }

    #[must_use]
    pub fn is_dirty(&self, path: &FsPath) -> bool {
        self.dirty.contains_sync(path)
    }

    /// Total bytes across tracked files.
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::Relaxed)
    }

    /// Number of tracked files.
    #[must_use]
    pub fn file_count(&self) -> usize {
        self.sizes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> FsPath {
        FsPath::new(s).unwrap_or_else(|e| panic!("{e}"))
    }

    #[test]
    fn new_usage_is_empty() {
        let usage = CacheUsage::new();
        assert_eq!(usage.total_bytes(), 0, "fresh usage should be empty");
        assert_eq!(usage.file_count(), 0);
    }

    #[test]
    fn track_same_path_replaces_size() {
        let usage = CacheUsage::new();
        usage.track(&p("/a"), 100);
        usage.track(&p("/b"), 50);
        usage.track(&p("/a"), 30);
        assert_eq!(usage.total_bytes(), 80, "re-tracking should replace, not add");
        assert_eq!(usage.file_count(), 2);
    }

    #[test]
    fn untrack_clears_size_and_dirt() {
        let usage = CacheUsage::new();
        usage.track(&p("/a"), 100);
        usage.mark_dirty(&p("/a"));
        usage.untrack(&p("/a"));
        assert_eq!(usage.total_bytes(), 0);
        assert!(!usage.is_dirty(&p("/a")));
    }

    #[test]
    fn untrack_unknown_is_noop() {
        let usage = CacheUsage::new();
        usage.track(&p("/a"), 10);
        usage.untrack(&p("/zzz"));
        assert_eq!(usage.total_bytes(), 10);
    }

    #[test]
    fn rebase_moves_subtree_records() {
        let usage = CacheUsage::new();
        usage.track(&p("/docs/a.txt"), 10);
        usage.track(&p("/docs/sub/b.txt"), 5);
        usage.track(&p("/docsx"), 7);
        usage.mark_dirty(&p("/docs/a.txt"));

        usage.rebase(&p("/docs"), &p("/papers"));

        assert_eq!(usage.total_bytes(), 22, "rebase must not change the total");
        assert!(usage.is_dirty(&p("/papers/a.txt")));
        assert!(!usage.is_dirty(&p("/docs/a.txt")));
        usage.untrack(&p("/papers/sub/b.txt"));
        assert_eq!(usage.total_bytes(), 17);
        usage.untrack(&p("/docsx"));
        assert_eq!(usage.total_bytes(), 10);
    }
}
