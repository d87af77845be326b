//! On-disk layout of the cache.
//!
//! Path `/a/b` of the mounted namespace is mirrored at `<cache_root>/root/a/b`. Presence on disk
//! is the only record of cache membership.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};

use crate::io;
use crate::path::FsPath;

#[derive(Debug, Error)]
pub enum InvalidCacheRootError {
    #[error("Cache root is not a directory: {0}")]
    NotADirectory(PathBuf),

    #[error("Cache root appears to contain data stemming from sources different to this app: {0}")]
    ForeignContents(PathBuf),

    #[error("IO error while accessing cache root: {0}")]
    Io(#[from] std::io::Error),
}

/// The cache root and its mirror subtree.
#[derive(Debug, Clone)]
pub struct CacheTree {
    root: PathBuf,
    mirror: PathBuf,
}

impl CacheTree {
    // Changing this constant makes every existing cache directory look foreign.
    const MARKER_FILE: &'static str = ".blobfs_cache";
    const MIRROR_DIR: &'static str = "root";

    /// Open the cache at `cache_root`, wiping whatever a previous run left behind.
    ///
    /// An existing directory must be empty or carry the marker file of a previous run.
    pub async fn open(cache_root: &Path) -> Result<Self, InvalidCacheRootError> {
        let root = match tokio::fs::canonicalize(cache_root).await {
            Ok(p) => {
                if !tokio::fs::metadata(&p).await?.is_dir() {
                    return Err(InvalidCacheRootError::NotADirectory(p));
                }
                let is_empty = io::is_empty_dir(&p).await?;
                let marker_exists = tokio::fs::try_exists(p.join(Self::MARKER_FILE)).await?;
                if !(is_empty || marker_exists) {
                    return Err(InvalidCacheRootError::ForeignContents(p));
                }
                if marker_exists {
                    debug!(path = %p.display(), "clearing cache left by a previous run");
                }
                io::remove_dir_contents(&p).await?;
                p
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tokio::fs::create_dir_all(cache_root).await?;
                info!(path = %cache_root.display(), "Created cache directory.");
                tokio::fs::canonicalize(cache_root).await?
            }
            Err(e) => return Err(e.into()),
        };

        tokio::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(root.join(Self::MARKER_FILE))
            .await?;

        let mirror = root.join(Self::MIRROR_DIR);
        io::create_dir_chain(&mirror).await?;

        Ok(Self { root, mirror })
    }

    /// The cache root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<cache_root>/root`
    #[must_use]
    pub fn mirror(&self) -> &Path {
        &self.mirror
    }

    /// Where `path` lives in the local cache.
    #[must_use]
    pub fn local_path(&self, path: &FsPath) -> PathBuf {
        if path.is_root() {
            self.mirror.clone()
        } else {
            self.mirror.join(path.remote_name())
        }
    }

    /// The namespace path a local cache file mirrors, if it lies inside the mirror tree.
    #[must_use]
    pub fn fs_path_of(&self, local: &Path) -> Option<FsPath> {
        let rel = local.strip_prefix(&self.mirror).ok()?;
        let rel = rel.to_str()?;
        if rel.is_empty() {
            return Some(FsPath::root());
        }
        FsPath::new(format!("/{rel}")).ok()
    }

    /// Create every missing cache directory above `path`.
    pub async fn ensure_parent_chain(&self, path: &FsPath) -> std::io::Result<()> {
        match path.parent() {
            Some(parent) => io::create_dir_chain(&self.local_path(&parent)).await,
            None => Ok(()),
        }
    }

    /// Create the cache directories missing above `path` and return them, shallowest first.
    ///
    /// On failure the directories created so far are removed again.
    pub async fn create_missing_parents(&self, path: &FsPath) -> std::io::Result<Vec<PathBuf>> {
        let mut created = Vec::new();
        for ancestor in path.ancestors() {
            let local = self.local_path(&ancestor);
            let result = match tokio::fs::create_dir(&local).await {
                Ok(()) => {
                    created.push(local);
                    Ok(())
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    match tokio::fs::metadata(&local).await {
                        Ok(meta) if meta.is_dir() => Ok(()),
                        Ok(_) => Err(e),
                        Err(stat_err) => Err(stat_err),
                    }
                }
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                for dir in created.iter().rev() {
                    let _ = tokio::fs::remove_dir(dir).await;
                }
                return Err(e);
            }
        }
        Ok(created)
    }

    /// Remove the entire mirror tree contents, keeping the cache root usable.
    pub async fn destroy(&self) -> std::io::Result<()> {
        match io::remove_dir_contents(&self.mirror).await {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}
