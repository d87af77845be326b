//! Propagating renames across the local cache and the remote store.
//!
//! File renames are a single remote move (native or copy plus delete) followed by a best-effort
//! local rename. Directory renames on hierarchical backends are one native move. On flat
//! backends the subtree is planned into a work-list of files and directories, files are moved
//! one by one, and directory markers are moved deepest first with the top-level marker last. The
//! destination marker is always created before the source marker is deleted, so a failure midway
//! never leaves both absent. Child failures are logged and skipped.

use rustc_hash::FxHashSet;
use tracing::{debug, info, instrument, warn};

use super::{BlobFs, EntryKind};
use crate::error::{FsError, FsResult, RemoteFault};
use crate::io;
use crate::path::FsPath;
use crate::remote::{FORMER_DIRECTORY_MARKER, RemoteStore};

/// Source and destination of one rename step.
type Move = (FsPath, FsPath);

/// Everything a flat directory rename has to move.
#[derive(Debug, Default)]
pub(crate) struct RenamePlan {
    /// Regular files, in discovery order.
    pub(crate) files: Vec<Move>,
    /// Directories, the top-level directory first.
    pub(crate) dirs: Vec<Move>,
}

impl RenamePlan {
    /// Directories ordered deepest first, so the top-level directory comes last.
    fn dirs_deepest_first(&self) -> Vec<Move> {
        let mut dirs = self.dirs.clone();
        dirs.sort_by_key(|(src, _)| std::cmp::Reverse(src.ancestors().count()));
        dirs
    }
}

impl<S: RemoteStore> BlobFs<S> {
    /// Rename `src` to `dst`.
    ///
    /// Reports success once the top-level object has moved, regardless of child stragglers.
    #[instrument(name = "BlobFs::rename", skip(self))]
    pub async fn rename(&self, src: &FsPath, dst: &FsPath) -> FsResult<()> {
        if src.is_root() || dst.is_root() || dst.is_descendant_of(src) {
            return Err(FsError::InvalidArgument);
        }
        let attr = self.stat(src).await?;
        if src == dst {
            return Ok(());
        }
        match attr.kind {
            EntryKind::RegularFile => self.rename_file(src, dst).await,
            EntryKind::Directory if self.store.supports_native_move() => {
                self.rename_directory_native(src, dst).await
            }
            EntryKind::Directory => self.rename_directory_flat(src, dst).await,
        }
    }

    /// Move one remote object, natively when the backend can.
    async fn move_remote_object(&self, src: &FsPath, dst: &FsPath) -> Result<(), RemoteFault> {
        if self.store.supports_native_move() {
            return self
                .store
                .move_object(src.remote_name(), dst.remote_name())
                .await;
        }
        self.store
            .copy_object(src.remote_name(), dst.remote_name())
            .await?;
        self.store.delete_object(src.remote_name()).await
    }

    async fn rename_file(&self, src: &FsPath, dst: &FsPath) -> FsResult<()> {
        let _pair = self.locks.acquire_pair(src, dst).await;
        match self.stat_locked(dst).await {
            Ok(existing) if existing.is_dir() => return Err(FsError::IsADirectory),
            Ok(_) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        self.move_file_locked(src, dst).await
    }

    /// Move a single file. Both paths must be locked.
    async fn move_file_locked(&self, src: &FsPath, dst: &FsPath) -> FsResult<()> {
        let local_src = self.cache.local_path(src);
        let local_dst = self.cache.local_path(dst);
        let has_local = tokio::fs::try_exists(&local_src).await?;

        match self.move_remote_object(src, dst).await {
            Ok(()) => {}
            Err(fault) if fault.is_not_found() && has_local => {
                debug!(%src, "source not uploaded yet, moving locally only");
            }
            Err(fault) => return Err(fault.into()),
        }

        if has_local {
            let moved = match self.cache.ensure_parent_chain(dst).await {
                Ok(()) => tokio::fs::rename(&local_src, &local_dst).await,
                Err(e) => Err(e),
            };
            if let Err(e) = moved {
                warn!(%src, %dst, error = %e, "remote rename succeeded but local rename failed");
                self.usage.untrack(src);
                return Ok(());
            }
        } else {
            match tokio::fs::remove_file(&local_dst).await {
                Ok(()) => debug!(%dst, "dropped stale local copy of destination"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(%dst, error = %e, "failed to drop stale local copy"),
            }
        }

        self.usage.untrack(dst);
        self.usage.rebase(src, dst);
        self.handles.rebase(src, dst);
        Ok(())
    }

    /// Fail unless `dst` is absent or an empty directory.
    async fn check_directory_target(&self, dst: &FsPath) -> FsResult<()> {
        match self.stat(dst).await {
            Ok(attr) if !attr.is_dir() => Err(FsError::NotADirectory),
            Ok(_) => {
                if self.list_children(dst).await?.names().next().is_some() {
                    Err(FsError::NotEmpty)
                } else {
                    Ok(())
                }
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn rename_directory_native(&self, src: &FsPath, dst: &FsPath) -> FsResult<()> {
        self.check_directory_target(dst).await?;
        let _pair = self.locks.acquire_pair(src, dst).await;
        let local_src = self.cache.local_path(src);
        let local_dst = self.cache.local_path(dst);
        let has_local = tokio::fs::try_exists(&local_src).await?;

        match self
            .store
            .move_object(src.remote_name(), dst.remote_name())
            .await
        {
            Ok(()) => {}
            Err(fault) if fault.is_not_found() && has_local => {
                debug!(%src, "directory exists only locally");
            }
            Err(fault) => return Err(fault.into()),
        }

        if has_local
            && let Err(e) = self.rename_local_directory(dst, &local_src, &local_dst).await
        {
            warn!(%src, %dst, error = %e, "remote rename succeeded but local rename failed");
        }
        self.usage.rebase(src, dst);
        self.handles.rebase(src, dst);
        info!(%src, %dst, "renamed directory");
        Ok(())
    }

    async fn rename_local_directory(
        &self,
        dst: &FsPath,
        local_src: &std::path::Path,
        local_dst: &std::path::Path,
    ) -> std::io::Result<()> {
        self.cache.ensure_parent_chain(dst).await?;
        match tokio::fs::remove_dir(local_dst).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        tokio::fs::rename(local_src, local_dst).await
    }

    /// Walk the subtree of `src` and plan every move, without holding any lock across the walk.
    pub(crate) async fn plan_rename(&self, src: &FsPath, dst: &FsPath) -> FsResult<RenamePlan> {
        let mut plan = RenamePlan::default();
        let mut seen: FxHashSet<FsPath> = FxHashSet::default();
        let mut pending = vec![src.clone()];
        plan.dirs.push((src.clone(), dst.clone()));
        seen.insert(src.clone());

        while let Some(dir) = pending.pop() {
            let view = match self.list_children(&dir).await {
                Ok(view) => view,
                Err(e) if dir == *src => return Err(e),
                Err(e) => {
                    warn!(%dir, error = %e, "failed to list directory, skipping its subtree");
                    continue;
                }
            };
            for entry in view.entries {
                if entry.name == "." || entry.name == ".." {
                    continue;
                }
                let child = dir.join(&entry.name)?;
                if !seen.insert(child.clone()) {
                    continue;
                }
                let Some(target) = child.rebase(src, dst) else {
                    continue;
                };
                match entry.kind {
                    EntryKind::Directory => {
                        pending.push(child.clone());
                        plan.dirs.push((child, target));
                    }
                    EntryKind::RegularFile => plan.files.push((child, target)),
                }
            }
        }
        debug!(
            files = plan.files.len(),
            dirs = plan.dirs.len(),
            "planned directory rename"
        );
        Ok(plan)
    }

    async fn rename_directory_flat(&self, src: &FsPath, dst: &FsPath) -> FsResult<()> {
        self.check_directory_target(dst).await?;
        let plan = self.plan_rename(src, dst).await?;

        {
            let _guard = self.locks.acquire(dst).await;
            self.store
                .create_directory_marker(dst.remote_name())
                .await?;
            self.cache.ensure_parent_chain(dst).await?;
            io::create_dir_chain(&self.cache.local_path(dst)).await?;
        }

        let mut stragglers = 0usize;
        for (from, to) in &plan.files {
            let _pair = self.locks.acquire_pair(from, to).await;
            if let Err(e) = self.move_file_locked(from, to).await {
                warn!(src = %from, dst = %to, error = %e, "failed to move file, continuing");
                stragglers += 1;
            }
        }

        for (from, to) in plan.dirs_deepest_first() {
            if let Err(e) = self.move_directory_marker(&from, &to, to != *dst).await {
                warn!(src = %from, dst = %to, error = %e, "failed to move directory marker");
                stragglers += 1;
            }
        }

        self.usage.rebase(src, dst);
        self.handles.rebase(src, dst);
        if stragglers > 0 {
            warn!(%src, %dst, stragglers, "directory renamed with stragglers left behind");
        } else {
            info!(%src, %dst, "renamed directory");
        }
        Ok(())
    }

    /// Create the marker for `to`, then delete the marker and the local placeholder of `from`.
    async fn move_directory_marker(
        &self,
        from: &FsPath,
        to: &FsPath,
        create_target: bool,
    ) -> FsResult<()> {
        let _pair = self.locks.acquire_pair(from, to).await;
        if create_target {
            self.store.create_directory_marker(to.remote_name()).await?;
            io::create_dir_chain(&self.cache.local_path(to)).await?;
        }

        let sentinel = from.join(FORMER_DIRECTORY_MARKER)?;
        if let Err(fault) = self.store.delete_object(sentinel.remote_name()).await
            && !fault.is_not_found()
        {
            return Err(fault.into());
        }
        match self
            .store
            .delete_directory(from.remote_name(), false)
            .await
        {
            Ok(()) => {}
            Err(fault) if fault.is_not_found() => {}
            Err(fault) if fault.status == RemoteFault::CONFLICT => {
                warn!(dir = %from, "source directory still has children remotely");
            }
            Err(fault) => return Err(fault.into()),
        }

        let local = self.cache.local_path(from);
        match tokio::fs::remove_dir(&local).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                warn!(dir = %from, error = %e, "local source directory not empty, leaving it");
                Ok(())
            }
        }
    }
}
