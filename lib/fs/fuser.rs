//! FUSE adapter: maps [`fuser::Filesystem`] callbacks to [`BlobFs`].

use std::collections::HashMap;
use std::ffi::OsStr;
use std::sync::Arc;
use std::time::SystemTime;

use tracing::{debug, error, instrument, warn};

use super::inodes::{InodeTable, ROOT_INO};
use super::{BlobFs, EntryKind, FileAttr, InodeAddr, OpenFlags};
use crate::error::{FsError, FsResult};
use crate::path::FsPath;
use crate::remote::RemoteStore;

/// Trait abstracting the `.error(errno)` method common to all fuser reply types.
trait FuseReply {
    fn error(self, errno: i32);
}

macro_rules! impl_fuse_reply {
    ($($ty:ty),* $(,)?) => {
        $(impl FuseReply for $ty {
            fn error(self, errno: i32) {
                // Calls the inherent fuser method (not this trait method).
                self.error(errno);
            }
        })*
    };
}

impl_fuse_reply!(
    fuser::ReplyEntry,
    fuser::ReplyAttr,
    fuser::ReplyDirectory,
    fuser::ReplyOpen,
    fuser::ReplyData,
    fuser::ReplyEmpty,
    fuser::ReplyWrite,
    fuser::ReplyCreate,
    fuser::ReplyStatfs,
    fuser::ReplyXattr,
);

/// Extension trait on [`FsResult`] for FUSE reply handling.
///
/// Centralizes the error-logging + errno-reply path so each FUSE callback
/// only has to express its success path.
trait FuseResultExt<T> {
    fn fuse_reply<R: FuseReply>(self, reply: R, on_ok: impl FnOnce(T, R));
}

impl<T> FuseResultExt<T> for FsResult<T> {
    fn fuse_reply<R: FuseReply>(self, reply: R, on_ok: impl FnOnce(T, R)) {
        match self {
            Ok(val) => on_ok(val, reply),
            Err(e) => {
                debug!(error = %e, "replying error");
                reply.error(e.errno());
            }
        }
    }
}

const BLOCK_SIZE: u32 = 4096;

fn kind_to_fuser(kind: EntryKind) -> fuser::FileType {
    match kind {
        EntryKind::Directory => fuser::FileType::Directory,
        EntryKind::RegularFile => fuser::FileType::RegularFile,
    }
}

/// Convert engine attributes to the fuser-specific `FileAttr`.
fn to_fuser_attr(ino: InodeAddr, attr: &FileAttr) -> fuser::FileAttr {
    fuser::FileAttr {
        ino,
        size: attr.size,
        blocks: attr.size.div_ceil(512),
        atime: attr.atime,
        mtime: attr.mtime,
        ctime: attr.ctime,
        crtime: attr.ctime,
        kind: kind_to_fuser(attr.kind),
        perm: attr.perms.bits(),
        nlink: attr.nlink,
        uid: attr.uid,
        gid: attr.gid,
        rdev: 0,
        blksize: BLOCK_SIZE,
        flags: 0,
    }
}

/// One readdir row: inode, name and type.
type DirRow = (InodeAddr, String, EntryKind);

/// Bridges [`BlobFs`] to the [`fuser::Filesystem`] trait.
///
/// Owns the inode table, a snapshot of every open directory's listing, and a tokio runtime handle
/// for blocking on async ops.
pub struct FuserAdapter<S: RemoteStore> {
    fs: Arc<BlobFs<S>>,
    inodes: InodeTable,
    open_dirs: HashMap<u64, Vec<DirRow>>,
    runtime: tokio::runtime::Handle,
}

impl<S: RemoteStore> FuserAdapter<S> {
    // TODO: invalidate kernel entries with notify_inval_entry after renames and unlinks so this
    // TTL can grow.
    const TTL: std::time::Duration = std::time::Duration::from_secs(1);

    pub fn new(fs: Arc<BlobFs<S>>, runtime: tokio::runtime::Handle) -> Self {
        Self {
            fs,
            inodes: InodeTable::new(),
            open_dirs: HashMap::new(),
            runtime,
        }
    }

    fn path_of(&self, ino: InodeAddr) -> FsResult<FsPath> {
        self.inodes.path_of(ino).ok_or(FsError::NotFound)
    }

    fn child_path(&self, parent: InodeAddr, name: &OsStr) -> FsResult<FsPath> {
        let name = name.to_str().ok_or(FsError::InvalidArgument)?;
        Ok(self.path_of(parent)?.join(name)?)
    }

    /// Snapshot the listing of `path` as readdir rows.
    fn snapshot(&self, path: &FsPath, ino: InodeAddr) -> FsResult<Vec<DirRow>> {
        let view = self.runtime.block_on(self.fs.list_children(path))?;
        let parent_ino = path
            .parent()
            .map_or(ROOT_INO, |parent| self.inodes.listing_ino(&parent));
        let mut rows = Vec::with_capacity(view.len());
        for entry in view.entries {
            let entry_ino = match entry.name.as_str() {
                "." => ino,
                ".." => parent_ino,
                name => self.inodes.listing_ino(&path.join(name)?),
            };
            rows.push((entry_ino, entry.name, entry.kind));
        }
        Ok(rows)
    }
}

impl<S: RemoteStore> fuser::Filesystem for FuserAdapter<S> {
    #[instrument(name = "FuserAdapter::lookup", skip(self, _req, reply))]
    fn lookup(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        reply: fuser::ReplyEntry,
    ) {
        self.child_path(parent, name)
            .and_then(|path| {
                let attr = self.runtime.block_on(self.fs.stat(&path))?;
                Ok((self.inodes.lookup(&path), attr))
            })
            .fuse_reply(reply, |(ino, attr), reply| {
                let f_attr = to_fuser_attr(ino, &attr);
                debug!(?f_attr, "replying...");
                reply.entry(&Self::TTL, &f_attr, 0);
            });
    }

    #[instrument(name = "FuserAdapter::getattr", skip(self, _req, _fh, reply))]
    fn getattr(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        _fh: Option<u64>,
        reply: fuser::ReplyAttr,
    ) {
        self.path_of(ino)
            .and_then(|path| self.runtime.block_on(self.fs.stat(&path)))
            .fuse_reply(reply, |attr, reply| {
                reply.attr(&Self::TTL, &to_fuser_attr(ino, &attr));
            });
    }

    #[instrument(
        name = "FuserAdapter::setattr",
        skip(self, _req, _atime, _mtime, _ctime, fh, _crtime, _chgtime, _bkuptime, _flags, reply)
    )]
    fn setattr(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<fuser::TimeOrNow>,
        _mtime: Option<fuser::TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: fuser::ReplyAttr,
    ) {
        let result = self.path_of(ino).and_then(|path| {
            self.runtime.block_on(async {
                if let Some(mode) = mode {
                    self.fs.chmod(&path, mode).await?;
                }
                if uid.is_some() || gid.is_some() {
                    self.fs.chown(&path, uid, gid)?;
                }
                if let Some(size) = size {
                    self.fs.truncate(&path, size).await?;
                }
                if let Some(fh) = fh {
                    self.fs.fsync(fh)?;
                }
                self.fs.utimens(&path)?;
                self.fs.stat(&path).await
            })
        });
        result.fuse_reply(reply, |attr, reply| {
            reply.attr(&Self::TTL, &to_fuser_attr(ino, &attr));
        });
    }

    fn readlink(&mut self, _req: &fuser::Request<'_>, ino: u64, reply: fuser::ReplyData) {
        self.path_of(ino)
            .and_then(|path| self.fs.readlink(&path))
            .fuse_reply(reply, |(), reply| reply.data(&[]));
    }

    fn mknod(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _rdev: u32,
        reply: fuser::ReplyEntry,
    ) {
        self.child_path(parent, name)
            .and_then(|path| self.fs.mknod(&path, mode))
            .fuse_reply(reply, |(), reply| reply.error(libc::ENOSYS));
    }

    #[instrument(name = "FuserAdapter::mkdir", skip(self, _req, reply))]
    fn mkdir(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: fuser::ReplyEntry,
    ) {
        self.child_path(parent, name)
            .and_then(|path| {
                let attr = self.runtime.block_on(self.fs.mkdir(&path, mode & !umask))?;
                Ok((self.inodes.lookup(&path), attr))
            })
            .fuse_reply(reply, |(ino, attr), reply| {
                reply.entry(&Self::TTL, &to_fuser_attr(ino, &attr), 0);
            });
    }

    #[instrument(name = "FuserAdapter::unlink", skip(self, _req, reply))]
    fn unlink(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        reply: fuser::ReplyEmpty,
    ) {
        self.child_path(parent, name)
            .and_then(|path| {
                self.runtime.block_on(self.fs.unlink(&path))?;
                self.inodes.remove_subtree(&path);
                Ok(())
            })
            .fuse_reply(reply, |(), reply| reply.ok());
    }

    #[instrument(name = "FuserAdapter::rmdir", skip(self, _req, reply))]
    fn rmdir(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        reply: fuser::ReplyEmpty,
    ) {
        self.child_path(parent, name)
            .and_then(|path| {
                self.runtime.block_on(self.fs.rmdir(&path))?;
                self.inodes.remove_subtree(&path);
                Ok(())
            })
            .fuse_reply(reply, |(), reply| reply.ok());
    }

    fn symlink(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &std::path::Path,
        reply: fuser::ReplyEntry,
    ) {
        self.child_path(parent, link_name)
            .and_then(|path| self.fs.symlink(&path, &target.to_string_lossy()))
            .fuse_reply(reply, |(), reply| reply.error(libc::ENOSYS));
    }

    #[instrument(name = "FuserAdapter::rename", skip(self, _req, _flags, reply))]
    fn rename(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: fuser::ReplyEmpty,
    ) {
        let paths = self
            .child_path(parent, name)
            .and_then(|src| Ok((src, self.child_path(newparent, newname)?)));
        paths
            .and_then(|(src, dst)| {
                self.runtime.block_on(self.fs.rename(&src, &dst))?;
                self.inodes.rebase(&src, &dst);
                Ok(())
            })
            .fuse_reply(reply, |(), reply| reply.ok());
    }

    fn link(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: fuser::ReplyEntry,
    ) {
        self.path_of(ino)
            .and_then(|src| Ok((src, self.child_path(newparent, newname)?)))
            .and_then(|(src, dst)| self.fs.link(&src, &dst))
            .fuse_reply(reply, |(), reply| reply.error(libc::ENOSYS));
    }

    #[instrument(name = "FuserAdapter::open", skip(self, _req, flags, reply))]
    fn open(&mut self, _req: &fuser::Request<'_>, ino: u64, flags: i32, reply: fuser::ReplyOpen) {
        let flags = OpenFlags::from_bits_truncate(flags);
        self.path_of(ino)
            .and_then(|path| self.runtime.block_on(self.fs.open(&path, flags)))
            .fuse_reply(reply, |fh, reply| {
                debug!(handle = fh, "replying...");
                reply.opened(fh, 0);
            });
    }

    #[instrument(
        name = "FuserAdapter::read",
        skip(self, _req, _ino, fh, offset, size, _flags, _lock_owner, reply)
    )]
    fn read(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: fuser::ReplyData,
    ) {
        self.runtime
            .block_on(self.fs.read(fh, offset.cast_unsigned(), size))
            .fuse_reply(reply, |data, reply| {
                debug!(read_bytes = data.len(), "replying...");
                reply.data(&data);
            });
    }

    #[instrument(
        name = "FuserAdapter::write",
        skip(self, _req, _ino, fh, offset, data, _write_flags, _flags, _lock_owner, reply)
    )]
    fn write(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: fuser::ReplyWrite,
    ) {
        self.runtime
            .block_on(self.fs.write(fh, offset.cast_unsigned(), data))
            .fuse_reply(reply, |written, reply| reply.written(written));
    }

    #[instrument(name = "FuserAdapter::flush", skip(self, _req, _ino, _lock_owner, reply))]
    fn flush(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        _lock_owner: u64,
        reply: fuser::ReplyEmpty,
    ) {
        self.runtime
            .block_on(self.fs.flush(fh))
            .fuse_reply(reply, |(), reply| reply.ok());
    }

    #[instrument(
        name = "FuserAdapter::release",
        skip(self, _req, _ino, _flags, _lock_owner, _flush, reply)
    )]
    fn release(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: fuser::ReplyEmpty,
    ) {
        self.runtime
            .block_on(self.fs.release(fh))
            .fuse_reply(reply, |(), reply| reply.ok());
    }

    fn fsync(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        _datasync: bool,
        reply: fuser::ReplyEmpty,
    ) {
        self.fs.fsync(fh).fuse_reply(reply, |(), reply| reply.ok());
    }

    #[instrument(name = "FuserAdapter::opendir", skip(self, _req, _flags, reply))]
    fn opendir(&mut self, _req: &fuser::Request<'_>, ino: u64, _flags: i32, reply: fuser::ReplyOpen) {
        let result = self.path_of(ino).and_then(|path| {
            let fh = self.runtime.block_on(self.fs.opendir(&path))?;
            match self.snapshot(&path, ino) {
                Ok(rows) => Ok((fh, rows)),
                Err(e) => {
                    if let Err(close) = self.fs.releasedir(fh) {
                        warn!(error = %close, "failed to close directory after listing error");
                    }
                    Err(e)
                }
            }
        });
        result.fuse_reply(reply, |(fh, rows), reply| {
            self.open_dirs.insert(fh, rows);
            reply.opened(fh, 0);
        });
    }

    #[instrument(name = "FuserAdapter::readdir", skip(self, _req, offset, reply))]
    fn readdir(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: fuser::ReplyDirectory,
    ) {
        let Some(rows) = self.open_dirs.get(&fh) else {
            debug!("directory handle not open, replying error");
            reply.error(libc::EBADF);
            return;
        };

        let skip = usize::try_from(offset).unwrap_or(0);
        for (i, (entry_ino, entry_name, entry_kind)) in rows.iter().enumerate().skip(skip) {
            let Ok(idx) = i64::try_from(i + 1) else {
                error!("Directory entry index {} too large for fuser", i + 1);
                reply.error(libc::EIO);
                return;
            };
            if reply.add(*entry_ino, idx, kind_to_fuser(*entry_kind), entry_name) {
                debug!("buffer full for now, stopping readdir");
                break;
            }
        }
        reply.ok();
    }

    #[instrument(name = "FuserAdapter::releasedir", skip(self, _req, _ino, _flags, reply))]
    fn releasedir(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        reply: fuser::ReplyEmpty,
    ) {
        self.open_dirs.remove(&fh);
        self.fs
            .releasedir(fh)
            .fuse_reply(reply, |(), reply| reply.ok());
    }

    #[instrument(name = "FuserAdapter::statfs", skip(self, _req, _ino, reply))]
    fn statfs(&mut self, _req: &fuser::Request<'_>, _ino: u64, reply: fuser::ReplyStatfs) {
        self.fs.statfs().fuse_reply(reply, |stats, reply| {
            debug!(?stats, "replying...");
            reply.statfs(
                stats.total_blocks,
                stats.free_blocks,
                stats.available_blocks,
                stats.total_inodes,
                stats.free_inodes,
                stats.block_size,
                stats.max_filename_length,
                stats.fragment_size,
            );
        });
    }

    fn setxattr(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        _name: &OsStr,
        _value: &[u8],
        _flags: i32,
        _position: u32,
        reply: fuser::ReplyEmpty,
    ) {
        self.path_of(ino)
            .and_then(|path| self.fs.xattr(&path))
            .fuse_reply(reply, |(), reply| reply.ok());
    }

    fn getxattr(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        _name: &OsStr,
        _size: u32,
        reply: fuser::ReplyXattr,
    ) {
        self.path_of(ino)
            .and_then(|path| self.fs.xattr(&path))
            .fuse_reply(reply, |(), reply| reply.size(0));
    }

    fn listxattr(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        _size: u32,
        reply: fuser::ReplyXattr,
    ) {
        self.path_of(ino)
            .and_then(|path| self.fs.xattr(&path))
            .fuse_reply(reply, |(), reply| reply.size(0));
    }

    fn removexattr(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        _name: &OsStr,
        reply: fuser::ReplyEmpty,
    ) {
        self.path_of(ino)
            .and_then(|path| self.fs.xattr(&path))
            .fuse_reply(reply, |(), reply| reply.ok());
    }

    #[instrument(name = "FuserAdapter::create", skip(self, _req, _flags, reply))]
    fn create(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        _flags: i32,
        reply: fuser::ReplyCreate,
    ) {
        self.child_path(parent, name)
            .and_then(|path| {
                let (fh, attr) = self.runtime.block_on(self.fs.create(&path, mode & !umask))?;
                Ok((self.inodes.lookup(&path), fh, attr))
            })
            .fuse_reply(reply, |(ino, fh, attr), reply| {
                reply.created(&Self::TTL, &to_fuser_attr(ino, &attr), 0, fh, 0);
            });
    }

    #[instrument(name = "FuserAdapter::forget", skip(self, _req))]
    fn forget(&mut self, _req: &fuser::Request<'_>, ino: u64, nlookup: u64) {
        self.inodes.forget(ino, nlookup);
    }

    #[instrument(name = "FuserAdapter::batch_forget", skip(self, _req, nodes))]
    fn batch_forget(&mut self, _req: &fuser::Request<'_>, nodes: &[fuser::fuse_forget_one]) {
        for node in nodes {
            self.inodes.forget(node.nodeid, node.nlookup);
        }
    }

    #[instrument(name = "FuserAdapter::destroy", skip(self))]
    fn destroy(&mut self) {
        self.open_dirs.clear();
        self.runtime.block_on(self.fs.destroy());
    }
}
