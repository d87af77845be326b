//! The filesystem engine: attribute resolution, directory reconciliation, renames, handles and
//! the driver-facing adapter.

/// Attribute Resolver.
pub mod attr;
/// Open file and directory handles.
pub mod handles;
/// Inode number to path mapping for the kernel driver.
pub mod inodes;
/// The [`BlobFs`](ops::BlobFs) engine.
pub mod ops;
/// Directory Reconciliation Engine.
pub mod readdir;
/// Rename/Move Coordinator.
pub mod rename;
/// FUSE adapter: maps [`fuser::Filesystem`] callbacks to [`BlobFs`](ops::BlobFs).
pub mod fuser;

pub use ops::BlobFs;

use std::os::unix::fs::MetadataExt as _;
use std::time::{Duration, SystemTime};

use bitflags::bitflags;

/// Type representing an inode identifier.
pub type InodeAddr = u64;

bitflags! {
    /// Permission bits for an inode, similar to Unix file permissions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct InodePerms: u16 {
        /// Other: execute permission.
        const OTHER_EXECUTE = 1 << 0;
        /// Other: write permission.
        const OTHER_WRITE   = 1 << 1;
        /// Other: read permission.
        const OTHER_READ    = 1 << 2;

        /// Group: execute permission.
        const GROUP_EXECUTE = 1 << 3;
        /// Group: write permission.
        const GROUP_WRITE   = 1 << 4;
        /// Group: read permission.
        const GROUP_READ    = 1 << 5;

        /// Owner: execute permission.
        const OWNER_EXECUTE = 1 << 6;
        /// Owner: write permission.
        const OWNER_WRITE   = 1 << 7;
        /// Owner: read permission.
        const OWNER_READ    = 1 << 8;

        /// Sticky bit.
        const STICKY        = 1 << 9;
        /// Set-group-ID bit.
        const SETGID        = 1 << 10;
        /// Set-user-ID bit.
        const SETUID        = 1 << 11;

        /// Other: read, write, and execute.
        const OTHER_RWX = Self::OTHER_READ.bits()
            | Self::OTHER_WRITE.bits()
            | Self::OTHER_EXECUTE.bits();
        /// Group: read, write, and execute.
        const GROUP_RWX = Self::GROUP_READ.bits()
            | Self::GROUP_WRITE.bits()
            | Self::GROUP_EXECUTE.bits();
        /// Owner: read, write, and execute.
        const OWNER_RWX = Self::OWNER_READ.bits()
            | Self::OWNER_WRITE.bits()
            | Self::OWNER_EXECUTE.bits();
    }
}

bitflags! {
    /// Flags for opening a file, similar to Unix open(2) flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpenFlags: i32 {
        /// Open for reading only.
        const RDONLY = libc::O_RDONLY;
        /// Open for writing only.
        const WRONLY = libc::O_WRONLY;
        /// Open for reading and writing.
        const RDWR = libc::O_RDWR;

        /// Append on each write.
        const APPEND = libc::O_APPEND;
        /// Truncate to zero length.
        const TRUNC = libc::O_TRUNC;
        /// Create file if it does not exist.
        const CREAT = libc::O_CREAT;
        /// Error if file already exists (with `CREAT`).
        const EXCL = libc::O_EXCL;

        /// Non-blocking mode.
        const NONBLOCK = libc::O_NONBLOCK;
        /// Synchronous writes.
        const SYNC = libc::O_SYNC;
        /// Synchronous data integrity writes.
        const DSYNC = libc::O_DSYNC;
        /// Do not follow symlinks.
        const NOFOLLOW = libc::O_NOFOLLOW;
        /// Set close-on-exec.
        const CLOEXEC = libc::O_CLOEXEC;
        /// Fail if not a directory.
        const DIRECTORY = libc::O_DIRECTORY;

        /// Do not update access time (Linux only).
        #[cfg(target_os = "linux")]
        const NOATIME = libc::O_NOATIME;
    }
}

impl InodePerms {
    /// Mode bits of raw `st_mode`-style value, ignoring the file type bits.
    #[must_use]
    #[expect(
        clippy::cast_possible_truncation,
        reason = "masked to the low 12 permission bits"
    )]
    pub fn from_mode(mode: u32) -> Self {
        Self::from_bits_truncate((mode & 0o7777) as u16)
    }
}

/// What a path resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    /// A regular file.
    RegularFile,
    /// A directory.
    Directory,
}

/// Attributes reported for a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileAttr {
    pub kind: EntryKind,
    pub size: u64,
    pub perms: InodePerms,
    /// 2 for an empty directory, 3 for a non-empty one, 1 for files.
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

fn unix_time(secs: i64, nanos: i64) -> SystemTime {
    let nanos = u32::try_from(nanos).unwrap_or(0);
    match u64::try_from(secs) {
        Ok(secs) => SystemTime::UNIX_EPOCH + Duration::new(secs, nanos),
        Err(_) => SystemTime::UNIX_EPOCH,
    }
}

impl FileAttr {
    /// The attributes of the mount root.
    #[must_use]
    pub fn root(perms: InodePerms, uid: u32, gid: u32) -> Self {
        let now = SystemTime::now();
        Self {
            kind: EntryKind::Directory,
            size: 4096,
            perms,
            nlink: 2,
            uid,
            gid,
            atime: now,
            mtime: now,
            ctime: now,
        }
    }

    /// Attributes of a local cache entry, as the host filesystem reports them.
    #[must_use]
    pub fn from_local(meta: &std::fs::Metadata) -> Self {
        let kind = if meta.is_dir() {
            EntryKind::Directory
        } else {
            EntryKind::RegularFile
        };
        Self {
            kind,
            size: meta.len(),
            perms: InodePerms::from_mode(meta.mode()),
            nlink: u32::try_from(meta.nlink()).unwrap_or(u32::MAX),
            uid: meta.uid(),
            gid: meta.gid(),
            atime: unix_time(meta.atime(), meta.atime_nsec()),
            mtime: unix_time(meta.mtime(), meta.mtime_nsec()),
            ctime: unix_time(meta.ctime(), meta.ctime_nsec()),
        }
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

/// One child of a reconciled directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub name: String,
    pub kind: EntryKind,
    /// Byte length for files; zero for directories.
    pub size: u64,
    /// Mode bits, empty when the source reported none.
    pub perms: InodePerms,
}

impl DirectoryEntry {
    #[must_use]
    pub fn directory(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: EntryKind::Directory,
            size: 0,
            perms: InodePerms::empty(),
        }
    }

    #[must_use]
    pub fn file(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            kind: EntryKind::RegularFile,
            size,
            perms: InodePerms::empty(),
        }
    }
}

/// The de-duplicated children of a directory, `.` and `..` first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectoryView {
    pub entries: Vec<DirectoryEntry>,
}

impl DirectoryView {
    /// Look a child up by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&DirectoryEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// Child names, excluding `.` and `..`.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .map(|e| e.name.as_str())
            .filter(|n| *n != "." && *n != "..")
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Filesystem statistics returned by [`BlobFs::statfs`].
///
/// Block-related sizes are in units of `block_size` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FsStats {
    /// Filesystem block size (bytes).
    pub block_size: u32,
    /// Fragment size (bytes).
    pub fragment_size: u32,
    /// Total number of data blocks.
    pub total_blocks: u64,
    /// Number of free blocks.
    pub free_blocks: u64,
    /// Number of blocks available to unprivileged users.
    pub available_blocks: u64,
    /// Total number of file nodes (inodes).
    pub total_inodes: u64,
    /// Number of free file nodes.
    pub free_inodes: u64,
    /// Maximum filename length (bytes).
    pub max_filename_length: u32,
}
