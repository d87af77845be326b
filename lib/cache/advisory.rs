//! Advisory `flock(2)` locks on cached files and directories.
//!
//! Every open handle holds a shared lock on its cache entry. The evictor and the directory
//! refresher probe with a non-blocking exclusive lock to learn whether anyone holds one.

use std::fs::File;
use std::path::Path;

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use tracing::trace;

use crate::error::{FsError, FsResult};

/// A file descriptor holding a shared advisory lock until dropped.
pub type SharedLock = Flock<File>;

/// Take a shared lock on `file`.
///
/// With `nonblocking`, contention is reported as [`FsError::Contention`]; otherwise the lock is
/// awaited on the blocking pool.
pub async fn lock_shared(file: File, nonblocking: bool) -> FsResult<SharedLock> {
    if nonblocking {
        return Flock::lock(file, FlockArg::LockSharedNonblock).map_err(|(_, errno)| errno.into());
    }
    tokio::task::spawn_blocking(move || Flock::lock(file, FlockArg::LockShared))
        .await
        .map_err(|e| FsError::LocalIo(std::io::Error::other(e)))?
        .map_err(|(_, errno)| errno.into())
}

/// Outcome of probing a cache entry for holders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    /// Nobody holds a lock; the entry may be replaced or removed.
    Free,
    /// Some handle holds a lock.
    Held,
    /// The entry does not exist.
    Missing,
}

/// Check whether any handle holds a lock on `path` without waiting.
///
/// The probe lock is released before returning.
pub fn probe(path: &Path) -> FsResult<Probe> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Probe::Missing),
        Err(e) => return Err(e.into()),
    };
    match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
        Ok(_released_on_drop) => Ok(Probe::Free),
        Err((_, Errno::EWOULDBLOCK)) => {
            trace!(path = %path.display(), "advisory lock is held");
            Ok(Probe::Held)
        }
        Err((_, errno)) => Err(FsError::LocalIo(std::io::Error::from(errno))),
    }
}

/// Run `f` while holding an exclusive lock on `path`, or return `None` if the lock is held.
pub fn with_exclusive<T>(path: &Path, f: impl FnOnce() -> T) -> FsResult<Option<T>> {
    let file = File::open(path)?;
    match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
        Ok(held) => {
            let out = f();
            drop(held);
            Ok(Some(out))
        }
        Err((_, Errno::EWOULDBLOCK)) => Ok(None),
        Err((_, errno)) => Err(FsError::LocalIo(std::io::Error::from(errno))),
    }
}
