//! blob-fs shared library.
//!
//! A cache consistency and directory-reconciliation engine that projects a remote object store
//! as a POSIX directory tree backed by an on-disk cache.

/// The on-disk cache: layout, usage counters, advisory locks, materialization and eviction.
pub mod cache;
/// Engine configuration.
pub mod config;
/// Error taxonomy and errno translation.
pub mod error;
/// Filesystem operations and the kernel driver adapter.
pub mod fs;
pub mod io;
/// Per-path locking.
pub mod lock;
/// Absolute namespace paths.
pub mod path;
/// The remote store capability and its backends.
pub mod remote;
