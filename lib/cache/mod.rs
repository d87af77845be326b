/// Advisory file locks used to detect open handles.
pub mod advisory;
/// Background eviction of cold cache files.
pub mod evict;
/// Cache root and mirror tree layout.
pub mod layout;
/// Materialization of remote entries into the cache.
pub mod materialize;
/// Process-wide cache usage counters.
pub mod usage;
