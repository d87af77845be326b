//! The remote object store capability consumed by the engine.
//!
//! Every backend implements [`RemoteStore`]. Which backend serves a mount is decided once, at
//! construction, by picking a [`Backend`] variant.

/// Mode-bit and permission-string conversions.
pub mod acl;
/// Paginated listings and directory emptiness probes.
pub mod lister;
/// A hierarchical backend over a host directory.
pub mod local;
/// An in-process backend, flat or hierarchical.
pub mod memory;

use std::collections::BTreeMap;
use std::path::Path;
use std::time::SystemTime;

use crate::error::RemoteFault;
use crate::fs::InodePerms;

pub use local::LocalDirStore;
pub use memory::MemoryStore;

/// Metadata key flagging a zero-length object as an explicit directory marker.
pub const DIRECTORY_MARKER_KEY: &str = "hdi_isfolder";

/// Sentinel object some legacy tools leave inside directories.
pub const FORMER_DIRECTORY_MARKER: &str = ".directory";

/// Delimiter used for hierarchical listings.
pub const DELIMITER: &str = "/";

/// How a backend models directories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    /// Directories are implicit, optionally made explicit by zero-length marker objects.
    Flat,
    /// Directories are native nodes and moves are atomic.
    Hierarchical,
}

/// A named object or directory node in the remote store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    /// Object name, without a leading separator.
    pub name: String,
    pub size: u64,
    pub last_modified: SystemTime,
    pub etag: String,
    pub content_type: String,
    pub metadata: BTreeMap<String, String>,
    /// The backend natively reports this entry as a directory.
    pub native_directory: bool,
    pub owner: Option<String>,
    pub group: Option<String>,
    /// 9-character permission string, e.g. `rwxr-x---`.
    pub permissions: Option<String>,
    pub acl: Option<String>,
}

impl RemoteEntry {
    /// An entry with empty metadata, last modified now.
    #[must_use]
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
            last_modified: SystemTime::now(),
            etag: String::new(),
            content_type: String::from("application/octet-stream"),
            metadata: BTreeMap::new(),
            native_directory: false,
            owner: None,
            group: None,
            permissions: None,
            acl: None,
        }
    }

    /// Zero-length object carrying `hdi_isfolder=true`: the flat-namespace directory convention.
    #[must_use]
    pub fn is_directory_blob(&self) -> bool {
        self.size == 0
            && self
                .metadata
                .get(DIRECTORY_MARKER_KEY)
                .is_some_and(|v| v.eq_ignore_ascii_case("true"))
    }

    #[must_use]
    pub fn is_directory(&self) -> bool {
        self.native_directory || self.is_directory_blob()
    }

    /// Mode bits reported by the backend; empty when it reports none.
    #[must_use]
    pub fn perms(&self) -> InodePerms {
        self.permissions
            .as_deref()
            .map_or_else(InodePerms::empty, acl::parse_permissions)
    }
}

/// One item of a delimiter listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListItem {
    /// A virtual directory rolled up by the delimiter. The name ends with the delimiter.
    Prefix(String),
    /// An object, or a native directory node on hierarchical backends.
    Object(RemoteEntry),
}

impl ListItem {
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Prefix(name) => name,
            Self::Object(entry) => &entry.name,
        }
    }
}

/// One page of a listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListPage {
    pub items: Vec<ListItem>,
    /// Token for the next page; `None` once the listing is exhausted.
    pub continuation: Option<String>,
}

/// The remote store as the engine sees it. Names never carry a leading separator.
pub trait RemoteStore: Send + Sync + 'static {
    /// How this backend models directories.
    fn namespace(&self) -> Namespace;

    /// Whether [`move_object`](Self::move_object) is a native operation.
    fn supports_native_move(&self) -> bool {
        self.namespace() == Namespace::Hierarchical
    }

    /// Properties of the object or directory node named exactly `name`.
    fn get_properties(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<RemoteEntry, RemoteFault>> + Send;

    /// List entries whose names start with `prefix`.
    ///
    /// With a delimiter, names containing it past the prefix are rolled up into
    /// [`ListItem::Prefix`] items. Without one, every object under the prefix is returned.
    fn list(
        &self,
        prefix: &str,
        delimiter: Option<&str>,
        continuation: Option<&str>,
        page_size: usize,
    ) -> impl Future<Output = Result<ListPage, RemoteFault>> + Send;

    fn create_directory_marker(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<(), RemoteFault>> + Send;

    /// Delete a directory. Without `recursive`, a directory with children is a conflict on
    /// hierarchical backends.
    fn delete_directory(
        &self,
        name: &str,
        recursive: bool,
    ) -> impl Future<Output = Result<(), RemoteFault>> + Send;

    fn delete_object(&self, name: &str) -> impl Future<Output = Result<(), RemoteFault>> + Send;

    /// Replace the object `name` with the bytes of the local file `source`.
    fn upload(
        &self,
        name: &str,
        source: &Path,
    ) -> impl Future<Output = Result<(), RemoteFault>> + Send;

    /// Write the bytes of object `name` into the local file `target`.
    fn download(
        &self,
        name: &str,
        target: &Path,
    ) -> impl Future<Output = Result<RemoteEntry, RemoteFault>> + Send;

    /// Natively move an object or directory. Backends without native moves report 501.
    fn move_object(
        &self,
        src: &str,
        dst: &str,
    ) -> impl Future<Output = Result<(), RemoteFault>> + Send;

    fn copy_object(
        &self,
        src: &str,
        dst: &str,
    ) -> impl Future<Output = Result<(), RemoteFault>> + Send;

    /// Apply an access-control string such as `user::rwx,group::r-x,other::---`.
    fn set_access_control(
        &self,
        name: &str,
        acl: &str,
    ) -> impl Future<Output = Result<(), RemoteFault>> + Send;
}

/// The backend selected for a mount.
#[derive(Debug)]
pub enum Backend {
    Memory(MemoryStore),
    Local(LocalDirStore),
}

macro_rules! dispatch {
    ($self:ident, $store:ident => $call:expr) => {
        match $self {
            Self::Memory($store) => $call,
            Self::Local($store) => $call,
        }
    };
}

impl RemoteStore for Backend {
    fn namespace(&self) -> Namespace {
        dispatch!(self, s => s.namespace())
    }

    async fn get_properties(&self, name: &str) -> Result<RemoteEntry, RemoteFault> {
        dispatch!(self, s => s.get_properties(name).await)
    }

    async fn list(
        &self,
        prefix: &str,
        delimiter: Option<&str>,
        continuation: Option<&str>,
        page_size: usize,
    ) -> Result<ListPage, RemoteFault> {
        dispatch!(self, s => s.list(prefix, delimiter, continuation, page_size).await)
    }

    async fn create_directory_marker(&self, name: &str) -> Result<(), RemoteFault> {
        dispatch!(self, s => s.create_directory_marker(name).await)
    }

    async fn delete_directory(&self, name: &str, recursive: bool) -> Result<(), RemoteFault> {
        dispatch!(self, s => s.delete_directory(name, recursive).await)
    }

    async fn delete_object(&self, name: &str) -> Result<(), RemoteFault> {
        dispatch!(self, s => s.delete_object(name).await)
    }

    async fn upload(&self, name: &str, source: &Path) -> Result<(), RemoteFault> {
        dispatch!(self, s => s.upload(name, source).await)
    }

    async fn download(&self, name: &str, target: &Path) -> Result<RemoteEntry, RemoteFault> {
        dispatch!(self, s => s.download(name, target).await)
    }

    async fn move_object(&self, src: &str, dst: &str) -> Result<(), RemoteFault> {
        dispatch!(self, s => s.move_object(src, dst).await)
    }

    async fn copy_object(&self, src: &str, dst: &str) -> Result<(), RemoteFault> {
        dispatch!(self, s => s.copy_object(src, dst).await)
    }

    async fn set_access_control(&self, name: &str, acl: &str) -> Result<(), RemoteFault> {
        dispatch!(self, s => s.set_access_control(name, acl).await)
    }
}

/// Cut one page out of a fully materialized, name-sorted listing.
///
/// The continuation token is the name of the first item of the next page.
pub(crate) fn paginate(
    items: &[ListItem],
    continuation: Option<&str>,
    page_size: usize,
) -> ListPage {
    let start = continuation.map_or(0, |token| items.partition_point(|i| i.name() < token));
    let end = start.saturating_add(page_size.max(1)).min(items.len());
    ListPage {
        items: items[start..end].to_vec(),
        continuation: items.get(end).map(|next| next.name().to_owned()),
    }
}

/// Map a local IO failure inside a backend to a transport-shaped fault.
#[expect(
    clippy::wildcard_enum_match_arm,
    reason = "ErrorKind is non_exhaustive; 500 is the safe default"
)]
pub(crate) fn fault_from_io(e: &std::io::Error) -> RemoteFault {
    match e.kind() {
        std::io::ErrorKind::NotFound => RemoteFault::not_found(),
        std::io::ErrorKind::PermissionDenied => RemoteFault::new(RemoteFault::FORBIDDEN),
        std::io::ErrorKind::AlreadyExists | std::io::ErrorKind::DirectoryNotEmpty => {
            RemoteFault::new(RemoteFault::CONFLICT)
        }
        _ => RemoteFault::new(RemoteFault::INTERNAL),
    }
}
