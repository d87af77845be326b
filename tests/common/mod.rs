#![allow(dead_code, missing_docs, clippy::unwrap_used)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tempfile::TempDir;

use blob_fs::config::EngineConfig;
use blob_fs::error::RemoteFault;
use blob_fs::fs::BlobFs;
use blob_fs::path::FsPath;
use blob_fs::remote::memory::MemoryStore;
use blob_fs::remote::{ListItem, ListPage, Namespace, RemoteEntry, RemoteStore};

/// The remote calls a [`FaultyStore`] can count and fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    GetProperties,
    List,
    CreateMarker,
    DeleteDirectory,
    DeleteObject,
    Upload,
    Download,
    Move,
    Copy,
    SetAccessControl,
}

/// A [`MemoryStore`] that counts calls and fails them on demand.
pub struct FaultyStore {
    pub inner: MemoryStore,
    /// Faults keyed by operation and, optionally, the exact name they apply to.
    faults: Mutex<HashMap<(Op, Option<String>), u16>>,
    calls: Mutex<HashMap<Op, usize>>,
    /// Empty pages carrying a continuation token to serve before real list pages.
    empty_pages: AtomicUsize,
    /// Start each listing with the listed directory itself, as hierarchical services do.
    echo_self: AtomicBool,
}

impl FaultyStore {
    pub fn new(inner: MemoryStore) -> Self {
        Self {
            inner,
            faults: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
            empty_pages: AtomicUsize::new(0),
            echo_self: AtomicBool::new(false),
        }
    }

    pub fn flat() -> Self {
        Self::new(MemoryStore::flat())
    }

    pub fn hierarchical() -> Self {
        Self::new(MemoryStore::hierarchical())
    }

    /// Fail every `op` call with `status`.
    pub fn fail(&self, op: Op, status: u16) {
        self.faults.lock().unwrap().insert((op, None), status);
    }

    /// Fail `op` calls naming exactly `name` with `status`.
    pub fn fail_on(&self, op: Op, name: &str, status: u16) {
        self.faults
            .lock()
            .unwrap()
            .insert((op, Some(name.to_owned())), status);
    }

    pub fn heal(&self) {
        self.faults.lock().unwrap().clear();
    }

    pub fn inject_empty_pages(&self, count: usize) {
        self.empty_pages.store(count, Ordering::SeqCst);
    }

    pub fn echo_self_entries(&self) {
        self.echo_self.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self, op: Op) -> usize {
        self.calls.lock().unwrap().get(&op).copied().unwrap_or(0)
    }

    pub fn reset_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    /// Count the call and return the fault configured for it, if any.
    fn enter(&self, op: Op, name: &str) -> Result<(), RemoteFault> {
        *self.calls.lock().unwrap().entry(op).or_insert(0) += 1;
        let faults = self.faults.lock().unwrap();
        let status = faults
            .get(&(op, Some(name.to_owned())))
            .or_else(|| faults.get(&(op, None)));
        match status {
            Some(&status) => Err(RemoteFault::new(status)),
            None => Ok(()),
        }
    }
}

impl RemoteStore for FaultyStore {
    fn namespace(&self) -> Namespace {
        self.inner.namespace()
    }

    async fn get_properties(&self, name: &str) -> Result<RemoteEntry, RemoteFault> {
        self.enter(Op::GetProperties, name)?;
        self.inner.get_properties(name).await
    }

    async fn list(
        &self,
        prefix: &str,
        delimiter: Option<&str>,
        continuation: Option<&str>,
        page_size: usize,
    ) -> Result<ListPage, RemoteFault> {
        self.enter(Op::List, prefix)?;
        let injected = self
            .empty_pages
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Ok(ListPage {
                items: Vec::new(),
                continuation: Some(continuation.unwrap_or_default().to_owned()),
            });
        }
        let mut page = self
            .inner
            .list(prefix, delimiter, continuation, page_size)
            .await?;
        if self.echo_self.load(Ordering::SeqCst) && continuation.is_none() && !prefix.is_empty() {
            let mut me = RemoteEntry::new(prefix.trim_end_matches('/'), 0);
            me.native_directory = true;
            page.items.insert(0, ListItem::Object(me));
        }
        Ok(page)
    }

    async fn create_directory_marker(&self, name: &str) -> Result<(), RemoteFault> {
        self.enter(Op::CreateMarker, name)?;
        self.inner.create_directory_marker(name).await
    }

    async fn delete_directory(&self, name: &str, recursive: bool) -> Result<(), RemoteFault> {
        self.enter(Op::DeleteDirectory, name)?;
        self.inner.delete_directory(name, recursive).await
    }

    async fn delete_object(&self, name: &str) -> Result<(), RemoteFault> {
        self.enter(Op::DeleteObject, name)?;
        self.inner.delete_object(name).await
    }

    async fn upload(&self, name: &str, source: &Path) -> Result<(), RemoteFault> {
        self.enter(Op::Upload, name)?;
        self.inner.upload(name, source).await
    }

    async fn download(&self, name: &str, target: &Path) -> Result<RemoteEntry, RemoteFault> {
        if let Err(fault) = self.enter(Op::Download, name) {
            // Leave a partial file behind, the way an interrupted transfer would.
            tokio::fs::write(target, b"partial").await.unwrap();
            return Err(fault);
        }
        self.inner.download(name, target).await
    }

    async fn move_object(&self, src: &str, dst: &str) -> Result<(), RemoteFault> {
        self.enter(Op::Move, src)?;
        self.inner.move_object(src, dst).await
    }

    async fn copy_object(&self, src: &str, dst: &str) -> Result<(), RemoteFault> {
        self.enter(Op::Copy, src)?;
        self.inner.copy_object(src, dst).await
    }

    async fn set_access_control(&self, name: &str, acl: &str) -> Result<(), RemoteFault> {
        self.enter(Op::SetAccessControl, name)?;
        self.inner.set_access_control(name, acl).await
    }
}

pub fn p(s: &str) -> FsPath {
    FsPath::new(s).unwrap()
}

/// An engine over `store` with its cache in a fresh temporary directory.
pub async fn mount(store: FaultyStore) -> (BlobFs<FaultyStore>, TempDir) {
    mount_with(store, |_| {}).await
}

pub async fn mount_with(
    store: FaultyStore,
    configure: impl FnOnce(&mut EngineConfig),
) -> (BlobFs<FaultyStore>, TempDir) {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = EngineConfig::new(tmp.path().join("cache"));
    configure(&mut config);
    let fs = BlobFs::new(store, config).await.unwrap();
    (fs, tmp)
}

/// Read the whole local cache copy of `path`, if there is one.
pub fn cached_bytes(fs: &BlobFs<FaultyStore>, path: &FsPath) -> Option<Vec<u8>> {
    std::fs::read(fs.cache().local_path(path)).ok()
}

pub fn is_cached(fs: &BlobFs<FaultyStore>, path: &FsPath) -> bool {
    fs.cache().local_path(path).exists()
}
