//! Directory reconciliation: one de-duplicated view over the local cache and the remote listing.

use std::os::unix::fs::MetadataExt as _;

use rustc_hash::FxHashSet;
use tracing::{debug, instrument, trace};

use super::{BlobFs, DirectoryEntry, DirectoryView, EntryKind, InodePerms};
use crate::error::FsResult;
use crate::path::FsPath;
use crate::remote::lister::{self, child_token};
use crate::remote::{FORMER_DIRECTORY_MARKER, ListItem, RemoteStore};

impl<S: RemoteStore> BlobFs<S> {
    /// The children of the directory `path`.
    ///
    /// Local entries win over remote ones with the same name, and every name appears once. A
    /// remote fault aborts the whole listing.
    #[instrument(name = "BlobFs::list_children", skip(self))]
    pub async fn list_children(&self, path: &FsPath) -> FsResult<DirectoryView> {
        let _guard = self.locks.acquire(path).await;
        self.list_children_locked(path).await
    }

    pub(crate) async fn list_children_locked(&self, path: &FsPath) -> FsResult<DirectoryView> {
        let mut view = DirectoryView {
            entries: vec![DirectoryEntry::directory("."), DirectoryEntry::directory("..")],
        };
        let mut seen: FxHashSet<String> = FxHashSet::default();

        let mut local = self.local_children(path).await?;
        local.sort_by(|a, b| a.name.cmp(&b.name));
        for entry in local {
            seen.insert(entry.name.clone());
            view.entries.push(entry);
        }
        let local_count = seen.len();

        let prefix = path.list_prefix();
        let items = lister::list_all(&*self.store, &prefix, self.config.list_page_size).await?;
        for item in &items {
            let Some(token) = child_token(&prefix, item) else {
                continue;
            };
            if token == FORMER_DIRECTORY_MARKER {
                trace!("hiding former directory marker");
                continue;
            }
            if seen.contains(token) {
                continue;
            }
            seen.insert(token.to_owned());
            view.entries.push(classify(token, item));
        }

        debug!(
            local = local_count,
            remote = seen.len() - local_count,
            "reconciled directory"
        );
        Ok(view)
    }

    /// Immediate, non-hidden children of the local placeholder for `path`.
    pub(crate) async fn local_children(&self, path: &FsPath) -> FsResult<Vec<DirectoryEntry>> {
        let dir = self.cache.local_path(path);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut children = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            let meta = match entry.metadata().await {
                Ok(meta) => meta,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            let kind = if meta.is_dir() {
                EntryKind::Directory
            } else {
                EntryKind::RegularFile
            };
            children.push(DirectoryEntry {
                name,
                kind,
                size: if meta.is_dir() { 0 } else { meta.len() },
                perms: InodePerms::from_mode(meta.mode()),
            });
        }
        Ok(children)
    }
}

fn classify(token: &str, item: &ListItem) -> DirectoryEntry {
    match item {
        ListItem::Prefix(_) => DirectoryEntry::directory(token),
        ListItem::Object(entry) if entry.is_directory() => DirectoryEntry {
            perms: entry.perms(),
            ..DirectoryEntry::directory(token)
        },
        ListItem::Object(entry) => DirectoryEntry {
            perms: entry.perms(),
            ..DirectoryEntry::file(token, entry.size)
        },
    }
}
