//! A hierarchical remote backed by a directory on the host.
//!
//! Object names map one-to-one onto paths below the store root, directories are native, and
//! moves are plain `rename(2)` calls.

use std::os::unix::fs::PermissionsExt as _;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::{debug, instrument};

use super::{
    DELIMITER, ListItem, ListPage, Namespace, RemoteEntry, RemoteStore, acl, fault_from_io,
    paginate,
};
use crate::error::RemoteFault;
use crate::fs::InodePerms;

/// A hierarchical store rooted at a host directory.
#[derive(Debug, Clone)]
pub struct LocalDirStore {
    root: PathBuf,
}

impl LocalDirStore {
    /// Serve objects out of `root`, creating it if needed.
    pub async fn open(root: impl Into<PathBuf>) -> std::io::Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self {
            root: tokio::fs::canonicalize(&root).await?,
        })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, name: &str) -> Result<PathBuf, RemoteFault> {
        let trimmed = name.trim_end_matches(DELIMITER);
        if trimmed.is_empty() {
            return Ok(self.root.clone());
        }
        let mut path = self.root.clone();
        for segment in trimmed.split(DELIMITER) {
            if segment.is_empty() || segment == "." || segment == ".." {
                return Err(RemoteFault::new(RemoteFault::FORBIDDEN));
            }
            path.push(segment);
        }
        Ok(path)
    }

    fn entry_from_metadata(name: String, meta: &std::fs::Metadata) -> RemoteEntry {
        let last_modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        let nanos = last_modified
            .duration_since(SystemTime::UNIX_EPOCH)
            .map_or(0, |d| d.as_nanos());
        let mut entry = RemoteEntry::new(name, if meta.is_dir() { 0 } else { meta.len() });
        entry.last_modified = last_modified;
        entry.etag = format!("\"{nanos:x}-{:x}\"", meta.len());
        entry.native_directory = meta.is_dir();
        #[expect(
            clippy::cast_possible_truncation,
            reason = "masked to the low 12 permission bits"
        )]
        let perms = InodePerms::from_bits_truncate((meta.permissions().mode() & 0o7777) as u16);
        entry.permissions = Some(acl::permissions_string(perms));
        entry
    }

    async fn ensure_parent(path: &Path) -> Result<(), RemoteFault> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| fault_from_io(&e))?;
        }
        Ok(())
    }

    /// Every item under `prefix`, sorted by name.
    async fn collect_listing(
        &self,
        prefix: &str,
        delimiter: Option<&str>,
    ) -> Result<Vec<ListItem>, RemoteFault> {
        let (dir_part, name_part) = match prefix.rfind(DELIMITER) {
            Some(idx) => (&prefix[..idx], &prefix[idx + 1..]),
            None => ("", prefix),
        };
        let start = self.resolve(dir_part)?;
        let mut items = Vec::new();
        let mut pending = vec![(start, dir_part.to_owned(), true)];

        while let Some((dir, name, top)) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound && top => break,
                Err(e) => return Err(fault_from_io(&e)),
            };
            while let Some(entry) = entries.next_entry().await.map_err(|e| fault_from_io(&e))? {
                let Some(child) = entry.file_name().to_str().map(str::to_owned) else {
                    continue;
                };
                if top && !child.starts_with(name_part) {
                    continue;
                }
                let full = if name.is_empty() {
                    child
                } else {
                    format!("{name}{DELIMITER}{child}")
                };
                let meta = entry.metadata().await.map_err(|e| fault_from_io(&e))?;
                if meta.is_dir() && delimiter.is_none() {
                    pending.push((entry.path(), full.clone(), false));
                }
                items.push(ListItem::Object(Self::entry_from_metadata(full, &meta)));
            }
        }

        items.sort_by(|a, b| a.name().cmp(b.name()));
        Ok(items)
    }
}

impl RemoteStore for LocalDirStore {
    fn namespace(&self) -> Namespace {
        Namespace::Hierarchical
    }

    async fn get_properties(&self, name: &str) -> Result<RemoteEntry, RemoteFault> {
        let path = self.resolve(name)?;
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|e| fault_from_io(&e))?;
        Ok(Self::entry_from_metadata(name.to_owned(), &meta))
    }

    #[instrument(name = "LocalDirStore::list", skip(self))]
    async fn list(
        &self,
        prefix: &str,
        delimiter: Option<&str>,
        continuation: Option<&str>,
        page_size: usize,
    ) -> Result<ListPage, RemoteFault> {
        let items = self.collect_listing(prefix, delimiter).await?;
        let page = paginate(&items, continuation, page_size);
        debug!(served = page.items.len(), total = items.len(), "serving list page");
        Ok(page)
    }

    async fn create_directory_marker(&self, name: &str) -> Result<(), RemoteFault> {
        tokio::fs::create_dir_all(self.resolve(name)?)
            .await
            .map_err(|e| fault_from_io(&e))
    }

    async fn delete_directory(&self, name: &str, recursive: bool) -> Result<(), RemoteFault> {
        let path = self.resolve(name)?;
        let result = if recursive {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_dir(&path).await
        };
        result.map_err(|e| fault_from_io(&e))
    }

    async fn delete_object(&self, name: &str) -> Result<(), RemoteFault> {
        tokio::fs::remove_file(self.resolve(name)?)
            .await
            .map_err(|e| fault_from_io(&e))
    }

    async fn upload(&self, name: &str, source: &Path) -> Result<(), RemoteFault> {
        let target = self.resolve(name)?;
        Self::ensure_parent(&target).await?;
        tokio::fs::copy(source, &target)
            .await
            .map_err(|e| fault_from_io(&e))?;
        Ok(())
    }

    async fn download(&self, name: &str, target: &Path) -> Result<RemoteEntry, RemoteFault> {
        let source = self.resolve(name)?;
        let meta = tokio::fs::metadata(&source)
            .await
            .map_err(|e| fault_from_io(&e))?;
        if meta.is_dir() {
            return Err(RemoteFault::new(RemoteFault::CONFLICT));
        }
        tokio::fs::copy(&source, target)
            .await
            .map_err(|e| fault_from_io(&e))?;
        Ok(Self::entry_from_metadata(name.to_owned(), &meta))
    }

    async fn move_object(&self, src: &str, dst: &str) -> Result<(), RemoteFault> {
        let from = self.resolve(src)?;
        let to = self.resolve(dst)?;
        Self::ensure_parent(&to).await?;
        tokio::fs::rename(&from, &to)
            .await
            .map_err(|e| fault_from_io(&e))
    }

    async fn copy_object(&self, src: &str, dst: &str) -> Result<(), RemoteFault> {
        let from = self.resolve(src)?;
        let to = self.resolve(dst)?;
        Self::ensure_parent(&to).await?;
        tokio::fs::copy(&from, &to)
            .await
            .map_err(|e| fault_from_io(&e))?;
        Ok(())
    }

    async fn set_access_control(&self, name: &str, acl_string: &str) -> Result<(), RemoteFault> {
        let path = self.resolve(name)?;
        let perms =
            acl::acl_to_perms(acl_string).ok_or(RemoteFault::new(RemoteFault::INTERNAL))?;
        tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(u32::from(perms.bits())))
            .await
            .map_err(|e| fault_from_io(&e))
    }
}
