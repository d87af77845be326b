//! An object store held entirely in process memory.
//!
//! [`MemoryStore`] models either namespace flavour: a flat blob container where directories are
//! implied by names and made explicit by `hdi_isfolder` marker blobs, or a hierarchical container
//! with native directory nodes and atomic moves.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use bytes::Bytes;
use parking_lot::RwLock;
use tracing::{debug, instrument};

use super::{
    DELIMITER, DIRECTORY_MARKER_KEY, ListItem, ListPage, Namespace, RemoteEntry, RemoteStore, acl,
    fault_from_io, paginate,
};
use crate::error::RemoteFault;

#[derive(Debug, Clone)]
struct StoredObject {
    entry: RemoteEntry,
    data: Bytes,
}

/// In-process remote store.
#[derive(Debug)]
pub struct MemoryStore {
    namespace: Namespace,
    objects: RwLock<BTreeMap<String, StoredObject>>,
    etag_generator: AtomicU64,
}

fn child_prefix(name: &str) -> String {
    format!("{name}{DELIMITER}")
}

impl MemoryStore {
    #[must_use]
    pub fn new(namespace: Namespace) -> Self {
        Self {
            namespace,
            objects: RwLock::new(BTreeMap::new()),
            etag_generator: AtomicU64::new(1),
        }
    }

    #[must_use]
    pub fn flat() -> Self {
        Self::new(Namespace::Flat)
    }

    #[must_use]
    pub fn hierarchical() -> Self {
        Self::new(Namespace::Hierarchical)
    }

    fn next_etag(&self) -> String {
        format!(
            "\"0x{:X}\"",
            self.etag_generator.fetch_add(1, Ordering::Relaxed)
        )
    }

    fn directory_entry(&self, name: &str) -> RemoteEntry {
        let mut entry = RemoteEntry::new(name, 0);
        entry.etag = self.next_etag();
        match self.namespace {
            Namespace::Flat => {
                entry
                    .metadata
                    .insert(DIRECTORY_MARKER_KEY.to_owned(), "true".to_owned());
            }
            Namespace::Hierarchical => {
                entry.native_directory = true;
                entry.permissions = Some("rwxr-x---".to_owned());
            }
        }
        entry
    }

    fn file_entry(&self, name: &str, size: u64) -> RemoteEntry {
        let mut entry = RemoteEntry::new(name, size);
        entry.etag = self.next_etag();
        if self.namespace == Namespace::Hierarchical {
            entry.permissions = Some("rw-r-----".to_owned());
        }
        entry
    }

    /// Create native directory nodes for every missing ancestor of `name`.
    fn ensure_parents(&self, objects: &mut BTreeMap<String, StoredObject>, name: &str) {
        if self.namespace != Namespace::Hierarchical {
            return;
        }
        for (idx, _) in name.match_indices(DELIMITER) {
            let parent = &name[..idx];
            if !objects.contains_key(parent) {
                objects.insert(
                    parent.to_owned(),
                    StoredObject {
                        entry: self.directory_entry(parent),
                        data: Bytes::new(),
                    },
                );
            }
        }
    }

    fn has_children(objects: &BTreeMap<String, StoredObject>, name: &str) -> bool {
        let prefix = child_prefix(name);
        objects
            .range::<str, _>((Bound::Included(prefix.as_str()), Bound::Unbounded))
            .next()
            .is_some_and(|(k, _)| k.starts_with(&prefix))
    }

    fn keys_under(objects: &BTreeMap<String, StoredObject>, prefix: &str) -> Vec<String> {
        objects
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Seed an object with `data`, creating native parents on hierarchical stores.
    pub fn put_object(&self, name: &str, data: impl Into<Bytes>) {
        let data = data.into();
        let mut objects = self.objects.write();
        self.ensure_parents(&mut objects, name);
        let entry = self.file_entry(name, data.len() as u64);
        objects.insert(name.to_owned(), StoredObject { entry, data });
    }

    /// Seed an entry with explicit properties; its data is zero-filled to the entry's size.
    #[expect(
        clippy::cast_possible_truncation,
        reason = "seeded entries are small enough to hold in memory"
    )]
    pub fn put_entry(&self, entry: RemoteEntry) {
        let data = Bytes::from(vec![0u8; entry.size as usize]);
        let mut objects = self.objects.write();
        self.ensure_parents(&mut objects, &entry.name);
        objects.insert(entry.name.clone(), StoredObject { entry, data });
    }

    /// Seed a directory marker (flat) or directory node (hierarchical).
    pub fn put_directory(&self, name: &str) {
        let mut objects = self.objects.write();
        self.ensure_parents(&mut objects, name);
        objects.insert(
            name.to_owned(),
            StoredObject {
                entry: self.directory_entry(name),
                data: Bytes::new(),
            },
        );
    }

    /// The bytes of object `name`, if it exists.
    #[must_use]
    pub fn object_data(&self, name: &str) -> Option<Bytes> {
        self.objects.read().get(name).map(|o| o.data.clone())
    }

    /// Properties of `name`, if it exists.
    #[must_use]
    pub fn entry(&self, name: &str) -> Option<RemoteEntry> {
        self.objects.read().get(name).map(|o| o.entry.clone())
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.objects.read().contains_key(name)
    }

    /// Every stored name in lexicographic order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.objects.read().keys().cloned().collect()
    }

    fn collect_listing(&self, prefix: &str, delimiter: Option<&str>) -> Vec<ListItem> {
        let objects = self.objects.read();
        let mut rolled: BTreeMap<String, ListItem> = BTreeMap::new();

        for (key, object) in objects
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
        {
            let rest = &key[prefix.len()..];
            let split = delimiter
                .filter(|_| !rest.is_empty())
                .and_then(|d| rest.find(d).map(|idx| idx + d.len()));
            match split {
                None => {
                    rolled.insert(key.clone(), ListItem::Object(object.entry.clone()));
                }
                // Native directory nodes stand in for rolled-up prefixes.
                Some(_) if self.namespace == Namespace::Hierarchical => {}
                Some(end) => {
                    let rolled_name = format!("{prefix}{}", &rest[..end]);
                    rolled
                        .entry(rolled_name.clone())
                        .or_insert(ListItem::Prefix(rolled_name));
                }
            }
        }

        rolled.into_values().collect()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::flat()
    }
}

impl RemoteStore for MemoryStore {
    fn namespace(&self) -> Namespace {
        self.namespace
    }

    async fn get_properties(&self, name: &str) -> Result<RemoteEntry, RemoteFault> {
        self.entry(name).ok_or_else(RemoteFault::not_found)
    }

    #[instrument(name = "MemoryStore::list", skip(self))]
    async fn list(
        &self,
        prefix: &str,
        delimiter: Option<&str>,
        continuation: Option<&str>,
        page_size: usize,
    ) -> Result<ListPage, RemoteFault> {
        let items = self.collect_listing(prefix, delimiter);
        let page = paginate(&items, continuation, page_size);
        debug!(
            served = page.items.len(),
            total = items.len(),
            "serving list page"
        );
        Ok(page)
    }

    async fn create_directory_marker(&self, name: &str) -> Result<(), RemoteFault> {
        let mut objects = self.objects.write();
        if let Some(existing) = objects.get(name) {
            return if existing.entry.is_directory() {
                Ok(())
            } else {
                Err(RemoteFault::new(RemoteFault::CONFLICT))
            };
        }
        self.ensure_parents(&mut objects, name);
        objects.insert(
            name.to_owned(),
            StoredObject {
                entry: self.directory_entry(name),
                data: Bytes::new(),
            },
        );
        Ok(())
    }

    async fn delete_directory(&self, name: &str, recursive: bool) -> Result<(), RemoteFault> {
        let mut objects = self.objects.write();
        let marker = objects.get(name).map(|o| o.entry.is_directory());
        if marker == Some(false) {
            return Err(RemoteFault::new(RemoteFault::CONFLICT));
        }
        let has_children = Self::has_children(&objects, name);
        if marker.is_none() && (!has_children || self.namespace == Namespace::Hierarchical) {
            return Err(RemoteFault::not_found());
        }
        if has_children && !recursive {
            return Err(RemoteFault::new(RemoteFault::CONFLICT));
        }
        for key in Self::keys_under(&objects, &child_prefix(name)) {
            objects.remove(&key);
        }
        objects.remove(name);
        Ok(())
    }

    async fn delete_object(&self, name: &str) -> Result<(), RemoteFault> {
        let mut objects = self.objects.write();
        match objects.get(name) {
            None => Err(RemoteFault::not_found()),
            Some(o) if o.entry.native_directory => Err(RemoteFault::new(RemoteFault::CONFLICT)),
            Some(_) => {
                objects.remove(name);
                Ok(())
            }
        }
    }

    async fn upload(&self, name: &str, source: &Path) -> Result<(), RemoteFault> {
        let data = Bytes::from(
            tokio::fs::read(source)
                .await
                .map_err(|e| fault_from_io(&e))?,
        );
        let mut objects = self.objects.write();
        if objects.get(name).is_some_and(|o| o.entry.native_directory) {
            return Err(RemoteFault::new(RemoteFault::CONFLICT));
        }
        self.ensure_parents(&mut objects, name);
        let mut entry = self.file_entry(name, data.len() as u64);
        if let Some(previous) = objects.get(name) {
            entry.permissions.clone_from(&previous.entry.permissions);
            entry.metadata.clone_from(&previous.entry.metadata);
            entry.metadata.remove(DIRECTORY_MARKER_KEY);
        }
        objects.insert(name.to_owned(), StoredObject { entry, data });
        Ok(())
    }

    async fn download(&self, name: &str, target: &Path) -> Result<RemoteEntry, RemoteFault> {
        let object = self
            .objects
            .read()
            .get(name)
            .cloned()
            .ok_or_else(RemoteFault::not_found)?;
        if object.entry.native_directory {
            return Err(RemoteFault::new(RemoteFault::CONFLICT));
        }
        tokio::fs::write(target, &object.data)
            .await
            .map_err(|e| fault_from_io(&e))?;
        Ok(object.entry)
    }

    async fn move_object(&self, src: &str, dst: &str) -> Result<(), RemoteFault> {
        if self.namespace != Namespace::Hierarchical {
            return Err(RemoteFault::new(RemoteFault::NOT_IMPLEMENTED));
        }
        let mut objects = self.objects.write();
        let Some(mut root) = objects.remove(src) else {
            return Err(RemoteFault::not_found());
        };
        if objects.get(dst).is_some_and(|o| o.entry.native_directory) {
            if Self::has_children(&objects, dst) {
                objects.insert(src.to_owned(), root);
                return Err(RemoteFault::new(RemoteFault::CONFLICT));
            }
            objects.remove(dst);
        }
        self.ensure_parents(&mut objects, dst);

        let src_prefix = child_prefix(src);
        let moved: Vec<(String, StoredObject)> = Self::keys_under(&objects, &src_prefix)
            .into_iter()
            .filter_map(|key| objects.remove(&key).map(|o| (key, o)))
            .collect();
        root.entry.name = dst.to_owned();
        objects.insert(dst.to_owned(), root);
        for (key, mut object) in moved {
            let renamed = format!("{dst}{DELIMITER}{}", &key[src_prefix.len()..]);
            object.entry.name.clone_from(&renamed);
            objects.insert(renamed, object);
        }
        Ok(())
    }

    async fn copy_object(&self, src: &str, dst: &str) -> Result<(), RemoteFault> {
        let mut objects = self.objects.write();
        let Some(source) = objects.get(src).cloned() else {
            return Err(RemoteFault::not_found());
        };
        if source.entry.native_directory {
            return Err(RemoteFault::new(RemoteFault::CONFLICT));
        }
        self.ensure_parents(&mut objects, dst);
        let mut copy = source;
        copy.entry.name = dst.to_owned();
        copy.entry.etag = self.next_etag();
        copy.entry.last_modified = SystemTime::now();
        objects.insert(dst.to_owned(), copy);
        Ok(())
    }

    async fn set_access_control(&self, name: &str, acl_string: &str) -> Result<(), RemoteFault> {
        let mut objects = self.objects.write();
        let Some(object) = objects.get_mut(name) else {
            return Err(RemoteFault::not_found());
        };
        if self.namespace == Namespace::Flat {
            return Ok(());
        }
        let perms =
            acl::acl_to_perms(acl_string).ok_or(RemoteFault::new(RemoteFault::INTERNAL))?;
        object.entry.permissions = Some(acl::permissions_string(perms));
        object.entry.acl = Some(acl_string.to_owned());
        Ok(())
    }
}
