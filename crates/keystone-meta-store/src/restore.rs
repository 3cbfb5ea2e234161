//! Restore and copy of keys out of snapshot views.
//!
//! A snapshot view is addressed inside its bucket as
//! `.snapshot/<name>/<key>`. Entries are listed from the view's frozen
//! checkpoint and copied into the live namespace as new keys that point
//! at the same content, re-normalized under the destination bucket's
//! layout.
//!
//! The destination existence check and the write are separate steps: a
//! key created concurrently through another path between the two can be
//! overwritten. Copies into the same destination key through this
//! service are serialized by the key lock.

use crate::lock::{LockManager, ResourceKind};
use crate::snapshot::{SNAPSHOT_INDICATOR, SnapshotManager, snapshot_key_prefix};
use crate::store::MetaStore;
use crate::types::{KeyInfo, SnapshotRecord, now_secs};
use keystone_common::{Error, KEY_DELIMITER, Result, normalize_key_path};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info};

/// Read-only handle on one snapshot's namespace
#[derive(Clone)]
pub struct SnapshotView {
    record: SnapshotRecord,
    store: Arc<MetaStore>,
}

impl SnapshotView {
    #[must_use]
    pub fn record(&self) -> &SnapshotRecord {
        &self.record
    }

    /// Prefix addressing this view's entries inside its bucket
    #[must_use]
    pub fn key_prefix(&self) -> String {
        snapshot_key_prefix(&self.record.name)
    }

    /// Strip this view's snapshot prefix from `key`, if present. Any
    /// other key is returned as is: object-store keys may start with `/`.
    fn relative<'k>(&self, key: &'k str) -> &'k str {
        let prefix = self.key_prefix();
        key.strip_prefix(prefix.as_str())
            .or_else(|| {
                key.strip_prefix(KEY_DELIMITER)
                    .and_then(|k| k.strip_prefix(prefix.as_str()))
            })
            .unwrap_or(key)
    }

    pub fn get_key(&self, key: &str) -> Result<KeyInfo> {
        Ok(self
            .store
            .get_key(&self.record.volume, &self.record.bucket, self.relative(key))?)
    }
}

/// One key of a snapshot view
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnapshotEntry {
    /// Key path within the bucket
    pub key: String,
    /// Key path prefixed with the snapshot prefix
    pub path: String,
    pub info: KeyInfo,
}

/// Lazy listing of a snapshot view, fetched one page at a time.
///
/// Ordered by key path. Nothing is persisted between calls; listing again
/// starts over.
pub struct EntryIter {
    view: SnapshotView,
    prefix: String,
    page_size: usize,
    buffer: VecDeque<KeyInfo>,
    last: Option<String>,
    done: bool,
}

impl EntryIter {
    fn fill(&mut self) -> Result<()> {
        let page = self.view.store.list_keys(
            &self.view.record.volume,
            &self.view.record.bucket,
            &self.prefix,
            self.last.as_deref(),
            self.page_size,
        )?;
        if page.len() < self.page_size {
            self.done = true;
        }
        if let Some(last) = page.last() {
            self.last = Some(last.key_name.clone());
        }
        self.buffer.extend(page);
        Ok(())
    }
}

impl Iterator for EntryIter {
    type Item = Result<SnapshotEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.done {
            if let Err(e) = self.fill() {
                self.done = true;
                return Some(Err(e));
            }
        }
        let info = self.buffer.pop_front()?;
        Some(Ok(SnapshotEntry {
            key: info.key_name.clone(),
            path: format!("{}{}", self.view.key_prefix(), info.key_name),
            info,
        }))
    }
}

/// Split "/vol/bucket/key" into its parts; the key may be empty
fn parse_path(path: &str) -> Result<(&str, &str, &str)> {
    let mut parts = path.trim_start_matches(KEY_DELIMITER).splitn(3, KEY_DELIMITER);
    match (parts.next(), parts.next(), parts.next()) {
        (Some(volume), Some(bucket), key) if !volume.is_empty() && !bucket.is_empty() => {
            Ok((volume, bucket, key.unwrap_or_default()))
        }
        _ => Err(Error::invalid_argument(format!(
            "path '{path}' does not name a bucket"
        ))),
    }
}

/// Split "<name>/<key>" following ".snapshot/"
fn parse_snapshot_key(key: &str) -> Option<(&str, &str)> {
    let rest = key.strip_prefix(SNAPSHOT_INDICATOR)?.strip_prefix(KEY_DELIMITER)?;
    Some(rest.split_once(KEY_DELIMITER).unwrap_or((rest, "")))
}

pub struct RestoreService {
    snapshots: Arc<SnapshotManager>,
    page_size: usize,
}

impl RestoreService {
    pub fn new(snapshots: Arc<SnapshotManager>, page_size: usize) -> Self {
        Self {
            snapshots,
            page_size: page_size.max(1),
        }
    }

    fn store(&self) -> &Arc<MetaStore> {
        self.snapshots.store()
    }

    fn locks(&self) -> &Arc<LockManager> {
        self.snapshots.locks()
    }

    /// Open the view of an ACTIVE snapshot
    pub fn resolve_snapshot_view(
        &self,
        volume: &str,
        bucket: &str,
        name: &str,
    ) -> Result<SnapshotView> {
        let lock_id = SnapshotRecord::table_key(volume, bucket, name);
        self.locks()
            .with_read_lock(ResourceKind::Snapshot, &lock_id, || {
                let record = self.snapshots.get_snapshot_info(volume, bucket, name)?;
                let store = self.snapshots.open_view(&record)?;
                Ok(SnapshotView { record, store })
            })
    }

    /// Entries of `view` whose key starts with `key_prefix`. The prefix
    /// may include the view's snapshot prefix.
    #[must_use]
    pub fn list_entries(&self, view: &SnapshotView, key_prefix: &str) -> EntryIter {
        EntryIter {
            prefix: view.relative(key_prefix).to_string(),
            view: view.clone(),
            page_size: self.page_size,
            buffer: VecDeque::new(),
            last: None,
            done: false,
        }
    }

    /// Copy `source_key` of a snapshot view into the live namespace.
    ///
    /// Fails with `KeyAlreadyExists` when a key or directory already
    /// occupies the destination; the destination is left untouched.
    pub fn copy_entry(
        &self,
        view: &SnapshotView,
        source_key: &str,
        dest_volume: &str,
        dest_bucket: &str,
        dest_key: &str,
    ) -> Result<KeyInfo> {
        let source = view.get_key(source_key)?;
        self.copy_info(&source, dest_volume, dest_bucket, dest_key)
    }

    fn copy_info(
        &self,
        source: &KeyInfo,
        dest_volume: &str,
        dest_bucket: &str,
        dest_key: &str,
    ) -> Result<KeyInfo> {
        let layout = self.store().get_bucket(dest_volume, dest_bucket)?.layout;
        let normalized = normalize_key_path(layout, dest_key)?;

        let lock_id = format!("/{dest_volume}/{dest_bucket}/{normalized}");
        self.locks().with_write_lock(ResourceKind::Key, &lock_id, || {
            if self
                .store()
                .key_or_directory_exists(dest_volume, dest_bucket, &normalized)?
            {
                return Err(Error::KeyAlreadyExists {
                    bucket: dest_bucket.to_string(),
                    key: normalized.clone(),
                });
            }
            let now = now_secs();
            let info = KeyInfo {
                key_name: normalized.clone(),
                data_size: source.data_size,
                content_ref: source.content_ref.clone(),
                created_at: now,
                modified_at: now,
                metadata: source.metadata.clone(),
            };
            let copied = self
                .store()
                .put_key(dest_volume, dest_bucket, &normalized, info)?;
            debug!("Copied {} to {}", source.key_name, lock_id);
            Ok(copied)
        })
    }

    /// List a bucket. A `.snapshot/<name>/` prefix lists that snapshot's
    /// entries, reported under their snapshot-prefixed paths.
    pub fn list_keys(&self, volume: &str, bucket: &str, prefix: &str) -> Result<Vec<KeyInfo>> {
        let Some((name, key_prefix)) = parse_snapshot_key(prefix) else {
            return Ok(self
                .store()
                .list_keys(volume, bucket, prefix, None, usize::MAX)?);
        };
        let view = self.resolve_snapshot_view(volume, bucket, name)?;
        self.list_entries(&view, key_prefix)
            .map(|entry| {
                entry.map(|entry| KeyInfo {
                    key_name: entry.path,
                    ..entry.info
                })
            })
            .collect()
    }

    /// Copy by path, as a filesystem shell would:
    /// `copy_path("/vol/bucket/.snapshot/s1/dir/key", "/vol/bucket2/")`.
    /// A destination ending in `/` (or naming only a bucket) keeps the
    /// source's file name. Live sources are copied the same way.
    pub fn copy_path(&self, source: &str, dest: &str) -> Result<KeyInfo> {
        let (volume, bucket, key) = parse_path(source)?;
        let info = match parse_snapshot_key(key) {
            Some((name, snapshot_key)) => {
                let view = self.resolve_snapshot_view(volume, bucket, name)?;
                view.get_key(snapshot_key)?
            }
            None => self.store().get_key(volume, bucket, key)?,
        };

        let (dest_volume, dest_bucket, dest_key) = parse_path(dest)?;
        let dest_key = if dest_key.is_empty() || dest_key.ends_with(KEY_DELIMITER) {
            let file_name = info
                .key_name
                .rsplit(KEY_DELIMITER)
                .next()
                .unwrap_or(info.key_name.as_str());
            format!("{dest_key}{file_name}")
        } else {
            dest_key.to_string()
        };

        let copied = self.copy_info(&info, dest_volume, dest_bucket, &dest_key)?;
        info!("Copied {} to /{}/{}/{}", source, dest_volume, dest_bucket, copied.key_name);
        Ok(copied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::LocalLog;
    use keystone_common::BucketLayout;
    use tempfile::{TempDir, tempdir};

    fn setup(page_size: usize) -> (TempDir, RestoreService) {
        let dir = tempdir().unwrap();
        let store = Arc::new(MetaStore::open(dir.path().join("db")).unwrap());
        store.create_volume("vol1", "alice").unwrap();
        let log = Arc::new(LocalLog::new("meta1", Arc::clone(&store)));
        let snapshots = Arc::new(SnapshotManager::new(
            store,
            Arc::new(LockManager::new()),
            log,
            dir.path().join("snapshot"),
        ));
        (dir, RestoreService::new(snapshots, page_size))
    }

    fn write_keys(service: &RestoreService, bucket: &str, keys: &[&str]) {
        for key in keys {
            service
                .store()
                .put_key("vol1", bucket, key, KeyInfo::new("", format!("blk-{key}"), 4))
                .unwrap();
        }
    }

    fn restore_scenario(source_layout: BucketLayout, dest_layout: BucketLayout) {
        let (_dir, service) = setup(2);
        let store = Arc::clone(service.store());
        store.create_bucket("vol1", "buck1", source_layout).unwrap();
        store.create_bucket("vol1", "buck2", dest_layout).unwrap();
        let keys: Vec<String> = (0..5).map(|i| format!("key-{i}")).collect();
        let keys: Vec<&str> = keys.iter().map(String::as_str).collect();
        write_keys(&service, "buck1", &keys);

        service
            .snapshots
            .create_snapshot("vol1", "buck1", "s1")
            .unwrap();
        let snapshot_prefix = format!("{}key-", snapshot_key_prefix("s1"));
        assert_eq!(service.list_keys("vol1", "buck1", &snapshot_prefix).unwrap().len(), 5);

        for key in &keys {
            store.delete_key("vol1", "buck1", key).unwrap();
        }
        assert!(service.list_keys("vol1", "buck1", "key-").unwrap().is_empty());

        let view = service.resolve_snapshot_view("vol1", "buck1", "s1").unwrap();
        assert_eq!(service.list_entries(&view, "key-").count(), 5);

        for key in &keys {
            service
                .copy_path(&format!("/vol1/buck1/.snapshot/s1/{key}"), "/vol1/buck2/")
                .unwrap();
        }
        let copied = service.list_keys("vol1", "buck2", "key-").unwrap();
        assert_eq!(copied.len(), 5);
        assert_eq!(copied[0].content_ref, "blk-key-0");
        assert!(service.list_keys("vol1", "buck1", "key-").unwrap().is_empty());
    }

    #[test]
    fn test_restore_tree_to_legacy() {
        restore_scenario(BucketLayout::FileSystemOptimized, BucketLayout::Legacy);
    }

    #[test]
    fn test_restore_legacy_to_tree() {
        restore_scenario(BucketLayout::Legacy, BucketLayout::FileSystemOptimized);
    }

    #[test]
    fn test_restore_same_layout() {
        restore_scenario(BucketLayout::FileSystemOptimized, BucketLayout::FileSystemOptimized);
        restore_scenario(BucketLayout::ObjectStore, BucketLayout::ObjectStore);
    }

    #[test]
    fn test_listing_is_ordered_paged_and_restartable() {
        let (_dir, service) = setup(2);
        service
            .store()
            .create_bucket("vol1", "buck1", BucketLayout::FileSystemOptimized)
            .unwrap();
        write_keys(&service, "buck1", &["dir/b", "dir/a/x", "c", "dir.txt", "a"]);
        service
            .snapshots
            .create_snapshot("vol1", "buck1", "s1")
            .unwrap();
        let view = service.resolve_snapshot_view("vol1", "buck1", "s1").unwrap();

        let first: Vec<String> = service
            .list_entries(&view, "")
            .map(|e| e.unwrap().key)
            .collect();
        assert_eq!(first, ["a", "c", "dir.txt", "dir/a/x", "dir/b"]);

        let again: Vec<String> = service
            .list_entries(&view, ".snapshot/s1/dir/")
            .map(|e| e.unwrap().path)
            .collect();
        assert_eq!(again, [".snapshot/s1/dir/a/x", ".snapshot/s1/dir/b"]);
    }

    #[test]
    fn test_copy_into_existing_key_fails() {
        let (_dir, service) = setup(10);
        let store = Arc::clone(service.store());
        store
            .create_bucket("vol1", "buck1", BucketLayout::Legacy)
            .unwrap();
        write_keys(&service, "buck1", &["key-0"]);
        service
            .snapshots
            .create_snapshot("vol1", "buck1", "s1")
            .unwrap();
        store
            .put_key("vol1", "buck1", "key-0", KeyInfo::new("", "newer", 1))
            .unwrap();

        let view = service.resolve_snapshot_view("vol1", "buck1", "s1").unwrap();
        let err = service
            .copy_entry(&view, "key-0", "vol1", "buck1", "key-0")
            .unwrap_err();
        assert!(err.is_already_exists());
        assert_eq!(store.get_key("vol1", "buck1", "key-0").unwrap().content_ref, "newer");

        // A directory implied by deeper keys occupies the name too
        write_keys(&service, "buck1", &["dir/inner"]);
        let err = service
            .copy_entry(&view, "key-0", "vol1", "buck1", "dir")
            .unwrap_err();
        assert!(err.is_already_exists());
    }

    #[test]
    fn test_copy_missing_source_and_deleted_snapshot() {
        let (_dir, service) = setup(10);
        service
            .store()
            .create_bucket("vol1", "buck1", BucketLayout::ObjectStore)
            .unwrap();
        service
            .snapshots
            .create_snapshot("vol1", "buck1", "s1")
            .unwrap();
        let view = service.resolve_snapshot_view("vol1", "buck1", "s1").unwrap();
        let err = service
            .copy_entry(&view, "missing", "vol1", "buck1", "x")
            .unwrap_err();
        assert!(err.is_not_found());

        service
            .snapshots
            .delete_snapshot("vol1", "buck1", "s1")
            .unwrap();
        let err = service
            .resolve_snapshot_view("vol1", "buck1", "s1")
            .err()
            .unwrap();
        assert!(err.is_not_found());
        let err = service
            .copy_path("/vol1/buck1/.snapshot/s1/x", "/vol1/buck1/")
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_copy_path_destinations() {
        let (_dir, service) = setup(10);
        let store = Arc::clone(service.store());
        store
            .create_bucket("vol1", "buck1", BucketLayout::FileSystemOptimized)
            .unwrap();
        store
            .create_bucket("vol1", "buck2", BucketLayout::ObjectStore)
            .unwrap();
        write_keys(&service, "buck1", &["a/b/file"]);
        service
            .snapshots
            .create_snapshot("vol1", "buck1", "s1")
            .unwrap();

        let kept = service
            .copy_path("/vol1/buck1/.snapshot/s1/a/b/file", "/vol1/buck2/restored/")
            .unwrap();
        assert_eq!(kept.key_name, "restored/file");
        let renamed = service
            .copy_path("/vol1/buck1/.snapshot/s1/a/b/file", "/vol1/buck2/other")
            .unwrap();
        assert_eq!(renamed.key_name, "other");
        assert!(service.copy_path("/vol1", "/vol1/buck2/").is_err());
    }

    #[test]
    fn test_object_store_keys_with_leading_delimiter() {
        let (_dir, service) = setup(10);
        let store = Arc::clone(service.store());
        store
            .create_bucket("vol1", "buck1", BucketLayout::ObjectStore)
            .unwrap();
        let mut info = KeyInfo::new("", "blk-conf", 4);
        info.metadata.insert("owner".into(), "root".into());
        store.put_key("vol1", "buck1", "/etc/conf", info).unwrap();
        service
            .snapshots
            .create_snapshot("vol1", "buck1", "s1")
            .unwrap();
        store.delete_key("vol1", "buck1", "/etc/conf").unwrap();

        let view = service.resolve_snapshot_view("vol1", "buck1", "s1").unwrap();
        let listed: Vec<String> = service
            .list_entries(&view, "")
            .map(|e| e.unwrap().key)
            .collect();
        assert_eq!(listed, ["/etc/conf"]);
        assert_eq!(service.list_entries(&view, "/etc").count(), 1);
        assert_eq!(service.list_entries(&view, ".snapshot/s1//etc").count(), 1);
        assert_eq!(service.list_entries(&view, "/.snapshot/s1//etc").count(), 1);

        let copied = service
            .copy_entry(&view, "/etc/conf", "vol1", "buck1", "/etc/conf")
            .unwrap();
        assert_eq!(copied.key_name, "/etc/conf");
        assert_eq!(copied.metadata.get("owner").map(String::as_str), Some("root"));
        assert_eq!(
            store.get_key("vol1", "buck1", "/etc/conf").unwrap().content_ref,
            "blk-conf"
        );
    }

    #[test]
    fn test_parse_helpers() {
        assert_eq!(parse_path("/v/b/k/x").unwrap(), ("v", "b", "k/x"));
        assert_eq!(parse_path("v/b").unwrap(), ("v", "b", ""));
        assert!(parse_path("/v").is_err());
        assert_eq!(parse_snapshot_key(".snapshot/s1/k"), Some(("s1", "k")));
        assert_eq!(parse_snapshot_key(".snapshot/s1"), Some(("s1", "")));
        assert_eq!(parse_snapshot_key("key"), None);
    }
}
