//! Snapshot lifecycle management.
//!
//! A snapshot is a bucket-scoped checkpoint of the metadata store stored
//! under `<snapshot_root>/checkpoint-<uuid>`, plus a record in the
//! snapshot info table. Records only move ACTIVE -> DELETED; the
//! checkpoint directory is removed later by the reclaimer so that open
//! views are never pulled out from under their readers.

use crate::lock::{LockManager, ResourceKind};
use crate::raft::ReplicatedLog;
use crate::store::{CheckpointScope, DB_FILE_NAME, MetaStore};
use crate::types::{SnapshotRecord, SnapshotState, now_secs};
use keystone_common::{Error, Result, SnapshotId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Path component that addresses snapshot views inside a bucket
pub const SNAPSHOT_INDICATOR: &str = ".snapshot";

/// Prefix that addresses entries of snapshot `name` inside its bucket
#[must_use]
pub fn snapshot_key_prefix(name: &str) -> String {
    format!("{SNAPSHOT_INDICATOR}/{name}/")
}

/// Checkpoint directory name for a snapshot. Stable across versions.
#[must_use]
pub fn checkpoint_dir_name(id: &SnapshotId) -> String {
    format!("checkpoint-{id}")
}

fn validate_snapshot_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(Error::invalid_argument(format!(
            "invalid snapshot name '{name}'"
        )));
    }
    Ok(())
}

/// Creates, looks up and deletes snapshots; hands out read-only views.
pub struct SnapshotManager {
    store: Arc<MetaStore>,
    locks: Arc<LockManager>,
    log: Arc<dyn ReplicatedLog>,
    snapshot_root: PathBuf,
    /// Opened checkpoint stores, shared by every reader of a snapshot
    views: Mutex<HashMap<SnapshotId, Arc<MetaStore>>>,
}

impl SnapshotManager {
    pub fn new(
        store: Arc<MetaStore>,
        locks: Arc<LockManager>,
        log: Arc<dyn ReplicatedLog>,
        snapshot_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            locks,
            log,
            snapshot_root: snapshot_root.into(),
            views: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<MetaStore> {
        &self.store
    }

    #[must_use]
    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    #[must_use]
    pub fn snapshot_root(&self) -> &Path {
        &self.snapshot_root
    }

    /// Absolute checkpoint directory of a record
    #[must_use]
    pub fn checkpoint_path(&self, record: &SnapshotRecord) -> PathBuf {
        self.snapshot_root
            .join(checkpoint_dir_name(&record.snapshot_id))
    }

    #[must_use]
    pub fn is_leader(&self) -> bool {
        self.log.is_leader()
    }

    fn require_leader(&self) -> Result<()> {
        if self.is_leader() {
            Ok(())
        } else {
            Err(Error::NotLeader {
                leader: self.log.leader_id().map(|p| p.to_string()),
            })
        }
    }

    /// Snapshot the bucket's current namespace under `name`.
    ///
    /// The record carries the applied index captured by the checkpoint
    /// and is written only after the checkpoint is durable.
    pub fn create_snapshot(&self, volume: &str, bucket: &str, name: &str) -> Result<SnapshotId> {
        validate_snapshot_name(name)?;
        self.require_leader()?;

        let lock_id = SnapshotRecord::table_key(volume, bucket, name);
        self.locks
            .with_write_lock(ResourceKind::Snapshot, &lock_id, || {
                if self
                    .store
                    .get_snapshot_info(volume, bucket, name)?
                    .is_some_and(|r| r.is_active())
                {
                    return Err(Error::SnapshotAlreadyExists {
                        volume: volume.to_string(),
                        bucket: bucket.to_string(),
                        name: name.to_string(),
                    });
                }

                let snapshot_id = SnapshotId::new();
                let dir_name = checkpoint_dir_name(&snapshot_id);
                let checkpoint_dir = self.snapshot_root.join(&dir_name);
                fs::create_dir_all(&self.snapshot_root)?;

                let scope = CheckpointScope::Bucket {
                    volume: volume.to_string(),
                    bucket: bucket.to_string(),
                };
                let checkpoint = match self.store.take_checkpoint(&scope, &checkpoint_dir) {
                    Ok(checkpoint) => checkpoint,
                    Err(e) => {
                        remove_dir_quietly(&checkpoint_dir);
                        return Err(e.into());
                    }
                };

                let record = SnapshotRecord {
                    snapshot_id,
                    volume: volume.to_string(),
                    bucket: bucket.to_string(),
                    name: name.to_string(),
                    created_at: now_secs(),
                    deleted_at: None,
                    checkpoint_dir: dir_name,
                    state: SnapshotState::Active,
                    snapshot_index: checkpoint.index,
                };
                if let Err(e) = self.store.insert_snapshot_info(&record) {
                    remove_dir_quietly(&checkpoint_dir);
                    return Err(e.into());
                }

                info!(
                    "Created snapshot {} ({}) at index {}",
                    lock_id, snapshot_id, checkpoint.index
                );
                Ok(snapshot_id)
            })
    }

    /// Look up an ACTIVE snapshot; DELETED snapshots are not found
    pub fn get_snapshot_info(
        &self,
        volume: &str,
        bucket: &str,
        name: &str,
    ) -> Result<SnapshotRecord> {
        self.store
            .get_snapshot_info(volume, bucket, name)?
            .filter(SnapshotRecord::is_active)
            .ok_or_else(|| Error::snapshot_not_found(volume, bucket, name))
    }

    /// Mark a snapshot DELETED. Its checkpoint stays on disk until the
    /// reclaimer sweeps it.
    pub fn delete_snapshot(&self, volume: &str, bucket: &str, name: &str) -> Result<()> {
        self.require_leader()?;

        let lock_id = SnapshotRecord::table_key(volume, bucket, name);
        self.locks
            .with_write_lock(ResourceKind::Snapshot, &lock_id, || {
                let mut record = self.get_snapshot_info(volume, bucket, name)?;
                record.state = SnapshotState::Deleted;
                record.deleted_at = Some(now_secs());
                self.store.update_snapshot_info(&record)?;
                info!("Deleted snapshot {} ({})", lock_id, record.snapshot_id);
                Ok(())
            })
    }

    /// ACTIVE snapshots of one bucket, ordered by name
    pub fn list_snapshots(&self, volume: &str, bucket: &str) -> Result<Vec<SnapshotRecord>> {
        Ok(self
            .store
            .list_snapshot_infos(volume, bucket)?
            .into_iter()
            .filter(SnapshotRecord::is_active)
            .collect())
    }

    /// Read-only store over a snapshot's checkpoint
    pub fn open_view(&self, record: &SnapshotRecord) -> Result<Arc<MetaStore>> {
        let mut views = self.views.lock();
        if let Some(view) = views.get(&record.snapshot_id) {
            return Ok(Arc::clone(view));
        }
        let path = self.checkpoint_path(record);
        // Records arrive with a full catch-up; their checkpoint directories
        // stay on the replica that took them
        if !path.join(DB_FILE_NAME).is_file() {
            warn!(
                "Checkpoint of snapshot {} is not present on this replica at {:?}",
                record.snapshot_id, path
            );
            return Err(Error::snapshot_not_found(
                &record.volume,
                &record.bucket,
                &record.name,
            ));
        }
        let view = Arc::new(MetaStore::open_checkpoint(path)?);
        debug!("Opened snapshot view {}", record.snapshot_id);
        views.insert(record.snapshot_id, Arc::clone(&view));
        Ok(view)
    }

    /// Drop the cached view of a snapshot unless a reader still holds it.
    /// Returns false when the view is in use.
    pub(crate) fn release_view(&self, id: &SnapshotId) -> bool {
        let mut views = self.views.lock();
        match views.get(id) {
            Some(view) if Arc::strong_count(view) > 1 => false,
            Some(_) => {
                views.remove(id);
                true
            }
            None => true,
        }
    }
}

fn remove_dir_quietly(dir: &Path) {
    if dir.exists()
        && let Err(e) = fs::remove_dir_all(dir)
    {
        warn!("Failed to remove checkpoint {:?}: {}", dir, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::LocalLog;
    use crate::types::KeyInfo;
    use keystone_common::{BucketLayout, LogIndex, PeerId};
    use tempfile::{TempDir, tempdir};

    struct FollowerLog;

    impl ReplicatedLog for FollowerLog {
        fn committed_index(&self) -> Result<LogIndex> {
            Ok(0)
        }
        fn is_leader(&self) -> bool {
            false
        }
        fn leader_id(&self) -> Option<PeerId> {
            Some(PeerId::new("meta1"))
        }
        fn peers(&self) -> Vec<PeerId> {
            Vec::new()
        }
    }

    fn setup() -> (TempDir, SnapshotManager) {
        let dir = tempdir().unwrap();
        let store = Arc::new(MetaStore::open(dir.path().join("db")).unwrap());
        store.create_volume("vol1", "alice").unwrap();
        store
            .create_bucket("vol1", "buck1", BucketLayout::ObjectStore)
            .unwrap();
        let log = Arc::new(LocalLog::new("meta1", Arc::clone(&store)));
        let manager = SnapshotManager::new(
            store,
            Arc::new(LockManager::new()),
            log,
            dir.path().join("snapshot"),
        );
        (dir, manager)
    }

    #[test]
    fn test_snapshot_key_prefix() {
        assert_eq!(snapshot_key_prefix("s1"), ".snapshot/s1/");
    }

    #[test]
    fn test_create_records_committed_index() {
        let (_dir, manager) = setup();
        manager
            .store()
            .put_key("vol1", "buck1", "key-0", KeyInfo::new("", "a", 1))
            .unwrap();
        let committed = manager.store().applied_index().unwrap();

        let id = manager.create_snapshot("vol1", "buck1", "s1").unwrap();
        let record = manager.get_snapshot_info("vol1", "buck1", "s1").unwrap();
        assert_eq!(record.snapshot_id, id);
        assert_eq!(record.snapshot_index, committed);
        assert_eq!(record.checkpoint_dir, checkpoint_dir_name(&id));
        assert!(manager.checkpoint_path(&record).is_dir());

        let err = manager.create_snapshot("vol1", "buck1", "s1").unwrap_err();
        assert!(matches!(err, Error::SnapshotAlreadyExists { .. }));
    }

    #[test]
    fn test_create_in_missing_bucket_leaves_nothing() {
        let (_dir, manager) = setup();
        let err = manager.create_snapshot("vol1", "nope1", "s1").unwrap_err();
        assert!(matches!(err, Error::BucketNotFound { .. }));
        assert!(manager.store().get_snapshot_info("vol1", "nope1", "s1").unwrap().is_none());
        let leftover = fs::read_dir(manager.snapshot_root()).unwrap().count();
        assert_eq!(leftover, 0);
    }

    #[test]
    fn test_delete_transitions_and_hides_record() {
        let (_dir, manager) = setup();
        manager.create_snapshot("vol1", "buck1", "s1").unwrap();
        manager.delete_snapshot("vol1", "buck1", "s1").unwrap();

        assert!(manager.get_snapshot_info("vol1", "buck1", "s1").unwrap_err().is_not_found());
        assert!(manager.delete_snapshot("vol1", "buck1", "s1").unwrap_err().is_not_found());
        assert!(manager.list_snapshots("vol1", "buck1").unwrap().is_empty());

        let stored = manager
            .store()
            .get_snapshot_info("vol1", "buck1", "s1")
            .unwrap()
            .unwrap();
        assert_eq!(stored.state, SnapshotState::Deleted);
        assert!(stored.deleted_at.is_some());
    }

    #[test]
    fn test_recreate_after_delete_gets_new_id() {
        let (_dir, manager) = setup();
        let first = manager.create_snapshot("vol1", "buck1", "s1").unwrap();
        manager.delete_snapshot("vol1", "buck1", "s1").unwrap();
        let second = manager.create_snapshot("vol1", "buck1", "s1").unwrap();

        assert_ne!(first, second);
        let deleted = manager.store().deleted_snapshot_infos().unwrap();
        assert_eq!(deleted.len(), 1);
        assert_eq!(deleted[0].snapshot_id, first);
    }

    #[test]
    fn test_invalid_names_rejected() {
        let (_dir, manager) = setup();
        for name in ["", ".", "..", "a/b"] {
            assert!(matches!(
                manager.create_snapshot("vol1", "buck1", name),
                Err(Error::InvalidArgument(_))
            ));
        }
    }

    #[test]
    fn test_follower_refuses_mutations() {
        let dir = tempdir().unwrap();
        let store = Arc::new(MetaStore::open(dir.path().join("db")).unwrap());
        let manager = SnapshotManager::new(
            store,
            Arc::new(LockManager::new()),
            Arc::new(FollowerLog),
            dir.path().join("snapshot"),
        );
        match manager.create_snapshot("vol1", "buck1", "s1") {
            Err(Error::NotLeader { leader }) => assert_eq!(leader.as_deref(), Some("meta1")),
            other => panic!("expected NotLeader, got {other:?}"),
        }
    }

    #[test]
    fn test_concurrent_creates_on_different_buckets() {
        let (_dir, manager) = setup();
        for bucket in ["buck2", "buck3", "buck4"] {
            manager
                .store()
                .create_bucket("vol1", bucket, BucketLayout::Legacy)
                .unwrap();
        }
        let manager = Arc::new(manager);
        let handles: Vec<_> = ["buck1", "buck2", "buck3", "buck4"]
            .into_iter()
            .map(|bucket| {
                let manager = Arc::clone(&manager);
                std::thread::spawn(move || manager.create_snapshot("vol1", bucket, "s1"))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap().unwrap();
        }
        assert_eq!(manager.list_snapshots("vol1", "buck3").unwrap().len(), 1);
    }

    #[test]
    fn test_views_are_shared_and_released() {
        let (_dir, manager) = setup();
        manager.create_snapshot("vol1", "buck1", "s1").unwrap();
        let record = manager.get_snapshot_info("vol1", "buck1", "s1").unwrap();

        let view = manager.open_view(&record).unwrap();
        let again = manager.open_view(&record).unwrap();
        assert!(Arc::ptr_eq(&view, &again));
        assert!(view.is_read_only());

        assert!(!manager.release_view(&record.snapshot_id));
        drop(view);
        drop(again);
        assert!(manager.release_view(&record.snapshot_id));
    }

    #[test]
    fn test_view_without_checkpoint_is_not_found() {
        let (_dir, manager) = setup();
        manager.create_snapshot("vol1", "buck1", "s1").unwrap();
        let record = manager.get_snapshot_info("vol1", "buck1", "s1").unwrap();
        fs::remove_dir_all(manager.checkpoint_path(&record)).unwrap();

        let err = manager.open_view(&record).unwrap_err();
        assert!(matches!(err, Error::SnapshotNotFound { .. }));
    }
}
