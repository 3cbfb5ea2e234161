//! Persistent metadata store backed by redb.
//!
//! One database file per store directory. The store is the replicated
//! state machine: every committed mutation advances the persisted
//! applied index by one, in the same write transaction as the mutation,
//! so a checkpoint always carries the exact index it corresponds to.
//!
//! Checkpoints are taken inside a single read transaction (redb MVCC),
//! so they never block writers and never observe a half-applied entry.

use crate::tables;
use crate::types::{
    BucketInfo, DirectoryInfo, KeyInfo, S3SecretValue, SnapshotRecord, SnapshotState, VolumeInfo,
    bucket_table_key, now_secs,
};
use keystone_common::{
    BucketLayout, BucketName, DigestCalculator, Error, LogIndex, PackageDigest, VolumeName,
    normalize_key_path,
};
use parking_lot::{MappedRwLockReadGuard, RwLock, RwLockReadGuard};
use redb::{
    Database, ReadTransaction, ReadableTable, TableDefinition, TableHandle, WriteTransaction,
};
use serde::de::DeserializeOwned;
use std::fs::{self, File};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Database file name inside a store or checkpoint directory
pub const DB_FILE_NAME: &str = "meta.redb";

/// Error type for metadata store operations
#[derive(Debug, thiserror::Error)]
pub enum MetaStoreError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::DatabaseError),
    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("redb transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),
    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store is closed")]
    Closed,
    #[error("store is read-only")]
    ReadOnly,
    #[error(transparent)]
    Domain(#[from] Error),
}

impl From<redb::TransactionError> for MetaStoreError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

impl From<MetaStoreError> for Error {
    fn from(e: MetaStoreError) -> Self {
        match e {
            MetaStoreError::Domain(e) => e,
            MetaStoreError::Io(e) => Self::DiskIo(e),
            other => Self::Storage(other.to_string()),
        }
    }
}

pub type MetaStoreResult<T> = Result<T, MetaStoreError>;

/// Which rows a checkpoint carries
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CheckpointScope {
    /// Every table (replica catch-up)
    Full,
    /// One bucket's namespace plus its volume and bucket rows (snapshots)
    Bucket { volume: String, bucket: String },
}

/// A consistent on-disk copy of the store
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Checkpoint {
    pub dir: PathBuf,
    /// Applied log index captured by the checkpoint
    pub index: LogIndex,
}

/// Persistent metadata store backed by redb.
#[derive(Debug)]
pub struct MetaStore {
    dir: PathBuf,
    read_only: bool,
    db: RwLock<Option<Database>>,
}

impl MetaStore {
    /// Open (or create) the store in `dir`, finishing or rolling back an
    /// interrupted checkpoint install first.
    pub fn open(dir: impl AsRef<Path>) -> MetaStoreResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        recover_interrupted_install(&dir)?;
        remove_retired(&dir)?;
        fs::create_dir_all(&dir)?;
        let db = open_db(&dir)?;
        debug!("Opened metadata store at {:?}", dir);
        Ok(Self {
            dir,
            read_only: false,
            db: RwLock::new(Some(db)),
        })
    }

    /// Open a checkpoint directory for reading only
    pub fn open_checkpoint(dir: impl AsRef<Path>) -> MetaStoreResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        let db = Database::open(dir.join(DB_FILE_NAME))?;
        Ok(Self {
            dir,
            read_only: true,
            db: RwLock::new(Some(db)),
        })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub const fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn db(&self) -> MetaStoreResult<MappedRwLockReadGuard<'_, Database>> {
        RwLockReadGuard::try_map(self.db.read(), Option::as_ref).map_err(|_| MetaStoreError::Closed)
    }

    /// Run `f` in a write transaction that applies one log entry.
    fn commit_mutation<T>(
        &self,
        f: impl FnOnce(&WriteTransaction) -> MetaStoreResult<T>,
    ) -> MetaStoreResult<T> {
        if self.read_only {
            return Err(MetaStoreError::ReadOnly);
        }
        let db = self.db()?;
        let txn = db.begin_write()?;
        let out = f(&txn)?;
        {
            let mut meta = txn.open_table(tables::META)?;
            let applied = meta.get(tables::APPLIED_INDEX)?.map_or(0, |v| v.value());
            meta.insert(tables::APPLIED_INDEX, applied + 1)?;
        }
        txn.commit()?;
        Ok(out)
    }

    fn read_txn(&self) -> MetaStoreResult<ReadTransaction> {
        Ok(self.db()?.begin_read()?)
    }

    // ---- Log index ----

    /// Index of the last log entry applied to this store
    pub fn applied_index(&self) -> MetaStoreResult<LogIndex> {
        read_index(&self.read_txn()?)
    }

    /// Record log entries applied without namespace effects. Never moves
    /// the index backwards.
    pub fn record_applied(&self, index: LogIndex) -> MetaStoreResult<LogIndex> {
        if self.read_only {
            return Err(MetaStoreError::ReadOnly);
        }
        let db = self.db()?;
        let txn = db.begin_write()?;
        let applied = {
            let mut meta = txn.open_table(tables::META)?;
            let current = meta.get(tables::APPLIED_INDEX)?.map_or(0, |v| v.value());
            let applied = current.max(index);
            meta.insert(tables::APPLIED_INDEX, applied)?;
            applied
        };
        txn.commit()?;
        Ok(applied)
    }

    // ---- Volumes ----

    pub fn create_volume(&self, name: &str, owner: &str) -> MetaStoreResult<VolumeInfo> {
        VolumeName::new(name).map_err(Error::from)?;
        self.commit_mutation(|txn| {
            let mut volumes = txn.open_table(tables::VOLUMES)?;
            if volumes.get(name)?.is_some() {
                return Err(Error::VolumeAlreadyExists(name.to_string()).into());
            }
            let info = VolumeInfo {
                name: name.to_string(),
                owner: owner.to_string(),
                created_at: now_secs(),
            };
            volumes.insert(name, bincode::serialize(&info)?.as_slice())?;
            Ok(info)
        })
    }

    pub fn get_volume(&self, name: &str) -> MetaStoreResult<VolumeInfo> {
        let txn = self.read_txn()?;
        let volumes = txn.open_table(tables::VOLUMES)?;
        get_bincode(&volumes, name)?.ok_or_else(|| Error::VolumeNotFound(name.to_string()).into())
    }

    // ---- Buckets ----

    pub fn create_bucket(
        &self,
        volume: &str,
        bucket: &str,
        layout: BucketLayout,
    ) -> MetaStoreResult<BucketInfo> {
        BucketName::new(bucket).map_err(Error::from)?;
        self.commit_mutation(|txn| {
            {
                let volumes = txn.open_table(tables::VOLUMES)?;
                if volumes.get(volume)?.is_none() {
                    return Err(Error::VolumeNotFound(volume.to_string()).into());
                }
            }
            let row = bucket_table_key(volume, bucket);
            {
                let buckets = txn.open_table(tables::BUCKETS)?;
                if buckets.get(row.as_str())?.is_some() {
                    return Err(Error::BucketAlreadyExists {
                        volume: volume.to_string(),
                        bucket: bucket.to_string(),
                    }
                    .into());
                }
            }
            let info = BucketInfo {
                volume: volume.to_string(),
                name: bucket.to_string(),
                layout,
                object_id: next_object_id(txn)?,
                created_at: now_secs(),
            };
            let mut buckets = txn.open_table(tables::BUCKETS)?;
            buckets.insert(row.as_str(), bincode::serialize(&info)?.as_slice())?;
            Ok(info)
        })
    }

    pub fn get_bucket(&self, volume: &str, bucket: &str) -> MetaStoreResult<BucketInfo> {
        let txn = self.read_txn()?;
        let buckets = txn.open_table(tables::BUCKETS)?;
        lookup_bucket(&buckets, volume, bucket)
    }

    // ---- Keys ----

    /// Create or overwrite a key. The stored `key_name` is the path
    /// normalized under the bucket's layout.
    pub fn put_key(
        &self,
        volume: &str,
        bucket: &str,
        key: &str,
        mut info: KeyInfo,
    ) -> MetaStoreResult<KeyInfo> {
        self.commit_mutation(|txn| {
            let bucket_info = {
                let buckets = txn.open_table(tables::BUCKETS)?;
                lookup_bucket(&buckets, volume, bucket)?
            };
            let path = normalize_key_path(bucket_info.layout, key).map_err(Error::from)?;
            info.key_name.clone_from(&path);
            info.modified_at = now_secs();

            if bucket_info.layout.is_tree() {
                put_tree_file(txn, &bucket_info, &path, &info)?;
            } else {
                let mut keys = txn.open_table(tables::KEYS)?;
                let row = flat_row(volume, bucket, &path);
                keys.insert(row.as_str(), bincode::serialize(&info)?.as_slice())?;
            }
            Ok(info)
        })
    }

    pub fn get_key(&self, volume: &str, bucket: &str, key: &str) -> MetaStoreResult<KeyInfo> {
        let txn = self.read_txn()?;
        let bucket_info = {
            let buckets = txn.open_table(tables::BUCKETS)?;
            lookup_bucket(&buckets, volume, bucket)?
        };
        let path = normalize_key_path(bucket_info.layout, key).map_err(Error::from)?;
        let found = if bucket_info.layout.is_tree() {
            let dirs = txn.open_table(tables::DIRECTORIES)?;
            let files = txn.open_table(tables::FILES)?;
            let (parents, leaf) = split_path(&path);
            match resolve_dir(&dirs, bucket_info.object_id, &parents)? {
                Some(parent) => get_bincode::<KeyInfo>(
                    &files,
                    &tree_row(bucket_info.object_id, parent, leaf),
                )?
                .map(|mut info| {
                    info.key_name.clone_from(&path);
                    info
                }),
                None => None,
            }
        } else {
            let keys = txn.open_table(tables::KEYS)?;
            get_bincode(&keys, &flat_row(volume, bucket, &path))?
        };
        found.ok_or_else(|| {
            Error::KeyNotFound {
                bucket: bucket.to_string(),
                key: path,
            }
            .into()
        })
    }

    pub fn delete_key(&self, volume: &str, bucket: &str, key: &str) -> MetaStoreResult<()> {
        self.commit_mutation(|txn| {
            let bucket_info = {
                let buckets = txn.open_table(tables::BUCKETS)?;
                lookup_bucket(&buckets, volume, bucket)?
            };
            let path = normalize_key_path(bucket_info.layout, key).map_err(Error::from)?;
            let removed = if bucket_info.layout.is_tree() {
                let parent = {
                    let dirs = txn.open_table(tables::DIRECTORIES)?;
                    resolve_dir(&dirs, bucket_info.object_id, &split_path(&path).0)?
                };
                match parent {
                    Some(parent) => {
                        let mut files = txn.open_table(tables::FILES)?;
                        let row = tree_row(bucket_info.object_id, parent, split_path(&path).1);
                        files.remove(row.as_str())?.is_some()
                    }
                    None => false,
                }
            } else {
                let mut keys = txn.open_table(tables::KEYS)?;
                keys.remove(flat_row(volume, bucket, &path).as_str())?.is_some()
            };
            if removed {
                Ok(())
            } else {
                Err(Error::KeyNotFound {
                    bucket: bucket.to_string(),
                    key: path,
                }
                .into())
            }
        })
    }

    /// Whether `key` is occupied in the bucket, either by a key or by a
    /// directory (explicit in tree layouts, implied by deeper keys in the
    /// legacy layout).
    pub fn key_or_directory_exists(
        &self,
        volume: &str,
        bucket: &str,
        key: &str,
    ) -> MetaStoreResult<bool> {
        let txn = self.read_txn()?;
        let bucket_info = {
            let buckets = txn.open_table(tables::BUCKETS)?;
            lookup_bucket(&buckets, volume, bucket)?
        };
        let path = normalize_key_path(bucket_info.layout, key).map_err(Error::from)?;

        if bucket_info.layout.is_tree() {
            let dirs = txn.open_table(tables::DIRECTORIES)?;
            let files = txn.open_table(tables::FILES)?;
            let (parents, leaf) = split_path(&path);
            let Some(parent) = resolve_dir(&dirs, bucket_info.object_id, &parents)? else {
                return Ok(false);
            };
            let row = tree_row(bucket_info.object_id, parent, leaf);
            return Ok(files.get(row.as_str())?.is_some() || dirs.get(row.as_str())?.is_some());
        }

        let keys = txn.open_table(tables::KEYS)?;
        let row = flat_row(volume, bucket, &path);
        if keys.get(row.as_str())?.is_some() {
            return Ok(true);
        }
        if bucket_info.layout == BucketLayout::Legacy {
            let dir_prefix = format!("{row}/");
            if let Some(entry) = keys.range(dir_prefix.as_str()..)?.next() {
                let (k, _) = entry?;
                return Ok(k.value().starts_with(dir_prefix.as_str()));
            }
        }
        Ok(false)
    }

    /// List keys under `prefix` in lexicographic path order, strictly after
    /// `start_after`, at most `limit` entries.
    ///
    /// Tree buckets are walked parent-first from the bucket root; each call
    /// re-walks the tree, so paging a tree bucket costs a full traversal
    /// per page.
    pub fn list_keys(
        &self,
        volume: &str,
        bucket: &str,
        prefix: &str,
        start_after: Option<&str>,
        limit: usize,
    ) -> MetaStoreResult<Vec<KeyInfo>> {
        let txn = self.read_txn()?;
        let bucket_info = {
            let buckets = txn.open_table(tables::BUCKETS)?;
            lookup_bucket(&buckets, volume, bucket)?
        };

        if bucket_info.layout.is_tree() {
            let dirs = txn.open_table(tables::DIRECTORIES)?;
            let files = txn.open_table(tables::FILES)?;
            let mut all = walk_tree(&dirs, &files, bucket_info.object_id)?;
            all.sort_by(|a, b| a.key_name.cmp(&b.key_name));
            return Ok(all
                .into_iter()
                .filter(|k| k.key_name.starts_with(prefix))
                .filter(|k| start_after.is_none_or(|after| k.key_name.as_str() > after))
                .take(limit)
                .collect());
        }

        let keys = txn.open_table(tables::KEYS)?;
        let base = format!("{}/", bucket_table_key(volume, bucket));
        let seek = format!("{base}{prefix}");
        let lower = match start_after {
            Some(after) if format!("{base}{after}") >= seek => {
                Bound::Excluded(format!("{base}{after}"))
            }
            _ => Bound::Included(seek.clone()),
        };

        let mut result = Vec::new();
        for entry in keys.range::<&str>((lower.as_ref().map(String::as_str), Bound::Unbounded))? {
            if result.len() >= limit {
                break;
            }
            let (k, v) = entry?;
            if !k.value().starts_with(seek.as_str()) {
                break;
            }
            result.push(bincode::deserialize::<KeyInfo>(v.value())?);
        }
        Ok(result)
    }

    // ---- Snapshot records ----

    /// Insert a new ACTIVE record. An existing DELETED record for the same
    /// name moves to the purge queue in the same transaction.
    pub fn insert_snapshot_info(&self, record: &SnapshotRecord) -> MetaStoreResult<()> {
        let row = record.key();
        self.commit_mutation(|txn| {
            let mut infos = txn.open_table(tables::SNAPSHOT_INFO)?;
            if let Some(existing) = get_bincode::<SnapshotRecord>(&infos, &row)? {
                if existing.is_active() {
                    return Err(Error::SnapshotAlreadyExists {
                        volume: record.volume.clone(),
                        bucket: record.bucket.clone(),
                        name: record.name.clone(),
                    }
                    .into());
                }
                let mut purge = txn.open_table(tables::SNAPSHOT_PURGE)?;
                purge.insert(
                    existing.snapshot_id.to_string().as_str(),
                    bincode::serialize(&existing)?.as_slice(),
                )?;
            }
            infos.insert(row.as_str(), bincode::serialize(record)?.as_slice())?;
            Ok(())
        })
    }

    /// Overwrite an existing record
    pub fn update_snapshot_info(&self, record: &SnapshotRecord) -> MetaStoreResult<()> {
        self.commit_mutation(|txn| {
            let mut infos = txn.open_table(tables::SNAPSHOT_INFO)?;
            infos.insert(record.key().as_str(), bincode::serialize(record)?.as_slice())?;
            Ok(())
        })
    }

    pub fn get_snapshot_info(
        &self,
        volume: &str,
        bucket: &str,
        name: &str,
    ) -> MetaStoreResult<Option<SnapshotRecord>> {
        let txn = self.read_txn()?;
        let infos = txn.open_table(tables::SNAPSHOT_INFO)?;
        get_bincode(&infos, &SnapshotRecord::table_key(volume, bucket, name))
    }

    /// All records (any state) for one bucket, ordered by name
    pub fn list_snapshot_infos(
        &self,
        volume: &str,
        bucket: &str,
    ) -> MetaStoreResult<Vec<SnapshotRecord>> {
        let txn = self.read_txn()?;
        let infos = txn.open_table(tables::SNAPSHOT_INFO)?;
        let prefix = format!("{}/", bucket_table_key(volume, bucket));
        Ok(scan_prefix(&infos, &prefix)?.into_iter().map(|(_, r)| r).collect())
    }

    /// DELETED records awaiting reclamation, including displaced ones
    pub fn deleted_snapshot_infos(&self) -> MetaStoreResult<Vec<SnapshotRecord>> {
        let txn = self.read_txn()?;
        let infos = txn.open_table(tables::SNAPSHOT_INFO)?;
        let purge = txn.open_table(tables::SNAPSHOT_PURGE)?;
        let mut result: Vec<SnapshotRecord> = scan_prefix::<SnapshotRecord>(&infos, "")?
            .into_iter()
            .map(|(_, r)| r)
            .filter(|r| r.state == SnapshotState::Deleted)
            .collect();
        result.extend(scan_prefix::<SnapshotRecord>(&purge, "")?.into_iter().map(|(_, r)| r));
        Ok(result)
    }

    /// Drop a reclaimed record
    pub fn purge_snapshot_info(&self, record: &SnapshotRecord) -> MetaStoreResult<()> {
        self.commit_mutation(|txn| {
            {
                let mut purge = txn.open_table(tables::SNAPSHOT_PURGE)?;
                purge.remove(record.snapshot_id.to_string().as_str())?;
            }
            let mut infos = txn.open_table(tables::SNAPSHOT_INFO)?;
            let row = record.key();
            let same = get_bincode::<SnapshotRecord>(&infos, &row)?
                .is_some_and(|r| r.snapshot_id == record.snapshot_id && !r.is_active());
            if same {
                infos.remove(row.as_str())?;
            }
            Ok(())
        })
    }

    // ---- S3 secrets ----

    pub fn put_secret(&self, value: &S3SecretValue) -> MetaStoreResult<()> {
        self.commit_mutation(|txn| {
            let mut secrets = txn.open_table(tables::S3_SECRETS)?;
            let mut access_keys = txn.open_table(tables::S3_ACCESS_KEYS)?;
            if let Some(previous) = get_bincode::<S3SecretValue>(&secrets, &value.principal)?
                && previous.aws_access_key != value.aws_access_key
            {
                access_keys.remove(previous.aws_access_key.as_str())?;
            }
            secrets.insert(value.principal.as_str(), bincode::serialize(value)?.as_slice())?;
            access_keys.insert(value.aws_access_key.as_str(), value.principal.as_str())?;
            Ok(())
        })
    }

    pub fn get_secret(&self, principal: &str) -> MetaStoreResult<Option<S3SecretValue>> {
        let txn = self.read_txn()?;
        let secrets = txn.open_table(tables::S3_SECRETS)?;
        get_bincode(&secrets, principal)
    }

    pub fn get_secret_by_access_key(
        &self,
        access_key: &str,
    ) -> MetaStoreResult<Option<S3SecretValue>> {
        let txn = self.read_txn()?;
        let access_keys = txn.open_table(tables::S3_ACCESS_KEYS)?;
        let Some(principal) = access_keys.get(access_key)?.map(|v| v.value().to_string()) else {
            return Ok(None);
        };
        let secrets = txn.open_table(tables::S3_SECRETS)?;
        get_bincode(&secrets, &principal)
    }

    /// Remove a principal's secret; returns whether one existed
    pub fn delete_secret(&self, principal: &str) -> MetaStoreResult<bool> {
        self.commit_mutation(|txn| {
            let mut secrets = txn.open_table(tables::S3_SECRETS)?;
            let previous = secrets
                .remove(principal)?
                .map(|v| bincode::deserialize::<S3SecretValue>(v.value()))
                .transpose()?;
            if let Some(previous) = &previous {
                let mut access_keys = txn.open_table(tables::S3_ACCESS_KEYS)?;
                access_keys.remove(previous.aws_access_key.as_str())?;
            }
            Ok(previous.is_some())
        })
    }

    // ---- Checkpoints ----

    /// Copy the rows selected by `scope` into a fresh database in `dest`.
    ///
    /// The copy runs inside one read transaction, so it captures exactly
    /// the state at the returned index while writers continue.
    pub fn take_checkpoint(
        &self,
        scope: &CheckpointScope,
        dest: &Path,
    ) -> MetaStoreResult<Checkpoint> {
        if dest.exists() && fs::read_dir(dest)?.next().is_some() {
            return Err(Error::invalid_argument(format!(
                "checkpoint directory {} is not empty",
                dest.display()
            ))
            .into());
        }
        fs::create_dir_all(dest)?;

        let src = self.read_txn()?;
        let index = read_index(&src)?;
        let db_path = dest.join(DB_FILE_NAME);
        {
            let target = Database::create(&db_path)?;
            let txn = target.begin_write()?;
            match scope {
                CheckpointScope::Full => {
                    for def in tables::BYTE_TABLES {
                        copy_rows(&src, &txn, def, &RowFilter::All)?;
                    }
                    copy_rows(&src, &txn, tables::S3_ACCESS_KEYS, &RowFilter::All)?;
                }
                CheckpointScope::Bucket { volume, bucket } => {
                    let bucket_info = {
                        let buckets = src.open_table(tables::BUCKETS)?;
                        lookup_bucket(&buckets, volume, bucket)?
                    };
                    let tree_prefix = format!("{}/", bucket_info.object_id);
                    copy_rows(&src, &txn, tables::VOLUMES, &RowFilter::Exact(volume.clone()))?;
                    copy_rows(
                        &src,
                        &txn,
                        tables::BUCKETS,
                        &RowFilter::Exact(bucket_table_key(volume, bucket)),
                    )?;
                    copy_rows(
                        &src,
                        &txn,
                        tables::KEYS,
                        &RowFilter::Prefix(format!("{}/", bucket_table_key(volume, bucket))),
                    )?;
                    copy_rows(
                        &src,
                        &txn,
                        tables::DIRECTORIES,
                        &RowFilter::Prefix(tree_prefix.clone()),
                    )?;
                    copy_rows(&src, &txn, tables::FILES, &RowFilter::Prefix(tree_prefix))?;
                    // Remaining tables exist but stay empty
                    for def in tables::BYTE_TABLES {
                        txn.open_table(def)?;
                    }
                    txn.open_table(tables::S3_ACCESS_KEYS)?;
                }
            }
            copy_rows(&src, &txn, tables::META, &RowFilter::All)?;
            txn.commit()?;
        }
        fsync(&db_path)?;
        fsync(dest)?;

        debug!("Checkpoint {:?} taken at index {} ({:?})", dest, index, scope);
        Ok(Checkpoint {
            dir: dest.to_path_buf(),
            index,
        })
    }

    /// Read the applied index persisted in a checkpoint directory
    pub fn read_persisted_index(dir: &Path) -> MetaStoreResult<LogIndex> {
        let db = Database::open(dir.join(DB_FILE_NAME))?;
        read_index(&db.begin_read()?)
    }

    /// Replace this store's data with the checkpoint staged in `staged`.
    ///
    /// The staged directory is fsynced, the live directory renamed aside,
    /// the staged directory renamed into place and the parent fsynced.
    /// Readers block for the duration and then see the new state. Returns
    /// the replaced store's directory; the caller removes it.
    pub fn install_checkpoint(&self, staged: &Path) -> MetaStoreResult<PathBuf> {
        if self.read_only {
            return Err(MetaStoreError::ReadOnly);
        }
        let staged_file = staged.join(DB_FILE_NAME);
        if !staged_file.is_file() {
            return Err(Error::invalid_argument(format!(
                "no checkpoint database in {}",
                staged.display()
            ))
            .into());
        }
        fsync(&staged_file)?;
        fsync(staged)?;

        let aside = aside_path(&self.dir);
        if aside.exists() {
            fs::remove_dir_all(&aside)?;
        }

        let mut guard = self.db.write();
        drop(guard.take());

        if let Err(e) = fs::rename(&self.dir, &aside) {
            error!("Failed to move live store {:?} aside: {}", self.dir, e);
            *guard = Some(open_db(&self.dir)?);
            return Err(e.into());
        }
        if let Err(e) = fs::rename(staged, &self.dir) {
            error!("Failed to move checkpoint {:?} into place: {}", staged, e);
            fs::rename(&aside, &self.dir)?;
            *guard = Some(open_db(&self.dir)?);
            return Err(e.into());
        }
        // The new data is in place either way; reopen before reporting
        let synced = fsync(parent_dir(&self.dir));
        *guard = Some(open_db(&self.dir)?);
        drop(guard);
        if let Err(e) = synced {
            error!("Failed to sync {:?} after install: {}", parent_dir(&self.dir), e);
            return Err(e.into());
        }
        info!("Installed checkpoint into {:?}", self.dir);

        // Give the replaced store a unique name so its removal cannot race
        // with a later install
        let retired = retired_path(&self.dir);
        match fs::rename(&aside, &retired) {
            Ok(()) => Ok(retired),
            Err(e) => {
                warn!("Failed to retire replaced store {:?}: {}", aside, e);
                Ok(aside)
            }
        }
    }

    /// Digest over every row of every table, in table order.
    ///
    /// Two stores with equal digests hold identical logical state.
    pub fn content_digest(&self) -> MetaStoreResult<PackageDigest> {
        let txn = self.read_txn()?;
        let mut calc = DigestCalculator::new();
        for def in tables::BYTE_TABLES {
            calc.update(def.name().as_bytes());
            let table = txn.open_table(def)?;
            for entry in table.iter()? {
                let (k, v) = entry?;
                calc.update(k.value().as_bytes());
                calc.update(v.value());
            }
        }
        let access_keys = txn.open_table(tables::S3_ACCESS_KEYS)?;
        for entry in access_keys.iter()? {
            let (k, v) = entry?;
            calc.update(k.value().as_bytes());
            calc.update(v.value().as_bytes());
        }
        calc.update(&read_index(&txn)?.to_be_bytes());
        Ok(calc.finalize())
    }
}

// ---- Generic helpers ----

enum RowFilter {
    All,
    Exact(String),
    Prefix(String),
}

fn open_db(dir: &Path) -> MetaStoreResult<Database> {
    let db = Database::create(dir.join(DB_FILE_NAME))?;

    // Create all tables eagerly so later read txns don't fail
    let write_txn = db.begin_write()?;
    {
        for def in tables::BYTE_TABLES {
            let _t = write_txn.open_table(def)?;
        }
        let _t = write_txn.open_table(tables::S3_ACCESS_KEYS)?;
        let _t = write_txn.open_table(tables::META)?;
    }
    write_txn.commit()?;
    Ok(db)
}

fn read_index(txn: &ReadTransaction) -> MetaStoreResult<LogIndex> {
    match txn.open_table(tables::META) {
        Ok(meta) => Ok(meta.get(tables::APPLIED_INDEX)?.map_or(0, |v| v.value())),
        Err(redb::TableError::TableDoesNotExist(_)) => Ok(0),
        Err(e) => Err(e.into()),
    }
}

fn next_object_id(txn: &WriteTransaction) -> MetaStoreResult<u64> {
    let mut meta = txn.open_table(tables::META)?;
    let next = meta.get(tables::NEXT_OBJECT_ID)?.map_or(1, |v| v.value());
    meta.insert(tables::NEXT_OBJECT_ID, next + 1)?;
    Ok(next)
}

fn get_bincode<T: DeserializeOwned>(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    key: &str,
) -> MetaStoreResult<Option<T>> {
    match table.get(key)? {
        Some(val) => Ok(Some(bincode::deserialize(val.value())?)),
        None => Ok(None),
    }
}

fn scan_prefix<T: DeserializeOwned>(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    prefix: &str,
) -> MetaStoreResult<Vec<(String, T)>> {
    let mut result = Vec::new();
    for entry in table.range(prefix..)? {
        let (k, v) = entry?;
        let key = k.value();
        if !key.starts_with(prefix) {
            break;
        }
        match bincode::deserialize::<T>(v.value()) {
            Ok(val) => result.push((key.to_string(), val)),
            Err(e) => error!("Failed to decode entry '{}': {}", key, e),
        }
    }
    Ok(result)
}

fn copy_rows<V: redb::Value + 'static>(
    src: &ReadTransaction,
    dst: &WriteTransaction,
    def: TableDefinition<'static, &'static str, V>,
    filter: &RowFilter,
) -> MetaStoreResult<()> {
    let source = src.open_table(def)?;
    let mut target = dst.open_table(def)?;
    match filter {
        RowFilter::All => {
            for entry in source.iter()? {
                let (k, v) = entry?;
                target.insert(k.value(), v.value())?;
            }
        }
        RowFilter::Exact(key) => {
            if let Some(v) = source.get(key.as_str())? {
                target.insert(key.as_str(), v.value())?;
            }
        }
        RowFilter::Prefix(prefix) => {
            for entry in source.range(prefix.as_str()..)? {
                let (k, v) = entry?;
                if !k.value().starts_with(prefix.as_str()) {
                    break;
                }
                target.insert(k.value(), v.value())?;
            }
        }
    }
    Ok(())
}

fn lookup_bucket(
    buckets: &impl ReadableTable<&'static str, &'static [u8]>,
    volume: &str,
    bucket: &str,
) -> MetaStoreResult<BucketInfo> {
    get_bincode(buckets, &bucket_table_key(volume, bucket))?.ok_or_else(|| {
        Error::BucketNotFound {
            volume: volume.to_string(),
            bucket: bucket.to_string(),
        }
        .into()
    })
}

fn flat_row(volume: &str, bucket: &str, path: &str) -> String {
    format!("/{volume}/{bucket}/{path}")
}

fn tree_row(bucket_id: u64, parent_id: u64, name: &str) -> String {
    format!("{bucket_id}/{parent_id}/{name}")
}

/// Split a normalized tree path into parent components and leaf name
fn split_path(path: &str) -> (Vec<&str>, &str) {
    let mut parts: Vec<&str> = path.split('/').collect();
    let leaf = parts.pop().unwrap_or_default();
    (parts, leaf)
}

/// Resolve parent directory components to a directory id
fn resolve_dir(
    dirs: &impl ReadableTable<&'static str, &'static [u8]>,
    bucket_id: u64,
    components: &[&str],
) -> MetaStoreResult<Option<u64>> {
    let mut parent = bucket_id;
    for component in components {
        match get_bincode::<DirectoryInfo>(dirs, &tree_row(bucket_id, parent, component))? {
            Some(dir) => parent = dir.object_id,
            None => return Ok(None),
        }
    }
    Ok(Some(parent))
}

fn put_tree_file(
    txn: &WriteTransaction,
    bucket: &BucketInfo,
    path: &str,
    info: &KeyInfo,
) -> MetaStoreResult<()> {
    let (parents, leaf) = split_path(path);
    let mut parent = bucket.object_id;
    for component in parents {
        let row = tree_row(bucket.object_id, parent, component);
        {
            let files = txn.open_table(tables::FILES)?;
            if files.get(row.as_str())?.is_some() {
                return Err(Error::invalid_argument(format!(
                    "path component '{component}' of '{path}' is a file"
                ))
                .into());
            }
        }
        let existing = {
            let dirs = txn.open_table(tables::DIRECTORIES)?;
            get_bincode::<DirectoryInfo>(&dirs, &row)?
        };
        parent = match existing {
            Some(dir) => dir.object_id,
            None => {
                let dir = DirectoryInfo {
                    name: component.to_string(),
                    object_id: next_object_id(txn)?,
                    parent_id: parent,
                    created_at: now_secs(),
                };
                let mut dirs = txn.open_table(tables::DIRECTORIES)?;
                dirs.insert(row.as_str(), bincode::serialize(&dir)?.as_slice())?;
                dir.object_id
            }
        };
    }

    let row = tree_row(bucket.object_id, parent, leaf);
    {
        let dirs = txn.open_table(tables::DIRECTORIES)?;
        if dirs.get(row.as_str())?.is_some() {
            return Err(Error::KeyAlreadyExists {
                bucket: bucket.name.clone(),
                key: path.to_string(),
            }
            .into());
        }
    }
    let mut files = txn.open_table(tables::FILES)?;
    files.insert(row.as_str(), bincode::serialize(info)?.as_slice())?;
    Ok(())
}

/// Every file in a tree bucket, visiting each directory before its children
fn walk_tree(
    dirs: &impl ReadableTable<&'static str, &'static [u8]>,
    files: &impl ReadableTable<&'static str, &'static [u8]>,
    bucket_id: u64,
) -> MetaStoreResult<Vec<KeyInfo>> {
    let mut result = Vec::new();
    let mut pending = vec![(bucket_id, String::new())];
    while let Some((dir_id, path)) = pending.pop() {
        let children = format!("{bucket_id}/{dir_id}/");
        for (row, mut info) in scan_prefix::<KeyInfo>(files, &children)? {
            info.key_name = format!("{path}{}", &row[children.len()..]);
            result.push(info);
        }
        for (_, dir) in scan_prefix::<DirectoryInfo>(dirs, &children)? {
            pending.push((dir.object_id, format!("{path}{}/", dir.name)));
        }
    }
    Ok(result)
}

fn aside_path(dir: &Path) -> PathBuf {
    let mut name = dir.file_name().unwrap_or_default().to_os_string();
    name.push(".old");
    dir.with_file_name(name)
}

fn retired_prefix(dir: &Path) -> String {
    format!(
        "{}.retired-",
        dir.file_name().unwrap_or_default().to_string_lossy()
    )
}

fn retired_path(dir: &Path) -> PathBuf {
    dir.with_file_name(format!("{}{}", retired_prefix(dir), Uuid::new_v4()))
}

/// Remove replaced stores whose asynchronous removal never finished
fn remove_retired(dir: &Path) -> MetaStoreResult<()> {
    let parent = parent_dir(dir);
    if !parent.is_dir() {
        return Ok(());
    }
    let prefix = retired_prefix(dir);
    for entry in fs::read_dir(parent)? {
        let entry = entry?;
        if entry.file_name().to_string_lossy().starts_with(&prefix) {
            debug!("Removing retired store {:?}", entry.path());
            fs::remove_dir_all(entry.path())?;
        }
    }
    Ok(())
}

/// A crash between the two renames of an install leaves the old store
/// aside and no live directory; put the old store back. A crash after
/// both renames leaves only the set-aside copy to clean up.
fn recover_interrupted_install(dir: &Path) -> MetaStoreResult<()> {
    let aside = aside_path(dir);
    if !aside.exists() {
        return Ok(());
    }
    if dir.join(DB_FILE_NAME).is_file() {
        warn!("Removing leftover pre-install store {:?}", aside);
        fs::remove_dir_all(&aside)?;
    } else {
        warn!("Rolling back interrupted checkpoint install into {:?}", dir);
        if dir.exists() {
            fs::remove_dir_all(dir)?;
        }
        fs::rename(&aside, dir)?;
    }
    Ok(())
}

/// Directory containing `dir`; `.` for a bare relative name
fn parent_dir(dir: &Path) -> &Path {
    match dir.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

/// fsync a file or directory
fn fsync(path: &Path) -> std::io::Result<()> {
    File::open(path)?.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store_with_bucket(dir: &Path, layout: BucketLayout) -> MetaStore {
        let store = MetaStore::open(dir.join("db")).unwrap();
        store.create_volume("vol1", "alice").unwrap();
        store.create_bucket("vol1", "buck1", layout).unwrap();
        store
    }

    fn key_names(keys: &[KeyInfo]) -> Vec<&str> {
        keys.iter().map(|k| k.key_name.as_str()).collect()
    }

    #[test]
    fn test_mutations_advance_applied_index() {
        let dir = tempdir().unwrap();
        let store = MetaStore::open(dir.path().join("db")).unwrap();
        assert_eq!(store.applied_index().unwrap(), 0);

        store.create_volume("vol1", "alice").unwrap();
        store
            .create_bucket("vol1", "buck1", BucketLayout::ObjectStore)
            .unwrap();
        assert_eq!(store.applied_index().unwrap(), 2);

        // Failed mutations do not apply
        assert!(store.create_volume("vol1", "bob").is_err());
        assert_eq!(store.applied_index().unwrap(), 2);
    }

    #[test]
    fn test_record_applied_is_monotonic() {
        let dir = tempdir().unwrap();
        let store = MetaStore::open(dir.path().join("db")).unwrap();
        assert_eq!(store.record_applied(100).unwrap(), 100);
        assert_eq!(store.record_applied(50).unwrap(), 100);
        store.create_volume("vol1", "alice").unwrap();
        assert_eq!(store.applied_index().unwrap(), 101);
    }

    #[test]
    fn test_bucket_requires_volume() {
        let dir = tempdir().unwrap();
        let store = MetaStore::open(dir.path().join("db")).unwrap();
        let err = store
            .create_bucket("nope1", "buck1", BucketLayout::Legacy)
            .unwrap_err();
        assert!(matches!(Error::from(err), Error::VolumeNotFound(_)));
    }

    #[test]
    fn test_flat_put_get_delete() {
        let dir = tempdir().unwrap();
        let store = store_with_bucket(dir.path(), BucketLayout::ObjectStore);

        store
            .put_key("vol1", "buck1", "key-1", KeyInfo::new("", "blk-1", 10))
            .unwrap();
        let info = store.get_key("vol1", "buck1", "key-1").unwrap();
        assert_eq!(info.key_name, "key-1");
        assert_eq!(info.content_ref, "blk-1");

        store.delete_key("vol1", "buck1", "key-1").unwrap();
        let err = store.get_key("vol1", "buck1", "key-1").unwrap_err();
        assert!(Error::from(err).is_not_found());
        let err = store.delete_key("vol1", "buck1", "key-1").unwrap_err();
        assert!(Error::from(err).is_not_found());
    }

    #[test]
    fn test_flat_listing_order_prefix_and_paging() {
        let dir = tempdir().unwrap();
        let store = store_with_bucket(dir.path(), BucketLayout::ObjectStore);
        for key in ["key-2", "key-0", "other", "key-1", "key-10"] {
            store
                .put_key("vol1", "buck1", key, KeyInfo::new("", key, 1))
                .unwrap();
        }

        let all = store.list_keys("vol1", "buck1", "key-", None, 100).unwrap();
        assert_eq!(key_names(&all), ["key-0", "key-1", "key-10", "key-2"]);

        let page = store
            .list_keys("vol1", "buck1", "key-", Some("key-1"), 2)
            .unwrap();
        assert_eq!(key_names(&page), ["key-10", "key-2"]);
    }

    #[test]
    fn test_tree_layout_listing_is_lexicographic() {
        let dir = tempdir().unwrap();
        let store = store_with_bucket(dir.path(), BucketLayout::FileSystemOptimized);
        for key in ["a/b/c", "a.txt", "a/x", "/z//y/", "b"] {
            store
                .put_key("vol1", "buck1", key, KeyInfo::new("", key, 1))
                .unwrap();
        }

        let all = store.list_keys("vol1", "buck1", "", None, 100).unwrap();
        assert_eq!(key_names(&all), ["a.txt", "a/b/c", "a/x", "b", "z/y"]);

        let page = store.list_keys("vol1", "buck1", "a/", Some("a/b/c"), 10).unwrap();
        assert_eq!(key_names(&page), ["a/x"]);

        let info = store.get_key("vol1", "buck1", "z/y").unwrap();
        assert_eq!(info.content_ref, "/z//y/");
    }

    #[test]
    fn test_tree_layout_rejects_file_over_directory() {
        let dir = tempdir().unwrap();
        let store = store_with_bucket(dir.path(), BucketLayout::FileSystemOptimized);
        store
            .put_key("vol1", "buck1", "a/b", KeyInfo::new("", "x", 1))
            .unwrap();

        let err = store
            .put_key("vol1", "buck1", "a", KeyInfo::new("", "y", 1))
            .unwrap_err();
        assert!(matches!(Error::from(err), Error::KeyAlreadyExists { .. }));
        let err = store
            .put_key("vol1", "buck1", "a/b/c", KeyInfo::new("", "z", 1))
            .unwrap_err();
        assert!(matches!(Error::from(err), Error::InvalidArgument(_)));

        assert!(store.key_or_directory_exists("vol1", "buck1", "a").unwrap());
        assert!(store.key_or_directory_exists("vol1", "buck1", "a/b").unwrap());
        assert!(!store.key_or_directory_exists("vol1", "buck1", "a/c").unwrap());
    }

    #[test]
    fn test_legacy_layout_implied_directory_exists() {
        let dir = tempdir().unwrap();
        let store = store_with_bucket(dir.path(), BucketLayout::Legacy);
        store
            .put_key("vol1", "buck1", "/dir//file", KeyInfo::new("", "x", 1))
            .unwrap();

        assert!(store.key_or_directory_exists("vol1", "buck1", "dir/file").unwrap());
        assert!(store.key_or_directory_exists("vol1", "buck1", "dir").unwrap());
        assert!(!store.key_or_directory_exists("vol1", "buck1", "di").unwrap());
    }

    #[test]
    fn test_bucket_checkpoint_is_scoped_and_frozen() {
        let dir = tempdir().unwrap();
        let store = store_with_bucket(dir.path(), BucketLayout::ObjectStore);
        store
            .create_bucket("vol1", "buck2", BucketLayout::ObjectStore)
            .unwrap();
        store
            .put_key("vol1", "buck1", "key-0", KeyInfo::new("", "a", 1))
            .unwrap();
        store
            .put_key("vol1", "buck2", "key-9", KeyInfo::new("", "b", 1))
            .unwrap();
        let index_before = store.applied_index().unwrap();

        let scope = CheckpointScope::Bucket {
            volume: "vol1".into(),
            bucket: "buck1".into(),
        };
        let checkpoint = store
            .take_checkpoint(&scope, &dir.path().join("cp"))
            .unwrap();
        assert_eq!(checkpoint.index, index_before);

        // Later writes are not visible in the checkpoint
        store
            .put_key("vol1", "buck1", "key-1", KeyInfo::new("", "c", 1))
            .unwrap();

        assert_eq!(
            MetaStore::read_persisted_index(&checkpoint.dir).unwrap(),
            index_before
        );
        let frozen = MetaStore::open_checkpoint(&checkpoint.dir).unwrap();
        let keys = frozen.list_keys("vol1", "buck1", "", None, 100).unwrap();
        assert_eq!(key_names(&keys), ["key-0"]);
        assert!(frozen.get_bucket("vol1", "buck2").is_err());
        assert!(matches!(
            frozen.create_volume("vol2", "x"),
            Err(MetaStoreError::ReadOnly)
        ));
    }

    #[test]
    fn test_checkpoint_into_non_empty_dir_fails() {
        let dir = tempdir().unwrap();
        let store = store_with_bucket(dir.path(), BucketLayout::ObjectStore);
        let dest = dir.path().join("cp");
        fs::create_dir_all(&dest).unwrap();
        fs::write(dest.join("junk"), b"x").unwrap();
        assert!(store.take_checkpoint(&CheckpointScope::Full, &dest).is_err());
    }

    #[test]
    fn test_install_checkpoint_swaps_state() {
        let dir = tempdir().unwrap();
        let leader = MetaStore::open(dir.path().join("leader")).unwrap();
        leader.create_volume("vol1", "alice").unwrap();
        leader.record_applied(130).unwrap();
        let checkpoint = leader
            .take_checkpoint(&CheckpointScope::Full, &dir.path().join("staged"))
            .unwrap();

        let follower = MetaStore::open(dir.path().join("follower")).unwrap();
        follower.create_volume("stale", "bob").unwrap();
        let retired = follower.install_checkpoint(&checkpoint.dir).unwrap();

        assert_eq!(follower.applied_index().unwrap(), 130);
        assert!(follower.get_volume("vol1").is_ok());
        assert!(follower.get_volume("stale").is_err());
        assert!(retired.join(DB_FILE_NAME).is_file());
        assert!(!aside_path(follower.dir()).exists());
        assert!(!checkpoint.dir.exists());
        assert_eq!(
            follower.content_digest().unwrap(),
            leader.content_digest().unwrap()
        );
    }

    #[test]
    fn test_parent_dir_of_relative_name() {
        assert_eq!(parent_dir(Path::new("follower")), Path::new("."));
        assert_eq!(parent_dir(Path::new("data/follower")), Path::new("data"));
        assert_eq!(parent_dir(Path::new("/srv/db")), Path::new("/srv"));
    }

    /// Removes paths relative to the working directory when dropped
    struct RelativeDirs(Vec<PathBuf>);

    impl Drop for RelativeDirs {
        fn drop(&mut self) {
            for dir in &self.0 {
                let _ = fs::remove_dir_all(dir);
            }
        }
    }

    #[test]
    fn test_install_into_relative_store_dir() {
        let name = format!("install-{}", Uuid::new_v4());
        let live = PathBuf::from(&name);
        let staged = PathBuf::from(format!("{name}-staged"));
        let mut cleanup = RelativeDirs(vec![live.clone(), staged.clone()]);

        let dir = tempdir().unwrap();
        let leader = MetaStore::open(dir.path().join("leader")).unwrap();
        leader.create_volume("vol1", "alice").unwrap();
        leader.record_applied(130).unwrap();
        leader
            .take_checkpoint(&CheckpointScope::Full, &staged)
            .unwrap();

        let follower = MetaStore::open(&live).unwrap();
        let retired = follower.install_checkpoint(&staged).unwrap();
        cleanup.0.push(retired);

        assert_eq!(follower.applied_index().unwrap(), 130);
        assert!(follower.get_volume("vol1").is_ok());
    }

    #[test]
    fn test_install_without_database_leaves_store_intact() {
        let dir = tempdir().unwrap();
        let store = MetaStore::open(dir.path().join("db")).unwrap();
        store.create_volume("vol1", "alice").unwrap();
        let empty = dir.path().join("empty");
        fs::create_dir_all(&empty).unwrap();

        assert!(store.install_checkpoint(&empty).is_err());
        assert!(store.get_volume("vol1").is_ok());
    }

    #[test]
    fn test_open_rolls_back_interrupted_install() {
        let dir = tempdir().unwrap();
        let live = dir.path().join("db");
        {
            let store = MetaStore::open(&live).unwrap();
            store.create_volume("vol1", "alice").unwrap();
        }
        // Crash after moving the live store aside, before the new one landed
        fs::rename(&live, aside_path(&live)).unwrap();

        let store = MetaStore::open(&live).unwrap();
        assert!(store.get_volume("vol1").is_ok());
        assert!(!aside_path(&live).exists());
    }

    #[test]
    fn test_snapshot_info_insert_and_displace() {
        let dir = tempdir().unwrap();
        let store = MetaStore::open(dir.path().join("db")).unwrap();
        let mut record = SnapshotRecord {
            snapshot_id: keystone_common::SnapshotId::new(),
            volume: "vol1".into(),
            bucket: "buck1".into(),
            name: "s1".into(),
            created_at: 0,
            deleted_at: None,
            checkpoint_dir: "checkpoint-a".into(),
            state: SnapshotState::Active,
            snapshot_index: 5,
        };
        store.insert_snapshot_info(&record).unwrap();
        assert!(store.insert_snapshot_info(&record).is_err());

        record.state = SnapshotState::Deleted;
        store.update_snapshot_info(&record).unwrap();

        let mut replacement = record.clone();
        replacement.snapshot_id = keystone_common::SnapshotId::new();
        replacement.state = SnapshotState::Active;
        store.insert_snapshot_info(&replacement).unwrap();

        let deleted = store.deleted_snapshot_infos().unwrap();
        assert_eq!(deleted.len(), 1);
        assert_eq!(deleted[0].snapshot_id, record.snapshot_id);

        store.purge_snapshot_info(&deleted[0]).unwrap();
        assert!(store.deleted_snapshot_infos().unwrap().is_empty());
        // The replacement survives the purge of its predecessor
        let current = store.get_snapshot_info("vol1", "buck1", "s1").unwrap().unwrap();
        assert_eq!(current.snapshot_id, replacement.snapshot_id);
    }

    #[test]
    fn test_secret_rows() {
        let dir = tempdir().unwrap();
        let store = MetaStore::open(dir.path().join("db")).unwrap();
        let first = S3SecretValue::generate("alice");
        store.put_secret(&first).unwrap();
        assert_eq!(
            store.get_secret_by_access_key(&first.aws_access_key).unwrap(),
            Some(first.clone())
        );

        let second = S3SecretValue::generate("alice");
        store.put_secret(&second).unwrap();
        assert!(store
            .get_secret_by_access_key(&first.aws_access_key)
            .unwrap()
            .is_none());

        assert!(store.delete_secret("alice").unwrap());
        assert!(!store.delete_secret("alice").unwrap());
        assert!(store.get_secret("alice").unwrap().is_none());
    }
}
