//! Leader side of checkpoint transfer.
//!
//! The leader packages a full checkpoint of its store at the index it has
//! applied when the request is served, tags it with that index and a
//! digest, and keeps it around so that repeated requests against an
//! unchanged index get the very same bytes.

use crate::raft::ReplicatedLog;
use crate::store::{CheckpointScope, DB_FILE_NAME, MetaStore};
use keystone_common::{Error, LogIndex, PackageDigest, Result};
use parking_lot::Mutex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Staging directory of a served package; removed once nothing refers to it
#[derive(Debug)]
struct PackageDir(PathBuf);

impl Drop for PackageDir {
    fn drop(&mut self) {
        if self.0.exists()
            && let Err(e) = fs::remove_dir_all(&self.0)
        {
            warn!("Failed to remove checkpoint package {:?}: {}", self.0, e);
        }
    }
}

/// A packaged checkpoint ready to stream to a follower
#[derive(Clone, Debug)]
pub struct CheckpointPackage {
    /// Applied index captured by the checkpoint
    pub index: LogIndex,
    pub digest: PackageDigest,
    /// Database file holding the package bytes
    pub path: PathBuf,
    _dir: Arc<PackageDir>,
}

/// Serves the leader's current state as a checkpoint package
pub struct CheckpointSource {
    store: Arc<MetaStore>,
    log: Arc<dyn ReplicatedLog>,
    staging_root: PathBuf,
    current: Mutex<Option<CheckpointPackage>>,
}

impl CheckpointSource {
    pub fn new(
        store: Arc<MetaStore>,
        log: Arc<dyn ReplicatedLog>,
        staging_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            log,
            staging_root: staging_root.into(),
            current: Mutex::new(None),
        }
    }

    /// Package the store at its current index. Leader only.
    ///
    /// Blocks on disk I/O; call from a blocking context.
    pub fn serve(&self) -> Result<CheckpointPackage> {
        if !self.log.is_leader() {
            return Err(Error::NotLeader {
                leader: self.log.leader_id().map(|p| p.to_string()),
            });
        }

        let mut current = self.current.lock();
        let index = self.store.applied_index()?;
        if let Some(package) = current.as_ref()
            && package.index == index
            && package.path.is_file()
        {
            debug!("Reusing checkpoint package at index {}", index);
            return Ok(package.clone());
        }

        let dir = self.staging_root.join(format!("serve-{}", Uuid::new_v4()));
        let package_dir = Arc::new(PackageDir(dir.clone()));
        let checkpoint = self.store.take_checkpoint(&CheckpointScope::Full, &dir)?;
        let package = package_from(&checkpoint.dir, checkpoint.index, package_dir)?;

        info!(
            "Packaged checkpoint at index {} ({})",
            package.index, package.digest
        );
        *current = Some(package.clone());
        Ok(package)
    }
}

/// Remove everything under a staging root left by a previous run.
/// Returns the number of entries removed.
pub fn clear_staging(root: &Path) -> Result<usize> {
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    let mut removed = 0;
    for entry in entries {
        let path = entry?.path();
        if path.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
        removed += 1;
    }
    if removed > 0 {
        info!("Removed {} stale staging entries under {:?}", removed, root);
    }
    Ok(removed)
}

fn package_from(
    dir: &Path,
    index: LogIndex,
    package_dir: Arc<PackageDir>,
) -> Result<CheckpointPackage> {
    let path = dir.join(DB_FILE_NAME);
    let digest = PackageDigest::compute_file(&path)?;
    Ok(CheckpointPackage {
        index,
        digest,
        path,
        _dir: package_dir,
    })
}
