//! Background reclamation of deleted snapshots.
//!
//! Second phase of snapshot deletion: DELETED records (and records
//! displaced by re-creating a name) have their checkpoint directories
//! removed once no reader holds a view, then the record is purged.

use crate::lock::ResourceKind;
use crate::snapshot::SnapshotManager;
use keystone_common::Result;
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Outcome of one sweep
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReclaimReport {
    pub reclaimed: usize,
    /// Records left for a later sweep (view in use or removal failed)
    pub deferred: usize,
}

pub struct SnapshotReclaimer {
    snapshots: Arc<SnapshotManager>,
}

impl SnapshotReclaimer {
    pub fn new(snapshots: Arc<SnapshotManager>) -> Self {
        Self { snapshots }
    }

    /// Reclaim every DELETED snapshot that no reader is using.
    ///
    /// Purging a record is a replicated mutation, so only the leader
    /// sweeps.
    pub fn sweep(&self) -> Result<ReclaimReport> {
        let mut report = ReclaimReport::default();
        if !self.snapshots.is_leader() {
            return Ok(report);
        }

        let store = self.snapshots.store();
        for record in store.deleted_snapshot_infos()? {
            let reclaimed = self.snapshots.locks().with_write_lock(
                ResourceKind::Snapshot,
                &record.key(),
                || -> Result<bool> {
                    if !self.snapshots.release_view(&record.snapshot_id) {
                        debug!("Snapshot {} still has open views", record.snapshot_id);
                        return Ok(false);
                    }
                    let path = self.snapshots.checkpoint_path(&record);
                    if path.exists()
                        && let Err(e) = fs::remove_dir_all(&path)
                    {
                        warn!("Failed to remove checkpoint {:?}: {}", path, e);
                        return Ok(false);
                    }
                    store.purge_snapshot_info(&record)?;
                    Ok(true)
                },
            )?;
            if reclaimed {
                debug!("Reclaimed snapshot {} ({})", record.key(), record.snapshot_id);
                report.reclaimed += 1;
            } else {
                report.deferred += 1;
            }
        }
        Ok(report)
    }

    /// Sweep every `interval` until `shutdown` flips
    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let this = Arc::clone(&self);
                    match tokio::task::spawn_blocking(move || this.sweep()).await {
                        Ok(Ok(report)) if report.reclaimed > 0 || report.deferred > 0 => {
                            info!(
                                "Snapshot reclaim: {} reclaimed, {} deferred",
                                report.reclaimed, report.deferred
                            );
                        }
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => error!("Snapshot reclaim failed: {}", e),
                        Err(e) => error!("Snapshot reclaim task panicked: {}", e),
                    }
                }
                _ = shutdown.changed() => {
                    debug!("Snapshot reclaimer stopping");
                    break;
                }
            }
        }
    }
}
