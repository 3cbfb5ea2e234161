//! Replicated-log interface consumed by the snapshot subsystem.
//!
//! Consensus itself (election, log shipping) lives outside this crate;
//! the snapshot code only needs the committed index, the leader identity
//! and the peer list.

use crate::store::MetaStore;
use keystone_common::{LogIndex, PeerId, Result};
use std::sync::Arc;

/// View of the replicated log from one replica
pub trait ReplicatedLog: Send + Sync {
    /// Index agreed on by a quorum of peers
    fn committed_index(&self) -> Result<LogIndex>;

    fn is_leader(&self) -> bool;

    /// Current leader, if known
    fn leader_id(&self) -> Option<PeerId>;

    fn peers(&self) -> Vec<PeerId>;

    /// Called after a checkpoint at `index` replaced the local store, so
    /// log application resumes from there.
    fn on_checkpoint_installed(&self, _index: LogIndex) {}
}

/// Single-node log: this node leads and its applied index is committed.
pub struct LocalLog {
    id: PeerId,
    store: Arc<MetaStore>,
}

impl LocalLog {
    pub fn new(id: impl Into<PeerId>, store: Arc<MetaStore>) -> Self {
        Self {
            id: id.into(),
            store,
        }
    }
}

impl ReplicatedLog for LocalLog {
    fn committed_index(&self) -> Result<LogIndex> {
        Ok(self.store.applied_index()?)
    }

    fn is_leader(&self) -> bool {
        true
    }

    fn leader_id(&self) -> Option<PeerId> {
        Some(self.id.clone())
    }

    fn peers(&self) -> Vec<PeerId> {
        vec![self.id.clone()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_local_log_tracks_store() {
        let dir = tempdir().unwrap();
        let store = Arc::new(MetaStore::open(dir.path().join("db")).unwrap());
        let log = LocalLog::new("meta1", Arc::clone(&store));

        assert_eq!(log.committed_index().unwrap(), 0);
        store.create_volume("vol1", "alice").unwrap();
        assert_eq!(log.committed_index().unwrap(), 1);
        assert!(log.is_leader());
        assert_eq!(log.leader_id(), Some(PeerId::new("meta1")));
        assert_eq!(log.peers().len(), 1);
    }
}
