//! Keystone Metadata Store - replicated namespace and snapshot subsystem
//!
//! This crate implements the metadata store (redb), the keyed lock
//! manager, snapshot lifecycle and reclamation, checkpoint transfer for
//! lagging replicas, restore from snapshot views and S3 credentials.

pub mod checkpoint;
pub mod lock;
pub mod provider;
pub mod raft;
pub mod reclaim;
pub mod restore;
pub mod secret;
pub mod snapshot;
pub mod store;
pub mod tables;
pub mod types;

// Re-exports
pub use checkpoint::{CheckpointPackage, CheckpointSource, clear_staging};
pub use lock::{LockManager, ResourceKind};
pub use provider::{
    CheckpointTransport, InProcessTransport, PackageHeader, ProviderState, SnapshotProvider,
};
pub use raft::{LocalLog, ReplicatedLog};
pub use reclaim::{ReclaimReport, SnapshotReclaimer};
pub use restore::{RestoreService, SnapshotEntry, SnapshotView};
pub use secret::{LockedSecretManager, S3SecretManager, StoreSecretManager};
pub use snapshot::{SnapshotManager, checkpoint_dir_name, snapshot_key_prefix};
pub use store::{Checkpoint, CheckpointScope, MetaStore, MetaStoreError};
pub use types::{KeyInfo, S3SecretValue, SnapshotRecord, SnapshotState};
