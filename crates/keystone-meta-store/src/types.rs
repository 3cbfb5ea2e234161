//! Stored types for metadata persistence.
//!
//! These types are serialized to redb via bincode.

use keystone_common::{BucketLayout, LogIndex, SnapshotId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub(crate) fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Row key for a volume/bucket pair: "/vol/bucket"
#[must_use]
pub fn bucket_table_key(volume: &str, bucket: &str) -> String {
    format!("/{volume}/{bucket}")
}

// ---- Namespace types ----

/// Stored volume metadata
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeInfo {
    pub name: String,
    pub owner: String,
    pub created_at: u64,
}

/// Stored bucket metadata
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketInfo {
    pub volume: String,
    pub name: String,
    pub layout: BucketLayout,
    /// Root directory id for tree layouts; unique across the store
    pub object_id: u64,
    pub created_at: u64,
}

/// Stored key (file) metadata
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyInfo {
    /// Full path of the key within its bucket, as stored under the bucket's layout
    pub key_name: String,
    pub data_size: u64,
    /// Reference to the object's data blocks (opaque to the metadata tier)
    pub content_ref: String,
    pub created_at: u64,
    pub modified_at: u64,
    pub metadata: HashMap<String, String>,
}

impl KeyInfo {
    /// New key metadata pointing at `content_ref`
    pub fn new(key_name: impl Into<String>, content_ref: impl Into<String>, data_size: u64) -> Self {
        let now = now_secs();
        Self {
            key_name: key_name.into(),
            data_size,
            content_ref: content_ref.into(),
            created_at: now,
            modified_at: now,
            metadata: HashMap::new(),
        }
    }
}

/// Stored directory row (tree layout only)
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryInfo {
    pub name: String,
    pub object_id: u64,
    pub parent_id: u64,
    pub created_at: u64,
}

// ---- Snapshot types ----

/// Snapshot lifecycle state; only ever moves Active -> Deleted
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotState {
    #[default]
    Active,
    Deleted,
}

/// Stored snapshot record
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub snapshot_id: SnapshotId,
    pub volume: String,
    pub bucket: String,
    pub name: String,
    pub created_at: u64,
    pub deleted_at: Option<u64>,
    /// Checkpoint directory name, derived from `snapshot_id`
    pub checkpoint_dir: String,
    pub state: SnapshotState,
    /// Log index the checkpoint corresponds to
    pub snapshot_index: LogIndex,
}

impl SnapshotRecord {
    /// Row key: "/vol/bucket/name"
    #[must_use]
    pub fn table_key(volume: &str, bucket: &str, name: &str) -> String {
        format!("/{volume}/{bucket}/{name}")
    }

    #[must_use]
    pub fn key(&self) -> String {
        Self::table_key(&self.volume, &self.bucket, &self.name)
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state == SnapshotState::Active
    }
}

// ---- Credential types ----

/// Stored S3 secret for a principal
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct S3SecretValue {
    pub principal: String,
    pub aws_access_key: String,
    pub aws_secret: String,
    pub created_at: u64,
}

impl S3SecretValue {
    /// Generate a fresh secret for `principal`
    pub fn generate(principal: impl Into<String>) -> Self {
        Self {
            principal: principal.into(),
            aws_access_key: generate_access_key_id(),
            aws_secret: generate_secret_key(),
            created_at: now_secs(),
        }
    }
}

/// Generate an access key ID (20 uppercase alphanumeric characters starting with AKIA)
fn generate_access_key_id() -> String {
    use rand::Rng;
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let mut rng = rand::thread_rng();

    let random_part: String = (0..16)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect();

    format!("AKIA{random_part}")
}

/// Generate a secret access key (40 base64-alphabet characters)
fn generate_secret_key() -> String {
    use rand::Rng;
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
    let mut rng = rand::thread_rng();

    (0..40)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect()
}
