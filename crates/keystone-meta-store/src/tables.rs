//! Redb table definitions for persistent metadata storage.

use redb::TableDefinition;

// Namespace
// Key: volume name
pub const VOLUMES: TableDefinition<&str, &[u8]> = TableDefinition::new("volumes");
// Key: "/vol/bucket"
pub const BUCKETS: TableDefinition<&str, &[u8]> = TableDefinition::new("buckets");
// Flat layouts. Key: "/vol/bucket/key/path"
pub const KEYS: TableDefinition<&str, &[u8]> = TableDefinition::new("keys");
// Tree layout. Key: "bucket_id/parent_id/name"
pub const DIRECTORIES: TableDefinition<&str, &[u8]> = TableDefinition::new("directories");
pub const FILES: TableDefinition<&str, &[u8]> = TableDefinition::new("files");

// Snapshots
// Key: "/vol/bucket/snapshot_name"
pub const SNAPSHOT_INFO: TableDefinition<&str, &[u8]> = TableDefinition::new("snapshot_info");
// Records displaced by re-creating a deleted name. Key: snapshot id
pub const SNAPSHOT_PURGE: TableDefinition<&str, &[u8]> = TableDefinition::new("snapshot_purge");

// Credentials
// Key: principal
pub const S3_SECRETS: TableDefinition<&str, &[u8]> = TableDefinition::new("s3_secrets");
// Key: access key id, Value: principal
pub const S3_ACCESS_KEYS: TableDefinition<&str, &str> = TableDefinition::new("s3_access_keys");

// Store bookkeeping
pub const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

pub const APPLIED_INDEX: &str = "applied_index";
pub const NEXT_OBJECT_ID: &str = "next_object_id";

/// Every byte-valued table, in the order checkpoints and digests visit them
pub const BYTE_TABLES: [TableDefinition<&str, &[u8]>; 8] = [
    VOLUMES,
    BUCKETS,
    KEYS,
    DIRECTORIES,
    FILES,
    SNAPSHOT_INFO,
    SNAPSHOT_PURGE,
    S3_SECRETS,
];
