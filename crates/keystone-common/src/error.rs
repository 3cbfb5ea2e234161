//! Error types for Keystone
//!
//! This module defines the common error types used throughout the
//! metadata service, including the snapshot subsystem's taxonomy.

use crate::types::{NameError, ObjectKeyError};
use thiserror::Error;

/// Common result type for Keystone operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for Keystone
#[derive(Debug, Error)]
pub enum Error {
    // Storage errors
    #[error("disk I/O error: {0}")]
    DiskIo(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(String),

    // Namespace errors
    #[error("volume not found: {0}")]
    VolumeNotFound(String),

    #[error("volume already exists: {0}")]
    VolumeAlreadyExists(String),

    #[error("bucket not found: {volume}/{bucket}")]
    BucketNotFound { volume: String, bucket: String },

    #[error("bucket already exists: {volume}/{bucket}")]
    BucketAlreadyExists { volume: String, bucket: String },

    #[error("key not found: {bucket}/{key}")]
    KeyNotFound { bucket: String, key: String },

    #[error("key already exists: {bucket}/{key}")]
    KeyAlreadyExists { bucket: String, key: String },

    #[error("invalid name: {0}")]
    InvalidName(#[from] NameError),

    #[error("invalid object key: {0}")]
    InvalidObjectKey(#[from] ObjectKeyError),

    // Snapshot errors
    #[error("snapshot not found: {volume}/{bucket}/{name}")]
    SnapshotNotFound {
        volume: String,
        bucket: String,
        name: String,
    },

    #[error("snapshot already exists: {volume}/{bucket}/{name}")]
    SnapshotAlreadyExists {
        volume: String,
        bucket: String,
        name: String,
    },

    // Checkpoint transfer errors
    #[error("checkpoint verification failed: advertised index {expected}, found {actual}")]
    VerificationFailure { expected: u64, actual: u64 },

    #[error("checkpoint digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("transport failure: {0}")]
    TransportFailure(String),

    #[error("checkpoint install failed, operator intervention required: {0}")]
    CorruptionFatal(String),

    #[error("catch-up failed after {attempts} attempts: {last_error}")]
    CatchUpFailed { attempts: u32, last_error: String },

    #[error("operation cancelled")]
    Cancelled,

    // Cluster errors
    #[error("not the leader (leader: {})", leader.as_deref().unwrap_or("unknown"))]
    NotLeader { leader: Option<String> },

    // Lock errors
    #[error("lock not held: {kind}/{id}")]
    LockNotHeld { kind: String, id: String },

    // Credential errors
    #[error("S3 secret not found: {0}")]
    SecretNotFound(String),

    // Request errors
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    // Internal errors
    #[error("internal error: {0}")]
    Internal(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::TransportFailure(msg.into())
    }

    /// Create a snapshot-not-found error
    pub fn snapshot_not_found(volume: &str, bucket: &str, name: &str) -> Self {
        Self::SnapshotNotFound {
            volume: volume.to_string(),
            bucket: bucket.to_string(),
            name: name.to_string(),
        }
    }

    /// Check if this error is retried by the checkpoint provider
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::VerificationFailure { .. } | Self::DigestMismatch { .. } | Self::TransportFailure(_)
        )
    }

    /// Check if this is a not found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::VolumeNotFound(_)
                | Self::BucketNotFound { .. }
                | Self::KeyNotFound { .. }
                | Self::SnapshotNotFound { .. }
                | Self::SecretNotFound(_)
        )
    }

    /// Check if this is an already-exists error
    #[must_use]
    pub fn is_already_exists(&self) -> bool {
        matches!(
            self,
            Self::VolumeAlreadyExists(_)
                | Self::BucketAlreadyExists { .. }
                | Self::KeyAlreadyExists { .. }
                | Self::SnapshotAlreadyExists { .. }
        )
    }

    /// Get HTTP status code for the service endpoints
    #[must_use]
    pub fn http_status_code(&self) -> u16 {
        match self {
            // 400 Bad Request
            Self::InvalidArgument(_) | Self::InvalidName(_) | Self::InvalidObjectKey(_) => 400,

            // 404 Not Found
            Self::VolumeNotFound(_)
            | Self::BucketNotFound { .. }
            | Self::KeyNotFound { .. }
            | Self::SnapshotNotFound { .. }
            | Self::SecretNotFound(_) => 404,

            // 409 Conflict
            Self::VolumeAlreadyExists(_)
            | Self::BucketAlreadyExists { .. }
            | Self::KeyAlreadyExists { .. }
            | Self::SnapshotAlreadyExists { .. } => 409,

            // 421 Misdirected Request
            Self::NotLeader { .. } => 421,

            // 499 Client Closed Request
            Self::Cancelled => 499,

            // 500 Internal Server Error
            Self::Internal(_)
            | Self::DiskIo(_)
            | Self::Storage(_)
            | Self::Serialization(_)
            | Self::LockNotHeld { .. }
            | Self::CorruptionFatal(_)
            | Self::Configuration(_) => 500,

            // 502 Bad Gateway
            Self::VerificationFailure { .. }
            | Self::DigestMismatch { .. }
            | Self::TransportFailure(_)
            | Self::CatchUpFailed { .. } => 502,
        }
    }
}
