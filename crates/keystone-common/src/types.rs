//! Core type definitions for Keystone
//!
//! This module defines the identifiers and validated names used
//! throughout the metadata service, plus the bucket layout model.

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Position in the replicated log
pub type LogIndex = u64;

/// Separator between path components in keys and table rows
pub const KEY_DELIMITER: char = '/';

/// Globally unique snapshot identifier, never reused
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, From, Into)]
pub struct SnapshotId(Uuid);

impl SnapshotId {
    /// Generate a new random snapshot ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse from the hyphenated string form
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Uuid::parse_str(s).map(Self)
    }
}

impl Default for SnapshotId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SnapshotId({})", self.0)
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a metadata-service replica
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Volume name (validated)
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct VolumeName(String);

impl VolumeName {
    /// Create a new volume name
    pub fn new(name: impl Into<String>) -> Result<Self, NameError> {
        let name = name.into();
        validate_resource_name(&name)?;
        Ok(Self(name))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for VolumeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VolumeName({:?})", self.0)
    }
}

/// Bucket name (validated)
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct BucketName(String);

impl BucketName {
    /// Create a new bucket name
    pub fn new(name: impl Into<String>) -> Result<Self, NameError> {
        let name = name.into();
        validate_resource_name(&name)?;
        Ok(Self(name))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for BucketName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BucketName({:?})", self.0)
    }
}

/// Validate a volume, bucket or snapshot name.
///
/// Same rules as S3 bucket names: 3-63 characters of lowercase letters,
/// digits, hyphens and periods, starting and ending alphanumeric.
pub fn validate_resource_name(name: &str) -> Result<(), NameError> {
    if name.len() < 3 {
        return Err(NameError::TooShort);
    }
    if name.len() > 63 {
        return Err(NameError::TooLong);
    }

    let is_alnum = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit();
    if !name.starts_with(is_alnum) {
        return Err(NameError::InvalidStartChar);
    }
    if !name.ends_with(is_alnum) {
        return Err(NameError::InvalidEndChar);
    }

    if let Some(c) = name.chars().find(|&c| !is_alnum(c) && c != '-' && c != '.') {
        return Err(NameError::InvalidChar(c));
    }

    if name.contains("..") {
        return Err(NameError::ConsecutivePeriods);
    }

    if name.parse::<std::net::Ipv4Addr>().is_ok() {
        return Err(NameError::LooksLikeIpAddress);
    }

    Ok(())
}

/// Errors that can occur when validating a resource name
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NameError {
    #[error("name must be at least 3 characters")]
    TooShort,
    #[error("name must be at most 63 characters")]
    TooLong,
    #[error("name must start with a lowercase letter or number")]
    InvalidStartChar,
    #[error("name must end with a lowercase letter or number")]
    InvalidEndChar,
    #[error("name contains invalid character: {0}")]
    InvalidChar(char),
    #[error("name cannot contain consecutive periods")]
    ConsecutivePeriods,
    #[error("name cannot be formatted as an IP address")]
    LooksLikeIpAddress,
}

/// Check the length bounds of an object key; layouts decide the rest
pub fn validate_object_key(key: &str) -> Result<(), ObjectKeyError> {
    if key.is_empty() {
        return Err(ObjectKeyError::Empty);
    }
    if key.len() > 1024 {
        return Err(ObjectKeyError::TooLong);
    }
    Ok(())
}

/// Errors that can occur when validating an object key
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ObjectKeyError {
    #[error("object key cannot be empty")]
    Empty,
    #[error("object key cannot exceed 1024 bytes")]
    TooLong,
    #[error("object key has invalid path component: {0:?}")]
    InvalidComponent(String),
}

/// Internal strategy a bucket uses to represent hierarchical names
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BucketLayout {
    /// Flat key-path rows, keys taken literally
    #[default]
    ObjectStore,
    /// Flat key-path rows with filesystem-style path normalization
    Legacy,
    /// Directory tree: one row per directory, files hang off a parent id
    FileSystemOptimized,
}

impl BucketLayout {
    /// Whether the layout stores a directory tree instead of flat paths
    #[must_use]
    pub const fn is_tree(&self) -> bool {
        matches!(self, Self::FileSystemOptimized)
    }

    /// Whether key paths are normalized before being stored
    #[must_use]
    pub const fn normalizes_paths(&self) -> bool {
        matches!(self, Self::Legacy | Self::FileSystemOptimized)
    }
}

/// Produce the key path a bucket with `layout` stores for `key`.
///
/// Filesystem-style layouts strip leading/trailing and duplicate
/// delimiters and reject `.` / `..` components. The object-store layout
/// keeps the key byte-for-byte.
pub fn normalize_key_path(layout: BucketLayout, key: &str) -> Result<String, ObjectKeyError> {
    validate_object_key(key)?;
    if !layout.normalizes_paths() {
        return Ok(key.to_string());
    }

    let mut parts = Vec::new();
    for component in key.split(KEY_DELIMITER).filter(|c| !c.is_empty()) {
        if component == "." || component == ".." {
            return Err(ObjectKeyError::InvalidComponent(component.to_string()));
        }
        parts.push(component);
    }
    if parts.is_empty() {
        return Err(ObjectKeyError::Empty);
    }
    Ok(parts.join("/"))
}
