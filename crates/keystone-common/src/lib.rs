//! Keystone Common - Shared types and utilities
//!
//! This crate provides the error taxonomy, validated identifiers,
//! configuration structures and checksum helpers used across all
//! Keystone metadata components.

pub mod checksum;
pub mod config;
pub mod error;
pub mod types;

pub use checksum::{DigestCalculator, PackageDigest};
pub use config::MetaConfig;
pub use error::{Error, Result};
pub use types::*;
