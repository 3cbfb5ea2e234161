//! S3 credential management.
//!
//! `StoreSecretManager` keeps one secret per principal in the metadata
//! store. `LockedSecretManager` wraps any manager and takes the
//! principal's lock around every call.

use crate::lock::{LockManager, ResourceKind};
use crate::store::MetaStore;
use crate::types::S3SecretValue;
use keystone_common::{Error, Result};
use std::sync::Arc;
use tracing::{debug, info};

/// Access to per-principal S3 secrets
pub trait S3SecretManager: Send + Sync {
    /// Secret of `principal`, generated and stored on first use
    fn get_secret(&self, principal: &str) -> Result<S3SecretValue>;

    /// Secret key belonging to an access key id
    fn get_secret_string(&self, access_key: &str) -> Result<String>;

    fn store_secret(&self, principal: &str, value: &S3SecretValue) -> Result<()>;

    fn revoke_secret(&self, principal: &str) -> Result<()>;

    /// Run `action` under the lock for `lock_id`
    fn do_under_lock<T>(&self, lock_id: &str, action: impl FnOnce() -> Result<T>) -> Result<T>
    where
        Self: Sized;
}

/// Secrets persisted in the metadata store, without locking
pub struct StoreSecretManager {
    store: Arc<MetaStore>,
}

impl StoreSecretManager {
    pub fn new(store: Arc<MetaStore>) -> Self {
        Self { store }
    }
}

impl S3SecretManager for StoreSecretManager {
    fn get_secret(&self, principal: &str) -> Result<S3SecretValue> {
        if let Some(existing) = self.store.get_secret(principal)? {
            return Ok(existing);
        }
        let value = S3SecretValue::generate(principal);
        self.store.put_secret(&value)?;
        info!("Generated S3 secret for {}", principal);
        Ok(value)
    }

    fn get_secret_string(&self, access_key: &str) -> Result<String> {
        self.store
            .get_secret_by_access_key(access_key)?
            .map(|v| v.aws_secret)
            .ok_or_else(|| Error::SecretNotFound(access_key.to_string()))
    }

    fn store_secret(&self, principal: &str, value: &S3SecretValue) -> Result<()> {
        if value.principal != principal {
            return Err(Error::invalid_argument(format!(
                "secret belongs to '{}', not '{principal}'",
                value.principal
            )));
        }
        self.store.put_secret(value)?;
        debug!("Stored S3 secret for {}", principal);
        Ok(())
    }

    fn revoke_secret(&self, principal: &str) -> Result<()> {
        if self.store.delete_secret(principal)? {
            info!("Revoked S3 secret for {}", principal);
            Ok(())
        } else {
            Err(Error::SecretNotFound(principal.to_string()))
        }
    }

    fn do_under_lock<T>(&self, _lock_id: &str, action: impl FnOnce() -> Result<T>) -> Result<T> {
        action()
    }
}

/// Adds per-principal locking to another secret manager
pub struct LockedSecretManager<M> {
    inner: M,
    locks: Arc<LockManager>,
}

impl<M: S3SecretManager> LockedSecretManager<M> {
    pub fn new(inner: M, locks: Arc<LockManager>) -> Self {
        Self { inner, locks }
    }
}

impl<M: S3SecretManager> S3SecretManager for LockedSecretManager<M> {
    fn get_secret(&self, principal: &str) -> Result<S3SecretValue> {
        self.locks
            .with_write_lock(ResourceKind::S3Secret, principal, || {
                self.inner.get_secret(principal)
            })
    }

    fn get_secret_string(&self, access_key: &str) -> Result<String> {
        self.locks
            .with_read_lock(ResourceKind::S3Secret, access_key, || {
                self.inner.get_secret_string(access_key)
            })
    }

    fn store_secret(&self, principal: &str, value: &S3SecretValue) -> Result<()> {
        self.locks
            .with_write_lock(ResourceKind::S3Secret, principal, || {
                self.inner.store_secret(principal, value)
            })
    }

    fn revoke_secret(&self, principal: &str) -> Result<()> {
        self.locks
            .with_write_lock(ResourceKind::S3Secret, principal, || {
                self.inner.revoke_secret(principal)
            })
    }

    fn do_under_lock<T>(&self, lock_id: &str, action: impl FnOnce() -> Result<T>) -> Result<T> {
        self.locks
            .with_write_lock(ResourceKind::S3Secret, lock_id, || {
                self.inner.do_under_lock(lock_id, action)
            })
    }
}
