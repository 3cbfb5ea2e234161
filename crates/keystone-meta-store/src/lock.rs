//! Keyed read/write lock manager.
//!
//! Serializes mutations of one logical resource (a bucket, a snapshot, a
//! principal's S3 secret, ...) without blocking unrelated resources. A
//! single `LockManager` is shared by every subsystem in the process.
//!
//! Locks are not reentrant: a caller must never acquire the write lock
//! of a key it already holds on the same call path.

use keystone_common::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{error, trace};

/// Kind of resource a lock protects
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    Volume,
    Bucket,
    Key,
    Snapshot,
    S3Secret,
    User,
    Prefix,
}

impl ResourceKind {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Volume => "VOLUME",
            Self::Bucket => "BUCKET",
            Self::Key => "KEY",
            Self::Snapshot => "SNAPSHOT",
            Self::S3Secret => "S3_SECRET",
            Self::User => "USER",
            Self::Prefix => "PREFIX",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Unit of mutual exclusion
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct LockKey {
    pub kind: ResourceKind,
    pub id: String,
}

impl LockKey {
    pub fn new(kind: ResourceKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    fn not_held(&self) -> Error {
        Error::LockNotHeld {
            kind: self.kind.name().to_string(),
            id: self.id.clone(),
        }
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}

#[derive(Default)]
struct SlotState {
    readers: usize,
    writer: bool,
}

#[derive(Default)]
struct Slot {
    state: Mutex<SlotState>,
    changed: Condvar,
}

struct Entry {
    slot: Arc<Slot>,
    /// Holders plus waiters; the entry is dropped when this reaches zero
    refs: usize,
}

/// Process-wide keyed lock manager
#[derive(Default)]
pub struct LockManager {
    entries: Mutex<HashMap<LockKey, Entry>>,
}

impl LockManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until a shared lock on `(kind, id)` is held
    pub fn acquire_read(&self, kind: ResourceKind, id: &str) {
        self.lock_read(&LockKey::new(kind, id));
    }

    /// Release a shared lock taken with [`acquire_read`](Self::acquire_read)
    pub fn release_read(&self, kind: ResourceKind, id: &str) -> Result<()> {
        self.unlock(&LockKey::new(kind, id), false)
    }

    /// Block until the exclusive lock on `(kind, id)` is held
    pub fn acquire_write(&self, kind: ResourceKind, id: &str) {
        self.lock_write(&LockKey::new(kind, id));
    }

    /// Release an exclusive lock taken with [`acquire_write`](Self::acquire_write)
    pub fn release_write(&self, kind: ResourceKind, id: &str) -> Result<()> {
        self.unlock(&LockKey::new(kind, id), true)
    }

    /// Scoped shared lock, released when the guard drops
    pub fn read(&self, kind: ResourceKind, id: &str) -> ReadGuard<'_> {
        let key = LockKey::new(kind, id);
        self.lock_read(&key);
        ReadGuard { manager: self, key }
    }

    /// Scoped exclusive lock, released when the guard drops
    pub fn write(&self, kind: ResourceKind, id: &str) -> WriteGuard<'_> {
        let key = LockKey::new(kind, id);
        self.lock_write(&key);
        WriteGuard { manager: self, key }
    }

    /// Run `action` while holding the shared lock on `(kind, id)`
    pub fn with_read_lock<T>(&self, kind: ResourceKind, id: &str, action: impl FnOnce() -> T) -> T {
        let _guard = self.read(kind, id);
        action()
    }

    /// Run `action` while holding the exclusive lock on `(kind, id)`
    pub fn with_write_lock<T>(
        &self,
        kind: ResourceKind,
        id: &str,
        action: impl FnOnce() -> T,
    ) -> T {
        let _guard = self.write(kind, id);
        action()
    }

    /// Number of keys currently held or waited on
    #[must_use]
    pub fn held_keys(&self) -> usize {
        self.entries.lock().len()
    }

    fn pin(&self, key: &LockKey) -> Arc<Slot> {
        let mut entries = self.entries.lock();
        let entry = entries.entry(key.clone()).or_insert_with(|| Entry {
            slot: Arc::new(Slot::default()),
            refs: 0,
        });
        entry.refs += 1;
        Arc::clone(&entry.slot)
    }

    fn lock_read(&self, key: &LockKey) {
        let slot = self.pin(key);
        let mut state = slot.state.lock();
        while state.writer {
            trace!("waiting for read lock on {}", key);
            slot.changed.wait(&mut state);
        }
        state.readers += 1;
    }

    fn lock_write(&self, key: &LockKey) {
        let slot = self.pin(key);
        let mut state = slot.state.lock();
        while state.writer || state.readers > 0 {
            trace!("waiting for write lock on {}", key);
            slot.changed.wait(&mut state);
        }
        state.writer = true;
    }

    fn unlock(&self, key: &LockKey, exclusive: bool) -> Result<()> {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(key) else {
            error!("release of {} lock on {} that is not held", mode(exclusive), key);
            return Err(key.not_held());
        };

        {
            let mut state = entry.slot.state.lock();
            if exclusive {
                if !state.writer {
                    error!("release of write lock on {} that is not held", key);
                    return Err(key.not_held());
                }
                state.writer = false;
            } else {
                if state.readers == 0 {
                    error!("release of read lock on {} that is not held", key);
                    return Err(key.not_held());
                }
                state.readers -= 1;
            }
        }
        entry.slot.changed.notify_all();

        entry.refs -= 1;
        if entry.refs == 0 {
            entries.remove(key);
        }
        Ok(())
    }
}

const fn mode(exclusive: bool) -> &'static str {
    if exclusive { "write" } else { "read" }
}

/// Shared lock held until dropped
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct ReadGuard<'a> {
    manager: &'a LockManager,
    key: LockKey,
}

impl ReadGuard<'_> {
    #[must_use]
    pub fn key(&self) -> &LockKey {
        &self.key
    }
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.manager.unlock(&self.key, false) {
            error!("Failed to release read lock {}: {}", self.key, e);
        }
    }
}

/// Exclusive lock held until dropped
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct WriteGuard<'a> {
    manager: &'a LockManager,
    key: LockKey,
}

impl WriteGuard<'_> {
    #[must_use]
    pub fn key(&self) -> &LockKey {
        &self.key
    }
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.manager.unlock(&self.key, true) {
            error!("Failed to release write lock {}: {}", self.key, e);
        }
    }
}
