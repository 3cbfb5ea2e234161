//! Snapshot provider: lagging-replica catch-up.
//!
//! A follower whose applied index trails the committed index by more than
//! the configured threshold downloads the leader's checkpoint, verifies
//! its digest and the index persisted inside it against what the leader
//! advertised, and swaps it in place of its local store. Verification and
//! transport failures are retried with exponential backoff up to
//! `max_attempts`; a failed install after successful verification is a
//! local storage problem and is not retried.

use crate::checkpoint::CheckpointSource;
use crate::raft::ReplicatedLog;
use crate::store::{DB_FILE_NAME, MetaStore};
use async_trait::async_trait;
use keystone_common::config::ProviderConfig;
use keystone_common::{Error, LogIndex, PackageDigest, PeerId, Result};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Catch-up state of this replica
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProviderState {
    Synced,
    CatchingUp { attempt: u32 },
    /// Retries exhausted or install failed; needs an operator
    Failed { reason: String },
}

/// What the leader advertised alongside a package
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PackageHeader {
    pub index: LogIndex,
    pub digest: PackageDigest,
}

/// Fetches a checkpoint package from a peer
#[async_trait]
pub trait CheckpointTransport: Send + Sync {
    /// Download `leader`'s current checkpoint into `dest_dir/meta.redb`
    async fn fetch_checkpoint(&self, leader: &PeerId, dest_dir: &Path) -> Result<PackageHeader>;
}

fn check_cancel(cancel: &watch::Receiver<bool>) -> Result<()> {
    if *cancel.borrow() {
        Err(Error::Cancelled)
    } else {
        Ok(())
    }
}

pub struct SnapshotProvider {
    store: Arc<MetaStore>,
    log: Arc<dyn ReplicatedLog>,
    transport: Arc<dyn CheckpointTransport>,
    config: ProviderConfig,
    staging_root: PathBuf,
    state: Mutex<ProviderState>,
}

impl SnapshotProvider {
    pub fn new(
        store: Arc<MetaStore>,
        log: Arc<dyn ReplicatedLog>,
        transport: Arc<dyn CheckpointTransport>,
        config: ProviderConfig,
        staging_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            log,
            transport,
            config,
            staging_root: staging_root.into(),
            state: Mutex::new(ProviderState::Synced),
        }
    }

    #[must_use]
    pub fn state(&self) -> ProviderState {
        self.state.lock().clone()
    }

    fn set_state(&self, state: ProviderState) {
        let mut current = self.state.lock();
        if *current != state {
            debug!("Provider state {:?} -> {:?}", *current, state);
            *current = state;
        }
    }

    fn lag(&self) -> Result<u64> {
        let committed = self.log.committed_index()?;
        let applied = self.store.applied_index()?;
        Ok(committed.saturating_sub(applied))
    }

    /// Check the lag and catch up if it exceeds the threshold
    pub async fn tick(&self, cancel: &watch::Receiver<bool>) -> Result<ProviderState> {
        if self.log.is_leader() || self.lag()? <= self.config.lag_threshold {
            self.set_state(ProviderState::Synced);
            return Ok(self.state());
        }
        match self.catch_up(cancel).await {
            Ok(_) => Ok(self.state()),
            Err(Error::Cancelled) => {
                // Re-evaluated on the next tick
                if self.lag()? <= self.config.lag_threshold {
                    self.set_state(ProviderState::Synced);
                }
                Err(Error::Cancelled)
            }
            Err(e) => Err(e),
        }
    }

    /// Replace the local store with the leader's checkpoint. Returns the
    /// installed index.
    pub async fn catch_up(&self, cancel: &watch::Receiver<bool>) -> Result<LogIndex> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            self.set_state(ProviderState::CatchingUp { attempt });
            check_cancel(cancel)?;

            match self.attempt(cancel).await {
                Ok(index) => {
                    self.set_state(ProviderState::Synced);
                    info!("Installed leader checkpoint at index {}", index);
                    return Ok(index);
                }
                Err(e) if e.is_retryable() => {
                    warn!(
                        "Checkpoint catch-up attempt {}/{} failed: {}",
                        attempt, max_attempts, e
                    );
                    last_error = e.to_string();
                    if attempt < max_attempts {
                        self.backoff(attempt, cancel).await?;
                    }
                }
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    error!("Checkpoint catch-up failed: {}", e);
                    self.set_state(ProviderState::Failed {
                        reason: e.to_string(),
                    });
                    return Err(e);
                }
            }
        }

        error!(
            "Checkpoint catch-up gave up after {} attempts, operator intervention required: {}",
            max_attempts, last_error
        );
        self.set_state(ProviderState::Failed {
            reason: last_error.clone(),
        });
        Err(Error::CatchUpFailed {
            attempts: max_attempts,
            last_error,
        })
    }

    async fn backoff(&self, attempt: u32, cancel: &watch::Receiver<bool>) -> Result<()> {
        let mut cancel = cancel.clone();
        tokio::select! {
            () = tokio::time::sleep(self.config.backoff(attempt)) => {}
            Ok(()) = cancel.changed() => {}
        }
        check_cancel(&cancel)
    }

    async fn attempt(&self, cancel: &watch::Receiver<bool>) -> Result<LogIndex> {
        let leader = self
            .log
            .leader_id()
            .ok_or_else(|| Error::transport("no leader known"))?;

        let staging = self
            .staging_root
            .join(format!("download-{}", Uuid::new_v4()));
        tokio::fs::create_dir_all(&staging).await?;

        let result = self.fetch_verify_install(&leader, &staging, cancel).await;
        // Consumed by a successful install; anything left is a failed attempt
        if tokio::fs::try_exists(&staging).await.unwrap_or(false)
            && let Err(e) = tokio::fs::remove_dir_all(&staging).await
        {
            warn!("Failed to remove staging directory {:?}: {}", staging, e);
        }
        result
    }

    async fn fetch_verify_install(
        &self,
        leader: &PeerId,
        staging: &Path,
        cancel: &watch::Receiver<bool>,
    ) -> Result<LogIndex> {
        let header = self.transport.fetch_checkpoint(leader, staging).await?;
        check_cancel(cancel)?;

        let path = staging.join(DB_FILE_NAME);
        let digest = tokio::task::spawn_blocking(move || PackageDigest::compute_file(path))
            .await
            .map_err(|e| Error::internal(e.to_string()))?
            .map_err(|e| Error::transport(format!("downloaded package unreadable: {e}")))?;
        if digest != header.digest {
            return Err(Error::DigestMismatch {
                expected: header.digest.to_string(),
                actual: digest.to_string(),
            });
        }

        let dir = staging.to_path_buf();
        let persisted = tokio::task::spawn_blocking(move || MetaStore::read_persisted_index(&dir))
            .await
            .map_err(|e| Error::internal(e.to_string()))?
            .map_err(|e| Error::transport(format!("downloaded package unreadable: {e}")))?;
        if persisted != header.index {
            return Err(Error::VerificationFailure {
                expected: header.index,
                actual: persisted,
            });
        }
        check_cancel(cancel)?;

        let store = Arc::clone(&self.store);
        let dir = staging.to_path_buf();
        let aside = tokio::task::spawn_blocking(move || store.install_checkpoint(&dir))
            .await
            .map_err(|e| Error::internal(e.to_string()))?
            .map_err(|e| Error::CorruptionFatal(e.to_string()))?;

        tokio::task::spawn_blocking(move || {
            if let Err(e) = std::fs::remove_dir_all(&aside) {
                warn!("Failed to remove replaced store {:?}: {}", aside, e);
            }
        });

        self.log.on_checkpoint_installed(persisted);
        Ok(persisted)
    }

    /// Check lag every poll interval until `shutdown` flips
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.poll_interval());
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.tick(&shutdown).await {
                        Ok(_) | Err(Error::Cancelled) => {}
                        Err(e) => error!("Snapshot provider tick failed: {}", e),
                    }
                }
                _ = shutdown.changed() => {
                    debug!("Snapshot provider stopping");
                    break;
                }
            }
        }
    }
}

/// Injected transfer failure for [`InProcessTransport`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportFault {
    Unreachable,
    /// Advertise this index instead of the package's own
    WrongIndex(LogIndex),
    /// Flip a byte of the transferred package
    CorruptBytes,
}

/// Transport that serves in-process checkpoint sources directly
#[derive(Default)]
pub struct InProcessTransport {
    sources: HashMap<PeerId, Arc<CheckpointSource>>,
    faults: Mutex<VecDeque<TransportFault>>,
    fetches: AtomicUsize,
}

impl InProcessTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_source(mut self, peer: impl Into<PeerId>, source: Arc<CheckpointSource>) -> Self {
        self.sources.insert(peer.into(), source);
        self
    }

    /// Queue a fault for the next fetch
    pub fn inject(&self, fault: TransportFault) {
        self.faults.lock().push_back(fault);
    }

    /// Number of fetches attempted
    #[must_use]
    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl CheckpointTransport for InProcessTransport {
    async fn fetch_checkpoint(&self, leader: &PeerId, dest_dir: &Path) -> Result<PackageHeader> {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        let fault = self.faults.lock().pop_front();
        if fault == Some(TransportFault::Unreachable) {
            return Err(Error::transport(format!("peer {leader} unreachable")));
        }

        let source = self
            .sources
            .get(leader)
            .cloned()
            .ok_or_else(|| Error::transport(format!("unknown peer {leader}")))?;
        let package = tokio::task::spawn_blocking(move || source.serve())
            .await
            .map_err(|e| Error::internal(e.to_string()))??;

        let dest = dest_dir.join(DB_FILE_NAME);
        tokio::fs::copy(&package.path, &dest).await?;
        let mut header = PackageHeader {
            index: package.index,
            digest: package.digest,
        };
        match fault {
            Some(TransportFault::WrongIndex(index)) => header.index = index,
            Some(TransportFault::CorruptBytes) => flip_last_byte(&dest).await?,
            _ => {}
        }
        Ok(header)
    }
}

async fn flip_last_byte(path: &Path) -> Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .await?;
    if file.seek(SeekFrom::End(-1)).await.is_err() {
        return Ok(());
    }
    let byte = file.read_u8().await?;
    file.seek(SeekFrom::End(-1)).await?;
    file.write_u8(byte ^ 0xff).await?;
    file.sync_all().await?;
    Ok(())
}
