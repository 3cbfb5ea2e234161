//! Static cluster membership.
//!
//! The leader is pinned by configuration. Followers learn the committed
//! index by polling the leader's `/v1/log/index` endpoint.

use crate::http::LogIndexResponse;
use keystone_common::{LogIndex, MetaConfig, PeerId, Result};
use keystone_meta_store::{MetaStore, ReplicatedLog};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub struct StaticCluster {
    id: PeerId,
    leader: PeerId,
    peers: Vec<PeerId>,
    store: Arc<MetaStore>,
    /// Committed index last reported by the leader
    leader_index: AtomicU64,
}

impl StaticCluster {
    pub fn from_config(config: &MetaConfig, store: Arc<MetaStore>) -> Self {
        let id = PeerId::new(config.node.id.as_str());
        let leader = config
            .cluster
            .leader
            .as_deref()
            .map_or_else(|| id.clone(), PeerId::from);
        let mut peers: Vec<PeerId> = config
            .cluster
            .peers
            .iter()
            .map(|p| PeerId::new(p.id.as_str()))
            .collect();
        if !peers.contains(&id) {
            peers.push(id.clone());
        }
        Self {
            id,
            leader,
            peers,
            store,
            leader_index: AtomicU64::new(0),
        }
    }

    pub fn record_leader_index(&self, index: LogIndex) {
        self.leader_index.fetch_max(index, Ordering::SeqCst);
    }

    /// Poll the leader's committed index until `shutdown` flips
    pub async fn poll_leader(
        self: Arc<Self>,
        client: reqwest::Client,
        address: String,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let url = format!("{}/v1/log/index", address.trim_end_matches('/'));
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => match fetch_index(&client, &url).await {
                    Ok(response) => {
                        debug!("Leader {} reports index {}", self.leader, response.index);
                        self.record_leader_index(response.index);
                    }
                    Err(e) => warn!("Failed to poll leader index at {}: {}", url, e),
                },
                _ = shutdown.changed() => break,
            }
        }
    }
}

async fn fetch_index(
    client: &reqwest::Client,
    url: &str,
) -> std::result::Result<LogIndexResponse, reqwest::Error> {
    client
        .get(url)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await
}

impl ReplicatedLog for StaticCluster {
    fn committed_index(&self) -> Result<LogIndex> {
        let applied = self.store.applied_index()?;
        if self.is_leader() {
            Ok(applied)
        } else {
            Ok(applied.max(self.leader_index.load(Ordering::SeqCst)))
        }
    }

    fn is_leader(&self) -> bool {
        self.leader == self.id
    }

    fn leader_id(&self) -> Option<PeerId> {
        Some(self.leader.clone())
    }

    fn peers(&self) -> Vec<PeerId> {
        self.peers.clone()
    }

    fn on_checkpoint_installed(&self, index: LogIndex) {
        info!("Resuming log application from index {}", index);
    }
}
