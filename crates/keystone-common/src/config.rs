//! Configuration types for the Keystone metadata service
//!
//! All sections have defaults so a partial TOML file (or none at all)
//! produces a runnable single-node configuration.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration for a metadata-service replica
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MetaConfig {
    /// Node identity and storage location
    pub node: NodeConfig,
    /// Cluster membership
    pub cluster: ClusterConfig,
    /// Snapshot lifecycle settings
    pub snapshot: SnapshotConfig,
    /// Lagging-replica catch-up settings
    pub provider: ProviderConfig,
    /// HTTP endpoint settings
    pub http: HttpConfig,
}

impl MetaConfig {
    /// Address of a configured peer, if any
    #[must_use]
    pub fn peer_address(&self, id: &str) -> Option<&str> {
        self.cluster
            .peers
            .iter()
            .find(|p| p.id == id)
            .map(|p| p.address.as_str())
    }
}

/// Node identity and role configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Replica identifier (unique within the cluster)
    pub id: String,
    /// Data directory; the live store lives in `<data_dir>/db`
    pub data_dir: PathBuf,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: "meta1".to_string(),
            data_dir: PathBuf::from("/var/lib/keystone"),
        }
    }
}

impl NodeConfig {
    /// Directory holding the live metadata database
    #[must_use]
    pub fn db_dir(&self) -> PathBuf {
        self.data_dir.join("db")
    }

    /// Root directory for snapshot checkpoint directories
    #[must_use]
    pub fn snapshot_root(&self) -> PathBuf {
        self.data_dir.join("snapshot")
    }

    /// Scratch directory for checkpoint packaging and downloads
    #[must_use]
    pub fn staging_root(&self) -> PathBuf {
        self.data_dir.join("staging")
    }
}

/// Cluster membership configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Current leader id; `None` means single-node (this node leads)
    pub leader: Option<String>,
    /// All replicas, including this one
    pub peers: Vec<PeerConfig>,
}

/// A peer replica
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Replica identifier
    pub id: String,
    /// HTTP base address (e.g. "http://10.0.0.2:9862")
    pub address: String,
}

/// Snapshot lifecycle configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Interval between reclamation sweeps (seconds)
    pub reclaim_interval_secs: u64,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            reclaim_interval_secs: 60,
        }
    }
}

impl SnapshotConfig {
    #[must_use]
    pub const fn reclaim_interval(&self) -> Duration {
        Duration::from_secs(self.reclaim_interval_secs)
    }
}

/// Snapshot provider (lagging replica catch-up) configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Catch up once the applied index trails the committed index by more than this
    pub lag_threshold: u64,
    /// Download attempts before reporting FAILED
    pub max_attempts: u32,
    /// Initial backoff between attempts (milliseconds)
    pub backoff_base_ms: u64,
    /// Backoff ceiling (milliseconds)
    pub backoff_max_ms: u64,
    /// Lag check interval (milliseconds)
    pub poll_interval_ms: u64,
    /// Timeout for a single checkpoint request (seconds)
    pub request_timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            lag_threshold: 1000,
            max_attempts: 5,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
            poll_interval_ms: 5_000,
            request_timeout_secs: 300,
        }
    }
}

impl ProviderConfig {
    /// Backoff before retry number `attempt` (1-based), doubling up to the ceiling
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let millis = self
            .backoff_base_ms
            .saturating_mul(1u64 << shift)
            .min(self.backoff_max_ms);
        Duration::from_millis(millis)
    }

    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// HTTP endpoint configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Listen address for checkpoint, log-index and secret endpoints
    pub listen: SocketAddr,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 9862)),
        }
    }
}
