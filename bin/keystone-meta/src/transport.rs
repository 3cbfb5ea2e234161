//! HTTP checkpoint transport.
//!
//! Fetches `GET /v1/checkpoint` from the leader and streams the body into
//! the staging directory. The package digest and index travel as headers;
//! the digest is checked as the body arrives.

use async_trait::async_trait;
use keystone_common::{DigestCalculator, Error, MetaConfig, PackageDigest, PeerId, Result};
use keystone_meta_store::store::DB_FILE_NAME;
use keystone_meta_store::{CheckpointTransport, PackageHeader};
use reqwest::StatusCode;
use reqwest::header::HeaderMap;
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use tokio::io::AsyncWriteExt;
use tracing::debug;

pub const INDEX_HEADER: &str = "x-keystone-checkpoint-index";
pub const CRC32C_HEADER: &str = "x-keystone-checkpoint-crc32c";
pub const XXH64_HEADER: &str = "x-keystone-checkpoint-xxh64";
pub const LEN_HEADER: &str = "x-keystone-checkpoint-len";

pub struct HttpTransport {
    client: reqwest::Client,
    addresses: HashMap<PeerId, String>,
}

impl HttpTransport {
    pub fn new(config: &MetaConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.provider.request_timeout())
            .build()
            .map_err(|e| Error::Configuration(format!("failed to build HTTP client: {e}")))?;
        let addresses = config
            .cluster
            .peers
            .iter()
            .map(|p| {
                (
                    PeerId::new(p.id.as_str()),
                    p.address.trim_end_matches('/').to_string(),
                )
            })
            .collect();
        Ok(Self { client, addresses })
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Result<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| Error::transport(format!("missing {name} header")))
}

fn parse_header<T: FromStr>(headers: &HeaderMap, name: &str) -> Result<T> {
    header_str(headers, name)?
        .parse()
        .map_err(|_| Error::transport(format!("invalid {name} header")))
}

fn parse_package_header(headers: &HeaderMap) -> Result<PackageHeader> {
    let crc32c = u32::from_str_radix(header_str(headers, CRC32C_HEADER)?, 16)
        .map_err(|_| Error::transport(format!("invalid {CRC32C_HEADER} header")))?;
    let xxhash64 = u64::from_str_radix(header_str(headers, XXH64_HEADER)?, 16)
        .map_err(|_| Error::transport(format!("invalid {XXH64_HEADER} header")))?;
    Ok(PackageHeader {
        index: parse_header(headers, INDEX_HEADER)?,
        digest: PackageDigest {
            crc32c,
            xxhash64,
            len: parse_header(headers, LEN_HEADER)?,
        },
    })
}

#[async_trait]
impl CheckpointTransport for HttpTransport {
    async fn fetch_checkpoint(&self, leader: &PeerId, dest_dir: &Path) -> Result<PackageHeader> {
        let address = self
            .addresses
            .get(leader)
            .ok_or_else(|| Error::transport(format!("no address configured for {leader}")))?;

        let mut response = self
            .client
            .get(format!("{address}/v1/checkpoint"))
            .send()
            .await
            .map_err(|e| Error::transport(format!("checkpoint request to {leader}: {e}")))?;
        match response.status() {
            StatusCode::OK => {}
            StatusCode::MISDIRECTED_REQUEST => {
                return Err(Error::transport(format!("{leader} is no longer the leader")));
            }
            status => {
                return Err(Error::transport(format!(
                    "checkpoint request to {leader} returned {status}"
                )));
            }
        }
        let header = parse_package_header(response.headers())?;

        let mut file = tokio::fs::File::create(dest_dir.join(DB_FILE_NAME)).await?;
        let mut calc = DigestCalculator::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| Error::transport(format!("checkpoint download from {leader}: {e}")))?
        {
            calc.update(&chunk);
            file.write_all(&chunk).await?;
        }
        file.sync_all().await?;

        let digest = calc.finalize();
        if digest != header.digest {
            return Err(Error::DigestMismatch {
                expected: header.digest.to_string(),
                actual: digest.to_string(),
            });
        }
        debug!(
            "Downloaded checkpoint at index {} from {} ({})",
            header.index, leader, digest
        );
        Ok(header)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{AppState, router};
    use keystone_common::config::PeerConfig;
    use keystone_meta_store::{
        CheckpointSource, LocalLog, LockManager, LockedSecretManager, MetaStore, ReplicatedLog,
        StoreSecretManager,
    };
    use std::sync::Arc;
    use tempfile::tempdir;

    async fn serve_leader(store: Arc<MetaStore>, staging: &Path) -> String {
        let log: Arc<dyn ReplicatedLog> = Arc::new(LocalLog::new("meta1", Arc::clone(&store)));
        let state = AppState {
            source: Arc::new(CheckpointSource::new(
                Arc::clone(&store),
                Arc::clone(&log),
                staging,
            )),
            secrets: Arc::new(LockedSecretManager::new(
                StoreSecretManager::new(store),
                Arc::new(LockManager::new()),
            )),
            log,
        };
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(state)).await.unwrap();
        });
        format!("http://{address}")
    }

    fn config_for(address: &str) -> MetaConfig {
        let mut config = MetaConfig::default();
        config.node.id = "meta2".into();
        config.cluster.leader = Some("meta1".into());
        config.cluster.peers = vec![PeerConfig {
            id: "meta1".into(),
            address: address.to_string(),
        }];
        config
    }

    #[tokio::test]
    async fn test_fetch_checkpoint_over_http() {
        let dir = tempdir().unwrap();
        let leader = Arc::new(MetaStore::open(dir.path().join("leader")).unwrap());
        leader.create_volume("vol1", "alice").unwrap();
        leader.create_volume("vol2", "alice").unwrap();
        let address = serve_leader(Arc::clone(&leader), &dir.path().join("staging")).await;

        let transport = HttpTransport::new(&config_for(&address)).unwrap();
        let dest = dir.path().join("download");
        std::fs::create_dir_all(&dest).unwrap();
        let header = transport
            .fetch_checkpoint(&PeerId::new("meta1"), &dest)
            .await
            .unwrap();

        assert_eq!(header.index, 2);
        let digest = PackageDigest::compute_file(dest.join(DB_FILE_NAME)).unwrap();
        assert_eq!(digest, header.digest);
        assert_eq!(MetaStore::read_persisted_index(&dest).unwrap(), 2);
    }

    #[tokio::test]
    async fn test_body_not_matching_headers_is_digest_mismatch() {
        let app = axum::Router::new().route(
            "/v1/checkpoint",
            axum::routing::get(|| async {
                (
                    [
                        (INDEX_HEADER, "7"),
                        (CRC32C_HEADER, "00000000"),
                        (XXH64_HEADER, "0000000000000000"),
                        (LEN_HEADER, "5"),
                    ],
                    "bytes",
                )
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let dir = tempdir().unwrap();
        let transport = HttpTransport::new(&config_for(&address)).unwrap();
        let err = transport
            .fetch_checkpoint(&PeerId::new("meta1"), dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DigestMismatch { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_unknown_peer_is_retryable() {
        let dir = tempdir().unwrap();
        let transport = HttpTransport::new(&config_for("http://127.0.0.1:1")).unwrap();
        let err = transport
            .fetch_checkpoint(&PeerId::new("meta9"), dir.path())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_unreachable_leader_is_retryable() {
        let dir = tempdir().unwrap();
        let transport = HttpTransport::new(&config_for("http://127.0.0.1:1")).unwrap();
        let err = transport
            .fetch_checkpoint(&PeerId::new("meta1"), dir.path())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_parse_package_header() {
        let mut headers = HeaderMap::new();
        headers.insert(INDEX_HEADER, "130".parse().unwrap());
        headers.insert(CRC32C_HEADER, "0000beef".parse().unwrap());
        headers.insert(XXH64_HEADER, "00000000deadbeef".parse().unwrap());
        headers.insert(LEN_HEADER, "4096".parse().unwrap());

        let header = parse_package_header(&headers).unwrap();
        assert_eq!(header.index, 130);
        assert_eq!(header.digest.crc32c, 0xbeef);
        assert_eq!(header.digest.xxhash64, 0xdead_beef);
        assert_eq!(header.digest.len, 4096);

        headers.remove(LEN_HEADER);
        assert!(parse_package_header(&headers).unwrap_err().is_retryable());
    }
}
