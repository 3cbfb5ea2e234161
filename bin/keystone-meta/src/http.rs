//! HTTP endpoints of the metadata service.
//!
//! - `GET /v1/log/index` reports the committed index and current leader
//! - `GET /v1/checkpoint` streams the leader's checkpoint package
//! - `/secret/generate` and `/secret/revoke` manage S3 credentials for the
//!   principal named in the `x-keystone-principal` header

use crate::transport::{CRC32C_HEADER, INDEX_HEADER, LEN_HEADER, XXH64_HEADER};
use axum::{
    Json, Router,
    body::Body,
    extract::State,
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use keystone_common::{Error, LogIndex};
use bytes::BytesMut;
use futures::stream;
use keystone_meta_store::{CheckpointPackage, CheckpointSource, ReplicatedLog, S3SecretManager};
use quick_xml::se::to_string as to_xml;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tracing::{debug, error};

pub const PRINCIPAL_HEADER: &str = "x-keystone-principal";

const BODY_CHUNK_SIZE: usize = 64 * 1024;

const XML_DECLARATION: &str = r#"<?xml version="1.0" encoding="UTF-8"?>"#;

/// Shared state for HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub log: Arc<dyn ReplicatedLog>,
    pub source: Arc<CheckpointSource>,
    pub secrets: Arc<dyn S3SecretManager>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LogIndexResponse {
    pub index: LogIndex,
    pub leader: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename = "S3Secret")]
struct S3SecretResponse {
    #[serde(rename = "awsAccessKey")]
    aws_access_key: String,
    #[serde(rename = "awsSecret")]
    aws_secret: String,
}

/// Maps domain errors onto HTTP status codes
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            error!("Request failed: {}", self.0);
        } else {
            debug!("Request rejected ({}): {}", status, self.0);
        }
        (status, self.0.to_string()).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/log/index", get(log_index))
        .route("/v1/checkpoint", get(checkpoint))
        .route("/secret/generate", get(generate_secret).put(generate_secret))
        .route("/secret/revoke", get(revoke_secret).put(revoke_secret))
        .with_state(state)
}

/// Run a store call off the async runtime
async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce() -> keystone_common::Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::internal(e.to_string()))?
        .map_err(ApiError::from)
}

fn require_leader(log: &dyn ReplicatedLog) -> Result<(), ApiError> {
    if log.is_leader() {
        Ok(())
    } else {
        Err(Error::NotLeader {
            leader: log.leader_id().map(|p| p.to_string()),
        }
        .into())
    }
}

fn principal(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get(PRINCIPAL_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| Error::invalid_argument(format!("missing {PRINCIPAL_HEADER} header")).into())
}

fn xml_response<T: Serialize>(value: &T) -> Result<Response, ApiError> {
    let body = to_xml(value).map_err(|e| Error::Serialization(e.to_string()))?;
    Ok((
        [(header::CONTENT_TYPE, "application/xml")],
        format!("{XML_DECLARATION}\n{body}"),
    )
        .into_response())
}

async fn log_index(State(state): State<AppState>) -> Result<Json<LogIndexResponse>, ApiError> {
    let log = Arc::clone(&state.log);
    let index = blocking(move || log.committed_index()).await?;
    Ok(Json(LogIndexResponse {
        index,
        leader: state.log.leader_id().map(|p| p.to_string()),
    }))
}

async fn checkpoint(State(state): State<AppState>) -> Result<Response, ApiError> {
    let source = Arc::clone(&state.source);
    let (package, file) = blocking(move || {
        let package = source.serve()?;
        let file = std::fs::File::open(&package.path)?;
        Ok((package, file))
    })
    .await?;

    debug!(
        "Serving checkpoint at index {} ({} bytes)",
        package.index, package.digest.len
    );
    let headers = [
        (header::CONTENT_TYPE.as_str(), "application/octet-stream".to_string()),
        (header::CONTENT_LENGTH.as_str(), package.digest.len.to_string()),
        (INDEX_HEADER, package.index.to_string()),
        (CRC32C_HEADER, format!("{:08x}", package.digest.crc32c)),
        (XXH64_HEADER, format!("{:016x}", package.digest.xxhash64)),
        (LEN_HEADER, package.digest.len.to_string()),
    ];
    Ok((headers, package_body(tokio::fs::File::from_std(file), package)).into_response())
}

/// Stream the package file in chunks. The package handle rides along so its
/// staging directory outlives the transfer.
fn package_body(file: tokio::fs::File, package: CheckpointPackage) -> Body {
    let chunks = stream::try_unfold((file, package), |(mut file, package)| async move {
        let mut buf = BytesMut::with_capacity(BODY_CHUNK_SIZE);
        if file.read_buf(&mut buf).await? == 0 {
            return Ok::<_, std::io::Error>(None);
        }
        Ok(Some((buf.freeze(), (file, package))))
    });
    Body::from_stream(chunks)
}

async fn generate_secret(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    require_leader(state.log.as_ref())?;
    let principal = principal(&headers)?;
    let secrets = Arc::clone(&state.secrets);
    let secret = blocking(move || secrets.get_secret(&principal)).await?;
    xml_response(&S3SecretResponse {
        aws_access_key: secret.aws_access_key,
        aws_secret: secret.aws_secret,
    })
}

async fn revoke_secret(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    require_leader(state.log.as_ref())?;
    let principal = principal(&headers)?;
    let secrets = Arc::clone(&state.secrets);
    blocking(move || secrets.revoke_secret(&principal)).await?;
    Ok(StatusCode::OK)
}
