//! Remote transports (query service RPC, object store) and the on-disk
//! snapshot artifact store for DNH.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

mod object_store;

pub use object_store::{MemoryObjectStore, ObjectStore, ParseObjectStore, ParseStoreConfig, STORE_MAX_PAGE_SIZE};

pub const CRATE_NAME: &str = "dnh-storage";

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("remote call {method} returned error: {message}")]
    Rpc { method: String, message: String },
    #[error("unexpected response shape from {context}: {detail}")]
    Shape { context: String, detail: String },
}

impl RemoteError {
    pub fn shape(context: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Shape {
            context: context.into(),
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Whether a request may be sent again when the first attempt's outcome is unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Replay {
    /// Reads, deletes, and query calls: repeating them cannot add rows.
    Safe,
    /// Creates: only retried when the server cannot have acted on the request.
    Unsafe,
}

pub fn classify_status(status: StatusCode, replay: Replay) -> RetryDisposition {
    let retryable = match replay {
        Replay::Safe => status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS,
        Replay::Unsafe => status == StatusCode::SERVICE_UNAVAILABLE || status == StatusCode::TOO_MANY_REQUESTS,
    };
    if retryable {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error, replay: Replay) -> RetryDisposition {
    classify_transport_failure(err.is_connect(), err.is_timeout(), replay)
}

/// A connect failure never reached the server. A timeout may have.
fn classify_transport_failure(connect: bool, timeout: bool, replay: Replay) -> RetryDisposition {
    if connect || (timeout && replay == Replay::Safe) {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(4),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Hard ceiling on open requests across every batch sharing this transport.
    pub max_in_flight: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            max_in_flight: 50,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn json<T: for<'de> Deserialize<'de>>(&self, context: &str) -> Result<T, RemoteError> {
        serde_json::from_slice(&self.body).map_err(|err| RemoteError::shape(context, err.to_string()))
    }
}

/// Shared reqwest client with an in-flight ceiling and retry on transient failures.
#[derive(Debug)]
pub struct HttpTransport {
    client: reqwest::Client,
    in_flight: Arc<Semaphore>,
    backoff: BackoffPolicy,
}

impl HttpTransport {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            in_flight: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
            backoff: config.backoff,
        })
    }

    /// Send the request produced by `build`, rebuilding it for each retry attempt.
    pub async fn send<F>(&self, build: F) -> Result<FetchedResponse, RemoteError>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        self.send_with(Replay::Safe, build).await
    }

    pub async fn send_with<F>(&self, replay: Replay, build: F) -> Result<FetchedResponse, RemoteError>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let _permit = self.in_flight.acquire().await.expect("semaphore not closed");

        for attempt in 0..=self.backoff.max_retries {
            let last_attempt = attempt == self.backoff.max_retries;
            match build(&self.client).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status, replay) == RetryDisposition::Retryable && !last_attempt {
                        debug!(%status, attempt, url = %final_url, "retrying after status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(RemoteError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err, replay) == RetryDisposition::Retryable && !last_attempt {
                        debug!(error = %err, attempt, "retrying after transport error");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(RemoteError::Request(err));
                }
            }
        }

        unreachable!("final attempt always returns")
    }
}

/// Method + params in, `result` out. A populated `error` field is a failure of that call.
#[async_trait]
pub trait QueryService: Send + Sync {
    async fn call(&self, method: &str, params: JsonValue) -> Result<JsonValue, RemoteError>;
}

#[derive(Debug, Deserialize)]
struct RpcEnvelope {
    #[serde(default)]
    error: JsonValue,
    #[serde(default)]
    result: JsonValue,
}

/// Normalizes the service's error field: null and `""` both mean success.
pub fn rpc_error_message(error: &JsonValue) -> Option<String> {
    match error {
        JsonValue::Null => None,
        JsonValue::String(s) if s.is_empty() => None,
        JsonValue::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// JSON-RPC client for the menu service.
#[derive(Debug)]
pub struct RpcClient {
    transport: HttpTransport,
    endpoint: String,
    next_id: AtomicU64,
}

impl RpcClient {
    pub fn new(endpoint: impl Into<String>, config: HttpClientConfig) -> anyhow::Result<Self> {
        Ok(Self {
            transport: HttpTransport::new(config)?,
            endpoint: endpoint.into(),
            next_id: AtomicU64::new(1),
        })
    }

    fn cache_buster() -> String {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default()
            .to_string()
    }
}

#[async_trait]
impl QueryService for RpcClient {
    async fn call(&self, method: &str, params: JsonValue) -> Result<JsonValue, RemoteError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "service": "",
            "method": method,
            "id": id,
            "params": params,
        });

        let span = info_span!("rpc_call", method, id);
        let response = self
            .transport
            .send(|client| {
                client
                    .post(&self.endpoint)
                    .query(&[("nocache", Self::cache_buster())])
                    .json(&body)
            })
            .instrument(span)
            .await?;

        let envelope: RpcEnvelope = response.json(method)?;
        if let Some(message) = rpc_error_message(&envelope.error) {
            return Err(RemoteError::Rpc {
                method: method.to_string(),
                message,
            });
        }
        Ok(envelope.result)
    }
}

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Hash-addressed, write-once store for snapshot artifacts.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    pub fn artifact_relative_path(&self, harvest_date: NaiveDate, venue_key: &str, content_hash: &str) -> PathBuf {
        PathBuf::from(harvest_date.format("%Y%m%d").to_string())
            .join(venue_key)
            .join(format!("{content_hash}.json"))
    }

    /// Write a snapshot document; identical bytes for the same venue and date land on the same path.
    pub async fn store_snapshot(
        &self,
        harvest_date: NaiveDate,
        venue_key: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredArtifact> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = self.artifact_relative_path(harvest_date, venue_key, &content_hash);
        let absolute_path = self.root.join(&relative_path);
        let mut artifact = StoredArtifact {
            content_hash,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            deduplicated: true,
        };

        let parent = artifact
            .absolute_path
            .parent()
            .context("artifact path has no parent")?
            .to_path_buf();
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating artifact directory {}", parent.display()))?;

        if fs::try_exists(&artifact.absolute_path)
            .await
            .with_context(|| format!("checking artifact path {}", artifact.absolute_path.display()))?
        {
            return Ok(artifact);
        }

        let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        write_new_file(&temp_path, bytes).await?;

        match fs::rename(&temp_path, &artifact.absolute_path).await {
            Ok(()) => {
                artifact.deduplicated = false;
                Ok(artifact)
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(artifact)
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "renaming {} -> {}",
                        temp_path.display(),
                        artifact.absolute_path.display()
                    )
                })
            }
        }
    }
}

async fn write_new_file(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(path)
        .await
        .with_context(|| format!("opening {}", path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing {}", path.display()))?;
    Ok(())
}
