//! Class-based object store: paginated list, create, delete.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;
use tracing::{info_span, Instrument};

use crate::{HttpClientConfig, HttpTransport, RemoteError, Replay};

/// Largest `limit` the store honours for a single list call.
pub const STORE_MAX_PAGE_SIZE: usize = 1000;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// One page of raw objects of `class`, ordered stably across calls.
    async fn list_page(&self, class: &str, skip: usize, limit: usize) -> Result<Vec<JsonValue>, RemoteError>;

    /// Create an object and return the store-generated object id.
    async fn create(&self, class: &str, body: JsonValue) -> Result<String, RemoteError>;

    async fn delete(&self, class: &str, object_id: &str) -> Result<(), RemoteError>;
}

#[derive(Debug, Clone)]
pub struct ParseStoreConfig {
    pub base_url: String,
    pub application_id: String,
    pub api_key: String,
}

/// Parse-compatible REST store (`/classes/{Class}`).
#[derive(Debug)]
pub struct ParseObjectStore {
    transport: HttpTransport,
    config: ParseStoreConfig,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    results: Vec<JsonValue>,
}

#[derive(Debug, Deserialize)]
struct CreateResponse {
    #[serde(rename = "objectId")]
    object_id: String,
}

impl ParseObjectStore {
    pub fn new(config: ParseStoreConfig, http: HttpClientConfig) -> anyhow::Result<Self> {
        Ok(Self {
            transport: HttpTransport::new(http)?,
            config,
        })
    }

    fn class_url(&self, class: &str) -> String {
        format!("{}/classes/{}", self.config.base_url.trim_end_matches('/'), class)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .header("X-Parse-Application-Id", &self.config.application_id)
            .header("X-Parse-REST-API-Key", &self.config.api_key)
    }
}

#[async_trait]
impl ObjectStore for ParseObjectStore {
    async fn list_page(&self, class: &str, skip: usize, limit: usize) -> Result<Vec<JsonValue>, RemoteError> {
        let url = self.class_url(class);
        let limit = limit.min(STORE_MAX_PAGE_SIZE);
        let response = self
            .transport
            .send(|client| {
                self.authorize(client.get(&url))
                    .query(&[("limit", limit), ("skip", skip)])
                    .query(&[("order", "createdAt")])
            })
            .instrument(info_span!("store_list", class, skip, limit))
            .await?;
        let page: ListResponse = response.json(&format!("list {class}"))?;
        Ok(page.results)
    }

    async fn create(&self, class: &str, body: JsonValue) -> Result<String, RemoteError> {
        let url = self.class_url(class);
        let response = self
            .transport
            .send_with(Replay::Unsafe, |client| self.authorize(client.post(&url)).json(&body))
            .instrument(info_span!("store_create", class))
            .await?;
        let created: CreateResponse = response.json(&format!("create {class}"))?;
        Ok(created.object_id)
    }

    async fn delete(&self, class: &str, object_id: &str) -> Result<(), RemoteError> {
        let url = format!("{}/{}", self.class_url(class), object_id);
        self.transport
            .send(|client| self.authorize(client.delete(&url)))
            .instrument(info_span!("store_delete", class, object_id))
            .await?;
        Ok(())
    }
}

/// In-process store used for dry runs and tests. Objects keep insertion order.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    classes: Mutex<BTreeMap<String, Vec<JsonValue>>>,
    next_id: Mutex<u64>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an object directly, assigning an object id when it has none.
    pub async fn insert(&self, class: &str, mut body: JsonValue) -> String {
        let object_id = match body.get("objectId").and_then(JsonValue::as_str) {
            Some(existing) => existing.to_string(),
            None => {
                let id = self.allocate_id().await;
                if let Some(map) = body.as_object_mut() {
                    map.insert("objectId".to_string(), JsonValue::String(id.clone()));
                }
                id
            }
        };
        self.classes
            .lock()
            .await
            .entry(class.to_string())
            .or_default()
            .push(body);
        object_id
    }

    pub async fn objects(&self, class: &str) -> Vec<JsonValue> {
        self.classes
            .lock()
            .await
            .get(class)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn count(&self, class: &str) -> usize {
        self.classes.lock().await.get(class).map_or(0, Vec::len)
    }

    async fn allocate_id(&self) -> String {
        let mut next = self.next_id.lock().await;
        *next += 1;
        format!("mem{:08}", *next)
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn list_page(&self, class: &str, skip: usize, limit: usize) -> Result<Vec<JsonValue>, RemoteError> {
        let limit = limit.min(STORE_MAX_PAGE_SIZE);
        Ok(self
            .classes
            .lock()
            .await
            .get(class)
            .map(|objects| objects.iter().skip(skip).take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn create(&self, class: &str, body: JsonValue) -> Result<String, RemoteError> {
        if !body.is_object() {
            return Err(RemoteError::shape(format!("create {class}"), "body is not an object"));
        }
        Ok(self.insert(class, body).await)
    }

    async fn delete(&self, class: &str, object_id: &str) -> Result<(), RemoteError> {
        let mut classes = self.classes.lock().await;
        let objects = classes.entry(class.to_string()).or_default();
        let before = objects.len();
        objects.retain(|obj| obj.get("objectId").and_then(JsonValue::as_str) != Some(object_id));
        if objects.len() == before {
            return Err(RemoteError::HttpStatus {
                status: 404,
                url: format!("memory://classes/{class}/{object_id}"),
            });
        }
        Ok(())
    }
}
