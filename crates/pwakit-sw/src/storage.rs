//! Versioned cache stores.
//!
//! A store maps a [`RequestKey`] to a [`CacheEntry`]. Stores are addressed by
//! name; the lifecycle manager embeds the build version in that name.

use std::fmt;

use async_trait::async_trait;
use hashbrown::HashMap;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use pwakit_net::{FetchRequest, FetchResponse, ResponseSource};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use url::Url;

use crate::ServiceWorkerError;

// ==================== Keys ====================

/// Canonical request identity: a GET for an absolute URL, fragment removed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestKey(String);

impl RequestKey {
    /// Key for a request, or `None` when the request may never be cached.
    pub fn for_request(request: &FetchRequest) -> Option<Self> {
        (request.method == Method::GET).then(|| Self::for_url(&request.url))
    }

    pub fn for_url(url: &Url) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        Self(url.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ==================== Entries ====================

/// Snapshot of a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Final response URL.
    pub url: String,

    /// Response status.
    pub status: u16,

    /// Response headers, in order.
    pub headers: Vec<(String, String)>,

    /// Response body.
    #[serde(with = "body_base64")]
    pub body: Vec<u8>,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    /// Snapshot a network response.
    pub fn snapshot(response: &FetchResponse) -> Self {
        let headers = response
            .headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        Self {
            url: response.url.to_string(),
            status: response.status.as_u16(),
            headers,
            body: response.body.to_vec(),
            cached_at: now_millis(),
        }
    }

    /// Rebuild a response served from cache.
    pub fn to_response(&self) -> Result<FetchResponse, ServiceWorkerError> {
        let url = Url::parse(&self.url)
            .map_err(|e| ServiceWorkerError::CacheError(format!("bad cached url: {e}")))?;
        let status = StatusCode::from_u16(self.status)
            .map_err(|e| ServiceWorkerError::CacheError(format!("bad cached status: {e}")))?;

        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::try_from(name.as_str()),
                HeaderValue::try_from(value.as_str()),
            ) {
                headers.append(name, value);
            }
        }

        Ok(FetchResponse {
            url,
            status,
            headers,
            body: self.body.clone().into(),
            source: ResponseSource::Cache,
        })
    }
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

mod body_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

// ==================== Storage ====================

/// Named key/value stores owned by the worker.
#[async_trait]
pub trait CacheStorage: Send + Sync {
    /// Open a store, creating it if absent. Returns `true` if it was created.
    async fn open(&self, cache: &str) -> Result<bool, ServiceWorkerError>;

    /// Check if a store exists.
    async fn has(&self, cache: &str) -> Result<bool, ServiceWorkerError>;

    /// Look up an entry. A missing store is a miss.
    async fn get(
        &self,
        cache: &str,
        key: &RequestKey,
    ) -> Result<Option<CacheEntry>, ServiceWorkerError>;

    /// Store an entry, replacing any previous one.
    ///
    /// Fails with [`ServiceWorkerError::NotFound`] if the store does not
    /// exist; only `open` creates stores.
    async fn put(
        &self,
        cache: &str,
        key: RequestKey,
        entry: CacheEntry,
    ) -> Result<(), ServiceWorkerError>;

    /// Store a batch into an existing store. Either every entry lands or
    /// none does.
    async fn put_all(
        &self,
        cache: &str,
        entries: Vec<(RequestKey, CacheEntry)>,
    ) -> Result<(), ServiceWorkerError>;

    /// Delete an entry.
    async fn delete(&self, cache: &str, key: &RequestKey) -> Result<bool, ServiceWorkerError>;

    /// Delete a whole store.
    async fn delete_cache(&self, cache: &str) -> Result<bool, ServiceWorkerError>;

    /// All store names, sorted.
    async fn list_names(&self) -> Result<Vec<String>, ServiceWorkerError>;

    /// All keys of a store, sorted.
    async fn keys(&self, cache: &str) -> Result<Vec<RequestKey>, ServiceWorkerError>;
}

/// In-process stores.
#[derive(Debug, Default)]
pub struct MemoryCacheStorage {
    caches: RwLock<HashMap<String, HashMap<RequestKey, CacheEntry>>>,
}

impl MemoryCacheStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStorage for MemoryCacheStorage {
    async fn open(&self, cache: &str) -> Result<bool, ServiceWorkerError> {
        let mut caches = self.caches.write().await;
        if caches.contains_key(cache) {
            return Ok(false);
        }
        caches.insert(cache.to_string(), HashMap::new());
        Ok(true)
    }

    async fn has(&self, cache: &str) -> Result<bool, ServiceWorkerError> {
        Ok(self.caches.read().await.contains_key(cache))
    }

    async fn get(
        &self,
        cache: &str,
        key: &RequestKey,
    ) -> Result<Option<CacheEntry>, ServiceWorkerError> {
        Ok(self
            .caches
            .read()
            .await
            .get(cache)
            .and_then(|entries| entries.get(key))
            .cloned())
    }

    async fn put(
        &self,
        cache: &str,
        key: RequestKey,
        entry: CacheEntry,
    ) -> Result<(), ServiceWorkerError> {
        let mut caches = self.caches.write().await;
        let entries = caches.get_mut(cache).ok_or_else(|| missing_store(cache))?;
        entries.insert(key, entry);
        Ok(())
    }

    async fn put_all(
        &self,
        cache: &str,
        entries: Vec<(RequestKey, CacheEntry)>,
    ) -> Result<(), ServiceWorkerError> {
        let mut caches = self.caches.write().await;
        caches
            .get_mut(cache)
            .ok_or_else(|| missing_store(cache))?
            .extend(entries);
        Ok(())
    }

    async fn delete(&self, cache: &str, key: &RequestKey) -> Result<bool, ServiceWorkerError> {
        Ok(self
            .caches
            .write()
            .await
            .get_mut(cache)
            .is_some_and(|entries| entries.remove(key).is_some()))
    }

    async fn delete_cache(&self, cache: &str) -> Result<bool, ServiceWorkerError> {
        Ok(self.caches.write().await.remove(cache).is_some())
    }

    async fn list_names(&self) -> Result<Vec<String>, ServiceWorkerError> {
        let mut names: Vec<String> = self.caches.read().await.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn keys(&self, cache: &str) -> Result<Vec<RequestKey>, ServiceWorkerError> {
        let mut keys: Vec<RequestKey> = self
            .caches
            .read()
            .await
            .get(cache)
            .map(|entries| entries.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        Ok(keys)
    }
}

pub(crate) fn missing_store(cache: &str) -> ServiceWorkerError {
    ServiceWorkerError::NotFound(format!("no cache store named {cache:?}"))
}
