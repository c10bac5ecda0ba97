//! # PwaKit Net
//!
//! The network side of the offline layer: request and response values that
//! flow through the worker, the [`Fetch`] seam the worker calls for live
//! traffic, and a reqwest-backed implementation of it.
//!
//! ## Design Goals
//!
//! 1. **Injectable network**: strategies only ever see `dyn Fetch`
//! 2. **Snapshot responses**: bodies are fully buffered so a response can be
//!    returned and stored at the same time
//! 3. **Failures are values**: a 404 is a response, a dropped connection is
//!    an error

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use thiserror::Error;
use url::Url;

pub mod client;
pub mod mock;

pub use client::{HttpFetcher, LoaderConfig};

/// Errors that can occur in networking.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Offline")]
    Offline,

    #[error("Invalid body: {0}")]
    InvalidBody(String),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
}

/// Unique identifier for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl RequestId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

/// Request mode, as the page issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
    /// Top-level document load.
    Navigate,
    #[default]
    SameOrigin,
    NoCors,
    Cors,
}

/// An intercepted request.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub id: RequestId,
    pub url: Url,
    pub method: Method,
    pub mode: RequestMode,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

impl FetchRequest {
    /// Create a GET subresource request.
    pub fn get(url: Url) -> Self {
        Self {
            id: RequestId::new(),
            url,
            method: Method::GET,
            mode: RequestMode::SameOrigin,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    /// Create a navigation request.
    pub fn navigate(url: Url) -> Self {
        Self {
            mode: RequestMode::Navigate,
            ..Self::get(url)
        }
    }

    /// Create a POST request.
    pub fn post(url: Url, body: Bytes) -> Self {
        Self {
            method: Method::POST,
            body: Some(body),
            ..Self::get(url)
        }
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn is_navigation(&self) -> bool {
        self.mode == RequestMode::Navigate
    }
}

/// Where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    Network,
    Cache,
}

/// A fully buffered response.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub url: Url,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub source: ResponseSource,
}

impl FetchResponse {
    /// Build a network response.
    pub fn new(url: Url, status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            url,
            status,
            headers: HeaderMap::new(),
            body: body.into(),
            source: ResponseSource::Network,
        }
    }

    /// Check if request was successful (2xx).
    pub fn ok(&self) -> bool {
        self.status.is_success()
    }

    pub fn from_cache(&self) -> bool {
        self.source == ResponseSource::Cache
    }

    /// Get the body as text.
    pub fn text(&self) -> Result<String, NetError> {
        String::from_utf8(self.body.to_vec()).map_err(|e| NetError::InvalidBody(e.to_string()))
    }

    /// Get the body as JSON.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, NetError> {
        serde_json::from_slice(&self.body).map_err(|e| NetError::InvalidBody(e.to_string()))
    }
}

/// The live network, as seen from the worker.
#[async_trait]
pub trait Fetch: Send + Sync {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, NetError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builder() {
        let url = Url::parse("https://example.com/app/").unwrap();
        let request = FetchRequest::navigate(url.clone()).header(
            HeaderName::from_static("accept"),
            HeaderValue::from_static("text/html"),
        );

        assert_eq!(request.url, url);
        assert_eq!(request.method, Method::GET);
        assert!(request.is_navigation());
        assert!(request.headers.contains_key("accept"));
    }

    #[test]
    fn test_post_is_not_navigation() {
        let url = Url::parse("https://example.com/upload").unwrap();
        let request = FetchRequest::post(url, Bytes::from_static(b"data"));
        assert_eq!(request.method, Method::POST);
        assert_eq!(request.mode, RequestMode::SameOrigin);
    }

    #[test]
    fn test_request_id_uniqueness() {
        assert_ne!(RequestId::new(), RequestId::new());
    }

    #[test]
    fn test_response_ok_range() {
        let url = Url::parse("https://example.com/").unwrap();
        assert!(FetchResponse::new(url.clone(), StatusCode::OK, "").ok());
        assert!(FetchResponse::new(url.clone(), StatusCode::NO_CONTENT, "").ok());
        assert!(!FetchResponse::new(url.clone(), StatusCode::NOT_FOUND, "").ok());
        assert!(!FetchResponse::new(url, StatusCode::INTERNAL_SERVER_ERROR, "").ok());
    }

    #[test]
    fn test_response_json() {
        #[derive(serde::Deserialize)]
        struct Build {
            version: String,
        }

        let url = Url::parse("https://example.com/sw.json").unwrap();
        let response = FetchResponse::new(url, StatusCode::OK, r#"{"version":"v2"}"#);
        let build: Build = response.json().unwrap();
        assert_eq!(build.version, "v2");
        assert!(!response.from_cache());
    }
}
