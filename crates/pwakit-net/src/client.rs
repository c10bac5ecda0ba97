//! reqwest-backed [`Fetch`] implementation.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, info, trace};

use crate::{Fetch, FetchRequest, FetchResponse, NetError, ResponseSource};

/// HTTP client configuration.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// User agent string.
    pub user_agent: String,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Maximum redirects.
    pub max_redirects: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("PwaKit/{}", env!("CARGO_PKG_VERSION")),
            timeout: Duration::from_secs(30),
            max_redirects: 10,
        }
    }
}

/// Fetches over real HTTP.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
    config: LoaderConfig,
}

impl HttpFetcher {
    pub fn new(config: LoaderConfig) -> Result<Self, NetError> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()
            .map_err(|e| NetError::RequestFailed(e.to_string()))?;

        info!(user_agent = %config.user_agent, "HttpFetcher initialized");

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }
}

#[async_trait]
impl Fetch for HttpFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, NetError> {
        debug!(url = %request.url, method = %request.method, "Fetching resource");

        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone())
            .headers(request.headers.clone());

        if let Some(ref body) = request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                NetError::Timeout(self.config.timeout)
            } else {
                NetError::HttpError(e)
            }
        })?;

        let status = response.status();
        let headers = response.headers().clone();
        let url = response.url().clone();
        let body = response.bytes().await?;

        trace!(
            url = %url,
            status = %status,
            body_len = body.len(),
            "Response received"
        );

        Ok(FetchResponse {
            url,
            status,
            headers,
            body,
            source: ResponseSource::Network,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;
    use url::Url;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_loader_config_default() {
        let config = LoaderConfig::default();
        assert!(config.user_agent.starts_with("PwaKit/"));
        assert_eq!(config.max_redirects, 10);
    }

    #[tokio::test]
    async fn test_fetch_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/app/index.html"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/html")
                    .set_body_string("<html>shell</html>"),
            )
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(LoaderConfig::default()).unwrap();
        let url = Url::parse(&format!("{}/app/index.html", server.uri())).unwrap();
        let response = fetcher.fetch(&FetchRequest::get(url)).await.unwrap();

        assert!(response.ok());
        assert_eq!(response.source, ResponseSource::Network);
        assert_eq!(response.text().unwrap(), "<html>shell</html>");
        assert_eq!(
            response.headers.get("content-type").unwrap(),
            "text/html"
        );
    }

    #[tokio::test]
    async fn test_fetch_not_found_is_a_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(LoaderConfig::default()).unwrap();
        let url = Url::parse(&format!("{}/missing.png", server.uri())).unwrap();
        let response = fetcher.fetch(&FetchRequest::get(url)).await.unwrap();

        assert_eq!(response.status, StatusCode::NOT_FOUND);
        assert!(!response.ok());
    }

    #[tokio::test]
    async fn test_fetch_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(LoaderConfig {
            timeout: Duration::from_millis(100),
            ..Default::default()
        })
        .unwrap();
        let url = Url::parse(&format!("{}/slow", server.uri())).unwrap();
        let err = fetcher.fetch(&FetchRequest::get(url)).await.unwrap_err();

        assert!(matches!(err, NetError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_fetch_connection_refused() {
        let fetcher = HttpFetcher::new(LoaderConfig::default()).unwrap();
        let url = Url::parse("http://127.0.0.1:9/unreachable").unwrap();
        assert!(fetcher.fetch(&FetchRequest::get(url)).await.is_err());
    }
}
