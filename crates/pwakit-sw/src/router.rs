//! Per-request caching strategies.

use std::sync::Arc;
use std::time::Duration;

use pwakit_common::{with_timeout, PwaConfig};
use pwakit_net::{Fetch, FetchRequest, FetchResponse, NetError};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use url::Url;

use crate::classify::{ResourceClass, ResourceClassifier, Strategy};
use crate::storage::{CacheEntry, CacheStorage, RequestKey};
use crate::ServiceWorkerError;

/// Router settings for one worker version.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Store this worker reads and writes.
    pub cache_name: String,
    /// Worker scope; also the app shell document.
    pub scope: Url,
    pub classifier: ResourceClassifier,
    pub network_timeout: Duration,
}

impl RouterConfig {
    pub fn from_config(config: &PwaConfig, cache_name: String, scope: Url) -> Self {
        Self {
            cache_name,
            scope,
            classifier: ResourceClassifier::from_config(config),
            network_timeout: config.network_timeout(),
        }
    }
}

/// A response produced by the router.
#[derive(Debug)]
pub struct RoutedResponse {
    pub response: FetchResponse,
    pub class: ResourceClass,
    /// Background refresh started alongside a cached answer.
    pub revalidation: Option<JoinHandle<()>>,
}

impl RoutedResponse {
    fn new(response: FetchResponse, class: ResourceClass) -> Self {
        Self {
            response,
            class,
            revalidation: None,
        }
    }
}

/// Answers intercepted requests from cache, network, or both.
#[derive(Clone)]
pub struct CacheStrategyRouter {
    config: Arc<RouterConfig>,
    shell_key: RequestKey,
    storage: Arc<dyn CacheStorage>,
    fetcher: Arc<dyn Fetch>,
}

impl CacheStrategyRouter {
    pub fn new(
        config: RouterConfig,
        storage: Arc<dyn CacheStorage>,
        fetcher: Arc<dyn Fetch>,
    ) -> Self {
        let shell_key = RequestKey::for_url(&config.scope);
        Self {
            config: Arc::new(config),
            shell_key,
            storage,
            fetcher,
        }
    }

    pub fn cache_name(&self) -> &str {
        &self.config.cache_name
    }

    /// Same-origin GET requests inside the scope.
    pub fn intercepts(&self, request: &FetchRequest) -> bool {
        RequestKey::for_request(request).is_some() && in_scope(&request.url, &self.config.scope)
    }

    /// Handle a fetch. `None` means the request is not intercepted and goes
    /// to the network untouched.
    pub async fn handle_fetch(
        &self,
        request: &FetchRequest,
    ) -> Option<Result<RoutedResponse, ServiceWorkerError>> {
        if !self.intercepts(request) {
            trace!(url = %request.url, method = %request.method, "Passing through");
            return None;
        }
        let key = RequestKey::for_request(request)?;
        let class = self.config.classifier.classify(request);
        debug!(url = %request.url, ?class, "Routing request");

        let result = match class.strategy() {
            Strategy::CacheFirstWithRefresh => self.cache_first_with_refresh(request, key).await,
            Strategy::CacheFirst => self.cache_first(request, key).await,
            Strategy::StaleWhileRevalidate => self.stale_while_revalidate(request, key).await,
            Strategy::NetworkFirst => self.network_first(request, key).await,
        };

        Some(result.map(|(response, revalidation)| RoutedResponse {
            revalidation,
            ..RoutedResponse::new(response, class)
        }))
    }

    // ==================== Strategies ====================

    async fn cache_first_with_refresh(
        &self,
        request: &FetchRequest,
        key: RequestKey,
    ) -> StrategyResult {
        if let Some(cached) = self.lookup(&key).await {
            let refresh = self.spawn_refresh(request.clone(), key);
            return Ok((cached, Some(refresh)));
        }

        match self.network(request).await {
            Ok(response) => {
                self.store(&key, &response).await;
                Ok((response, None))
            }
            Err(err) => {
                warn!(url = %request.url, error = %err, "Navigation failed, serving app shell");
                self.lookup(&self.shell_key)
                    .await
                    .map(|shell| (shell, None))
                    .ok_or_else(|| network_failure(request, &err))
            }
        }
    }

    async fn cache_first(&self, request: &FetchRequest, key: RequestKey) -> StrategyResult {
        if let Some(cached) = self.lookup(&key).await {
            return Ok((cached, None));
        }

        let response = self
            .network(request)
            .await
            .map_err(|err| network_failure(request, &err))?;
        self.store(&key, &response).await;
        Ok((response, None))
    }

    async fn stale_while_revalidate(
        &self,
        request: &FetchRequest,
        key: RequestKey,
    ) -> StrategyResult {
        if let Some(cached) = self.lookup(&key).await {
            let refresh = self.spawn_refresh(request.clone(), key);
            return Ok((cached, Some(refresh)));
        }

        let response = self
            .network(request)
            .await
            .map_err(|err| network_failure(request, &err))?;
        self.store(&key, &response).await;
        Ok((response, None))
    }

    async fn network_first(&self, request: &FetchRequest, key: RequestKey) -> StrategyResult {
        match self.network(request).await {
            Ok(response) => {
                self.store(&key, &response).await;
                Ok((response, None))
            }
            Err(err) => {
                debug!(url = %request.url, error = %err, "Network failed, trying cache");
                self.lookup(&key)
                    .await
                    .map(|cached| (cached, None))
                    .ok_or_else(|| network_failure(request, &err))
            }
        }
    }

    // ==================== Helpers ====================

    async fn network(&self, request: &FetchRequest) -> Result<FetchResponse, NetError> {
        let timeout = self.config.network_timeout;
        with_timeout(timeout, || self.fetcher.fetch(request))
            .await
            .unwrap_or(Err(NetError::Timeout(timeout)))
    }

    /// Cached response, treating unreadable entries as misses.
    async fn lookup(&self, key: &RequestKey) -> Option<FetchResponse> {
        match self.storage.get(&self.config.cache_name, key).await {
            Ok(Some(entry)) => match entry.to_response() {
                Ok(response) => {
                    trace!(key = %key, "Cache hit");
                    Some(response)
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Discarding unreadable cache entry");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(key = %key, error = %e, "Cache lookup failed");
                None
            }
        }
    }

    /// Store a successful response under `key`. Failures are logged only.
    async fn store(&self, key: &RequestKey, response: &FetchResponse) {
        if !response.ok() {
            trace!(key = %key, status = %response.status, "Not caching unsuccessful response");
            return;
        }
        let entry = CacheEntry::snapshot(response);
        match self
            .storage
            .put(&self.config.cache_name, key.clone(), entry)
            .await
        {
            Ok(()) => {}
            // Purged by a newer version's activation.
            Err(ServiceWorkerError::NotFound(_)) => {
                debug!(key = %key, cache = %self.config.cache_name, "Store gone, not caching")
            }
            Err(e) => warn!(key = %key, error = %e, "Cache write failed"),
        }
    }

    fn spawn_refresh(&self, request: FetchRequest, key: RequestKey) -> JoinHandle<()> {
        let router = self.clone();
        tokio::spawn(async move {
            match router.network(&request).await {
                Ok(response) => {
                    router.store(&key, &response).await;
                    trace!(key = %key, "Background refresh stored");
                }
                Err(e) => debug!(key = %key, error = %e, "Background refresh failed"),
            }
        })
    }
}

/// Whether `url` falls under `scope`. The scope path without its trailing
/// slash (`/app` for `/app/`) counts as the scope root.
pub fn in_scope(url: &Url, scope: &Url) -> bool {
    if url.origin() != scope.origin() {
        return false;
    }
    let path = url.path();
    path.starts_with(scope.path())
        || scope
            .path()
            .strip_suffix('/')
            .is_some_and(|root| !root.is_empty() && path == root)
}

type StrategyResult = Result<(FetchResponse, Option<JoinHandle<()>>), ServiceWorkerError>;

fn network_failure(request: &FetchRequest, err: &NetError) -> ServiceWorkerError {
    ServiceWorkerError::NetworkFailure(format!("{}: {err}", request.url))
}
