//! Install-time precaching and activation-time eviction.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::try_join_all;
use pwakit_common::with_timeout;
use pwakit_net::{Fetch, FetchRequest};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use crate::storage::{CacheEntry, CacheStorage, RequestKey};
use crate::ServiceWorkerError;

/// Build tag embedded in the store name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheVersion(String);

impl CacheVersion {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Store name for this version under `prefix`.
    pub fn store_name(&self, prefix: &str) -> String {
        format!("{prefix}-{}", self.0)
    }
}

impl fmt::Display for CacheVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Ordered set of app shell paths, relative to the scope.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PrecacheManifest {
    entries: Vec<String>,
}

impl PrecacheManifest {
    /// Build a manifest, dropping repeated entries but keeping first-seen order.
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut unique: Vec<String> = Vec::new();
        for entry in entries {
            let entry = entry.into();
            if !unique.contains(&entry) {
                unique.push(entry);
            }
        }
        Self { entries: unique }
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Absolute URLs, resolved against `scope`.
    pub fn resolve(&self, scope: &Url) -> Result<Vec<Url>, ServiceWorkerError> {
        self.entries
            .iter()
            .map(|entry| {
                scope.join(entry).map_err(|e| {
                    ServiceWorkerError::InvalidBuild(format!("bad manifest entry {entry:?}: {e}"))
                })
            })
            .collect()
    }
}

/// Outcome of a successful install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReport {
    pub cache_name: String,
    pub cached: usize,
}

/// Outcome of an activation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivationReport {
    pub kept: String,
    pub purged: Vec<String>,
}

/// Owns precache population and old-version eviction for one version.
pub struct CacheLifecycleManager {
    version: CacheVersion,
    cache_name: String,
    manifest: PrecacheManifest,
    scope: Url,
    storage: Arc<dyn CacheStorage>,
    fetcher: Arc<dyn Fetch>,
    network_timeout: Duration,
}

impl CacheLifecycleManager {
    pub fn new(
        version: CacheVersion,
        cache_name: String,
        manifest: PrecacheManifest,
        scope: Url,
        storage: Arc<dyn CacheStorage>,
        fetcher: Arc<dyn Fetch>,
        network_timeout: Duration,
    ) -> Self {
        Self {
            version,
            cache_name,
            manifest,
            scope,
            storage,
            fetcher,
            network_timeout,
        }
    }

    pub fn version(&self) -> &CacheVersion {
        &self.version
    }

    pub fn cache_name(&self) -> &str {
        &self.cache_name
    }

    pub fn manifest(&self) -> &PrecacheManifest {
        &self.manifest
    }

    /// Precache every manifest entry, all or nothing.
    ///
    /// On failure nothing is written, and a store this call created is
    /// removed again.
    pub async fn install(&self) -> Result<InstallReport, ServiceWorkerError> {
        info!(cache = %self.cache_name, entries = self.manifest.len(), "Installing");

        let urls = self.manifest.resolve(&self.scope)?;
        let created = self.storage.open(&self.cache_name).await?;

        let fetched = try_join_all(urls.iter().map(|url| self.fetch_for_precache(url))).await;
        let entries = match fetched {
            Ok(entries) => entries,
            Err(err) => {
                self.abandon(created).await;
                warn!(cache = %self.cache_name, error = %err, "Install aborted");
                return Err(err);
            }
        };

        let cached = entries.len();
        if let Err(err) = self.storage.put_all(&self.cache_name, entries).await {
            self.abandon(created).await;
            warn!(cache = %self.cache_name, error = %err, "Install aborted");
            return Err(err);
        }

        info!(cache = %self.cache_name, cached, "Install complete");
        Ok(InstallReport {
            cache_name: self.cache_name.clone(),
            cached,
        })
    }

    /// Delete every store but this version's.
    pub async fn activate(&self) -> Result<ActivationReport, ServiceWorkerError> {
        let mut purged = Vec::new();
        for name in self.storage.list_names().await? {
            if name == self.cache_name {
                continue;
            }
            if self.storage.delete_cache(&name).await? {
                debug!(cache = %name, "Purged old store");
                purged.push(name);
            }
        }

        info!(cache = %self.cache_name, purged = purged.len(), "Activated");
        Ok(ActivationReport {
            kept: self.cache_name.clone(),
            purged,
        })
    }

    async fn fetch_for_precache(
        &self,
        url: &Url,
    ) -> Result<(RequestKey, CacheEntry), ServiceWorkerError> {
        let request = FetchRequest::get(url.clone());
        let precache_failed = |reason: String| ServiceWorkerError::PrecacheFailed {
            url: url.to_string(),
            reason,
        };

        let response = with_timeout(self.network_timeout, || self.fetcher.fetch(&request))
            .await
            .map_err(|e| precache_failed(e.to_string()))?
            .map_err(|e| precache_failed(e.to_string()))?;

        if !response.ok() {
            return Err(precache_failed(response.status.to_string()));
        }

        Ok((RequestKey::for_url(url), CacheEntry::snapshot(&response)))
    }

    async fn abandon(&self, created: bool) {
        if !created {
            return;
        }
        if let Err(e) = self.storage.delete_cache(&self.cache_name).await {
            warn!(cache = %self.cache_name, error = %e, "Could not remove abandoned store");
        }
    }
}
