//! Request classification.
//!
//! Classification looks only at the request itself. Precedence is fixed and
//! first match wins: navigation, then engine extension, then static
//! extension, then everything else.

use pwakit_common::PwaConfig;
use pwakit_net::FetchRequest;
use url::Url;

/// Resource class of an intercepted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceClass {
    /// Top-level document load.
    Navigation,
    /// The compiled computation unit.
    EngineBinary,
    /// Scripts, styles, images, icons, manifests.
    StaticAsset,
    Other,
}

/// Caching strategy applied to a class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Serve cache, refresh in the background, fall back to the app shell.
    CacheFirstWithRefresh,
    /// Serve cache; only a miss reaches the network.
    CacheFirst,
    StaleWhileRevalidate,
    NetworkFirst,
}

impl ResourceClass {
    pub fn strategy(self) -> Strategy {
        match self {
            ResourceClass::Navigation => Strategy::CacheFirstWithRefresh,
            ResourceClass::EngineBinary => Strategy::CacheFirst,
            ResourceClass::StaticAsset => Strategy::StaleWhileRevalidate,
            ResourceClass::Other => Strategy::NetworkFirst,
        }
    }
}

/// Maps requests to classes by mode and file extension.
#[derive(Debug, Clone)]
pub struct ResourceClassifier {
    engine_extensions: Vec<String>,
    static_extensions: Vec<String>,
}

impl ResourceClassifier {
    pub fn new<E, S>(engine_extensions: E, static_extensions: S) -> Self
    where
        E: IntoIterator,
        E::Item: AsRef<str>,
        S: IntoIterator,
        S::Item: AsRef<str>,
    {
        let normalize = |ext: &str| ext.trim_start_matches('.').to_ascii_lowercase();
        Self {
            engine_extensions: engine_extensions
                .into_iter()
                .map(|e| normalize(e.as_ref()))
                .collect(),
            static_extensions: static_extensions
                .into_iter()
                .map(|e| normalize(e.as_ref()))
                .collect(),
        }
    }

    pub fn from_config(config: &PwaConfig) -> Self {
        Self::new(&config.engine_extensions, &config.static_extensions)
    }

    pub fn classify(&self, request: &FetchRequest) -> ResourceClass {
        if request.is_navigation() {
            return ResourceClass::Navigation;
        }

        match extension(&request.url) {
            Some(ext) if self.engine_extensions.contains(&ext) => ResourceClass::EngineBinary,
            Some(ext) if self.static_extensions.contains(&ext) => ResourceClass::StaticAsset,
            _ => ResourceClass::Other,
        }
    }
}

impl Default for ResourceClassifier {
    fn default() -> Self {
        Self::from_config(&PwaConfig::default())
    }
}

/// Lowercased extension of the last path segment.
fn extension(url: &Url) -> Option<String> {
    let segment = url.path_segments()?.next_back()?;
    let (stem, ext) = segment.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}
