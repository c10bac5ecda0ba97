//! PWA configuration

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::PwaKitError;

/// Configuration shared by the background worker and the page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PwaConfig {
    /// Logical cache name; the version tag is appended to it.
    pub cache_prefix: String,

    /// Build tag. Changing it is what evicts every previous store.
    pub cache_version: String,

    /// Deployed base path, which is also the worker scope.
    pub base_path: String,

    /// Worker script (build descriptor) path, relative to the base path.
    pub worker_script: String,

    /// App shell assets, relative to the base path, in install order.
    pub precache: Vec<String>,

    /// Extensions served strictly cache-first (the compiled engine).
    pub engine_extensions: Vec<String>,

    /// Extensions served stale-while-revalidate.
    pub static_extensions: Vec<String>,

    /// Upper bound for a single network fetch issued by the worker.
    pub network_timeout_ms: u64,

    /// How often the page asks the registration to look for a new build.
    pub update_check_interval_secs: u64,

    /// How long the full offline panel stays up before collapsing.
    pub offline_banner_timeout_ms: u64,
}

impl Default for PwaConfig {
    fn default() -> Self {
        Self {
            cache_prefix: "vectorizer".to_string(),
            cache_version: option_env!("PWAKIT_BUILD_TAG")
                .unwrap_or(env!("CARGO_PKG_VERSION"))
                .to_string(),
            base_path: "/".to_string(),
            worker_script: "sw.json".to_string(),
            precache: [
                "./",
                "./manifest.json",
                "./icons/icon-192.png",
                "./icons/icon-512.png",
                "./icons/apple-touch-icon.png",
                "./logo.svg",
                "./logo.png",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            engine_extensions: vec!["wasm".to_string()],
            static_extensions: [
                "js",
                "mjs",
                "css",
                "png",
                "jpg",
                "jpeg",
                "gif",
                "svg",
                "ico",
                "webp",
                "woff",
                "woff2",
                "json",
                "webmanifest",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            network_timeout_ms: 30_000,
            update_check_interval_secs: 60 * 60,
            offline_banner_timeout_ms: 8_000,
        }
    }
}

impl PwaConfig {
    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, PwaKitError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, PwaKitError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            PwaKitError::config_with_source(format!("cannot read {}", path.display()), e)
        })?;
        Self::from_json_str(&raw)
    }

    /// Check the invariants the worker relies on.
    pub fn validate(&self) -> Result<(), PwaKitError> {
        if self.cache_prefix.trim().is_empty() {
            return Err(PwaKitError::config("cache_prefix must not be empty"));
        }
        if self.cache_version.trim().is_empty() {
            return Err(PwaKitError::config("cache_version must not be empty"));
        }
        if !self.base_path.starts_with('/') || !self.base_path.ends_with('/') {
            return Err(PwaKitError::config(format!(
                "base_path must start and end with '/': {:?}",
                self.base_path
            )));
        }
        if self.precache.is_empty() {
            return Err(PwaKitError::config("precache manifest must not be empty"));
        }
        if let Some(ext) = self
            .engine_extensions
            .iter()
            .find(|ext| self.static_extensions.contains(ext))
        {
            return Err(PwaKitError::config(format!(
                "extension {ext:?} is listed as both engine and static"
            )));
        }
        Ok(())
    }

    /// Name of the store for the current version.
    pub fn cache_name(&self) -> String {
        format!("{}-{}", self.cache_prefix, self.cache_version)
    }

    pub fn network_timeout(&self) -> Duration {
        Duration::from_millis(self.network_timeout_ms)
    }

    pub fn update_check_interval(&self) -> Duration {
        Duration::from_secs(self.update_check_interval_secs)
    }

    pub fn offline_banner_timeout(&self) -> Duration {
        Duration::from_millis(self.offline_banner_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = PwaConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.precache[0], "./");
        assert_eq!(config.offline_banner_timeout(), Duration::from_secs(8));
        assert_eq!(config.update_check_interval(), Duration::from_secs(3600));
    }

    #[test]
    fn test_cache_name_embeds_version() {
        let config = PwaConfig {
            cache_version: "build-42".to_string(),
            ..Default::default()
        };
        assert_eq!(config.cache_name(), "vectorizer-build-42");
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config =
            PwaConfig::from_json_str(r#"{ "cache_version": "abc", "base_path": "/app/" }"#)
                .unwrap();
        assert_eq!(config.cache_version, "abc");
        assert_eq!(config.base_path, "/app/");
        assert_eq!(config.engine_extensions, vec!["wasm".to_string()]);
    }

    #[test]
    fn test_rejects_bad_base_path() {
        let err = PwaConfig::from_json_str(r#"{ "base_path": "app" }"#).unwrap_err();
        assert_eq!(err.category(), "config");
    }

    #[test]
    fn test_rejects_overlapping_extensions() {
        let config = PwaConfig {
            engine_extensions: vec!["js".to_string()],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "cache_prefix": "shell", "cache_version": "v9" }}"#).unwrap();

        let config = PwaConfig::load(file.path()).unwrap();
        assert_eq!(config.cache_name(), "shell-v9");
    }

    #[test]
    fn test_load_missing_file() {
        let err = PwaConfig::load("/definitely/not/here.json").unwrap_err();
        assert!(err.to_string().contains("cannot read"));
    }
}
