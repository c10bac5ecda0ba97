//! # PwaKit Common
//!
//! Shared error types, logging setup and configuration for the PwaKit
//! offline caching layer.
//!
//! ## Features
//!
//! - Unified error type for configuration and I/O failures
//! - Logging configuration and setup
//! - Timeout helper for network-bound futures
//! - `PwaConfig`, the single source of cache naming, manifest and timing knobs

use std::time::Duration;
use thiserror::Error;

pub mod config;
pub mod logging;
pub mod timeout;

pub use config::PwaConfig;
pub use logging::{init_logging, LogConfig, LogFormat};
pub use timeout::with_timeout;

/// Unified error type for PwaKit.
#[derive(Error, Debug)]
pub enum PwaKitError {
    /// Configuration errors.
    #[error("Config error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// I/O errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization errors.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Timeout errors.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Invalid argument.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl PwaKitError {
    /// Create a config error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// Create a config error with source.
    pub fn config_with_source<E: std::error::Error + Send + Sync + 'static>(
        message: impl Into<String>,
        source: E,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Get the error category for log fields.
    pub fn category(&self) -> &'static str {
        match self {
            PwaKitError::Config { .. } => "config",
            PwaKitError::Io(_) => "io",
            PwaKitError::Json(_) => "json",
            PwaKitError::Timeout(_) => "timeout",
            PwaKitError::InvalidArgument(_) => "invalid_argument",
        }
    }
}

/// Result type alias for PwaKit operations.
pub type Result<T> = std::result::Result<T, PwaKitError>;
