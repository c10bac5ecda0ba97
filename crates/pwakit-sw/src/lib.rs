//! # PwaKit Service Worker
//!
//! The background half of the offline layer.
//!
//! ## Features
//!
//! - **Strategy routing**: every same-origin GET in scope is classified and
//!   answered cache-first, stale-while-revalidate or network-first
//! - **Cache lifecycle**: atomic precache on install, purge of every other
//!   store on activation
//! - **Update coordination**: `SKIP_WAITING` / `GET_VERSION` messages from pages
//! - **Registration model**: installing / waiting / active slots, controlled
//!   clients, lifecycle events for pages
//!
//! ## Architecture
//!
//! ```text
//! ServiceWorkerContainer
//!     │
//!     └── ServiceWorkerRegistration (scope)
//!             ├── installing ─┐
//!             ├── waiting    ─┼── ServiceWorker
//!             └── active     ─┘       ├── CacheStrategyRouter   (fetch)
//!                                     ├── CacheLifecycleManager (install / activate)
//!                                     └── UpdateCoordinator     (messages)
//!
//! CacheStorage (trait)
//!     ├── MemoryCacheStorage
//!     └── DiskCacheStorage
//!             └── "<prefix>-<version>" → RequestKey → CacheEntry
//! ```
//!
//! A worker keeps no state of its own between events; everything durable
//! lives in the [`CacheStorage`].

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod classify;
pub mod coordinator;
pub mod disk;
pub mod lifecycle;
pub mod message;
pub mod registration;
pub mod router;
pub mod storage;

pub use classify::{ResourceClass, ResourceClassifier, Strategy};
pub use coordinator::{Handled, SkipWaiting, UpdateCoordinator};
pub use disk::DiskCacheStorage;
pub use lifecycle::{
    ActivationReport, CacheLifecycleManager, CacheVersion, InstallReport, PrecacheManifest,
};
pub use message::{ClientMessage, MessageChannel, ReplyPort, ReplyReceiver, WorkerMessage};
pub use registration::{
    BuildSource, RegistrationEvent, RemoteBuildSource, ServiceWorker, ServiceWorkerContainer,
    ServiceWorkerRegistration, StaticBuildSource, UpdateOutcome, WorkerBuild, WorkerEnvironment,
    WorkerTarget,
};
pub use router::{CacheStrategyRouter, RoutedResponse, RouterConfig};
pub use storage::{CacheEntry, CacheStorage, MemoryCacheStorage, RequestKey};

// ==================== Errors ====================

/// Errors that can occur in service worker operations.
#[derive(Error, Debug)]
pub enum ServiceWorkerError {
    #[error("Registration failed: {0}")]
    RegistrationFailed(String),

    #[error("Security error: {0}")]
    SecurityError(String),

    #[error("Network failure: {0}")]
    NetworkFailure(String),

    #[error("Precache of {url} failed: {reason}")]
    PrecacheFailed { url: String, reason: String },

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("State error: {0}")]
    StateError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid build: {0}")]
    InvalidBuild(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

// ==================== Types ====================

/// Unique identifier for a service worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Service worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ServiceWorkerState {
    /// Build fetched, nothing run yet.
    #[default]
    Parsed,
    /// Precaching.
    Installing,
    /// Installed but waiting for activation.
    Installed,
    /// Purging old stores.
    Activating,
    /// Active and controlling pages.
    Activated,
    /// Replaced, or install failed.
    Redundant,
}
