//! # PwaKit Page
//!
//! The page half of the offline layer.
//!
//! ## Features
//!
//! - **Lifecycle bridge**: registers the worker at the app's base path,
//!   checks for updates, applies them and replays the install prompt
//! - **Page events**: `pwa:installable`, `pwa:installed`, `pwa:online`,
//!   `pwa:offline`, `pwa:updateavailable` through an explicit observer list
//! - **Connectivity UI**: offline panel, minimized indicator and update
//!   banner state with a cancelable visibility timer
//!
//! ## Wiring
//!
//! ```text
//! ConnectivityMonitor ──pwa:online/offline──▶ PageEventBus ◀──pwa:updateavailable── ClientLifecycleBridge
//!                                                  │                                         ▲
//!                                                  ▼                                         │
//!                                  ConnectivityUiStateMachine ──UiCommand──▶ serve_commands ─┘
//! ```

use thiserror::Error;

pub mod bridge;
pub mod connectivity;
pub mod events;
pub mod session;

pub use bridge::{serve_commands, ClientLifecycleBridge, InstallOutcome, InstallPromptEvent, PageHost};
pub use connectivity::{
    ConnectivityMonitor, ConnectivityState, ConnectivityUiStateMachine, UiCommand, UiInput,
    UiView, UpdateState, VisibilityTimer,
};
pub use events::{EventHandler, PageEvent, PageEventBus, SubscriptionId};
pub use session::PageSession;

/// Page-side errors.
#[derive(Error, Debug)]
pub enum PageError {
    #[error("No service worker registered for this page")]
    NotRegistered,

    #[error("Service worker error: {0}")]
    Worker(#[from] pwakit_sw::ServiceWorkerError),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error(transparent)]
    Common(#[from] pwakit_common::PwaKitError),

    #[error("Unexpected reply: {0}")]
    UnexpectedReply(String),

    #[error("Page session closed")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_error_display() {
        assert_eq!(
            PageError::NotRegistered.to_string(),
            "No service worker registered for this page"
        );
        let timeout: PageError = pwakit_common::PwaKitError::Timeout(Duration::from_secs(30)).into();
        assert!(timeout.to_string().contains("30s"));
    }
}
