//! Worker-side handling of page control messages.

use std::sync::Weak;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use crate::lifecycle::CacheVersion;
use crate::message::{ClientMessage, ReplyPort, WorkerMessage};
use crate::{ServiceWorkerError, ServiceWorkerId};

/// Host hook that promotes a waiting worker.
#[async_trait]
pub trait SkipWaiting: Send + Sync {
    /// Activate `worker` if it is waiting. Returns whether it was activated.
    async fn skip_waiting(&self, worker: ServiceWorkerId) -> Result<bool, ServiceWorkerError>;
}

/// What a message turned into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handled {
    /// `SKIP_WAITING`; `activated` is false when there was nothing to do.
    SkipWaiting { activated: bool },
    /// `GET_VERSION` answered.
    VersionSent,
    /// `GET_VERSION` without a reply port.
    VersionDropped,
    /// Unrecognized message.
    Ignored,
}

/// Answers `SKIP_WAITING` and `GET_VERSION` for one worker.
pub struct UpdateCoordinator {
    worker: ServiceWorkerId,
    version: CacheVersion,
    host: Weak<dyn SkipWaiting>,
}

impl UpdateCoordinator {
    pub fn new(worker: ServiceWorkerId, version: CacheVersion, host: Weak<dyn SkipWaiting>) -> Self {
        Self {
            worker,
            version,
            host,
        }
    }

    pub fn version(&self) -> &CacheVersion {
        &self.version
    }

    /// Handle one raw message. Never fails: problems are logged and the
    /// message is treated as handled.
    pub async fn handle_message(&self, data: &JsonValue, reply: Option<ReplyPort>) -> Handled {
        let Some(message) = ClientMessage::parse(data) else {
            debug!(worker = self.worker.raw(), %data, "Ignoring unrecognized message");
            return Handled::Ignored;
        };

        match message {
            ClientMessage::ForceActivate => Handled::SkipWaiting {
                activated: self.force_activate().await,
            },
            ClientMessage::QueryVersion => self.reply_version(reply),
        }
    }

    async fn force_activate(&self) -> bool {
        let Some(host) = self.host.upgrade() else {
            debug!(worker = self.worker.raw(), "Registration gone, skip waiting ignored");
            return false;
        };

        match host.skip_waiting(self.worker).await {
            Ok(activated) => {
                if activated {
                    info!(worker = self.worker.raw(), version = %self.version, "Skipped waiting");
                } else {
                    debug!(worker = self.worker.raw(), "Nothing waiting, skip waiting is a no-op");
                }
                activated
            }
            Err(e) => {
                warn!(worker = self.worker.raw(), error = %e, "Skip waiting failed");
                false
            }
        }
    }

    fn reply_version(&self, reply: Option<ReplyPort>) -> Handled {
        let Some(port) = reply else {
            debug!(worker = self.worker.raw(), "Version query without reply port");
            return Handled::VersionDropped;
        };

        let message = WorkerMessage::VersionReply {
            version: self.version.to_string(),
        };
        if let Err(e) = port.post_message(message.to_json()) {
            debug!(worker = self.worker.raw(), error = %e, "Version reply not delivered");
        }
        Handled::VersionSent
    }
}
