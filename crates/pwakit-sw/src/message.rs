//! Page/worker message protocol.
//!
//! Pages send JSON objects tagged by `type`. Version queries carry a
//! [`ReplyPort`]; the worker answers on it with `{ "version": "..." }`.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::oneshot;

use crate::ServiceWorkerError;

/// Page → worker messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Promote the waiting version now.
    #[serde(rename = "SKIP_WAITING")]
    ForceActivate,
    /// Ask for the running cache version.
    #[serde(rename = "GET_VERSION")]
    QueryVersion,
}

impl ClientMessage {
    /// Parse a raw message; anything unrecognized is `None`.
    pub fn parse(data: &JsonValue) -> Option<Self> {
        Self::deserialize(data).ok()
    }

    /// Wire form, from the serde attributes above.
    pub fn to_json(&self) -> JsonValue {
        to_wire(self)
    }
}

/// Worker → page messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WorkerMessage {
    VersionReply { version: String },
}

impl WorkerMessage {
    pub fn parse(data: &JsonValue) -> Option<Self> {
        Self::deserialize(data).ok()
    }

    pub fn to_json(&self) -> JsonValue {
        to_wire(self)
    }
}

// Unit variants and string fields always serialize.
fn to_wire<T: Serialize>(message: &T) -> JsonValue {
    serde_json::to_value(message).unwrap_or_default()
}

// ==================== MessageChannel ====================

/// Sending half handed to the worker with a message.
#[derive(Debug)]
pub struct ReplyPort {
    tx: oneshot::Sender<JsonValue>,
}

impl ReplyPort {
    /// Post the reply. Consumes the port; a reply is sent at most once.
    pub fn post_message(self, data: JsonValue) -> Result<(), ServiceWorkerError> {
        self.tx
            .send(data)
            .map_err(|_| ServiceWorkerError::StateError("reply port closed".to_string()))
    }
}

/// Receiving half kept by the page.
#[derive(Debug)]
pub struct ReplyReceiver {
    rx: oneshot::Receiver<JsonValue>,
}

impl ReplyReceiver {
    pub async fn recv(self) -> Result<JsonValue, ServiceWorkerError> {
        self.rx
            .await
            .map_err(|_| ServiceWorkerError::StateError("reply port dropped".to_string()))
    }
}

/// A one-shot request/reply channel.
#[derive(Debug)]
pub struct MessageChannel {
    pub port1: ReplyReceiver,
    pub port2: ReplyPort,
}

impl MessageChannel {
    pub fn new() -> Self {
        let (tx, rx) = oneshot::channel();
        Self {
            port1: ReplyReceiver { rx },
            port2: ReplyPort { tx },
        }
    }
}

impl Default for MessageChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_wire_names() {
        assert_eq!(
            ClientMessage::parse(&json!({ "type": "SKIP_WAITING" })),
            Some(ClientMessage::ForceActivate)
        );
        assert_eq!(
            ClientMessage::parse(&json!({ "type": "GET_VERSION" })),
            Some(ClientMessage::QueryVersion)
        );
    }

    #[test]
    fn test_parse_ignores_extra_fields() {
        assert_eq!(
            ClientMessage::parse(&json!({ "type": "SKIP_WAITING", "from": "banner" })),
            Some(ClientMessage::ForceActivate)
        );
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for data in [
            json!(null),
            json!("SKIP_WAITING"),
            json!({}),
            json!({ "type": "CLEAR_ALL" }),
            json!({ "type": 7 }),
        ] {
            assert_eq!(ClientMessage::parse(&data), None, "{data}");
        }
    }

    #[test]
    fn test_to_json_uses_wire_names() {
        let cases = [
            (ClientMessage::ForceActivate, json!({ "type": "SKIP_WAITING" })),
            (ClientMessage::QueryVersion, json!({ "type": "GET_VERSION" })),
        ];
        for (message, wire) in cases {
            assert_eq!(message.to_json(), wire);
            assert_eq!(ClientMessage::parse(&message.to_json()), Some(message));
        }
    }

    #[test]
    fn test_version_reply_shape() {
        let reply = WorkerMessage::VersionReply {
            version: "v3".to_string(),
        };
        assert_eq!(reply.to_json(), json!({ "version": "v3" }));
        assert_eq!(WorkerMessage::parse(&json!({ "version": "v3" })), Some(reply));
    }

    #[tokio::test]
    async fn test_channel_delivers_once() {
        let channel = MessageChannel::new();
        channel.port2.post_message(json!({ "version": "v1" })).unwrap();
        assert_eq!(channel.port1.recv().await.unwrap(), json!({ "version": "v1" }));
    }

    #[tokio::test]
    async fn test_dropped_port_is_an_error() {
        let MessageChannel { port1, port2 } = MessageChannel::new();
        drop(port2);
        assert!(port1.recv().await.is_err());
    }
}
