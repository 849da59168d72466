//! Protocol message types for broker communication.

use crate::version::ProtocolVersion;
use serde::{Deserialize, Serialize};

/// Message types that daemons send to the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageType {
    /// Handshake; must be the first frame on a connection
    Connect {
        #[serde(skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
    },

    /// Publish a payload to every current subscriber of `channel`
    Publish {
        /// Echoed back in the `Ack`
        seq: u64,
        channel: String,
        payload: String,
    },

    /// Start receiving `Message` frames for `channel`
    Subscribe { channel: String },

    /// Stop receiving frames for `channel`
    Unsubscribe { channel: String },

    Ping { seq: u64 },

    /// Client disconnecting gracefully
    Disconnect,
}

/// Frame sent from a daemon to the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientMessage {
    pub protocol_version: ProtocolVersion,

    #[serde(flatten)]
    pub message: MessageType,
}

impl ClientMessage {
    /// Wraps `message` with the current protocol version.
    pub fn new(message: MessageType) -> Self {
        Self {
            protocol_version: ProtocolVersion::CURRENT,
            message,
        }
    }

    pub fn connect(client_id: Option<String>) -> Self {
        Self::new(MessageType::Connect { client_id })
    }

    pub fn publish(seq: u64, channel: impl Into<String>, payload: impl Into<String>) -> Self {
        Self::new(MessageType::Publish {
            seq,
            channel: channel.into(),
            payload: payload.into(),
        })
    }

    pub fn subscribe(channel: impl Into<String>) -> Self {
        Self::new(MessageType::Subscribe {
            channel: channel.into(),
        })
    }

    pub fn unsubscribe(channel: impl Into<String>) -> Self {
        Self::new(MessageType::Unsubscribe {
            channel: channel.into(),
        })
    }

    pub fn ping(seq: u64) -> Self {
        Self::new(MessageType::Ping { seq })
    }

    pub fn disconnect() -> Self {
        Self::new(MessageType::Disconnect)
    }
}

/// Frames sent from the broker to daemons.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BrokerMessage {
    /// Handshake accepted
    Connected {
        protocol_version: ProtocolVersion,
        client_id: String,
    },

    /// Handshake refused (version mismatch, malformed hello)
    Rejected {
        reason: String,
        protocol_version: ProtocolVersion,
    },

    /// Receipt of a `Publish`; says nothing about delivery
    Ack {
        seq: u64,
        /// Subscribers the payload was handed to
        receivers: usize,
    },

    /// Subscription is live
    Subscribed { channel: String },

    /// A payload published on a channel this client subscribes to
    Message { channel: String, payload: String },

    Pong { seq: u64 },

    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
}

impl BrokerMessage {
    pub fn connected(client_id: String) -> Self {
        Self::Connected {
            protocol_version: ProtocolVersion::CURRENT,
            client_id,
        }
    }

    pub fn rejected(reason: &str) -> Self {
        Self::Rejected {
            reason: reason.to_string(),
            protocol_version: ProtocolVersion::CURRENT,
        }
    }

    pub fn ack(seq: u64, receivers: usize) -> Self {
        Self::Ack { seq, receivers }
    }

    pub fn subscribed(channel: impl Into<String>) -> Self {
        Self::Subscribed {
            channel: channel.into(),
        }
    }

    pub fn message(channel: impl Into<String>, payload: impl Into<String>) -> Self {
        Self::Message {
            channel: channel.into(),
            payload: payload.into(),
        }
    }

    pub fn pong(seq: u64) -> Self {
        Self::Pong { seq }
    }

    pub fn error(message: &str) -> Self {
        Self::Error {
            message: message.to_string(),
            code: None,
        }
    }

    pub fn error_with_code(message: &str, code: &str) -> Self {
        Self::Error {
            message: message.to_string(),
            code: Some(code.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_serialization() {
        let msg = ClientMessage::publish(7, "photo_channel", "{}");
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"publish\""));
        assert!(json.contains("\"seq\":7"));
        assert!(json.contains("\"protocol_version\":{\"major\":1,\"minor\":0}"));
    }

    #[test]
    fn test_broker_message_tagging() {
        let json = serde_json::to_string(&BrokerMessage::ack(3, 2)).unwrap();
        assert_eq!(json, r#"{"type":"ack","seq":3,"receivers":2}"#);
    }

    #[test]
    fn test_connect_omits_missing_client_id() {
        let json = serde_json::to_string(&ClientMessage::connect(None)).unwrap();
        assert!(!json.contains("client_id"));
    }

    #[test]
    fn test_unknown_type_rejected() {
        let raw = r#"{"protocol_version":{"major":1,"minor":0},"type":"teleport"}"#;
        assert!(serde_json::from_str::<ClientMessage>(raw).is_err());
    }
}
