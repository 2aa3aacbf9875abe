use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The closed set of message type bytes understood by the protocol.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[repr(u8)]
pub enum MessageType {
    /// Client authentication request.
    Auth = 0x01,
    /// Server acknowledgement of a successful authentication.
    AuthSuccess = 0x02,
    /// Server rejection of an authentication attempt.
    AuthError = 0x03,
    /// Client request to subscribe to a topic.
    Subscribe = 0x10,
    /// Client request to drop a topic subscription.
    Unsubscribe = 0x11,
    /// Server acknowledgement of a subscription.
    Subscribed = 0x12,
    /// Server acknowledgement of an unsubscription.
    Unsubscribed = 0x13,
    /// Client publication to a topic.
    Message = 0x20,
    /// Server-pushed publication delivered to a subscriber.
    ServerMessage = 0x21,
    /// Keepalive probe.
    Ping = 0x30,
    /// Keepalive response.
    Pong = 0x31,
    /// Typed error report.
    Error = 0xFF,
}

impl MessageType {
    /// Maps a wire type byte to its message type, or `None` if the byte is
    /// outside the valid set.
    pub const fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::Auth),
            0x02 => Some(Self::AuthSuccess),
            0x03 => Some(Self::AuthError),
            0x10 => Some(Self::Subscribe),
            0x11 => Some(Self::Unsubscribe),
            0x12 => Some(Self::Subscribed),
            0x13 => Some(Self::Unsubscribed),
            0x20 => Some(Self::Message),
            0x21 => Some(Self::ServerMessage),
            0x30 => Some(Self::Ping),
            0x31 => Some(Self::Pong),
            0xFF => Some(Self::Error),
            _ => None,
        }
    }

    /// The wire representation of this message type.
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Auth => "AUTH",
            Self::AuthSuccess => "AUTH_SUCCESS",
            Self::AuthError => "AUTH_ERROR",
            Self::Subscribe => "SUBSCRIBE",
            Self::Unsubscribe => "UNSUBSCRIBE",
            Self::Subscribed => "SUBSCRIBED",
            Self::Unsubscribed => "UNSUBSCRIBED",
            Self::Message => "MESSAGE",
            Self::ServerMessage => "SERVER_MESSAGE",
            Self::Ping => "PING",
            Self::Pong => "PONG",
            Self::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// Payload of an `AUTH` message.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthPayload {
    /// Bearer token to verify.
    pub token: String,
}

/// Payload of an `AUTH_SUCCESS` message.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthSuccessPayload {
    /// Identity the connection is now bound to.
    pub user_id: String,
    /// Human-readable confirmation.
    pub message: String,
}

/// Payload of `SUBSCRIBE` and `UNSUBSCRIBE` messages.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribePayload {
    /// Topic or topic pattern.
    pub topic: String,
}

/// Payload of a `SUBSCRIBED` acknowledgement.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribedPayload {
    /// The topic that was subscribed.
    pub topic: String,
    /// Broker-assigned subscription id, needed for unsubscription bookkeeping.
    pub subscription_id: String,
}

/// Payload of an `UNSUBSCRIBED` acknowledgement.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnsubscribedPayload {
    /// The topic that was unsubscribed.
    pub topic: String,
}

/// Payload of a client `MESSAGE` publication.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    /// Concrete topic to publish to.
    pub topic: String,
    /// Opaque message content.
    pub content: Value,
}

/// Payload of a server-pushed `SERVER_MESSAGE`.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessagePayload {
    /// Topic the publication was made on.
    pub topic: String,
    /// Opaque message content.
    pub content: Value,
    /// RFC 3339 timestamp of delivery.
    pub timestamp: String,
}

/// Payload of `PING` and `PONG` messages.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PingPayload {
    /// Sender clock in milliseconds since the Unix epoch.
    pub timestamp: i64,
}

/// Payload of an `ERROR` message.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable description.
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_bytes_round_trip() {
        for byte in 0..=u8::MAX {
            if let Some(ty) = MessageType::from_u8(byte) {
                assert_eq!(ty.as_u8(), byte);
            }
        }
    }

    #[test]
    fn rejects_bytes_outside_the_valid_set() {
        assert_eq!(MessageType::from_u8(0x00), None);
        assert_eq!(MessageType::from_u8(0x04), None);
        assert_eq!(MessageType::from_u8(0x32), None);
        assert_eq!(MessageType::from_u8(0xFE), None);
    }

    #[test]
    fn payload_field_names_are_camel_case() {
        let payload = SubscribedPayload {
            topic: "room".into(),
            subscription_id: "sub-1".into(),
        };
        let json = serde_json::to_value(&payload).expect("serializable");
        assert_eq!(json["subscriptionId"], "sub-1");
    }
}
