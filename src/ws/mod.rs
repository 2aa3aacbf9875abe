//! The WebSocket front-end: a JSON text-framed analogue of the TCP session
//! with the same state machine and authorization rules.

mod session;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use session::WsFrontend;

/// Client → server messages, tagged by the `type` field.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Authenticate the session.
    #[serde(rename_all = "camelCase")]
    Auth {
        /// Bearer token to verify.
        token: String,
    },
    /// Subscribe to a topic.
    #[serde(rename_all = "camelCase")]
    Subscribe {
        /// Topic or topic pattern.
        topic: String,
    },
    /// Drop a topic subscription.
    #[serde(rename_all = "camelCase")]
    Unsubscribe {
        /// The subscribed topic.
        topic: String,
    },
    /// Publish to a topic.
    #[serde(rename_all = "camelCase")]
    Message {
        /// Concrete topic to publish to.
        topic: String,
        /// Opaque payload.
        data: Value,
        /// Optional publisher metadata.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<HashMap<String, String>>,
    },
    /// Application-level keepalive.
    Ping,
}

/// Server → client messages, tagged by the `type` field.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Authentication succeeded.
    #[serde(rename_all = "camelCase")]
    AuthSuccess {
        /// The authenticated identity.
        user_id: String,
    },
    /// Authentication failed; the session may retry.
    #[serde(rename_all = "camelCase")]
    AuthError {
        /// Human-readable description.
        message: String,
        /// Stable error code.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
    /// Subscription acknowledged.
    #[serde(rename_all = "camelCase")]
    Subscribed {
        /// The subscribed topic.
        topic: String,
    },
    /// Unsubscription acknowledged.
    #[serde(rename_all = "camelCase")]
    Unsubscribed {
        /// The unsubscribed topic.
        topic: String,
    },
    /// A publication delivered to this subscriber.
    #[serde(rename_all = "camelCase")]
    Message {
        /// Topic the publication was made on.
        topic: String,
        /// Opaque payload.
        data: Value,
        /// Publisher metadata.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<HashMap<String, String>>,
    },
    /// Typed error report.
    #[serde(rename_all = "camelCase")]
    Error {
        /// Stable error code.
        code: String,
        /// Human-readable description.
        message: String,
        /// Optional structured details.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<Value>,
    },
    /// Keepalive response.
    Pong,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn client_messages_parse_from_tagged_json() {
        let parsed: ClientMessage =
            serde_json::from_str(r#"{"type":"auth","token":"t"}"#).unwrap();
        assert_eq!(parsed, ClientMessage::Auth { token: "t".into() });

        let parsed: ClientMessage = serde_json::from_str(
            r#"{"type":"message","topic":"room","data":{"n":1},"metadata":{"k":"v"}}"#,
        )
        .unwrap();
        match parsed {
            ClientMessage::Message { topic, data, metadata } => {
                assert_eq!(topic, "room");
                assert_eq!(data, json!({ "n": 1 }));
                assert_eq!(metadata.unwrap()["k"], "v");
            }
            other => panic!("unexpected message: {other:?}"),
        }

        let parsed: ClientMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(parsed, ClientMessage::Ping);
    }

    #[test]
    fn server_messages_serialize_with_camel_case_fields() {
        let json = serde_json::to_value(ServerMessage::AuthSuccess {
            user_id: "u1".into(),
        })
        .unwrap();
        assert_eq!(json, json!({ "type": "auth_success", "userId": "u1" }));

        let json = serde_json::to_value(ServerMessage::Error {
            code: "FORBIDDEN".into(),
            message: "no".into(),
            details: None,
        })
        .unwrap();
        assert_eq!(json, json!({ "type": "error", "code": "FORBIDDEN", "message": "no" }));
    }
}
