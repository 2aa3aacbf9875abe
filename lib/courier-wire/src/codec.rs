use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;
use snafu::ResultExt;

use crate::error::{InvalidFrameSnafu, WireError};
use crate::frame::{Frame, DEFAULT_MAX_FRAME_SIZE, HEADER_LEN};
use crate::message::{
    AuthSuccessPayload, ErrorPayload, MessageType, PingPayload, ServerMessagePayload,
    SubscribedPayload, UnsubscribedPayload,
};

/// A decoded protocol message: the type byte plus its JSON payload.
///
/// Per-message-type schema validation is deliberately left to the session
/// handler; the codec only guarantees the payload is well-formed JSON.
#[derive(Clone, Debug, PartialEq)]
pub struct WireMessage {
    /// Decoded type byte.
    pub message_type: MessageType,
    /// Parsed JSON payload.
    pub data: Value,
}

/// Encodes typed messages into frames and decodes frames into messages.
#[derive(Clone, Debug)]
pub struct Codec {
    max_frame_size: usize,
}

impl Default for Codec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl Codec {
    /// Creates a codec enforcing the given maximum frame size on encode.
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// Serializes a payload and wraps it into a length-prefixed frame.
    ///
    /// Fails with [`WireError::FrameTooLarge`] when `1 + payload length`
    /// exceeds the configured maximum.
    pub fn encode<T: Serialize>(
        &self,
        message_type: MessageType,
        payload: &T,
    ) -> Result<Bytes, WireError> {
        let payload = serde_json::to_vec(payload).context(InvalidFrameSnafu)?;
        let frame_size = 1 + payload.len();
        if frame_size > self.max_frame_size {
            return Err(WireError::FrameTooLarge {
                size: frame_size,
                max: self.max_frame_size,
            });
        }

        let mut buf = BytesMut::with_capacity(HEADER_LEN + frame_size);
        buf.put_u32(frame_size as u32);
        buf.put_u8(message_type.as_u8());
        buf.put_slice(&payload);
        Ok(buf.freeze())
    }

    /// Parses a frame's payload into a [`WireMessage`].
    ///
    /// The type byte was already validated when the frame was cut out of the
    /// stream; JSON errors map to [`WireError::InvalidFrame`].
    pub fn decode(&self, frame: &Frame) -> Result<WireMessage, WireError> {
        let data = serde_json::from_slice(&frame.payload).context(InvalidFrameSnafu)?;
        Ok(WireMessage {
            message_type: frame.message_type,
            data,
        })
    }

    /// Encodes a typed `ERROR` frame.
    pub fn encode_error(&self, code: &str, message: &str) -> Result<Bytes, WireError> {
        self.encode(
            MessageType::Error,
            &ErrorPayload {
                code: code.to_owned(),
                message: message.to_owned(),
            },
        )
    }

    /// Encodes an `AUTH_SUCCESS` frame.
    pub fn encode_auth_success(&self, user_id: &str, message: &str) -> Result<Bytes, WireError> {
        self.encode(
            MessageType::AuthSuccess,
            &AuthSuccessPayload {
                user_id: user_id.to_owned(),
                message: message.to_owned(),
            },
        )
    }

    /// Encodes a `SUBSCRIBED` acknowledgement.
    pub fn encode_subscribed(&self, topic: &str, subscription_id: &str) -> Result<Bytes, WireError> {
        self.encode(
            MessageType::Subscribed,
            &SubscribedPayload {
                topic: topic.to_owned(),
                subscription_id: subscription_id.to_owned(),
            },
        )
    }

    /// Encodes an `UNSUBSCRIBED` acknowledgement.
    pub fn encode_unsubscribed(&self, topic: &str) -> Result<Bytes, WireError> {
        self.encode(
            MessageType::Unsubscribed,
            &UnsubscribedPayload {
                topic: topic.to_owned(),
            },
        )
    }

    /// Encodes a `SERVER_MESSAGE` push.
    pub fn encode_server_message(
        &self,
        topic: &str,
        content: &Value,
        timestamp: DateTime<Utc>,
    ) -> Result<Bytes, WireError> {
        self.encode(
            MessageType::ServerMessage,
            &ServerMessagePayload {
                topic: topic.to_owned(),
                content: content.clone(),
                timestamp: timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            },
        )
    }

    /// Encodes a `PING` probe.
    pub fn encode_ping(&self, timestamp: i64) -> Result<Bytes, WireError> {
        self.encode(MessageType::Ping, &PingPayload { timestamp })
    }

    /// Encodes a `PONG` response.
    pub fn encode_pong(&self, timestamp: i64) -> Result<Bytes, WireError> {
        self.encode(MessageType::Pong, &PingPayload { timestamp })
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use serde_json::json;
    use tokio_util::codec::Decoder;

    use super::*;
    use crate::frame::FrameDecoder;
    use crate::message::AuthPayload;

    fn decode_bytes(bytes: Bytes) -> Frame {
        let mut decoder = FrameDecoder::default();
        let mut src = BytesMut::from(&bytes[..]);
        decoder.decode(&mut src).unwrap().unwrap()
    }

    #[test]
    fn round_trips_a_message() {
        let codec = Codec::default();
        let payload = AuthPayload { token: "t".into() };

        let bytes = codec.encode(MessageType::Auth, &payload).unwrap();
        let decoded = codec.decode(&decode_bytes(bytes)).unwrap();

        assert_eq!(decoded.message_type, MessageType::Auth);
        assert_eq!(decoded.data, json!({ "token": "t" }));
    }

    #[test]
    fn encode_enforces_the_size_bound() {
        let codec = Codec::new(8);
        let error = codec
            .encode(MessageType::Message, &json!({ "content": "0123456789" }))
            .unwrap_err();
        assert!(matches!(error, WireError::FrameTooLarge { .. }));

        // 1 + payload length exactly at the bound still encodes.
        let codec = Codec::new(1 + "\"ok\"".len());
        assert!(codec.encode(MessageType::Message, &json!("ok")).is_ok());
    }

    #[test]
    fn decode_rejects_malformed_json() {
        let codec = Codec::default();
        let frame = Frame {
            message_type: MessageType::Message,
            payload: Bytes::from_static(b"{not json"),
        };
        let error = codec.decode(&frame).unwrap_err();
        assert!(matches!(error, WireError::InvalidFrame { .. }));
    }

    #[test]
    fn convenience_encoders_produce_typed_frames() {
        let codec = Codec::default();

        let frame = decode_bytes(codec.encode_error("UNAUTHORIZED", "nope").unwrap());
        assert_eq!(frame.message_type, MessageType::Error);
        let decoded = codec.decode(&frame).unwrap();
        assert_eq!(decoded.data["code"], "UNAUTHORIZED");

        let frame = decode_bytes(codec.encode_subscribed("room", "sub-1").unwrap());
        let decoded = codec.decode(&frame).unwrap();
        assert_eq!(decoded.data["subscriptionId"], "sub-1");

        let frame = decode_bytes(codec.encode_pong(42).unwrap());
        assert_eq!(frame.message_type, MessageType::Pong);
        let decoded = codec.decode(&frame).unwrap();
        assert_eq!(decoded.data["timestamp"], 42);
    }

    #[test]
    fn server_message_carries_rfc3339_timestamp() {
        let codec = Codec::default();
        let now = Utc::now();
        let frame = decode_bytes(
            codec
                .encode_server_message("room", &json!({ "t": 1 }), now)
                .unwrap(),
        );
        let decoded = codec.decode(&frame).unwrap();
        let stamp = decoded.data["timestamp"].as_str().unwrap();
        assert!(stamp.parse::<DateTime<Utc>>().is_ok());
    }
}
