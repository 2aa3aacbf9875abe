//! Wire-level protocol for courier's framed TCP transport.
//!
//! A protocol unit on the wire is a length-prefixed frame:
//!
//! ```text
//! [u32 length (big-endian)] [u8 type] [payload (UTF-8 JSON)]
//! ```
//!
//! where `length` excludes itself and therefore equals `1 + payload length`.
//! [`FrameDecoder`] defragments the inbound byte stream into complete
//! [`Frame`]s, and [`Codec`] converts between frames and typed messages.

#![deny(missing_docs)]

mod codec;
mod error;
mod frame;
mod message;

pub use codec::{Codec, WireMessage};
pub use error::{StreamDecodingError, WireError};
pub use frame::{Frame, FrameDecoder, FrameDecoderStats, DEFAULT_MAX_FRAME_SIZE, HEADER_LEN};
pub use message::{
    AuthPayload, AuthSuccessPayload, ErrorPayload, MessagePayload, MessageType, PingPayload,
    ServerMessagePayload, SubscribePayload, SubscribedPayload, UnsubscribedPayload,
};
