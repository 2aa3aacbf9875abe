use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::Decoder;
use tracing::trace;

use crate::error::WireError;
use crate::message::MessageType;

/// Default upper bound on the announced frame size (1 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Length of the frame header: a big-endian `u32` size prefix.
pub const HEADER_LEN: usize = 4;

/// A complete protocol frame cut out of the byte stream.
///
/// The payload excludes the header and the type byte; its length is exactly
/// `announced size - 1`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Frame {
    /// Decoded type byte.
    pub message_type: MessageType,
    /// Raw payload bytes (expected to be UTF-8 JSON, validated by the codec).
    pub payload: Bytes,
}

/// Counters accumulated by a [`FrameDecoder`] over its lifetime.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FrameDecoderStats {
    /// Complete frames emitted.
    pub frames_parsed: u64,
    /// Bytes consumed from the stream, including headers and skipped frames.
    pub bytes_processed: u64,
    /// Protocol errors observed.
    pub errors: u64,
}

/// Stateful decoder that defragments a byte stream into complete [`Frame`]s.
///
/// Each connection owns exactly one decoder; it is driven either by a
/// [`FramedRead`](tokio_util::codec::FramedRead) or by feeding chunks into
/// [`Decoder::decode`] manually.
///
/// Error recovery: a frame with an unknown type byte is skipped in full, so a
/// single poisoned frame does not desync the stream. An oversized frame
/// discards the buffer, after which resynchronization is impossible and the
/// caller must hang up (see
/// [`StreamDecodingError::can_continue`](crate::StreamDecodingError)).
#[derive(Debug)]
pub struct FrameDecoder {
    max_frame_size: usize,
    stats: FrameDecoderStats,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl FrameDecoder {
    /// Creates a decoder enforcing the given maximum announced frame size.
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            max_frame_size,
            stats: FrameDecoderStats::default(),
        }
    }

    /// Snapshot of the decoder counters.
    pub fn stats(&self) -> FrameDecoderStats {
        self.stats
    }

    /// Clears the counters.
    ///
    /// The buffer lives with the framed reader driving this decoder; the
    /// fatal-error path discards it before the error is surfaced, so a reset
    /// only needs to zero the counters when a connection is recycled.
    pub fn reset(&mut self) {
        self.stats = FrameDecoderStats::default();
    }
}

impl Decoder for FrameDecoder {
    type Item = Frame;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, WireError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let frame_size = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;

        if frame_size > self.max_frame_size {
            self.stats.errors += 1;
            self.stats.bytes_processed += src.len() as u64;
            src.clear();
            return Err(WireError::FrameTooLarge {
                size: frame_size,
                max: self.max_frame_size,
            });
        }

        if frame_size == 0 {
            // A frame must carry at least the type byte.
            self.stats.errors += 1;
            self.stats.bytes_processed += HEADER_LEN as u64;
            src.advance(HEADER_LEN);
            return Err(WireError::InvalidMessageType { ty: 0x00 });
        }

        if src.len() < HEADER_LEN + frame_size {
            // Awaiting the rest of the frame.
            return Ok(None);
        }

        let ty = src[HEADER_LEN];
        let Some(message_type) = MessageType::from_u8(ty) else {
            // Skip the poisoned frame, the stream stays in sync.
            self.stats.errors += 1;
            self.stats.bytes_processed += (HEADER_LEN + frame_size) as u64;
            src.advance(HEADER_LEN + frame_size);
            return Err(WireError::InvalidMessageType { ty });
        };

        let mut frame = src.split_to(HEADER_LEN + frame_size);
        frame.advance(HEADER_LEN + 1);

        self.stats.frames_parsed += 1;
        self.stats.bytes_processed += (HEADER_LEN + frame_size) as u64;
        trace!(%message_type, payload_len = frame.len(), "Decoded frame.");

        Ok(Some(Frame {
            message_type,
            payload: frame.freeze(),
        }))
    }
}
