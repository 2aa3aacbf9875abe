use snafu::Snafu;

/// An error that occurs while decoding a stream.
pub trait StreamDecodingError {
    /// Whether it is reasonable to assume that continuing to read from the
    /// stream in which this error occurred will not result in an indefinite
    /// hang up.
    ///
    /// This can occur e.g. when a frame header announces a size beyond the
    /// configured maximum and the buffer has been discarded, so it can no
    /// longer be determined where the next header starts.
    fn can_continue(&self) -> bool;
}

/// An error produced by the frame decoder or the message codec.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum WireError {
    /// The announced frame size exceeds the configured maximum.
    #[snafu(display("frame of {size} bytes exceeds maximum of {max} bytes"))]
    FrameTooLarge {
        /// Size announced by the frame header.
        size: usize,
        /// Configured maximum frame size.
        max: usize,
    },

    /// The frame carries a type byte outside the valid set.
    #[snafu(display("invalid message type byte 0x{ty:02x}"))]
    InvalidMessageType {
        /// The offending type byte.
        ty: u8,
    },

    /// The frame payload is not well-formed JSON.
    #[snafu(display("invalid frame payload: {source}"))]
    InvalidFrame {
        /// The underlying JSON error.
        source: serde_json::Error,
    },

    /// An I/O error occurred while reading from the stream.
    #[snafu(display("i/o error while reading frame: {source}"), context(false))]
    Io {
        /// The underlying I/O error.
        source: std::io::Error,
    },
}

impl StreamDecodingError for WireError {
    fn can_continue(&self) -> bool {
        match self {
            // The poisoned frame was skipped in full, the stream is still in
            // sync on the next header.
            Self::InvalidMessageType { .. } => true,
            // Payload validation happens after the frame was consumed.
            Self::InvalidFrame { .. } => true,
            // The buffer was discarded, subsequent reads would misinterpret
            // payload bytes as headers.
            Self::FrameTooLarge { .. } => false,
            Self::Io { .. } => false,
        }
    }
}
