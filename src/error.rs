//! The server-wide error taxonomy.
//!
//! Every front-end maps these kinds onto a typed ERROR reply with a stable
//! machine-readable code; only the fatal kinds tear the connection down.

use courier_wire::WireError;
use snafu::Snafu;

/// Result alias used throughout the server.
pub type Result<T, E = ServerError> = std::result::Result<T, E>;

/// Closed set of error kinds surfaced by the messaging core.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ServerError {
    /// Malformed or incomplete client input.
    #[snafu(display("invalid input: {message}"))]
    InvalidInput {
        /// What was wrong with the input.
        message: String,
    },

    /// The operation requires authentication.
    #[snafu(display("unauthorized: {message}"))]
    Unauthorized {
        /// Why the operation was refused.
        message: String,
    },

    /// Authenticated but not allowed.
    #[snafu(display("forbidden: {message}"))]
    Forbidden {
        /// Why the operation was refused.
        message: String,
    },

    /// The operation conflicts with current state (duplicate subscription,
    /// repeated authentication, connection caps).
    #[snafu(display("conflict: {message}"))]
    Conflict {
        /// The conflicting condition.
        message: String,
    },

    /// A collaborator (broker adapter, repository, verifier) is unavailable
    /// or failed.
    #[snafu(display("dependency failure: {message}"))]
    Dependency {
        /// The failing dependency and cause.
        message: String,
    },

    /// The referenced entity does not exist.
    #[snafu(display("not found: {message}"))]
    NotFound {
        /// What was missing.
        message: String,
    },

    /// A bounded wait elapsed.
    #[snafu(display("timed out: {message}"))]
    Timeout {
        /// The operation that timed out.
        message: String,
    },

    /// A wire-protocol error (framing or codec).
    #[snafu(display("{source}"), context(false))]
    Wire {
        /// The underlying wire error.
        source: WireError,
    },
}

impl ServerError {
    /// The stable error code reported to clients in ERROR frames and
    /// WebSocket error messages.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput { .. } => "INVALID_INPUT",
            Self::Unauthorized { .. } => "UNAUTHORIZED",
            Self::Forbidden { .. } => "FORBIDDEN",
            Self::Conflict { .. } => "CONFLICT",
            Self::Dependency { .. } => "DEPENDENCY_ERROR",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Timeout { .. } => "TIMEOUT",
            Self::Wire { source } => match source {
                WireError::FrameTooLarge { .. } => "FRAME_TOO_LARGE",
                WireError::InvalidMessageType { .. } => "INVALID_MESSAGE_TYPE",
                WireError::InvalidFrame { .. } => "INVALID_FRAME",
                WireError::Io { .. } => "IO_ERROR",
            },
        }
    }

    /// Whether the connection must be torn down after reporting this error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Wire {
                source: WireError::FrameTooLarge { .. } | WireError::Io { .. }
            }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        let error = ServerError::Conflict {
            message: "Connection limit reached".into(),
        };
        assert_eq!(error.code(), "CONFLICT");
        assert!(!error.is_fatal());
    }

    #[test]
    fn oversized_frames_are_fatal() {
        let error = ServerError::from(WireError::FrameTooLarge { size: 9, max: 8 });
        assert_eq!(error.code(), "FRAME_TOO_LARGE");
        assert!(error.is_fatal());
    }

    #[test]
    fn unknown_type_bytes_are_recoverable() {
        let error = ServerError::from(WireError::InvalidMessageType { ty: 0x42 });
        assert_eq!(error.code(), "INVALID_MESSAGE_TYPE");
        assert!(!error.is_fatal());
    }
}
