//! Error types for the RSocket engine.
//!
//! Two layers live here:
//!
//! - [`ErrorCode`] - the numeric codes carried by ERROR frames on the wire,
//!   split into the stream-0 (connection) and stream-local namespaces.
//! - [`RSocketError`] - the crate-level error enum surfaced to application
//!   code and used internally by the engine.

use std::fmt;

use thiserror::Error;

/// Numeric error code carried by an ERROR frame.
///
/// The stream-0 and stream-local namespaces do not overlap in meaning:
/// codes up to `0x102` are only valid on stream 0, the `0x2xx` codes only
/// on individual streams. Codes in `0x301..=0xFFFFFFFE` are custom.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ErrorCode(pub u32);

impl ErrorCode {
    // Stream 0: setup / resume.
    pub const INVALID_SETUP: ErrorCode = ErrorCode(0x0000_0001);
    pub const UNSUPPORTED_SETUP: ErrorCode = ErrorCode(0x0000_0002);
    pub const REJECTED_SETUP: ErrorCode = ErrorCode(0x0000_0003);
    pub const REJECTED_RESUME: ErrorCode = ErrorCode(0x0000_0004);

    // Stream 0: connection lifecycle.
    pub const CONNECTION_ERROR: ErrorCode = ErrorCode(0x0000_0101);
    pub const CONNECTION_CLOSE: ErrorCode = ErrorCode(0x0000_0102);

    // Stream != 0.
    pub const APPLICATION_ERROR: ErrorCode = ErrorCode(0x0000_0201);
    pub const REJECTED: ErrorCode = ErrorCode(0x0000_0202);
    pub const CANCELED: ErrorCode = ErrorCode(0x0000_0203);
    pub const INVALID: ErrorCode = ErrorCode(0x0000_0204);

    /// First custom error code.
    pub const CUSTOM_MIN: ErrorCode = ErrorCode(0x0000_0301);
    /// Last custom error code.
    pub const CUSTOM_MAX: ErrorCode = ErrorCode(0xFFFF_FFFE);

    /// Check whether this code belongs to the custom range.
    #[inline]
    pub fn is_custom(self) -> bool {
        self.0 >= Self::CUSTOM_MIN.0 && self.0 <= Self::CUSTOM_MAX.0
    }

    /// Check whether this code is valid on stream 0.
    #[inline]
    pub fn is_connection_scoped(self) -> bool {
        matches!(
            self,
            Self::INVALID_SETUP
                | Self::UNSUPPORTED_SETUP
                | Self::REJECTED_SETUP
                | Self::REJECTED_RESUME
                | Self::CONNECTION_ERROR
                | Self::CONNECTION_CLOSE
        )
    }

    /// Human-readable name for the well-known codes.
    pub fn name(self) -> &'static str {
        match self {
            Self::INVALID_SETUP => "InvalidSetup",
            Self::UNSUPPORTED_SETUP => "UnsupportedSetup",
            Self::REJECTED_SETUP => "RejectedSetup",
            Self::REJECTED_RESUME => "RejectedResume",
            Self::CONNECTION_ERROR => "ConnectionError",
            Self::CONNECTION_CLOSE => "ConnectionClose",
            Self::APPLICATION_ERROR => "ApplicationError",
            Self::REJECTED => "Rejected",
            Self::CANCELED => "Canceled",
            Self::INVALID => "Invalid",
            _ if self.is_custom() => "Custom",
            _ => "Reserved",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:08X})", self.name(), self.0)
    }
}

/// Main error type for all RSocket operations.
#[derive(Debug, Error)]
pub enum RSocketError {
    /// I/O error reported by the transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Bytes could not be parsed into a frame. Always fatal to the
    /// connection.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// Structurally valid frame that is illegal in context. Reported and
    /// ignored unless it occurs on stream 0.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The 31-bit stream-id space of this connection is used up.
    #[error("stream ids exhausted")]
    StreamIdsExhausted,

    /// The connection is closed (or was never established).
    #[error("connection closed")]
    ConnectionClosed,

    /// Connection-scoped failure: keepalive timeout, a stream-0 ERROR
    /// frame, or a fatal local condition. Fails every active stream.
    #[error("{code}: {message}")]
    Connection { code: ErrorCode, message: String },

    /// Stream-scoped failure carried by an ERROR frame; sibling streams
    /// are unaffected.
    #[error("{code}: {message}")]
    Stream { code: ErrorCode, message: String },
}

impl RSocketError {
    /// Build the typed error for an ERROR frame received on `stream_id`.
    pub fn from_frame(stream_id: u32, code: ErrorCode, message: String) -> Self {
        if stream_id == 0 {
            RSocketError::Connection { code, message }
        } else {
            RSocketError::Stream { code, message }
        }
    }

    /// Stream-scoped `ApplicationError`.
    pub fn application(message: impl Into<String>) -> Self {
        RSocketError::Stream {
            code: ErrorCode::APPLICATION_ERROR,
            message: message.into(),
        }
    }

    /// Stream-scoped `Rejected`.
    pub fn rejected(message: impl Into<String>) -> Self {
        RSocketError::Stream {
            code: ErrorCode::REJECTED,
            message: message.into(),
        }
    }

    /// Stream-scoped `Canceled`.
    pub fn canceled(message: impl Into<String>) -> Self {
        RSocketError::Stream {
            code: ErrorCode::CANCELED,
            message: message.into(),
        }
    }

    /// Stream-scoped `Invalid`.
    pub fn invalid(message: impl Into<String>) -> Self {
        RSocketError::Stream {
            code: ErrorCode::INVALID,
            message: message.into(),
        }
    }

    /// Connection-scoped `ConnectionError`.
    pub fn connection(message: impl Into<String>) -> Self {
        RSocketError::Connection {
            code: ErrorCode::CONNECTION_ERROR,
            message: message.into(),
        }
    }

    /// The wire code for this error, if it maps to one.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            RSocketError::Connection { code, .. } | RSocketError::Stream { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// The code and message to put into an outbound ERROR frame when this
    /// error terminates a stream. Errors without a wire code translate to
    /// `ApplicationError`.
    pub(crate) fn to_stream_error(&self) -> (ErrorCode, String) {
        match self {
            RSocketError::Stream { code, message } => (*code, message.clone()),
            other => (ErrorCode::APPLICATION_ERROR, other.to_string()),
        }
    }

    /// True when this error is the distinguishable cancellation signal.
    pub fn is_canceled(&self) -> bool {
        matches!(
            self,
            RSocketError::Stream {
                code: ErrorCode::CANCELED,
                ..
            }
        )
    }
}

/// Result type alias using [`RSocketError`].
pub type Result<T> = std::result::Result<T, RSocketError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_namespaces() {
        assert!(ErrorCode::CONNECTION_ERROR.is_connection_scoped());
        assert!(ErrorCode::CONNECTION_CLOSE.is_connection_scoped());
        assert!(ErrorCode::REJECTED_SETUP.is_connection_scoped());
        assert!(!ErrorCode::APPLICATION_ERROR.is_connection_scoped());
        assert!(!ErrorCode::CANCELED.is_connection_scoped());
    }

    #[test]
    fn test_custom_range() {
        assert!(ErrorCode(0x301).is_custom());
        assert!(ErrorCode(0xFFFF_FFFE).is_custom());
        assert!(!ErrorCode(0x204).is_custom());
        assert!(!ErrorCode(0xFFFF_FFFF).is_custom());
    }

    #[test]
    fn test_from_frame_scoping() {
        let conn = RSocketError::from_frame(0, ErrorCode::CONNECTION_ERROR, "boom".into());
        assert!(matches!(conn, RSocketError::Connection { .. }));

        let stream = RSocketError::from_frame(5, ErrorCode::APPLICATION_ERROR, "boom".into());
        assert!(matches!(stream, RSocketError::Stream { .. }));
    }

    #[test]
    fn test_stream_error_translation() {
        let err = RSocketError::rejected("not implemented");
        let (code, message) = err.to_stream_error();
        assert_eq!(code, ErrorCode::REJECTED);
        assert_eq!(message, "not implemented");

        let err = RSocketError::ConnectionClosed;
        let (code, _) = err.to_stream_error();
        assert_eq!(code, ErrorCode::APPLICATION_ERROR);
    }

    #[test]
    fn test_canceled_signal() {
        assert!(RSocketError::canceled("upstream gone").is_canceled());
        assert!(!RSocketError::application("boom").is_canceled());
    }

    #[test]
    fn test_display_contains_code() {
        let err = RSocketError::application("handler failed");
        let text = err.to_string();
        assert!(text.contains("ApplicationError"));
        assert!(text.contains("handler failed"));
    }
}
