//! Error types for tchannel.

use thiserror::Error;

/// Error codes carried by `Error` frames on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorCode {
    /// Never a valid code on the wire; reserved.
    Invalid = 0x00,
    /// The call exceeded its ttl.
    Timeout = 0x01,
    /// The call was cancelled by the caller.
    Cancelled = 0x02,
    /// The peer is overloaded.
    Busy = 0x03,
    /// The peer refused the call.
    Declined = 0x04,
    /// The peer hit an unexpected internal error.
    UnexpectedError = 0x05,
    /// The sender emitted a malformed or invalid call.
    BadRequest = 0x06,
    /// A network failure terminated the call.
    NetworkError = 0x07,
    /// The peer reports itself unhealthy.
    Unhealthy = 0x08,
    /// Unrecoverable protocol violation; the connection must close.
    FatalProtocolError = 0xFF,
}

impl ErrorCode {
    /// Decode an error code byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::Invalid),
            0x01 => Some(Self::Timeout),
            0x02 => Some(Self::Cancelled),
            0x03 => Some(Self::Busy),
            0x04 => Some(Self::Declined),
            0x05 => Some(Self::UnexpectedError),
            0x06 => Some(Self::BadRequest),
            0x07 => Some(Self::NetworkError),
            0x08 => Some(Self::Unhealthy),
            0xFF => Some(Self::FatalProtocolError),
            _ => None,
        }
    }

    /// The wire byte for this code.
    #[inline]
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Main error type for all tchannel operations.
#[derive(Debug, Error)]
pub enum TChannelError {
    /// I/O error on the underlying stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Unrecoverable protocol violation (malformed frame, unknown type, etc.).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The sender's fault: invalid call contents. The connection survives.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Init handshake failed.
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// The call exceeded its ttl.
    #[error("Call timed out")]
    Timeout,

    /// The call was cancelled.
    #[error("Call cancelled")]
    Cancelled,

    /// The peer terminated the call with an error frame.
    #[error("Peer error ({code:?}): {message}")]
    Peer {
        /// Wire error code sent by the peer.
        code: ErrorCode,
        /// Human-readable message from the error frame.
        message: String,
    },

    /// Network failure; all in-flight calls on the connection fail with this.
    #[error("Network failure: {0}")]
    Network(String),

    /// Connection closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Outbound frame queue full - backpressure timeout.
    #[error("Outbound queue full")]
    QueueFull,

    /// A request span interceptor rejected the call before it was sent.
    #[error("Span interceptor rejected request: {0}")]
    Interceptor(String),
}

impl TChannelError {
    /// Wire code to use when reporting this failure to the peer.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::BadRequest(_) => ErrorCode::BadRequest,
            Self::Timeout => ErrorCode::Timeout,
            Self::Cancelled => ErrorCode::Cancelled,
            Self::Io(_) | Self::Network(_) | Self::ConnectionClosed => ErrorCode::NetworkError,
            Self::Peer { code, .. } => *code,
            _ => ErrorCode::FatalProtocolError,
        }
    }

    /// Map an inbound error frame to the error surfaced to the caller.
    pub fn from_peer(code: ErrorCode, message: String) -> Self {
        match code {
            ErrorCode::Timeout => Self::Timeout,
            ErrorCode::Cancelled => Self::Cancelled,
            _ => Self::Peer { code, message },
        }
    }
}

/// Result type alias using TChannelError.
pub type Result<T> = std::result::Result<T, TChannelError>;
