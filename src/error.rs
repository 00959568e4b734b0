//! Error types for etpwire.

use thiserror::Error;

use crate::handler::Contract;

/// Wire-level ETP error codes.
///
/// This is the closed set used by the session core when it converts local
/// failures into outbound `ProtocolException` messages. Codes outside this
/// set received from a peer are preserved numerically via [`ErrorCode::Other`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Peer addressed a protocol this endpoint did not negotiate.
    UnsupportedProtocol,
    /// Message type id is not in the catalog for its protocol.
    InvalidMessageType,
    /// Malformed body or argument outside its valid range.
    InvalidArgument,
    /// Operation not permitted for this role.
    PermissionDenied,
    /// Operation recognized but not offered by this endpoint.
    NotSupported,
    /// Message arrived in a session state that cannot accept it.
    InvalidState,
    /// URI failed to parse or resolve.
    InvalidUri,
    /// Referenced object or token has expired.
    Expired,
    /// Per-request deadline elapsed before a final part arrived.
    Timeout,
    /// Request refused by store policy.
    RequestDenied,
    /// Code received from a peer that is outside the closed set.
    Other(i32),
}

impl ErrorCode {
    /// Numeric code as carried in a `ProtocolException` body.
    pub fn as_i32(self) -> i32 {
        match self {
            ErrorCode::InvalidMessageType => 3,
            ErrorCode::UnsupportedProtocol => 4,
            ErrorCode::InvalidArgument => 5,
            ErrorCode::PermissionDenied => 6,
            ErrorCode::NotSupported => 7,
            ErrorCode::InvalidState => 8,
            ErrorCode::InvalidUri => 9,
            ErrorCode::Expired => 10,
            ErrorCode::Timeout => 11,
            ErrorCode::RequestDenied => 12,
            ErrorCode::Other(code) => code,
        }
    }

    /// Decode a numeric code from the wire.
    pub fn from_i32(code: i32) -> Self {
        match code {
            3 => ErrorCode::InvalidMessageType,
            4 => ErrorCode::UnsupportedProtocol,
            5 => ErrorCode::InvalidArgument,
            6 => ErrorCode::PermissionDenied,
            7 => ErrorCode::NotSupported,
            8 => ErrorCode::InvalidState,
            9 => ErrorCode::InvalidUri,
            10 => ErrorCode::Expired,
            11 => ErrorCode::Timeout,
            12 => ErrorCode::RequestDenied,
            other => ErrorCode::Other(other),
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCode::UnsupportedProtocol => write!(f, "unsupported protocol"),
            ErrorCode::InvalidMessageType => write!(f, "invalid message type"),
            ErrorCode::InvalidArgument => write!(f, "invalid argument"),
            ErrorCode::PermissionDenied => write!(f, "permission denied"),
            ErrorCode::NotSupported => write!(f, "not supported"),
            ErrorCode::InvalidState => write!(f, "invalid state"),
            ErrorCode::InvalidUri => write!(f, "invalid uri"),
            ErrorCode::Expired => write!(f, "expired"),
            ErrorCode::Timeout => write!(f, "timeout"),
            ErrorCode::RequestDenied => write!(f, "request denied"),
            ErrorCode::Other(code) => write!(f, "error code {}", code),
        }
    }
}

/// Main error type for all etpwire operations.
#[derive(Debug, Error)]
pub enum EtpError {
    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON framing serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket transport error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Malformed frame or Avro-binary encoding.
    #[error("Codec error: {0}")]
    Codec(String),

    /// `(protocol, messageType)` pair is not in the session's catalog.
    #[error("Unknown message type {message_type} on protocol {protocol}")]
    UnknownMessage {
        /// Numeric protocol id from the header.
        protocol: u16,
        /// Protocol-scoped message type id from the header.
        message_type: u16,
    },

    /// Protocol violation (bad negotiation reply, duplicate registration, etc.).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// No handler registered under the requested contract.
    #[error("Contract {0:?} is not registered on this session")]
    NotRegistered(Contract),

    /// A handler is already registered for this protocol id.
    #[error("Protocol {0} already has a registered handler")]
    DuplicateProtocol(u16),

    /// Peer answered with a `ProtocolException`.
    #[error("Peer reported {code}: {message}")]
    Remote {
        /// Wire error code from the exception body.
        code: ErrorCode,
        /// Human-readable message from the peer.
        message: String,
    },

    /// Operation attempted on a session that is closing or closed.
    #[error("Session closed")]
    SessionClosed,

    /// Per-request deadline elapsed before the final part arrived.
    #[error("Request timed out")]
    Timeout,

    /// Transport closed by the peer.
    #[error("Connection closed")]
    ConnectionClosed,
}

/// Result type alias using EtpError.
pub type Result<T> = std::result::Result<T, EtpError>;
