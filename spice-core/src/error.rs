//! Domain-specific error types for the SPICE channel engine.
//!
//! All fallible operations return `Result<T, SpiceError>`.
//! No panics on invalid input: every error is typed, and every
//! transport failure maps onto the [`ErrorCode`] reported to the
//! application once per disconnect episode.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::link::LinkError;

/// The canonical error type for the SPICE channel engine.
#[derive(Debug, Error)]
pub enum SpiceError {
    // ── Transport Errors ─────────────────────────────────────────
    /// The host name could not be resolved to any address.
    #[error("cannot resolve host address {0}")]
    AddressResolution(String),

    /// A socket could not be created.
    #[error("failed to create socket: {0}")]
    SocketCreate(#[source] std::io::Error),

    /// Every resolved address refused or failed the TCP connect.
    #[error("failed to connect to {addr}: {source}")]
    ConnectFailed {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The TLS handshake failed for a reason other than certificate policy.
    #[error("TLS handshake failed: {0}")]
    TlsHandshakeFailed(String),

    /// The peer certificate was rejected by the host verification policy.
    #[error("TLS certificate verification failed: {0}")]
    TlsVerifyFailed(String),

    /// The peer closed the connection.
    #[error("peer disconnected")]
    Disconnected,

    /// The TCP/IO layer reported an unrecoverable error.
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),

    // ── Protocol Errors ──────────────────────────────────────────
    /// A message or link record violated protocol rules.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// A numeric value did not map to any known enum variant.
    #[error("unknown {type_name} discriminant: {value:#x}")]
    UnknownVariant { type_name: &'static str, value: u64 },

    /// The server refused the link.
    #[error("link rejected: {0}")]
    Link(#[from] LinkError),

    /// Encoding or decoding of a body failed.
    #[error("encoding error: {0}")]
    Encoding(String),

    // ── Lifecycle Errors ─────────────────────────────────────────
    /// An operation exceeded its deadline.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// One or more shadow connections to the migration target failed.
    #[error("migration connect error: {0}")]
    MigrationConnectError(String),

    /// The operation was cancelled by an abort.
    #[error("aborted")]
    Aborted,

    /// An mpsc channel was closed unexpectedly.
    #[error("channel closed")]
    ChannelClosed,
}

impl SpiceError {
    /// Shorthand for a [`SpiceError::ProtocolViolation`].
    pub fn protocol(msg: impl Into<String>) -> Self {
        SpiceError::ProtocolViolation(msg.into())
    }

    /// The code reported to the application when this error ends a
    /// connection. `None` means the disconnect was clean.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            SpiceError::AddressResolution(_) => Some(ErrorCode::ResolveFailure),
            SpiceError::SocketCreate(_) => Some(ErrorCode::SocketFailure),
            SpiceError::ConnectFailed { .. } | SpiceError::Timeout(_) => {
                Some(ErrorCode::ConnectFailure)
            }
            SpiceError::TlsHandshakeFailed(_) | SpiceError::TlsVerifyFailed(_) => {
                Some(ErrorCode::TlsFailure)
            }
            SpiceError::ProtocolViolation(_)
            | SpiceError::UnknownVariant { .. }
            | SpiceError::Encoding(_) => Some(ErrorCode::Protocol),
            SpiceError::Link(_) => Some(ErrorCode::LinkFailure),
            SpiceError::Disconnected | SpiceError::Aborted => None,
            SpiceError::Connection(_)
            | SpiceError::MigrationConnectError(_)
            | SpiceError::ChannelClosed => Some(ErrorCode::PeerReset),
        }
    }
}

// ── ErrorCode ─────────────────────────────────────────────────────

/// Connection-error code carried by
/// [`ClientEvent::ConnectionError`](crate::events::ClientEvent::ConnectionError).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ResolveFailure,
    SocketFailure,
    ConnectFailure,
    TlsFailure,
    PeerReset,
    /// The peer sent something the engine could not accept.
    Protocol,
    /// The server refused the link handshake.
    LinkFailure,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCode::ResolveFailure => "resolve-failure",
            ErrorCode::SocketFailure => "socket-failure",
            ErrorCode::ConnectFailure => "connect-failure",
            ErrorCode::TlsFailure => "tls-failure",
            ErrorCode::PeerReset => "peer-reset",
            ErrorCode::Protocol => "protocol-error",
            ErrorCode::LinkFailure => "link-failure",
        };
        f.write_str(s)
    }
}

// ── Convenient From implementations ──────────────────────────────

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for SpiceError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        SpiceError::ChannelClosed
    }
}

impl From<Box<bincode::ErrorKind>> for SpiceError {
    fn from(e: Box<bincode::ErrorKind>) -> Self {
        SpiceError::Encoding(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for SpiceError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        SpiceError::Timeout(Duration::ZERO)
    }
}
