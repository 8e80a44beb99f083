use std::fmt;

use thiserror::Error;

use super::wire::PacketType;
use crate::domain::ErrorKind;

/// Everything that ends an LDR connection.
///
/// Protocol errors are fatal to the one connection they happen on and are
/// never propagated past its teardown.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("declared packet length {0} out of range")]
    BadLength(u32),

    #[error("unknown packet type {0}")]
    UnknownType(u16),

    #[error("{0} packet truncated")]
    Truncated(PacketType),

    #[error("{0} packet has {1} trailing bytes")]
    Trailing(PacketType, usize),

    #[error("{0} packet malformed: {1}")]
    Malformed(PacketType, &'static str),

    #[error("{0} packet too long ({1} bytes)")]
    TooLong(PacketType, usize),

    #[error("unexpected {got} packet during {during}")]
    Unexpected {
        got: PacketType,
        during: &'static str,
    },

    #[error("raw data outside a file transfer")]
    UnexpectedData,

    #[error("authentication failed")]
    AuthFailed,

    #[error("task request while another one is in flight")]
    RequestInFlight,

    #[error("file download does not match the outstanding request")]
    DownloadMismatch,

    #[error("connection closed by peer")]
    PeerClosed,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProtocolError::Io(_) | ProtocolError::PeerClosed => ErrorKind::Transient,
            _ => ErrorKind::Protocol,
        }
    }

    pub fn close_reason(&self) -> CloseReason {
        match self {
            ProtocolError::AuthFailed => CloseReason::AuthFailure,
            ProtocolError::PeerClosed => CloseReason::PeerClosed,
            ProtocolError::Io(_) => CloseReason::Io,
            _ => CloseReason::ProtocolViolation,
        }
    }
}

/// Why a connection ended; reported once, from teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    PeerClosed,
    AuthFailure,
    AuthTimeout,
    AlreadyConnected,
    IdleTimeout,
    ProtocolViolation,
    Io,
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CloseReason::PeerClosed => "peer closed",
            CloseReason::AuthFailure => "auth failure",
            CloseReason::AuthTimeout => "auth timeout",
            CloseReason::AlreadyConnected => "already connected",
            CloseReason::IdleTimeout => "idle timeout",
            CloseReason::ProtocolViolation => "protocol violation",
            CloseReason::Io => "i/o error",
            CloseReason::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}
