//! Error taxonomy.
//!
//! Codec and protocol violations are wire-fatal: they close the whole
//! session. Everything scoped to a single pipe surfaces as an
//! [`Abort`](crate::Abort) on that pipe's outcome and leaves the session
//! running.

use std::fmt;
use std::io;

/// Malformed or oversize frame. Closes the wire.
#[derive(Debug)]
pub enum CodecError {
    /// Encoded frame would exceed the u16 envelope cap.
    FrameTooLarge { len: usize },
    /// Block payload above [`MAX_PAYLOAD_SIZE`](crate::MAX_PAYLOAD_SIZE).
    PayloadTooLarge { len: usize },
    /// Unknown message type tag.
    UnknownTag(u8),
    /// Unknown control tag.
    UnknownControl(u8),
    /// Frame body did not parse as the declared message type.
    Malformed(String),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::FrameTooLarge { len } => {
                write!(f, "frame of {} bytes exceeds the 65535-byte envelope", len)
            }
            CodecError::PayloadTooLarge { len } => {
                write!(
                    f,
                    "block payload of {} bytes exceeds {} bytes",
                    len,
                    crate::MAX_PAYLOAD_SIZE
                )
            }
            CodecError::UnknownTag(tag) => write!(f, "unknown message tag {:#04x}", tag),
            CodecError::UnknownControl(tag) => write!(f, "unknown control tag {:#04x}", tag),
            CodecError::Malformed(detail) => write!(f, "malformed frame body: {}", detail),
        }
    }
}

impl std::error::Error for CodecError {}

/// Semantically invalid message sequence. Closes the wire, except for the
/// per-pipe variants which are answered with a pipe abort.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// An Open named a pipe id whose high bit does not match the remote
    /// peer's role.
    RoleMismatch { pipe_id: u16, remote_primary: bool },
    /// An Open named a pipe id that is already live.
    DuplicatePipeId { pipe_id: u16 },
    /// A non-control message named the reserved pipe id 0.
    ReservedPipeId,
    /// The peer's first message was not SyncSession.
    HandshakeExpected,
    /// SyncSession arrived after the handshake already completed.
    UnexpectedSyncSession,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::RoleMismatch {
                pipe_id,
                remote_primary,
            } => {
                if *remote_primary {
                    write!(
                        f,
                        "pipe id {:#06x}: primary peers must set the high bit",
                        pipe_id
                    )
                } else {
                    write!(
                        f,
                        "pipe id {:#06x}: primary mask not accepted from non-primary peer",
                        pipe_id
                    )
                }
            }
            ProtocolError::DuplicatePipeId { pipe_id } => {
                write!(f, "duplicate pipe-id {:#06x}", pipe_id)
            }
            ProtocolError::ReservedPipeId => write!(f, "pipe id 0 is reserved for control"),
            ProtocolError::HandshakeExpected => {
                write!(f, "first message must be SyncSession")
            }
            ProtocolError::UnexpectedSyncSession => {
                write!(f, "SyncSession outside of handshake")
            }
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Operation attempted on a closed queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueClosed;

impl fmt::Display for QueueClosed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "message queue is closed")
    }
}

impl std::error::Error for QueueClosed {}

/// Transport-level failure.
#[derive(Debug)]
pub enum TransportError {
    /// The transport is closed (locally or by the peer).
    Closed,
    /// I/O failure on the underlying duplex.
    Io(io::Error),
    /// Byte stream did not frame correctly (truncated or inconsistent
    /// length header).
    Malformed(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Closed => write!(f, "transport closed"),
            TransportError::Io(err) => write!(f, "transport i/o error: {}", err),
            TransportError::Malformed(detail) => write!(f, "malformed transport frame: {}", detail),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransportError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        TransportError::Io(err)
    }
}

/// Failure reported by a wire to its listeners before it closes.
#[derive(Debug)]
pub enum WireError {
    Codec(CodecError),
    Protocol(ProtocolError),
    Transport(TransportError),
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireError::Codec(err) => write!(f, "codec: {}", err),
            WireError::Protocol(err) => write!(f, "protocol: {}", err),
            WireError::Transport(err) => write!(f, "transport: {}", err),
        }
    }
}

impl std::error::Error for WireError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WireError::Codec(err) => Some(err),
            WireError::Protocol(err) => Some(err),
            WireError::Transport(err) => Some(err),
        }
    }
}

impl From<CodecError> for WireError {
    fn from(err: CodecError) -> Self {
        WireError::Codec(err)
    }
}

impl From<TransportError> for WireError {
    fn from(err: TransportError) -> Self {
        WireError::Transport(err)
    }
}

/// Handshake failure; the session never reaches the running state.
#[derive(Debug)]
pub enum HandshakeError {
    /// The wire closed before the peer's SyncSession arrived.
    WireClosed,
    /// The peer's first message was not SyncSession.
    Protocol(ProtocolError),
    /// The peer speaks an incompatible protocol major version.
    VersionMismatch { local: u32, remote: u32 },
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeError::WireClosed => write!(f, "wire closed during handshake"),
            HandshakeError::Protocol(err) => write!(f, "handshake protocol error: {}", err),
            HandshakeError::VersionMismatch { local, remote } => write!(
                f,
                "incompatible protocol version: local {:#010x}, remote {:#010x}",
                local, remote
            ),
        }
    }
}

impl std::error::Error for HandshakeError {}

/// Session-level operation failure.
#[derive(Debug)]
pub enum SessionError {
    /// The session (or its wire) is closed.
    Closed,
    /// Every pipe id slot on this side is occupied.
    PipesExhausted,
    /// Duplicate service id at registration.
    ServiceAlreadyRegistered(String),
    Handshake(HandshakeError),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Closed => write!(f, "session closed"),
            SessionError::PipesExhausted => write!(f, "no free pipe id"),
            SessionError::ServiceAlreadyRegistered(id) => {
                write!(f, "service {:?} is already registered", id)
            }
            SessionError::Handshake(err) => write!(f, "handshake failed: {}", err),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::Handshake(err) => Some(err),
            _ => None,
        }
    }
}

impl From<HandshakeError> for SessionError {
    fn from(err: HandshakeError) -> Self {
        SessionError::Handshake(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_error_display() {
        let err = CodecError::FrameTooLarge { len: 70000 };
        assert!(format!("{}", err).contains("70000"));

        let err = CodecError::UnknownTag(0x5A);
        assert!(format!("{}", err).contains("0x5a"));
    }

    #[test]
    fn role_mismatch_display_names_the_offender() {
        let err = ProtocolError::RoleMismatch {
            pipe_id: 0x8001,
            remote_primary: false,
        };
        let text = format!("{}", err);
        assert!(text.contains("primary mask not accepted"));
        assert!(text.contains("0x8001"));
    }

    #[test]
    fn duplicate_pipe_display() {
        let err = ProtocolError::DuplicatePipeId { pipe_id: 1 };
        assert!(format!("{}", err).contains("duplicate pipe-id"));
    }

    #[test]
    fn transport_error_from_io() {
        let err = TransportError::from(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
        assert!(matches!(err, TransportError::Io(_)));
        assert!(format!("{}", err).contains("gone"));
    }
}
