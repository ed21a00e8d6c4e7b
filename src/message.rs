//! Wire message envelopes and control payloads.

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;

/// Protocol version advertised in [`SyncSession`] (1.0, major in the high
/// 16 bits).
pub const PROTOCOL_VERSION: u32 = 0x0001_0000;

/// Pipe id 0 is reserved for control messages and never names a pipe.
pub const CONTROL_PIPE_ID: u16 = 0;

/// High bit of the pipe id; set on ids issued by the transport-accepting
/// peer (primary), clear on ids issued by the initiator (secondary).
pub const PRIMARY_PIPE_MASK: u16 = 0x8000;

/// Largest payload a single [`Block`] may carry.
pub const MAX_PAYLOAD_SIZE: usize = 0xFFFF - 4096;

/// One framed unit on the wire.
///
/// Every message names a pipe; [`Control`] messages use the reserved pipe
/// id 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Initiate a call on a fresh pipe.
    Open(Open),
    /// Terminate a pipe with a result or an abort.
    Close(Close),
    /// In-flight streaming fragment for an open pipe.
    Block(Block),
    /// Session-level control payload (pipe id 0).
    Control(Control),
}

impl Message {
    /// The pipe this message addresses (0 for control messages).
    pub fn pipe_id(&self) -> u16 {
        match self {
            Message::Open(open) => open.pipe_id,
            Message::Close(close) => close.pipe_id,
            Message::Block(block) => block.pipe_id,
            Message::Control(_) => CONTROL_PIPE_ID,
        }
    }
}

/// Call initiation: names the service and function and carries the encoded
/// argument list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Open {
    pub pipe_id: u16,
    pub priority: i8,
    pub service_id: String,
    pub function_id: u16,
    pub params: Bytes,
}

/// Terminal message for a pipe. `code == 0` means success and `result`
/// carries the encoded return value; any other code is an abort and
/// `result` carries the UTF-8 abort message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Close {
    pub pipe_id: u16,
    pub code: i8,
    pub result: Bytes,
}

impl Close {
    /// Successful termination carrying an encoded result value.
    pub fn with_result(pipe_id: u16, result: Bytes) -> Self {
        Close {
            pipe_id,
            code: 0,
            result,
        }
    }

    /// Failed termination carrying an abort.
    pub fn with_abort(pipe_id: u16, abort: &Abort) -> Self {
        Close {
            pipe_id,
            code: abort.code,
            result: Bytes::copy_from_slice(abort.message.as_bytes()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == 0
    }

    /// The abort this close carries, if any.
    pub fn abort(&self) -> Option<Abort> {
        if self.code == 0 {
            None
        } else {
            Some(Abort {
                code: self.code,
                message: String::from_utf8_lossy(&self.result).into_owned(),
            })
        }
    }
}

/// Streaming fragment. `eof` marks the last block of the pipe's inbound
/// stream; `loss` is a reserved best-effort-delivery hint, zero on emit and
/// tolerated at any value on receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub pipe_id: u16,
    pub eof: bool,
    pub loss: u8,
    pub payload: Bytes,
}

impl Block {
    pub fn new(pipe_id: u16, payload: Bytes) -> Self {
        Block {
            pipe_id,
            eof: false,
            loss: 0,
            payload,
        }
    }

    /// The end-of-stream marker block.
    pub fn eof(pipe_id: u16) -> Self {
        Block {
            pipe_id,
            eof: true,
            loss: 0,
            payload: Bytes::new(),
        }
    }

    /// Wire `status` byte: bit 7 = EOF, bits 0..=6 = loss hint.
    pub fn status(&self) -> u8 {
        (if self.eof { 0x80 } else { 0 }) | (self.loss & 0x7F)
    }

    pub fn from_status(pipe_id: u16, status: u8, payload: Bytes) -> Self {
        Block {
            pipe_id,
            eof: status & 0x80 != 0,
            loss: status & 0x7F,
            payload,
        }
    }
}

/// Session-level control payloads, carried on pipe id 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Control {
    /// Handshake: the first message each peer sends in each direction.
    SyncSession(SyncSession),
    /// Graceful session termination.
    SessionClose,
}

/// Handshake payload exchanged once per session in each direction before
/// any pipe traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSession {
    pub version: u32,
    pub utc_time: i64,
    pub config: BTreeMap<String, String>,
}

impl SyncSession {
    /// Config key under which the primary advertises the session id
    /// (hex-encoded u64).
    pub const SESSION_ID_KEY: &'static str = "session.id";

    pub fn new(version: u32, utc_time: i64, config: BTreeMap<String, String>) -> Self {
        SyncSession {
            version,
            utc_time,
            config,
        }
    }

    /// Session id advertised by the peer, if present and well-formed.
    pub fn session_id(&self) -> Option<u64> {
        let hex = self.config.get(Self::SESSION_ID_KEY)?;
        u64::from_str_radix(hex, 16).ok()
    }
}

/// Reserved abort codes.
pub mod abort_code {
    /// Internal or unclassified failure.
    pub const UNEXPECTED: i8 = -1;
    /// The session is shutting down.
    pub const SESSION_CLOSING: i8 = -2;
    /// No service is bound under the requested id.
    pub const SERVICE_UNDEFINED: i8 = 100;
    /// The service has no such function.
    pub const FUNCTION_UNDEFINED: i8 = 101;
    /// The function signalled failure.
    pub const FUNCTION_ABORTED: i8 = 102;
    /// A block arrived on a pipe whose function does not accept a stream.
    pub const FUNCTION_CANNOT_RECEIVE_BLOCK: i8 = 103;
    /// A message named a pipe that does not exist on the receiver.
    pub const DESTINATION_PIPE_UNREACHABLE: i8 = 104;
}

/// Application-level pipe failure: a non-zero code and a human-readable
/// message. Code 0 is reserved for success and never appears here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Abort {
    pub code: i8,
    pub message: String,
}

impl Abort {
    /// Build an abort. `code` must be non-zero; 0 is coerced to
    /// [`abort_code::UNEXPECTED`] so a success code can never masquerade as
    /// a failure on the wire.
    pub fn new(code: i8, message: impl Into<String>) -> Self {
        let code = if code == 0 { abort_code::UNEXPECTED } else { code };
        Abort {
            code,
            message: message.into(),
        }
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Abort::new(abort_code::UNEXPECTED, message)
    }

    pub fn session_closing() -> Self {
        Abort::new(abort_code::SESSION_CLOSING, "session closing")
    }

    pub fn service_undefined(service_id: &str) -> Self {
        Abort::new(
            abort_code::SERVICE_UNDEFINED,
            format!("service undefined: {}", service_id),
        )
    }

    pub fn function_undefined(function_id: u16) -> Self {
        Abort::new(
            abort_code::FUNCTION_UNDEFINED,
            format!("function undefined: {}", function_id),
        )
    }

    pub fn function_cannot_receive_block(pipe_id: u16) -> Self {
        Abort::new(
            abort_code::FUNCTION_CANNOT_RECEIVE_BLOCK,
            format!("pipe {:#06x} does not accept blocks", pipe_id),
        )
    }

    pub fn destination_unreachable(pipe_id: u16) -> Self {
        Abort::new(
            abort_code::DESTINATION_PIPE_UNREACHABLE,
            format!("no such pipe: {:#06x}", pipe_id),
        )
    }
}

impl fmt::Display for Abort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "abort {}: {}", self.code, self.message)
    }
}

impl std::error::Error for Abort {}
