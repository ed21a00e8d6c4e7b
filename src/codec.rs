//! Wire frame codec.
//!
//! Each framed unit is one complete [`Message`]: a one-byte type tag, a
//! little-endian `u16` total length (header included), and a MessagePack
//! body. Frames are self-delimited, so [`decode`] can run against a raw
//! accumulation buffer: a partial frame yields [`Decoded::Incomplete`],
//! never an error.
//!
//! User payload values (Open params, Close results) are opaque bytes at
//! this layer; the [`ValueCodec`] trait converts between user types and
//! those bytes.

use std::collections::BTreeMap;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Serialize, de::DeserializeOwned};

use crate::error::CodecError;
use crate::message::{Block, Close, Control, MAX_PAYLOAD_SIZE, Message, Open, SyncSession};

/// Bytes of the frame header: tag plus total length.
pub const FRAME_HEADER_LEN: usize = 3;

/// Maximum total frame size (the length field is a u16).
pub const MAX_FRAME_SIZE: usize = 0xFFFF;

/// Message type tags.
pub const TAG_OPEN: u8 = b'(';
pub const TAG_CLOSE: u8 = b')';
pub const TAG_BLOCK: u8 = b'#';
pub const TAG_CONTROL: u8 = b'*';

/// Control body tags.
pub const CONTROL_SYNC_SESSION: u8 = b'Q';
pub const CONTROL_SESSION_CLOSE: u8 = b'C';

/// Result of running [`decode`] against an accumulation buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A complete frame was parsed; `consumed` bytes belong to it.
    Frame { message: Message, consumed: usize },
    /// The buffer holds only a partial frame; accumulate more bytes.
    Incomplete,
}

/// Encode a message into one self-delimited frame.
pub fn encode(message: &Message) -> Result<Bytes, CodecError> {
    let mut body = Vec::with_capacity(64);
    let tag = match message {
        Message::Open(open) => {
            write_int(&mut body, open.pipe_id as i16 as i64)?;
            write_int(&mut body, open.priority as i64)?;
            write_str(&mut body, &open.service_id)?;
            write_int(&mut body, open.function_id as i16 as i64)?;
            write_bin(&mut body, &open.params)?;
            TAG_OPEN
        }
        Message::Close(close) => {
            write_int(&mut body, close.pipe_id as i16 as i64)?;
            write_int(&mut body, close.code as i64)?;
            write_bin(&mut body, &close.result)?;
            TAG_CLOSE
        }
        Message::Block(block) => {
            if block.payload.len() > MAX_PAYLOAD_SIZE {
                return Err(CodecError::PayloadTooLarge {
                    len: block.payload.len(),
                });
            }
            write_int(&mut body, block.pipe_id as i16 as i64)?;
            write_uint(&mut body, block.status() as u64)?;
            write_bin(&mut body, &block.payload)?;
            TAG_BLOCK
        }
        Message::Control(control) => {
            match control {
                Control::SyncSession(sync) => {
                    body.push(CONTROL_SYNC_SESSION);
                    write_int(&mut body, sync.version as i64)?;
                    write_int(&mut body, sync.utc_time)?;
                    write_map(&mut body, &sync.config)?;
                }
                Control::SessionClose => body.push(CONTROL_SESSION_CLOSE),
            }
            TAG_CONTROL
        }
    };

    let total = FRAME_HEADER_LEN + body.len();
    if total > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge { len: total });
    }

    let mut frame = BytesMut::with_capacity(total);
    frame.put_u8(tag);
    frame.put_u16_le(total as u16);
    frame.put_slice(&body);
    Ok(frame.freeze())
}

/// Decode the first frame in `buf`, if one is complete.
pub fn decode(buf: &[u8]) -> Result<Decoded, CodecError> {
    if buf.len() < FRAME_HEADER_LEN {
        return Ok(Decoded::Incomplete);
    }
    let tag = buf[0];
    let total = u16::from_le_bytes([buf[1], buf[2]]) as usize;
    if total < FRAME_HEADER_LEN {
        return Err(CodecError::Malformed(format!(
            "frame length {} below header size",
            total
        )));
    }
    if buf.len() < total {
        return Ok(Decoded::Incomplete);
    }

    let mut body = &buf[FRAME_HEADER_LEN..total];
    let message = match tag {
        TAG_OPEN => {
            let pipe_id = read_int(&mut body)? as i16 as u16;
            let priority = read_i8(&mut body)?;
            let service_id = read_string(&mut body)?;
            let function_id = read_int(&mut body)? as i16 as u16;
            let params = read_bytes(&mut body)?;
            Message::Open(Open {
                pipe_id,
                priority,
                service_id,
                function_id,
                params,
            })
        }
        TAG_CLOSE => {
            let pipe_id = read_int(&mut body)? as i16 as u16;
            let code = read_i8(&mut body)?;
            let result = read_bytes(&mut body)?;
            Message::Close(Close {
                pipe_id,
                code,
                result,
            })
        }
        TAG_BLOCK => {
            let pipe_id = read_int(&mut body)? as i16 as u16;
            let status = read_int(&mut body)?;
            if !(0..=0xFF).contains(&status) {
                return Err(CodecError::Malformed(format!(
                    "block status {} out of range",
                    status
                )));
            }
            let payload = read_bytes(&mut body)?;
            if payload.len() > MAX_PAYLOAD_SIZE {
                return Err(CodecError::PayloadTooLarge { len: payload.len() });
            }
            Message::Block(Block::from_status(pipe_id, status as u8, payload))
        }
        TAG_CONTROL => {
            let (control_tag, rest) = body
                .split_first()
                .ok_or_else(|| CodecError::Malformed("empty control body".into()))?;
            body = rest;
            match *control_tag {
                CONTROL_SYNC_SESSION => {
                    let version = read_int(&mut body)? as u32;
                    let utc_time = read_int(&mut body)?;
                    let config = read_map(&mut body)?;
                    Message::Control(Control::SyncSession(SyncSession {
                        version,
                        utc_time,
                        config,
                    }))
                }
                CONTROL_SESSION_CLOSE => Message::Control(Control::SessionClose),
                other => return Err(CodecError::UnknownControl(other)),
            }
        }
        other => return Err(CodecError::UnknownTag(other)),
    };

    if !body.is_empty() {
        return Err(CodecError::Malformed(format!(
            "{} trailing bytes after frame body",
            body.len()
        )));
    }

    Ok(Decoded::Frame {
        message,
        consumed: total,
    })
}

fn malformed(err: impl std::fmt::Display) -> CodecError {
    CodecError::Malformed(err.to_string())
}

fn write_int(out: &mut Vec<u8>, value: i64) -> Result<(), CodecError> {
    rmp::encode::write_sint(out, value).map(|_| ()).map_err(malformed)
}

fn write_uint(out: &mut Vec<u8>, value: u64) -> Result<(), CodecError> {
    rmp::encode::write_uint(out, value).map(|_| ()).map_err(malformed)
}

fn write_str(out: &mut Vec<u8>, value: &str) -> Result<(), CodecError> {
    rmp::encode::write_str(out, value).map_err(malformed)
}

fn write_bin(out: &mut Vec<u8>, value: &[u8]) -> Result<(), CodecError> {
    rmp::encode::write_bin(out, value).map_err(malformed)
}

fn write_map(out: &mut Vec<u8>, map: &BTreeMap<String, String>) -> Result<(), CodecError> {
    rmp::encode::write_map_len(out, map.len() as u32)
        .map(|_| ())
        .map_err(malformed)?;
    for (key, value) in map {
        write_str(out, key)?;
        write_str(out, value)?;
    }
    Ok(())
}

fn read_int(body: &mut &[u8]) -> Result<i64, CodecError> {
    rmp::decode::read_int(body).map_err(malformed)
}

fn read_i8(body: &mut &[u8]) -> Result<i8, CodecError> {
    let value = read_int(body)?;
    i8::try_from(value).map_err(|_| CodecError::Malformed(format!("{} out of i8 range", value)))
}

fn take<'a>(body: &mut &'a [u8], len: usize) -> Result<&'a [u8], CodecError> {
    if body.len() < len {
        return Err(CodecError::Malformed(format!(
            "body truncated: need {} bytes, have {}",
            len,
            body.len()
        )));
    }
    let (head, rest) = body.split_at(len);
    *body = rest;
    Ok(head)
}

fn read_string(body: &mut &[u8]) -> Result<String, CodecError> {
    let len = rmp::decode::read_str_len(body).map_err(malformed)? as usize;
    let raw = take(body, len)?;
    String::from_utf8(raw.to_vec())
        .map_err(|_| CodecError::Malformed("invalid utf-8 in string".into()))
}

fn read_bytes(body: &mut &[u8]) -> Result<Bytes, CodecError> {
    let len = rmp::decode::read_bin_len(body).map_err(malformed)? as usize;
    Ok(Bytes::copy_from_slice(take(body, len)?))
}

fn read_map(body: &mut &[u8]) -> Result<BTreeMap<String, String>, CodecError> {
    let len = rmp::decode::read_map_len(body).map_err(malformed)?;
    let mut map = BTreeMap::new();
    for _ in 0..len {
        let key = read_string(body)?;
        let value = read_string(body)?;
        map.insert(key, value);
    }
    Ok(map)
}

/// Codec for user payload values.
///
/// The engine never inspects Open params or Close results; callers encode
/// and decode them through an implementation of this trait.
pub trait ValueCodec {
    /// Error type returned by encode operations.
    type EncodeError: std::error::Error;

    /// Error type returned by decode operations.
    type DecodeError: std::error::Error;

    /// Encode a value into bytes.
    fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, Self::EncodeError>;

    /// Decode bytes into a value.
    fn decode<T: DeserializeOwned>(buf: &[u8]) -> Result<T, Self::DecodeError>;
}

/// MessagePack value codec. This is the canonical payload encoding: compact,
/// deterministic, and the same format the envelopes themselves use.
pub struct MsgpackCodec;

impl ValueCodec for MsgpackCodec {
    type EncodeError = rmp_serde::encode::Error;
    type DecodeError = rmp_serde::decode::Error;

    fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, Self::EncodeError> {
        rmp_serde::to_vec(value)
    }

    fn decode<T: DeserializeOwned>(buf: &[u8]) -> Result<T, Self::DecodeError> {
        rmp_serde::from_slice(buf)
    }
}

/// Raw value codec: no serialization, bytes pass through as-is.
///
/// Only works with byte payloads; use [`RawCodec::to_bytes`] /
/// [`RawCodec::from_bytes`] instead of the trait methods.
pub struct RawCodec;

/// Error type for [`RawCodec`] operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawCodecError {
    message: &'static str,
}

impl std::fmt::Display for RawCodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "raw codec error: {}", self.message)
    }
}

impl std::error::Error for RawCodecError {}

impl ValueCodec for RawCodec {
    type EncodeError = RawCodecError;
    type DecodeError = RawCodecError;

    fn encode<T: Serialize>(_value: &T) -> Result<Vec<u8>, Self::EncodeError> {
        Err(RawCodecError {
            message: "raw codec only supports byte payloads, use to_bytes() instead",
        })
    }

    fn decode<T: DeserializeOwned>(_buf: &[u8]) -> Result<T, Self::DecodeError> {
        Err(RawCodecError {
            message: "raw codec only supports byte payloads, use from_bytes() instead",
        })
    }
}

impl RawCodec {
    pub fn to_bytes(data: &[u8]) -> Vec<u8> {
        data.to_vec()
    }

    pub fn from_bytes(data: Vec<u8>) -> Vec<u8> {
        data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::PROTOCOL_VERSION;
    use serde::Deserialize;

    fn sample_open() -> Message {
        Message::Open(Open {
            pipe_id: 0x8000,
            priority: -3,
            service_id: "echo".to_string(),
            function_id: 1,
            params: Bytes::from_static(b"hello"),
        })
    }

    fn roundtrip(message: Message) -> Message {
        let frame = encode(&message).unwrap();
        match decode(&frame).unwrap() {
            Decoded::Frame { message, consumed } => {
                assert_eq!(consumed, frame.len());
                message
            }
            Decoded::Incomplete => panic!("complete frame decoded as incomplete"),
        }
    }

    #[test]
    fn open_roundtrip() {
        let message = sample_open();
        assert_eq!(roundtrip(message.clone()), message);
    }

    #[test]
    fn close_roundtrip() {
        let message = Message::Close(Close {
            pipe_id: 0x0001,
            code: -1,
            result: Bytes::from_static(b"duplicate pipe-id"),
        });
        assert_eq!(roundtrip(message.clone()), message);
    }

    #[test]
    fn block_roundtrip_at_max_payload() {
        let message = Message::Block(Block {
            pipe_id: 0x7FFF,
            eof: true,
            loss: 0x11,
            payload: Bytes::from(vec![0xAB; MAX_PAYLOAD_SIZE]),
        });
        assert_eq!(roundtrip(message.clone()), message);
    }

    #[test]
    fn control_roundtrip() {
        let mut config = BTreeMap::new();
        config.insert("session.id".to_string(), "deadbeef".to_string());
        let message = Message::Control(Control::SyncSession(SyncSession {
            version: PROTOCOL_VERSION,
            utc_time: 1_700_000_000_000,
            config,
        }));
        assert_eq!(roundtrip(message.clone()), message);

        let message = Message::Control(Control::SessionClose);
        assert_eq!(roundtrip(message.clone()), message);
    }

    #[test]
    fn header_tag_and_length() {
        let frame = encode(&Message::Control(Control::SessionClose)).unwrap();
        assert_eq!(frame[0], b'*');
        assert_eq!(
            u16::from_le_bytes([frame[1], frame[2]]) as usize,
            frame.len()
        );
        assert_eq!(frame[3], b'C');
    }

    #[test]
    fn oversize_block_payload_rejected() {
        let message = Message::Block(Block {
            pipe_id: 1,
            eof: false,
            loss: 0,
            payload: Bytes::from(vec![0; MAX_PAYLOAD_SIZE + 1]),
        });
        assert!(matches!(
            encode(&message),
            Err(CodecError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn truncated_prefix_is_incomplete_never_an_error() {
        let frame = encode(&sample_open()).unwrap();
        for cut in 0..frame.len() {
            match decode(&frame[..cut]).unwrap() {
                Decoded::Incomplete => {}
                Decoded::Frame { .. } => panic!("prefix of {} bytes decoded as a frame", cut),
            }
        }
    }

    #[test]
    fn concatenated_frames_self_delimit() {
        let first = sample_open();
        let second = Message::Close(Close::with_result(0x8000, Bytes::from_static(b"hello")));

        let mut buf = Vec::new();
        let first_frame = encode(&first).unwrap();
        buf.extend_from_slice(&first_frame);
        buf.extend_from_slice(&encode(&second).unwrap());
        buf.extend_from_slice(b"tail");

        let Decoded::Frame { message, consumed } = decode(&buf).unwrap() else {
            panic!("expected first frame");
        };
        assert_eq!(message, first);
        assert_eq!(consumed, first_frame.len());

        let Decoded::Frame { message, .. } = decode(&buf[consumed..]).unwrap() else {
            panic!("expected second frame");
        };
        assert_eq!(message, second);
    }

    #[test]
    fn unknown_tag_is_an_error() {
        let buf = [0x5A, 0x03, 0x00];
        assert!(matches!(decode(&buf), Err(CodecError::UnknownTag(0x5A))));
    }

    #[test]
    fn unknown_control_tag_is_an_error() {
        let buf = [b'*', 0x04, 0x00, b'Z'];
        assert!(matches!(
            decode(&buf),
            Err(CodecError::UnknownControl(b'Z'))
        ));
    }

    #[test]
    fn trailing_garbage_in_body_is_an_error() {
        let mut frame = encode(&Message::Control(Control::SessionClose))
            .unwrap()
            .to_vec();
        frame.push(0x00);
        let len = frame.len() as u16;
        frame[1..3].copy_from_slice(&len.to_le_bytes());
        assert!(matches!(decode(&frame), Err(CodecError::Malformed(_))));
    }

    #[test]
    fn length_below_header_is_an_error() {
        let buf = [b'(', 0x02, 0x00];
        assert!(matches!(decode(&buf), Err(CodecError::Malformed(_))));
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct EchoArgs {
        text: String,
        repeat: u32,
    }

    #[test]
    fn msgpack_value_codec_roundtrip() {
        let args = EchoArgs {
            text: "hello".to_string(),
            repeat: 3,
        };
        let encoded = MsgpackCodec::encode(&args).unwrap();
        let decoded: EchoArgs = MsgpackCodec::decode(&encoded).unwrap();
        assert_eq!(args, decoded);
    }

    #[test]
    fn msgpack_value_codec_rejects_garbage() {
        let result: Result<EchoArgs, _> = MsgpackCodec::decode(&[0xC1, 0xFF]);
        assert!(result.is_err());
    }

    #[test]
    fn raw_codec_passthrough() {
        assert_eq!(RawCodec::to_bytes(b"abc"), b"abc".to_vec());
        assert_eq!(RawCodec::from_bytes(vec![1, 2]), vec![1, 2]);

        let err = <RawCodec as ValueCodec>::encode(&1u8).unwrap_err();
        assert!(format!("{}", err).contains("to_bytes"));
    }
}
