//! Property-based roundtrip and framing tests for the wire codec.
//!
//! Proptest drives arbitrary messages through encode/decode and arbitrary
//! byte soup through decode, checking:
//!
//! - every well-formed message roundtrips identically;
//! - frames self-delimit: concatenations decode message by message with
//!   exact consumed counts;
//! - any truncated prefix reads as incomplete, never as an error;
//! - arbitrary input never panics the decoder.

use std::collections::BTreeMap;

use bytes::Bytes;
use proptest::prelude::*;

use asterisque::{Block, Close, Control, Decoded, Message, Open, SyncSession, decode, encode};

fn arb_open() -> impl Strategy<Value = Message> {
    (
        any::<u16>(),
        any::<i8>(),
        "[a-z][a-z0-9.-]{0,24}",
        any::<u16>(),
        prop::collection::vec(any::<u8>(), 0..512),
    )
        .prop_map(|(pipe_id, priority, service_id, function_id, params)| {
            Message::Open(Open {
                pipe_id,
                priority,
                service_id,
                function_id,
                params: Bytes::from(params),
            })
        })
}

fn arb_close() -> impl Strategy<Value = Message> {
    (
        any::<u16>(),
        any::<i8>(),
        prop::collection::vec(any::<u8>(), 0..512),
    )
        .prop_map(|(pipe_id, code, result)| {
            Message::Close(Close {
                pipe_id,
                code,
                result: Bytes::from(result),
            })
        })
}

fn arb_block() -> impl Strategy<Value = Message> {
    (
        any::<u16>(),
        any::<bool>(),
        0u8..=0x7F,
        prop::collection::vec(any::<u8>(), 0..2048),
    )
        .prop_map(|(pipe_id, eof, loss, payload)| {
            Message::Block(Block {
                pipe_id,
                eof,
                loss,
                payload: Bytes::from(payload),
            })
        })
}

fn arb_control() -> impl Strategy<Value = Message> {
    let sync = (
        any::<u32>(),
        any::<i64>(),
        prop::collection::btree_map("[a-z.]{1,12}", "[a-zA-Z0-9]{0,16}", 0..5),
    )
        .prop_map(|(version, utc_time, config)| {
            Message::Control(Control::SyncSession(SyncSession {
                version,
                utc_time,
                config: config.into_iter().collect::<BTreeMap<_, _>>(),
            }))
        });
    prop_oneof![sync, Just(Message::Control(Control::SessionClose))]
}

fn arb_message() -> impl Strategy<Value = Message> {
    prop_oneof![arb_open(), arb_close(), arb_block(), arb_control()]
}

proptest! {
    /// Any well-formed message roundtrips identically, consuming exactly
    /// its own frame.
    #[test]
    fn message_roundtrips(message in arb_message()) {
        let frame = encode(&message).unwrap();
        match decode(&frame).unwrap() {
            Decoded::Frame { message: back, consumed } => {
                prop_assert_eq!(back, message);
                prop_assert_eq!(consumed, frame.len());
            }
            Decoded::Incomplete => prop_assert!(false, "complete frame read as incomplete"),
        }
    }

    /// Encoding is deterministic.
    #[test]
    fn encoding_is_deterministic(message in arb_message()) {
        prop_assert_eq!(encode(&message).unwrap(), encode(&message).unwrap());
    }

    /// Concatenated frames decode one by one with exact consumed counts,
    /// regardless of the trailing bytes.
    #[test]
    fn frames_self_delimit(
        first in arb_message(),
        second in arb_message(),
        tail in prop::collection::vec(any::<u8>(), 0..64),
    ) {
        let first_frame = encode(&first).unwrap();
        let second_frame = encode(&second).unwrap();

        let mut buf = Vec::new();
        buf.extend_from_slice(&first_frame);
        buf.extend_from_slice(&second_frame);
        buf.extend_from_slice(&tail);

        match decode(&buf).unwrap() {
            Decoded::Frame { message, consumed } => {
                prop_assert_eq!(message, first);
                prop_assert_eq!(consumed, first_frame.len());
            }
            Decoded::Incomplete => prop_assert!(false, "first frame incomplete"),
        }

        match decode(&buf[first_frame.len()..]).unwrap() {
            Decoded::Frame { message, consumed } => {
                prop_assert_eq!(message, second);
                prop_assert_eq!(consumed, second_frame.len());
            }
            Decoded::Incomplete => prop_assert!(false, "second frame incomplete"),
        }
    }

    /// A truncated prefix is a signal to accumulate more bytes, never an
    /// error.
    #[test]
    fn truncated_prefixes_are_incomplete(message in arb_message(), cut in 0.0f64..1.0) {
        let frame = encode(&message).unwrap();
        let cut = ((frame.len() as f64) * cut) as usize;
        prop_assume!(cut < frame.len());
        prop_assert_eq!(decode(&frame[..cut]).unwrap(), Decoded::Incomplete);
    }

    /// The decoder never panics, whatever the input.
    #[test]
    fn decoder_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..512)) {
        let _ = decode(&bytes);
    }

    /// Corrupting a frame body never yields a different valid message
    /// silently panicking; it either still parses or reports an error.
    #[test]
    fn bit_flips_do_not_panic(message in arb_message(), index in any::<prop::sample::Index>(), bit in 0u8..8) {
        let mut frame = encode(&message).unwrap().to_vec();
        let position = index.index(frame.len());
        frame[position] ^= 1 << bit;
        let _ = decode(&frame);
    }
}
