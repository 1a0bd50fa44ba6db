#![no_std]
//! Wire format of the real-time audio streaming protocol, receiver side.
//!
//! This crate defines every datagram exchanged between a streaming sender and a
//! receiver, and nothing else: no sockets, no clocks, no state.
//!
//! ## Channels
//!
//! A stream session uses three UDP channels:
//!
//! - **Audio**: the sender pushes audio packets (and, on request, resent audio packets).
//!   See [`audio`].
//! - **Control**: the sender pushes periodic sync packets anchoring its frame clock to its
//!   wall clock, and occasionally resent audio. The receiver sends resend requests. See
//!   [`control`].
//! - **Timing**: the receiver sends time requests, the sender answers with its receive and
//!   transmit times, NTP style. See [`timing`].
//!
//! ## Layout
//!
//! All packets share the first bytes of an RTP header: a leader byte (`0x80`, version 2)
//! followed by a type byte. Multi-byte values are big-endian. Wall-clock times are
//! [`NtpTimestamp`]s (32.32 fixed point seconds).
//!
//! Parsing is zero-copy: parsed packets borrow their payload from the datagram buffer.
//! Parsing never panics, malformed input is reported through [`ParseError`].
//!
//! The types in this crate implement `serde`'s `Serialize` and `Deserialize` traits, for
//! the user to conveniently plug them into packet capture or diagnostics backends.

pub mod audio;
pub mod control;
pub mod timing;

mod ntp;

pub use ntp::NtpTimestamp;

use serde::{Deserialize, Serialize};

/// First byte of every packet sent by the receiver: RTP version 2, no padding, no extension.
pub const RTP_LEADER: u8 = 0x80;

/// Size of the fixed RTP header preceding the audio payload.
pub const RTP_HEADER_LEN: usize = 12;

/// Size of the extra prefix carried by resent audio packets, before their RTP header.
pub const RESEND_PREFIX_LEN: usize = 4;

/// Audio payloads shorter than this are considered bogus and dropped.
pub const MIN_AUDIO_PAYLOAD_LEN: usize = 16;

/// Receive buffers should be at least this large.
pub const MAX_DATAGRAM_LEN: usize = 2048;

/// Reasons a datagram could not be parsed.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParseError {
    /// The datagram is shorter than its fixed layout requires.
    #[error("packet too short: needed {needed} bytes, got {have}")]
    TooShort { needed: usize, have: usize },
    /// The type byte doesn't correspond to any packet expected on this channel.
    #[error("unknown packet type 0x{0:02X}")]
    UnknownType(u8),
    /// An audio packet whose payload is shorter than [`MIN_AUDIO_PAYLOAD_LEN`].
    #[error("audio packet {sequence} carries only {have} payload bytes")]
    ShortPayload { sequence: u16, have: usize },
}

/// Returns the raw type byte of a datagram (the second byte), if any.
#[inline(always)]
pub fn type_byte(datagram: &[u8]) -> Option<u8> {
    datagram.get(1).copied()
}

#[inline(always)]
pub(crate) fn read_array<const N: usize>(bytes: &[u8], offset: usize) -> Option<[u8; N]> {
    bytes
        .get(offset..)
        .and_then(|rem| rem.split_first_chunk())
        .map(|(&chunk, _rem)| chunk)
}

#[inline(always)]
pub(crate) fn read_u16(bytes: &[u8], offset: usize) -> Option<u16> {
    read_array(bytes, offset).map(u16::from_be_bytes)
}

#[inline(always)]
pub(crate) fn read_u32(bytes: &[u8], offset: usize) -> Option<u32> {
    read_array(bytes, offset).map(u32::from_be_bytes)
}

#[inline(always)]
pub(crate) const fn too_short(needed: usize, bytes: &[u8]) -> ParseError {
    ParseError::TooShort {
        needed,
        have: bytes.len(),
    }
}
