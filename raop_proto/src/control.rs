//! Control channel packets.
//!
//! Inbound, the sender emits [`SyncPacket`]s about once a second, and may multiplex resent
//! audio onto this channel. Outbound, the receiver sends [`ResendRequest`]s.

use serde::{Deserialize, Serialize};

use crate::{NtpTimestamp, ParseError, RTP_LEADER, audio::AudioPacket};

/// Type byte of a sync packet.
pub const TYPE_SYNC: u8 = 0xd4;
/// Type byte of resent audio delivered on the control channel.
pub const TYPE_RESENT_AUDIO: u8 = 0xd6;
/// Type byte of a resend request (`0x55` with the marker bit set).
pub const TYPE_RESEND_REQUEST: u8 = 0x55 | 0x80;

pub const SYNC_PACKET_LEN: usize = 20;
pub const RESEND_REQUEST_LEN: usize = 8;

/// Sequence number the receiver puts in every resend request.
pub const RESEND_REQUEST_SEQUENCE: u16 = 1;

/// Anchors the sender's frame clock to its wall clock.
///
/// ```text
/// byte  0      1     2..4   4..8                        8..16        16..20
///       leader 0xd4  flags  rtp_timestamp_less_latency  remote_time  sync_timestamp
/// ```
///
/// `sync_timestamp` is the frame that plays at `remote_time` on the sender,
/// `rtp_timestamp_less_latency` the frame that should play at that time on the receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SyncPacket {
    pub flags: u16,
    pub rtp_timestamp_less_latency: u32,
    pub remote_time: NtpTimestamp,
    pub sync_timestamp: u32,
}

impl SyncPacket {
    pub fn parse(datagram: &[u8]) -> Result<Self, ParseError> {
        match crate::type_byte(datagram) {
            Some(TYPE_SYNC) => (),
            Some(other) => return Err(ParseError::UnknownType(other)),
            None => return Err(crate::too_short(SYNC_PACKET_LEN, datagram)),
        }

        let short = || crate::too_short(SYNC_PACKET_LEN, datagram);

        Ok(Self {
            flags: crate::read_u16(datagram, 2).ok_or_else(short)?,
            rtp_timestamp_less_latency: crate::read_u32(datagram, 4).ok_or_else(short)?,
            remote_time: crate::read_array(datagram, 8)
                .map(NtpTimestamp::from_be_bytes)
                .ok_or_else(short)?,
            sync_timestamp: crate::read_u32(datagram, 16).ok_or_else(short)?,
        })
    }

    pub fn encode(&self) -> [u8; SYNC_PACKET_LEN] {
        let mut buf = [0; SYNC_PACKET_LEN];
        buf[0] = RTP_LEADER;
        buf[1] = TYPE_SYNC;
        buf[2..4].copy_from_slice(&self.flags.to_be_bytes());
        buf[4..8].copy_from_slice(&self.rtp_timestamp_less_latency.to_be_bytes());
        buf[8..16].copy_from_slice(&self.remote_time.to_be_bytes());
        buf[16..20].copy_from_slice(&self.sync_timestamp.to_be_bytes());
        buf
    }

    /// The latency the sender asks for, in frames.
    ///
    /// Modulo 2^32: a sync straddling the timestamp wraparound yields the right value.
    #[inline(always)]
    pub const fn latency_frames(&self) -> u32 {
        self.sync_timestamp
            .wrapping_sub(self.rtp_timestamp_less_latency)
    }
}

/// Any packet the control channel may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ControlPacket<'a> {
    Sync(SyncPacket),
    ResentAudio(#[serde(borrow)] AudioPacket<'a>),
}

impl<'a> ControlPacket<'a> {
    /// Unlike the audio channel, the type byte is compared verbatim (marker bit included).
    pub fn parse(datagram: &'a [u8]) -> Result<Self, ParseError> {
        match crate::type_byte(datagram) {
            Some(TYPE_SYNC) => SyncPacket::parse(datagram).map(Self::Sync),
            Some(TYPE_RESENT_AUDIO) => AudioPacket::parse_prefixed(datagram).map(Self::ResentAudio),
            Some(other) => Err(ParseError::UnknownType(other)),
            None => Err(crate::too_short(2, datagram)),
        }
    }
}

/// Asks the sender to retransmit `count` audio packets starting at sequence number `first`.
///
/// This is *not* a standard RTCP NACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResendRequest {
    pub first: u16,
    pub count: u16,
}

impl ResendRequest {
    pub fn encode(&self) -> [u8; RESEND_REQUEST_LEN] {
        let mut buf = [0; RESEND_REQUEST_LEN];
        buf[0] = RTP_LEADER;
        buf[1] = TYPE_RESEND_REQUEST;
        buf[2..4].copy_from_slice(&RESEND_REQUEST_SEQUENCE.to_be_bytes());
        buf[4..6].copy_from_slice(&self.first.to_be_bytes());
        buf[6..8].copy_from_slice(&self.count.to_be_bytes());
        buf
    }

    /// Sender-side parsing, mostly useful for simulated senders.
    pub fn parse(datagram: &[u8]) -> Result<Self, ParseError> {
        match crate::type_byte(datagram) {
            Some(TYPE_RESEND_REQUEST) => (),
            Some(other) => return Err(ParseError::UnknownType(other)),
            None => return Err(crate::too_short(RESEND_REQUEST_LEN, datagram)),
        }

        let short = || crate::too_short(RESEND_REQUEST_LEN, datagram);

        Ok(Self {
            first: crate::read_u16(datagram, 4).ok_or_else(short)?,
            count: crate::read_u16(datagram, 6).ok_or_else(short)?,
        })
    }
}
