//! Timing channel packets.
//!
//! The receiver periodically sends a [`TimingRequest`]; the sender answers with a
//! [`TimingReply`] carrying the time it received the request and the time it sent the reply,
//! both read from its own wall clock.
//!
//! ```text
//! byte  0      1     2..4      4..8    8..16   16..24   24..32
//!       leader type  sequence  filler  origin  receive  transmit
//! ```

use serde::{Deserialize, Serialize};

use crate::{NtpTimestamp, ParseError, RTP_LEADER};

pub const TYPE_TIMING_REQUEST: u8 = 0xd2;
pub const TYPE_TIMING_REPLY: u8 = 0xd3;

pub const TIMING_PACKET_LEN: usize = 32;

/// Sequence number the receiver puts in every timing request.
pub const TIMING_REQUEST_SEQUENCE: u16 = 7;

/// A time request.
///
/// The receiver leaves all three timestamps zeroed and records the departure time on its
/// own clock instead.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimingRequest {
    pub origin: NtpTimestamp,
    pub receive: NtpTimestamp,
    pub transmit: NtpTimestamp,
}

impl TimingRequest {
    pub const ZEROED: Self = Self {
        origin: NtpTimestamp::ZERO,
        receive: NtpTimestamp::ZERO,
        transmit: NtpTimestamp::ZERO,
    };

    pub fn encode(&self) -> [u8; TIMING_PACKET_LEN] {
        encode_timing(
            TYPE_TIMING_REQUEST,
            TIMING_REQUEST_SEQUENCE,
            [self.origin, self.receive, self.transmit],
        )
    }

    /// Sender-side parsing, mostly useful for simulated senders.
    pub fn parse(datagram: &[u8]) -> Result<Self, ParseError> {
        let [origin, receive, transmit] = parse_timing(TYPE_TIMING_REQUEST, datagram)?;
        Ok(Self {
            origin,
            receive,
            transmit,
        })
    }
}

/// A time reply, as seen by the receiver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimingReply {
    /// Echo of the request's origin field. Unused, since our requests leave it zeroed.
    pub origin: NtpTimestamp,
    /// When the sender received the request, on its clock.
    pub receive_time: NtpTimestamp,
    /// When the sender sent this reply, on its clock.
    pub transmit_time: NtpTimestamp,
}

impl TimingReply {
    pub fn parse(datagram: &[u8]) -> Result<Self, ParseError> {
        let [origin, receive_time, transmit_time] = parse_timing(TYPE_TIMING_REPLY, datagram)?;
        Ok(Self {
            origin,
            receive_time,
            transmit_time,
        })
    }

    /// Sender-side encoding, mostly useful for simulated senders.
    pub fn encode(&self, sequence: u16) -> [u8; TIMING_PACKET_LEN] {
        encode_timing(
            TYPE_TIMING_REPLY,
            sequence,
            [self.origin, self.receive_time, self.transmit_time],
        )
    }
}

fn encode_timing(
    packet_type: u8,
    sequence: u16,
    times: [NtpTimestamp; 3],
) -> [u8; TIMING_PACKET_LEN] {
    let mut buf = [0; TIMING_PACKET_LEN];
    buf[0] = RTP_LEADER;
    buf[1] = packet_type;
    buf[2..4].copy_from_slice(&sequence.to_be_bytes());
    // bytes 4..8 are filler

    for (dest, time) in buf[8..].chunks_exact_mut(8).zip(times) {
        dest.copy_from_slice(&time.to_be_bytes());
    }

    buf
}

fn parse_timing(packet_type: u8, datagram: &[u8]) -> Result<[NtpTimestamp; 3], ParseError> {
    match crate::type_byte(datagram) {
        Some(t) if t == packet_type => (),
        Some(other) => return Err(ParseError::UnknownType(other)),
        None => return Err(crate::too_short(TIMING_PACKET_LEN, datagram)),
    }

    let read = |offset| {
        crate::read_array(datagram, offset)
            .map(NtpTimestamp::from_be_bytes)
            .ok_or(crate::too_short(TIMING_PACKET_LEN, datagram))
    };

    Ok([read(8)?, read(16)?, read(24)?])
}
