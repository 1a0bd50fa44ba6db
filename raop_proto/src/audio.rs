//! Audio channel packets.
//!
//! ```text
//! byte  0      1      2..4       4..8        8..12  12..
//!       leader type   sequence   timestamp   ssrc   payload (>= 16 bytes)
//! ```
//!
//! Resent audio carries an extra [`RESEND_PREFIX_LEN`]-byte prefix, after which the layout
//! above applies unchanged.

use serde::{Deserialize, Serialize};

use crate::{MIN_AUDIO_PAYLOAD_LEN, ParseError, RESEND_PREFIX_LEN, RTP_HEADER_LEN};

/// Type code (marker bit masked off) of regular audio data.
pub const TYPE_AUDIO_DATA: u8 = 0x60;
/// Type code (marker bit masked off) of audio resent on the audio channel.
pub const TYPE_AUDIO_RESEND: u8 = 0x56;

/// Mask removing the RTP marker bit from the type byte.
pub const TYPE_MASK: u8 = 0x7f;

/// How an audio packet reached us.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AudioKind {
    /// Regular, in-order audio data.
    Data,
    /// Audio resent in answer to a resend request.
    Resend,
}

/// A parsed audio packet, borrowing its payload from the datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AudioPacket<'a> {
    pub kind: AudioKind,
    pub sequence: u16,
    /// Source frame clock value of the first frame in the payload.
    pub timestamp: u32,
    #[serde(borrow)]
    pub payload: &'a [u8],
}

impl<'a> AudioPacket<'a> {
    /// Parses a datagram received on the audio channel.
    ///
    /// Accepts both regular ([`TYPE_AUDIO_DATA`]) and resent ([`TYPE_AUDIO_RESEND`]) audio.
    pub fn parse(datagram: &'a [u8]) -> Result<Self, ParseError> {
        let packet_type = crate::type_byte(datagram)
            .ok_or(crate::too_short(2, datagram))?
            & TYPE_MASK;

        match packet_type {
            TYPE_AUDIO_DATA => Self::parse_rtp(AudioKind::Data, datagram),
            TYPE_AUDIO_RESEND => Self::parse_prefixed(datagram),
            other => Err(ParseError::UnknownType(other)),
        }
    }

    /// Parses resent audio: a [`RESEND_PREFIX_LEN`]-byte prefix, then a regular audio packet.
    pub(crate) fn parse_prefixed(datagram: &'a [u8]) -> Result<Self, ParseError> {
        let rtp = datagram
            .get(RESEND_PREFIX_LEN..)
            .ok_or(crate::too_short(RESEND_PREFIX_LEN, datagram))?;

        Self::parse_rtp(AudioKind::Resend, rtp)
    }

    fn parse_rtp(kind: AudioKind, rtp: &'a [u8]) -> Result<Self, ParseError> {
        let (header, payload) = rtp
            .split_at_checked(RTP_HEADER_LEN)
            .ok_or(crate::too_short(RTP_HEADER_LEN, rtp))?;

        // the header is RTP_HEADER_LEN bytes long, both reads succeed
        let sequence = crate::read_u16(header, 2).ok_or(crate::too_short(4, header))?;
        let timestamp = crate::read_u32(header, 4).ok_or(crate::too_short(8, header))?;

        if payload.len() < MIN_AUDIO_PAYLOAD_LEN {
            return Err(ParseError::ShortPayload {
                sequence,
                have: payload.len(),
            });
        }

        Ok(Self {
            kind,
            sequence,
            timestamp,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rtp(packet_type: u8, sequence: u16, timestamp: u32, payload_len: usize) -> [u8; 64] {
        let mut buf = [0u8; 64];
        buf[0] = 0x80;
        buf[1] = packet_type;
        buf[2..4].copy_from_slice(&sequence.to_be_bytes());
        buf[4..8].copy_from_slice(&timestamp.to_be_bytes());
        for (i, b) in buf[12..12 + payload_len].iter_mut().enumerate() {
            *b = i as u8;
        }
        buf
    }

    #[test]
    fn parses_data_with_marker_bit() {
        let buf = rtp(0x80 | TYPE_AUDIO_DATA, 513, 0xdead_beef, 16);
        let packet = AudioPacket::parse(&buf[..28]).unwrap();

        assert_eq!(packet.kind, AudioKind::Data);
        assert_eq!(packet.sequence, 513);
        assert_eq!(packet.timestamp, 0xdead_beef);
        assert_eq!(packet.payload.len(), 16);
        assert_eq!(packet.payload[3], 3);
    }

    #[test]
    fn fifteen_byte_payload_is_rejected() {
        let buf = rtp(TYPE_AUDIO_DATA, 7, 0, 15);
        assert_eq!(
            AudioPacket::parse(&buf[..27]),
            Err(ParseError::ShortPayload { sequence: 7, have: 15 })
        );
    }

    #[test]
    fn resend_skips_prefix() {
        let inner = rtp(TYPE_AUDIO_DATA, 42, 1000, 20);
        let mut buf = [0u8; 68];
        buf[0] = 0x80;
        buf[1] = 0x80 | TYPE_AUDIO_RESEND;
        buf[4..].copy_from_slice(&inner);

        let packet = AudioPacket::parse(&buf[..4 + 32]).unwrap();
        assert_eq!(packet.kind, AudioKind::Resend);
        assert_eq!(packet.sequence, 42);
        assert_eq!(packet.timestamp, 1000);
        assert_eq!(packet.payload.len(), 20);
    }

    #[test]
    fn garbage_never_panics() {
        assert_eq!(AudioPacket::parse(&[]), Err(ParseError::TooShort { needed: 2, have: 0 }));
        assert_eq!(
            AudioPacket::parse(&[0x80, 0x60, 1]),
            Err(ParseError::TooShort { needed: 12, have: 3 })
        );
        assert_eq!(
            AudioPacket::parse(&[0x80, 0xd6, 0]),
            Err(ParseError::TooShort { needed: 4, have: 3 })
        );
        assert_eq!(
            AudioPacket::parse(&[0x80, 0xd4, 0, 0]),
            Err(ParseError::UnknownType(0x54))
        );
    }
}
