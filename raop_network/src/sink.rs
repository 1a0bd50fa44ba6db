//! Where validated audio goes.
//!
//! The receivers hand every valid audio packet to a [`PacketSink`]. What happens next
//! (sequencing, gap detection, decoding) is the sink's business.

use std::sync::{Mutex, PoisonError};

use arrayvec::ArrayVec;
use raop_proto::{
    MAX_DATAGRAM_LEN, RTP_HEADER_LEN,
    audio::{AudioKind, AudioPacket},
};
use raop_utils::queue::{self, rtrb};

use crate::ConnectionId;

/// Receives validated audio packets from the network threads.
///
/// Called from the audio receiver thread and, for audio resent over the control channel,
/// from the control receiver thread, so it must not block for long.
pub trait PacketSink: Send + Sync + 'static {
    fn put_packet(&self, connection: ConnectionId, packet: &AudioPacket<'_>);
}

impl<F> PacketSink for F
where
    F: Fn(ConnectionId, &AudioPacket<'_>) + Send + Sync + 'static,
{
    #[inline(always)]
    fn put_packet(&self, connection: ConnectionId, packet: &AudioPacket<'_>) {
        self(connection, packet)
    }
}

/// Largest audio payload a datagram can carry.
pub const MAX_PAYLOAD_LEN: usize = MAX_DATAGRAM_LEN - RTP_HEADER_LEN;

/// An owned copy of an [`AudioPacket`], for queueing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedPacket {
    pub connection: ConnectionId,
    pub kind: AudioKind,
    pub sequence: u16,
    pub timestamp: u32,
    pub payload: ArrayVec<u8, MAX_PAYLOAD_LEN>,
}

impl QueuedPacket {
    /// Returns `None` if the payload is larger than any datagram we receive.
    pub fn new(connection: ConnectionId, packet: &AudioPacket<'_>) -> Option<Self> {
        Some(Self {
            connection,
            kind: packet.kind,
            sequence: packet.sequence,
            timestamp: packet.timestamp,
            payload: ArrayVec::try_from(packet.payload).ok()?,
        })
    }
}

/// A [`PacketSink`] pushing copies of every packet onto a wait-free SPSC ring.
///
/// The consuming end goes to the playback thread. When the ring is full, packets are
/// dropped, and the playback side will eventually ask for them again.
pub struct RingSink {
    tx: Mutex<rtrb::Producer<QueuedPacket>>,
}

impl RingSink {
    pub fn new(capacity: usize) -> (Self, rtrb::Consumer<QueuedPacket>) {
        let (tx, rx) = queue::ring(capacity);
        (Self { tx: Mutex::new(tx) }, rx)
    }
}

impl PacketSink for RingSink {
    fn put_packet(&self, connection: ConnectionId, packet: &AudioPacket<'_>) {
        let Some(queued) = QueuedPacket::new(connection, packet) else {
            log::debug!(
                "{connection}: audio packet {} too large to queue ({} bytes)",
                packet.sequence,
                packet.payload.len(),
            );
            return;
        };

        // both the audio and control threads may push
        let mut tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner);

        if tx.push(queued).is_err() {
            log::debug!(
                "{connection}: packet queue full, dropping audio packet {}",
                packet.sequence,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_sink_queues_until_full() {
        let (sink, mut rx) = RingSink::new(2);
        let id = ConnectionId(3);

        let payload = [0xab; 16];
        for sequence in 0..3 {
            sink.put_packet(
                id,
                &AudioPacket {
                    kind: AudioKind::Data,
                    sequence,
                    timestamp: u32::from(sequence) * 352,
                    payload: &payload,
                },
            );
        }

        let first = rx.pop().unwrap();
        assert_eq!(first.connection, id);
        assert_eq!(first.sequence, 0);
        assert_eq!(first.payload.as_slice(), &payload);

        assert_eq!(rx.pop().unwrap().timestamp, 352);
        // the third one found the ring full
        assert!(rx.pop().is_err());
    }

    #[test]
    fn closures_are_sinks() {
        let seen = std::sync::Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();

        let sink = move |_: ConnectionId, p: &AudioPacket<'_>| {
            seen2.lock().unwrap().push(p.sequence);
        };

        sink.put_packet(
            ConnectionId(0),
            &AudioPacket {
                kind: AudioKind::Resend,
                sequence: 9,
                timestamp: 0,
                payload: &[0; 16],
            },
        );

        assert_eq!(*seen.lock().unwrap(), [9]);
    }
}
