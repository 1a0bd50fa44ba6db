use std::sync::Arc;

use raop_proto::{
    ParseError,
    control::{ControlPacket, SyncPacket},
};

use super::Receiver;
use crate::{
    connection::Shared,
    socket::DatagramSocket,
    sync::{self, LatencyDecision},
};

/// Anchors the stream on sync packets, and forwards audio resent over the control channel.
pub(crate) struct ControlReceiver<S> {
    shared: Arc<Shared<S>>,
}

impl<S: DatagramSocket> ControlReceiver<S> {
    pub(crate) fn new(shared: Arc<Shared<S>>) -> Self {
        Self { shared }
    }

    fn on_sync(&mut self, packet: &SyncPacket) {
        let shared = &*self.shared;
        let id = shared.id;

        let (decision, changed, latency) = {
            let mut state = shared.lock();

            if state.clock.is_none() {
                drop(state);
                log::debug!("{id}: sync packet received before any timing reply, dropped");
                return;
            }

            let decision = sync::resolve_latency(
                &shared.config,
                state.minimum_latency,
                state.maximum_latency,
                state.peer_version,
                packet,
            );

            let changed = sync::apply_latency(&mut state, decision);
            sync::update_anchor(&mut state, packet);

            (decision, changed, state.latency)
        };

        match decision {
            LatencyDecision::Rejected { requested, ceiling } => log::warn!(
                "{id}: out-of-range latency request of {requested} frames ignored, must be \
                {ceiling} frames or less. Latency remains at {latency} frames",
            ),
            LatencyDecision::UserSupplied(l) if changed => {
                log::debug!("{id}: using the user-supplied latency of {l} frames");
            }
            LatencyDecision::Resolved(l) if changed => log::trace!(
                "{id}: new latency {l} frames, sync latency {} frames",
                packet.latency_frames(),
            ),
            _ => (),
        }
    }
}

impl<S: DatagramSocket> Receiver<S> for ControlReceiver<S> {
    const CHANNEL: &'static str = "control";

    fn on_datagram(&mut self, datagram: &[u8], _arrival: u64) {
        let id = self.shared.id;

        if self.shared.dropper.should_drop() {
            log::trace!("{id}: dropping control packet to simulate a bad connection");
            return;
        }

        match ControlPacket::parse(datagram) {
            Ok(ControlPacket::Sync(sync)) => self.on_sync(&sync),
            Ok(ControlPacket::ResentAudio(packet)) => {
                log::trace!(
                    "{id}: retransmitted audio packet {} received on the control channel",
                    packet.sequence,
                );
                self.shared.deliver(&packet);
            }
            Err(ParseError::ShortPayload { sequence, have }) => log::debug!(
                "{id}: retransmitted audio packet {sequence} carries only {have} payload \
                bytes, dropped"
            ),
            Err(ParseError::UnknownType(t)) => log::debug!(
                "{id}: unknown control packet of type 0x{t:02x}, length {}",
                datagram.len(),
            ),
            Err(e) => log::debug!("{id}: malformed control packet: {e}"),
        }
    }
}
