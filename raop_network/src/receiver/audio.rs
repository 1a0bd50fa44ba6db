use std::sync::Arc;

use raop_proto::{
    ParseError,
    audio::{AudioPacket, TYPE_AUDIO_RESEND, TYPE_MASK},
};
use raop_utils::{queue::PeriodicCounter, stats::OnlineStats, time};

use super::Receiver;
use crate::{connection::Shared, socket::DatagramSocket};

/// Inter-arrival statistics are logged, then reset, every this many packets.
pub(crate) const ARRIVAL_STATS_PERIOD: core::num::NonZeroUsize =
    core::num::NonZeroUsize::new(2500).unwrap();

/// Validates audio packets and hands them to the connection's sink.
pub(crate) struct AudioReceiver<S> {
    shared: Arc<Shared<S>>,
    /// Microseconds between consecutive datagrams.
    arrivals: OnlineStats,
    period: PeriodicCounter,
    last_arrival: Option<u64>,
}

impl<S: DatagramSocket> AudioReceiver<S> {
    pub(crate) fn new(shared: Arc<Shared<S>>) -> Self {
        Self {
            shared,
            arrivals: OnlineStats::new(),
            period: PeriodicCounter::new(ARRIVAL_STATS_PERIOD),
            last_arrival: None,
        }
    }

    fn track_arrival(&mut self, arrival: u64) {
        let Some(last) = self.last_arrival.replace(arrival) else {
            return;
        };

        self.arrivals
            .push(time::nanos_to_micros_f64(arrival.saturating_sub(last)));

        if self.period.advance(1) > 0 {
            log::debug!(
                "{}: packet arrival interval over the last {} packets, in µs: mean {:.1}, \
                std dev {:.1}, max {:.1}",
                self.shared.id,
                self.arrivals.count(),
                self.arrivals.mean(),
                self.arrivals.std_dev().unwrap_or(0.),
                self.arrivals.max(),
            );

            self.arrivals.reset();
            self.last_arrival = None;
        }
    }
}

impl<S: DatagramSocket> Receiver<S> for AudioReceiver<S> {
    const CHANNEL: &'static str = "audio";

    fn on_datagram(&mut self, datagram: &[u8], arrival: u64) {
        self.track_arrival(arrival);

        let id = self.shared.id;

        match AudioPacket::parse(datagram) {
            Ok(packet) if self.shared.dropper.should_drop() => {
                log::trace!(
                    "{id}: dropping audio packet {} to simulate a bad connection",
                    packet.sequence,
                );
            }
            Ok(packet) => self.shared.deliver(&packet),
            Err(ParseError::ShortPayload { sequence: 0, .. })
                if datagram[1] & TYPE_MASK == TYPE_AUDIO_RESEND =>
            {
                log::debug!("{id}: resend-related request packet received, ignored");
            }
            Err(ParseError::ShortPayload { sequence, have }) => {
                log::debug!(
                    "{id}: audio packet {sequence} carries only {have} payload bytes, dropped"
                );
            }
            Err(ParseError::UnknownType(t)) => {
                log::debug!(
                    "{id}: unknown audio packet of type 0x{t:02x}, length {}",
                    datagram.len(),
                );
            }
            Err(e) => log::debug!("{id}: malformed audio packet: {e}"),
        }
    }
}
