//! The timing channel: a pinger thread sends time requests, the receiver matches replies
//! against the latest departure time and feeds the clock estimator.

use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use raop_proto::timing::{TimingReply, TimingRequest};
use raop_utils::{queue::PeriodicCounter, time};

use super::Receiver;
use crate::{
    clock::{ClockEstimator, Exchange, Rejection},
    connection::Shared,
    socket::{self, DatagramSocket},
};

/// Round trip statistics are logged, then reset, every this many accepted replies.
pub(crate) const ROUND_TRIP_STATS_PERIOD: core::num::NonZeroUsize =
    core::num::NonZeroUsize::new(20).unwrap();

pub(crate) struct TimingReceiver<S> {
    shared: Arc<Shared<S>>,
    estimator: ClockEstimator,
    period: PeriodicCounter,
}

impl<S: DatagramSocket> TimingReceiver<S> {
    pub(crate) fn new(shared: Arc<Shared<S>>) -> Self {
        let estimator = ClockEstimator::new(shared.id);
        Self {
            shared,
            estimator,
            period: PeriodicCounter::new(ROUND_TRIP_STATS_PERIOD),
        }
    }

    fn track_round_trips(&mut self) {
        if self.period.advance(1) == 0 {
            return;
        }

        let stats = self.estimator.round_trip_stats();

        log::debug!(
            "{}: timing round trip over the last {} replies, in µs: mean {:.1}, std dev {:.1}, \
            max {:.1}",
            self.shared.id,
            stats.count(),
            stats.mean(),
            stats.std_dev().unwrap_or(0.),
            stats.max(),
        );

        self.estimator.reset_round_trip_stats();
    }
}

impl<S: DatagramSocket> Receiver<S> for TimingReceiver<S> {
    const CHANNEL: &'static str = "timing";

    fn on_datagram(&mut self, datagram: &[u8], arrival: u64) {
        let id = self.shared.id;

        if self.shared.dropper.should_drop() {
            log::trace!("{id}: dropping timing reply to simulate a bad connection");
            return;
        }

        let reply = match TimingReply::parse(datagram) {
            Ok(r) => r,
            Err(e) => {
                log::debug!("{id}: unexpected packet on the timing channel: {e}");
                return;
            }
        };

        let Some(departure) = self.shared.lock().departure_time else {
            log::debug!("{id}: timing reply received before any request was sent, ignored");
            return;
        };

        let exchange = Exchange {
            departure,
            arrival,
            remote_receive: reply.receive_time.to_nanos(),
            remote_transmit: reply.transmit_time.to_nanos(),
        };

        match self.estimator.process(exchange) {
            Ok(estimate) => {
                self.shared.lock().clock = Some(estimate.model);

                log::trace!(
                    "{id}: clock offset {} ns from sample {}, drift {:.8} over {} samples, \
                    dispersion {} µs",
                    estimate.model.difference as i64,
                    estimate.chosen,
                    estimate.model.gradient,
                    estimate.drift_samples,
                    estimate.dispersion / time::NANOS_PER_MICRO,
                );

                self.track_round_trips();
            }
            Err(Rejection::RoundTripTooLong { round_trip }) => log::debug!(
                "{id}: timing reply took {} µs, the request or its reply was probably lost",
                round_trip / time::NANOS_PER_MICRO,
            ),
        }
    }
}

/// Sends timing requests until the connection stops.
///
/// The departure time is recorded in the shared state right before each send.
pub(crate) fn run_pinger<S: DatagramSocket>(shared: &Shared<S>) {
    let id = shared.id;
    let request = TimingRequest::ZEROED.encode();
    let mut sent = 0u64;

    while !shared.should_stop() {
        shared.lock().departure_time = Some(time::local_now());

        if shared.dropper.should_drop() {
            log::trace!("{id}: dropping timing request to simulate a bad connection");
        } else if let Err(e) =
            socket::send_packet(&shared.sockets.timing, &request, shared.peers.timing)
        {
            log::debug!("{id}: error sending a timing request: {e}");
        }

        sent += 1;

        park_unless_stopped(shared, shared.config.timing_delay_after(sent));
    }

    log::trace!("{id}: timing pinger stopped");
}

/// Sleeps for `duration`, returning early once the connection stops.
///
/// Teardown unparks the pinger after raising the stop flag.
fn park_unless_stopped<S>(shared: &Shared<S>, duration: Duration) {
    let deadline = Instant::now() + duration;

    while !shared.should_stop() {
        match deadline.checked_duration_since(Instant::now()) {
            Some(left) if !left.is_zero() => thread::park_timeout(left),
            _ => break,
        }
    }
}

/// Body of a connection's timing thread: spawns the pinger, drains the timing socket, and
/// joins the pinger on the way out.
pub(crate) fn run<S: DatagramSocket>(shared: Arc<Shared<S>>) {
    let id = shared.id;

    let pinger = {
        let shared = Arc::clone(&shared);
        thread::Builder::new()
            .name(format!("raop-pinger-{}", id.0))
            .spawn(move || run_pinger(&shared))
    };

    let pinger = match pinger {
        Ok(handle) => {
            shared.set_pinger(handle.thread().clone());
            Some(handle)
        }
        Err(e) => {
            log::warn!("{id}: cannot spawn the timing pinger, the clock will not sync: {e}");
            None
        }
    };

    TimingReceiver::new(Arc::clone(&shared)).start(&shared, &shared.sockets.timing);

    if let Some(handle) = pinger {
        handle.thread().unpark();
        if handle.join().is_err() {
            log::warn!("{id}: timing pinger panicked");
        }
    }
}
