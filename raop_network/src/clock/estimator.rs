//! Best-of-window offset estimation with least-squares drift.
//!
//! Every timing exchange yields one sample of the local-to-remote offset, whose quality is
//! its *dispersion*: the round trip time minus the time the sender spent processing the
//! request. Samples are kept, newest first, in a ring of [`TIME_PING_HISTORY`] entries, and
//! every insertion ages all older dispersions by [`DISPERSION_AGING_PERCENT`].
//!
//! The sample with the lowest (aged) dispersion is *chosen* and its offset adopted. Once
//! enough samples have been chosen, the drift between the two clocks is the slope of the
//! least-squares line through the chosen samples.

use arrayvec::ArrayVec;
use raop_utils::{stats::OnlineStats, time};

use super::ClockModel;
use crate::ConnectionId;

/// Capacity of the sample ring.
pub const TIME_PING_HISTORY: usize = 16;

/// Exchanges whose round trip reaches this are presumed lost or mismatched.
pub const MAX_ROUND_TRIP: u64 = 300 * time::NANOS_PER_MILLI;

/// Every insertion multiplies older dispersions by this, in percent.
pub const DISPERSION_AGING_PERCENT: u64 = 110;

/// Samples with a sequence number up to this are left out of the drift estimate, the
/// first exchanges of a session being the noisiest.
pub const SETTLING_SAMPLES: u64 = 20;

/// Minimum number of qualifying chosen samples for a drift estimate.
pub const MIN_DRIFT_SAMPLES: usize = 8;

/// One offset sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimePing {
    /// When the reply arrived, on our clock.
    pub local_time: u64,
    /// Our estimate of the sender's clock at `local_time`.
    pub remote_time: u64,
    pub sequence_number: u64,
    /// `remote_time - local_time`, two's complement.
    pub local_to_remote_difference: u64,
    pub dispersion: u64,
    /// Whether this sample has ever been the best of the window.
    pub chosen: bool,
}

/// One request/reply exchange. All fields are nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exchange {
    /// When the request left, on our clock.
    pub departure: u64,
    /// When the reply arrived, on our clock.
    pub arrival: u64,
    /// When the sender received the request, on its clock.
    pub remote_receive: u64,
    /// When the sender sent the reply, on its clock.
    pub remote_transmit: u64,
}

/// Why an exchange was not used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// The round trip took [`MAX_ROUND_TRIP`] or longer, or the reply predates the request.
    RoundTripTooLong { round_trip: u64 },
}

/// The outcome of an accepted exchange.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Estimate {
    pub model: ClockModel,
    /// Index of the chosen sample, `0` being the newest.
    pub chosen: usize,
    /// The accepted exchange's dispersion.
    pub dispersion: u64,
    /// Number of samples the gradient was fitted on, `0` if the gradient is the default.
    pub drift_samples: usize,
}

#[derive(Debug, Clone)]
pub struct ClockEstimator {
    id: ConnectionId,
    pings: ArrayVec<TimePing, TIME_PING_HISTORY>,
    next_sequence: u64,
    round_trips: OnlineStats,
}

impl ClockEstimator {
    pub const fn new(id: ConnectionId) -> Self {
        Self {
            id,
            pings: ArrayVec::new_const(),
            next_sequence: 0,
            round_trips: OnlineStats::new(),
        }
    }

    /// Held samples, newest first.
    #[inline(always)]
    pub fn pings(&self) -> &[TimePing] {
        &self.pings
    }

    /// Round trip statistics of accepted exchanges, net of the sender's processing time,
    /// in microseconds.
    #[inline(always)]
    pub fn round_trip_stats(&self) -> &OnlineStats {
        &self.round_trips
    }

    /// Starts a new round of round trip statistics.
    #[inline(always)]
    pub fn reset_round_trip_stats(&mut self) {
        self.round_trips.reset();
    }

    /// Folds one exchange into the model.
    pub fn process(&mut self, exchange: Exchange) -> Result<Estimate, Rejection> {
        let raw_round_trip = exchange.arrival.wrapping_sub(exchange.departure);

        if raw_round_trip >= MAX_ROUND_TRIP {
            return Err(Rejection::RoundTripTooLong {
                round_trip: raw_round_trip,
            });
        }

        let processing = exchange
            .remote_transmit
            .checked_sub(exchange.remote_receive)
            .unwrap_or_else(|| {
                log::debug!(
                    "{}: sender transmitted a timing reply before receiving the request",
                    self.id,
                );
                0
            });

        let mut dispersion = raw_round_trip;

        if processing < raw_round_trip {
            dispersion -= processing;
        } else {
            log::debug!(
                "{}: remote processing time ({processing} ns) is not less than the round trip \
                ({raw_round_trip} ns), ignored",
                self.id,
            );
        }

        // half the raw round trip, so the arrival lines up with the reply's transmit time
        let remote_time = exchange.remote_transmit.wrapping_add(raw_round_trip / 2);

        let ping = TimePing {
            local_time: exchange.arrival,
            remote_time,
            sequence_number: self.next_sequence,
            local_to_remote_difference: remote_time.wrapping_sub(exchange.arrival),
            dispersion,
            chosen: false,
        };

        self.next_sequence += 1;
        self.insert(ping);

        let chosen = self.choose();
        let best = self.pings[chosen];

        let mut model = ClockModel::new(best.local_to_remote_difference, best.local_time);

        let drift_samples = match self.drift() {
            Some((gradient, n)) => {
                model.gradient = gradient;
                n
            }
            None => 0,
        };

        self.round_trips.push(time::nanos_to_micros_f64(dispersion));

        Ok(Estimate {
            model,
            chosen,
            dispersion,
            drift_samples,
        })
    }

    fn insert(&mut self, ping: TimePing) {
        for p in &mut self.pings {
            p.dispersion = p.dispersion.saturating_mul(DISPERSION_AGING_PERCENT) / 100;
        }

        self.pings.truncate(TIME_PING_HISTORY - 1);
        self.pings.insert(0, ping);
    }

    /// Marks the sample with the lowest dispersion as chosen, the newest winning ties.
    fn choose(&mut self) -> usize {
        let mut best = 0;

        for (i, p) in self.pings.iter().enumerate().skip(1) {
            if p.dispersion < self.pings[best].dispersion {
                best = i;
            }
        }

        self.pings[best].chosen = true;
        best
    }

    /// Slope of remote time against local time over the settled, chosen samples.
    fn drift(&self) -> Option<(f64, usize)> {
        let mut samples = self
            .pings
            .iter()
            .filter(|p| p.chosen && p.sequence_number > SETTLING_SAMPLES)
            .peekable();

        // coordinates relative to the newest sample keep the sums well within f64 precision
        let &&origin = samples.peek()?;

        let points: ArrayVec<(f64, f64), TIME_PING_HISTORY> = samples
            .map(|p| {
                let x = p.local_time.wrapping_sub(origin.local_time) as i64 as f64;
                let y = p.remote_time.wrapping_sub(origin.remote_time) as i64 as f64;
                (x, y)
            })
            .collect();

        if points.len() < MIN_DRIFT_SAMPLES {
            return None;
        }

        let n = points.len() as f64;
        let x_bar = points.iter().map(|(x, _)| x).sum::<f64>() / n;
        let y_bar = points.iter().map(|(_, y)| y).sum::<f64>() / n;

        let (covariance, variance) =
            points
                .iter()
                .fold((0., 0.), |(c, v), &(x, y)| {
                    let dx = x - x_bar;
                    (c + dx * (y - y_bar), v + dx * dx)
                });

        if variance == 0. {
            log::debug!(
                "{}: chosen timing samples share one local time, drift left at 1.0",
                self.id,
            );
            return None;
        }

        let gradient = covariance / variance;

        if !gradient.is_finite() || gradient <= 0. {
            log::debug!("{}: discarding implausible clock drift {gradient}", self.id);
            return None;
        }

        Some((gradient, points.len()))
    }
}
