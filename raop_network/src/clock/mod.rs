//! Local ⇄ remote clock model.
//!
//! Local times are nanoseconds on our monotonic clock (see [`raop_utils::time`]), remote
//! times are nanoseconds on the sender's wall clock. [`ClockModel`] relates the two, and
//! the [`estimator`] keeps it up to date from timing exchanges.

pub mod estimator;

pub use estimator::{ClockEstimator, Estimate, Exchange, Rejection, TimePing};

/// `remote ≈ local + difference + (gradient - 1) · (local - measurement_time)`.
///
/// `difference` is a two's complement signed value: add it with wrapping arithmetic.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockModel {
    /// Remote time minus local time, as measured at `measurement_time`.
    pub difference: u64,
    /// Local time at which `difference` was measured.
    pub measurement_time: u64,
    /// Remote clock rate over local clock rate.
    pub gradient: f64,
}

impl ClockModel {
    #[inline(always)]
    pub const fn new(difference: u64, measurement_time: u64) -> Self {
        Self {
            difference,
            measurement_time,
            gradient: 1.,
        }
    }

    /// The offset (remote minus local) extrapolated to local time `now`.
    ///
    /// Exactly `difference` when `now == measurement_time`, or when `gradient == 1.0`
    /// for any elapsed time below 2^53 ns.
    pub fn offset_at(&self, now: u64) -> u64 {
        let elapsed = now.wrapping_sub(self.measurement_time) as i64;
        let local_elapsed = elapsed.unsigned_abs();
        let remote_elapsed = (self.gradient * local_elapsed as f64) as u64;

        // projected remote time leads (positive) or lags (negative) the local clock
        let drift = if remote_elapsed >= local_elapsed {
            (remote_elapsed - local_elapsed) as i64
        } else {
            -((local_elapsed - remote_elapsed) as i64)
        };

        let drift = if elapsed < 0 { -drift } else { drift };

        self.difference.wrapping_add_signed(drift)
    }

    #[inline(always)]
    pub fn local_to_remote(&self, local: u64) -> u64 {
        local.wrapping_add(self.offset_at(local))
    }

    /// Converts a remote time to local, using the offset extrapolated to `now`.
    #[inline(always)]
    pub fn remote_to_local(&self, remote: u64, now: u64) -> u64 {
        remote.wrapping_sub(self.offset_at(now))
    }
}
