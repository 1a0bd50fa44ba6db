//! Local time, as nanosecond ticks of a monotonic clock.
//!
//! Ticks count from a process-wide epoch captured the first time the clock is read. Plain
//! `u64`s keep the arithmetic in the engine explicit: values are subtracted with wrapping
//! operations, and mixed with remote (sender) times converted to the same unit.

use std::{sync::OnceLock, time::Duration, time::Instant};

pub const NANOS_PER_SEC: u64 = 1_000_000_000;
pub const NANOS_PER_MILLI: u64 = 1_000_000;
pub const NANOS_PER_MICRO: u64 = 1_000;

/// One hour, in ticks.
pub const ONE_HOUR: u64 = 3600 * NANOS_PER_SEC;

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// The instant local tick `0` corresponds to.
#[inline(always)]
pub fn epoch() -> Instant {
    *EPOCH.get_or_init(Instant::now)
}

/// The current local time.
#[inline(always)]
pub fn local_now() -> u64 {
    instant_to_local(Instant::now())
}

/// Converts an instant to local ticks. Instants preceding the epoch map to `0`.
#[inline]
pub fn instant_to_local(instant: Instant) -> u64 {
    duration_to_nanos(instant.saturating_duration_since(epoch()))
}

/// Converts local ticks back to an instant.
///
/// Returns `None` if the result is not representable on this platform.
#[inline]
pub fn local_to_instant(ticks: u64) -> Option<Instant> {
    epoch().checked_add(Duration::from_nanos(ticks))
}

/// Saturates at `u64::MAX` (about 584 years).
#[inline(always)]
pub fn duration_to_nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

/// Convenience for log lines.
#[inline(always)]
pub fn nanos_to_micros_f64(nanos: u64) -> f64 {
    nanos as f64 / NANOS_PER_MICRO as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_is_monotonic() {
        let a = local_now();
        std::thread::sleep(Duration::from_millis(2));
        let b = local_now();
        assert!(b > a);
        assert!(b - a >= 2 * NANOS_PER_MILLI);
    }

    #[test]
    fn instant_conversions_agree() {
        let start = epoch();
        let now = Instant::now();
        assert_eq!(local_to_instant(instant_to_local(now)), Some(now));
        assert_eq!(instant_to_local(start), 0);
    }
}
