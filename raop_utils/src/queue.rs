//! Queue-related helpers.
//!
//! Packets handed from network threads to a playback thread travel over [`rtrb`] rings,
//! re-exported here so dependents agree on one version.
use core::num;

pub use rtrb;

/// A counter that tracks progress through fixed-size periods.
///
/// Each time the counter advances past a multiple of it's period, a boundary
/// is considered crossed.
#[derive(Debug, Clone, Copy)]
pub struct PeriodicCounter {
    period: num::NonZeroUsize,
    current: usize, // always less than self.period
}

impl PeriodicCounter {
    /// Creates a new counter with the given `period`.
    #[inline(always)]
    pub const fn new(period: num::NonZeroUsize) -> Self {
        Self { period, current: 0 }
    }

    #[inline(always)]
    pub const fn period(&self) -> num::NonZeroUsize {
        self.period
    }

    /// Progress through the current period.
    #[inline(always)]
    pub const fn current(&self) -> usize {
        self.current
    }

    /// Advances the counter by `n` steps.
    ///
    /// Returns the number of period boundaries crossed.
    #[inline(always)]
    pub fn advance(&mut self, n: usize) -> usize {
        let p = self.period();
        let next_non_wrapped = self.current.saturating_add(n);
        self.current = next_non_wrapped % p;
        next_non_wrapped / p
    }

    #[inline(always)]
    pub fn reset(&mut self) {
        self.current = 0;
    }
}

/// Creates a ring of `capacity` slots.
#[inline(always)]
pub fn ring<T>(capacity: usize) -> (rtrb::Producer<T>, rtrb::Consumer<T>) {
    rtrb::RingBuffer::new(capacity)
}
