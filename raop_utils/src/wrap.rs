//! Signed distances between values of modular counters.
//!
//! RTP frame timestamps are 32-bit and wrap roughly every 27 hours at 44.1 kHz. Comparing
//! two of them with `<` is meaningless near the wraparound, so we instead compute the
//! forward modular distance from a reference to a query value and, if it is within a
//! *horizon*, consider the query ahead. Otherwise the query is behind the reference, by the
//! backward modular distance.
//!
//! The horizon used throughout the engine is one hour: a query more than an hour ahead of
//! the reference is treated as having actually wrapped around from behind it.

/// Which side of a reference a value lies on, and how far away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WrappedDistance<T> {
    /// The value is at or after the reference.
    Ahead(T),
    /// The value is before the reference.
    Behind(T),
}

impl<T> WrappedDistance<T> {
    #[inline(always)]
    pub fn magnitude(self) -> T {
        match self {
            Self::Ahead(d) | Self::Behind(d) => d,
        }
    }

    #[inline(always)]
    pub const fn is_ahead(&self) -> bool {
        matches!(self, Self::Ahead(_))
    }
}

impl WrappedDistance<u32> {
    #[inline(always)]
    pub fn signed(self) -> i64 {
        match self {
            Self::Ahead(d) => i64::from(d),
            Self::Behind(d) => -i64::from(d),
        }
    }
}

impl WrappedDistance<u64> {
    #[inline(always)]
    pub fn signed(self) -> i128 {
        match self {
            Self::Ahead(d) => i128::from(d),
            Self::Behind(d) => -i128::from(d),
        }
    }
}

/// Forward distance from `from` to `to`, modulo 2^32.
#[inline(always)]
pub const fn modulo_32_offset(from: u32, to: u32) -> u32 {
    to.wrapping_sub(from)
}

/// Forward distance from `from` to `to`, modulo 2^64.
#[inline(always)]
pub const fn modulo_64_offset(from: u64, to: u64) -> u64 {
    to.wrapping_sub(from)
}

/// Where frame `query` lies relative to frame `reference`.
///
/// `query` is [`Ahead`](WrappedDistance::Ahead) if the forward distance to it is at most
/// `horizon` frames.
#[inline]
pub const fn frame_distance(reference: u32, query: u32, horizon: u32) -> WrappedDistance<u32> {
    let forward = modulo_32_offset(reference, query);
    if forward <= horizon {
        WrappedDistance::Ahead(forward)
    } else {
        WrappedDistance::Behind(modulo_32_offset(query, reference))
    }
}

/// Where time `query` lies relative to time `reference`, see [`frame_distance`].
#[inline]
pub const fn time_distance(reference: u64, query: u64, horizon: u64) -> WrappedDistance<u64> {
    let forward = modulo_64_offset(reference, query);
    if forward <= horizon {
        WrappedDistance::Ahead(forward)
    } else {
        WrappedDistance::Behind(modulo_64_offset(query, reference))
    }
}

/// One hour worth of frames at `rate` frames per second, saturating.
#[inline(always)]
pub const fn frames_per_hour(rate: u32) -> u32 {
    rate.saturating_mul(3600)
}
