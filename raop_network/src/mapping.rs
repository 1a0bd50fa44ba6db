//! Frame ⇄ local time conversions.
//!
//! Both directions go through the latest anchor: a frame's distance to the anchor's
//! timestamp is scaled into a remote time distance, and the extrapolated clock offset turns
//! remote times into local ones.
//!
//! Frames are scaled into time rounding up, and times into frames rounding down, so that
//! `local_time_to_frame(frame_to_local_time(f)) == f` for any frame within an hour of the
//! anchor.

use raop_utils::{
    time::NANOS_PER_SEC,
    wrap::{self, WrappedDistance},
};

use crate::{ConnectionId, state::TimingState};

/// The sanitised rate may deviate from the nominal rate by this much, relative.
pub const MAX_RATE_DEVIATION: f64 = 0.002;

/// How trustworthy a [`Mapping`] is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MappingQuality {
    /// No anchor or no clock offset yet: the value is meaningless.
    Unsynchronized,
    /// Scaled with the nominal input rate.
    NominalRate,
    /// Scaled with the rate observed between the first and latest anchors.
    ObservedRate,
}

/// The result of a frame ⇄ time conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Mapping<T> {
    pub value: T,
    pub quality: MappingQuality,
}

impl<T> Mapping<T> {
    #[inline(always)]
    pub const fn unsynchronized(value: T) -> Self {
        Self {
            value,
            quality: MappingQuality::Unsynchronized,
        }
    }

    #[inline(always)]
    pub fn is_synchronized(&self) -> bool {
        self.quality != MappingQuality::Unsynchronized
    }
}

/// `frames` source frames per `nanos` remote nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceRate {
    pub frames: u64,
    pub nanos: u64,
    /// Whether the rate was measured rather than nominal.
    pub observed: bool,
}

impl SourceRate {
    #[inline(always)]
    pub const fn nominal(rate: core::num::NonZeroU32) -> Self {
        Self {
            frames: rate.get() as u64,
            nanos: NANOS_PER_SEC,
            observed: false,
        }
    }

    /// Remote nanoseconds spanned by `frames`, rounded up.
    #[inline]
    pub fn frames_to_nanos(&self, frames: u32) -> u64 {
        let num = u128::from(frames) * u128::from(self.nanos);
        let nanos = num.div_ceil(u128::from(self.frames));
        u64::try_from(nanos).unwrap_or(u64::MAX)
    }

    /// Frames spanned by `nanos` remote nanoseconds, rounded down. Modulo 2^32.
    #[inline]
    pub fn nanos_to_frames(&self, nanos: u64) -> u32 {
        let frames = u128::from(nanos) * u128::from(self.frames) / u128::from(self.nanos);
        frames as u32
    }

    #[inline(always)]
    pub fn quality(&self) -> MappingQuality {
        if self.observed {
            MappingQuality::ObservedRate
        } else {
            MappingQuality::NominalRate
        }
    }
}

/// The rate observed between the first and latest anchors, unless either interval is
/// zero or it strays more than [`MAX_RATE_DEVIATION`] from the nominal rate.
pub(crate) fn sanitised_rate(id: ConnectionId, state: &TimingState) -> SourceRate {
    let nominal = SourceRate::nominal(state.input_rate);

    let (Some(initial), Some(reference)) = (state.initial_reference, state.reference) else {
        return nominal;
    };

    let frames = wrap::modulo_32_offset(initial.timestamp, reference.timestamp);
    let nanos = wrap::modulo_64_offset(initial.remote_time, reference.remote_time);

    if frames == 0 || nanos == 0 {
        return nominal;
    }

    let rate = f64::from(frames) * NANOS_PER_SEC as f64 / nanos as f64;
    let ratio = rate / f64::from(state.input_rate.get());

    if (ratio - 1.).abs() > MAX_RATE_DEVIATION {
        log::trace!(
            "{id}: observed source rate {rate:.2} strays too far from {}, using the nominal rate",
            state.input_rate,
        );
        return nominal;
    }

    SourceRate {
        frames: u64::from(frames),
        nanos,
        observed: true,
    }
}

/// The local time `timestamp` plays at, were there no latency.
pub(crate) fn frame_to_local_time(
    id: ConnectionId,
    state: &TimingState,
    timestamp: u32,
    now: u64,
) -> Mapping<u64> {
    let (Some(reference), Some(clock)) = (state.reference, state.clock) else {
        return Mapping::unsynchronized(0);
    };

    let rate = sanitised_rate(id, state);
    let horizon = wrap::frames_per_hour(state.input_rate.get());

    let remote = match wrap::frame_distance(reference.timestamp, timestamp, horizon) {
        WrappedDistance::Ahead(d) => reference
            .remote_time
            .wrapping_add(rate.frames_to_nanos(d)),
        WrappedDistance::Behind(d) => reference
            .remote_time
            .wrapping_sub(rate.frames_to_nanos(d)),
    };

    Mapping {
        value: clock.remote_to_local(remote, now),
        quality: rate.quality(),
    }
}

/// The frame playing at local time `time`, were there no latency.
pub(crate) fn local_time_to_frame(
    id: ConnectionId,
    state: &TimingState,
    time: u64,
    now: u64,
) -> Mapping<u32> {
    let (Some(reference), Some(clock)) = (state.reference, state.clock) else {
        return Mapping::unsynchronized(0);
    };

    let rate = sanitised_rate(id, state);
    let remote = time.wrapping_add(clock.offset_at(now));

    // one hour of frames, as in the other direction
    let horizon = rate.frames_to_nanos(wrap::frames_per_hour(state.input_rate.get()));

    let frame = match wrap::time_distance(reference.remote_time, remote, horizon) {
        WrappedDistance::Ahead(d) => reference
            .timestamp
            .wrapping_add(rate.nanos_to_frames(d)),
        WrappedDistance::Behind(d) => reference
            .timestamp
            .wrapping_sub(rate.nanos_to_frames(d)),
    };

    Mapping {
        value: frame,
        quality: rate.quality(),
    }
}
