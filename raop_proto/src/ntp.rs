use serde::{Deserialize, Serialize};

const NANOS_PER_SEC: u64 = 1_000_000_000;

/// A 64-bit NTP timestamp: whole seconds in the upper 32 bits, binary fraction of a second
/// in the lower 32 bits.
///
/// The engine never does arithmetic on this representation, timestamps are converted to
/// nanosecond ticks with [`to_nanos`](Self::to_nanos) as soon as they are read off the wire.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct NtpTimestamp(pub u64);

impl NtpTimestamp {
    pub const ZERO: Self = Self(0);

    #[inline(always)]
    pub const fn from_parts(seconds: u32, fraction: u32) -> Self {
        Self(((seconds as u64) << 32) | fraction as u64)
    }

    #[inline(always)]
    pub const fn seconds(self) -> u32 {
        (self.0 >> 32) as u32
    }

    #[inline(always)]
    pub const fn fraction(self) -> u32 {
        self.0 as u32
    }

    #[inline(always)]
    pub const fn from_be_bytes(bytes: [u8; 8]) -> Self {
        Self(u64::from_be_bytes(bytes))
    }

    #[inline(always)]
    pub const fn to_be_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    /// Converts to nanoseconds, rounding the fraction down.
    ///
    /// The result never overflows: 2^32 seconds is below 2^64 nanoseconds.
    #[inline(always)]
    pub const fn to_nanos(self) -> u64 {
        let seconds = self.seconds() as u64 * NANOS_PER_SEC;
        let fraction = (self.fraction() as u64 * NANOS_PER_SEC) >> 32;
        seconds + fraction
    }

    /// Converts from nanoseconds, rounding the fraction up so that
    /// `NtpTimestamp::from_nanos(n).to_nanos() == n` for every `n` below 2^32 seconds.
    ///
    /// Seconds past 2^32 wrap around, like the NTP era does.
    #[inline(always)]
    pub const fn from_nanos(nanos: u64) -> Self {
        let seconds = (nanos / NANOS_PER_SEC) as u32;
        let rem = nanos % NANOS_PER_SEC;
        let fraction = ((rem << 32) + NANOS_PER_SEC - 1) / NANOS_PER_SEC;
        Self::from_parts(seconds, fraction as u32)
    }
}
