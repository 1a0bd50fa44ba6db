//! Packet-drop simulation, for resilience testing.

/// Decides, independently for each packet, whether to pretend it was lost.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PacketDropper {
    fraction: f64,
}

impl PacketDropper {
    /// Drops packets with probability `fraction`. `0.0` never drops.
    #[inline(always)]
    pub const fn new(fraction: f64) -> Self {
        Self { fraction }
    }

    #[inline(always)]
    pub const fn never() -> Self {
        Self::new(0.)
    }

    #[inline]
    pub fn should_drop(&self) -> bool {
        self.fraction > 0. && rand::random::<f64>() < self.fraction
    }
}
