//! Receiver configuration.
//!
//! [`ReceiverConfig`] holds the process-wide knobs, shared by every connection.
//! [`StreamParams`] holds what the session manager negotiated for one stream.
//!
//! Both implement [`serde::Deserialize`] with defaults for every missing field, so an
//! application may load them from whatever format it already uses.

use core::{num::NonZeroU32, time::Duration};
use serde::{Deserialize, Serialize};

use crate::SetupError;

/// An inclusive range of peer protocol versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionRange {
    pub min: u32,
    pub max: u32,
}

impl VersionRange {
    #[inline(always)]
    pub const fn contains(&self, version: u32) -> bool {
        self.min <= version && version <= self.max
    }
}

/// Compatibility shim for senders whose sync packets understate the latency they expect.
///
/// Such senders expect a fixed extra delay on top of the latency carried in their sync
/// packets. They are recognised either by the flags of the sync packet, or by the protocol
/// version they announced at session setup.
///
/// The version thresholds were observed on real devices and have not been confirmed
/// beyond that, keep them as data rather than changing them in code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LegacyLatencyPolicy {
    /// Frames added to the sync-derived latency when the policy applies.
    pub offset_frames: u32,
    /// Sync packet flag values that trigger the offset.
    pub trigger_flags: Vec<u16>,
    /// Peer versions that trigger the offset. An unknown or zero version never matches.
    pub version_ranges: Vec<VersionRange>,
}

impl Default for LegacyLatencyPolicy {
    fn default() -> Self {
        Self {
            offset_frames: 11025,
            trigger_flags: vec![7],
            version_ranges: vec![
                VersionRange { min: 1, max: 353 },
                VersionRange {
                    min: 371,
                    max: u32::MAX,
                },
            ],
        }
    }
}

impl LegacyLatencyPolicy {
    /// Whether the fixed offset should be added for a sync packet carrying `flags`, from a
    /// peer that announced `peer_version`.
    pub fn applies(&self, flags: u16, peer_version: Option<u32>) -> bool {
        self.trigger_flags.contains(&flags)
            || peer_version
                .filter(|&v| v != 0)
                .is_some_and(|v| self.version_ranges.iter().any(|r| r.contains(v)))
    }
}

/// Process-wide receiver configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverConfig {
    /// First local UDP port to try. `0` lets the OS choose.
    pub udp_port_base: u16,
    /// Number of consecutive ports tried before giving up.
    pub udp_port_range: u16,
    /// When set, replaces the latency carried in sync packets, in frames.
    pub user_latency: Option<u32>,
    pub legacy_latency: LegacyLatencyPolicy,
    /// Number of packet slots in the playback ring.
    pub buffer_frames: u32,
    pub frames_per_packet: u32,
    /// Probability, in `[0, 1)`, of silently dropping any packet we send or receive.
    /// Only useful for resilience testing.
    pub diagnostic_drop_packet_fraction: f64,
    /// How long resend requests stay suppressed after a failed send.
    pub resend_error_backoff: Duration,
    /// Write timeout on the control socket, bounding how long a resend request may block.
    pub resend_send_timeout: Duration,
    /// Read timeout on every socket. The receive loops notice teardown at this granularity.
    pub receive_poll_interval: Duration,
    /// Delay between the first [`timing_burst_count`](Self::timing_burst_count) timing
    /// requests.
    pub timing_burst_interval: Duration,
    pub timing_burst_count: u32,
    /// Delay between timing requests once the burst is over.
    pub timing_interval: Duration,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            udp_port_base: 6001,
            udp_port_range: 10,
            user_latency: None,
            legacy_latency: LegacyLatencyPolicy::default(),
            buffer_frames: 1024,
            frames_per_packet: 352,
            diagnostic_drop_packet_fraction: 0.,
            resend_error_backoff: Duration::from_millis(300),
            resend_send_timeout: Duration::from_millis(100),
            receive_poll_interval: Duration::from_millis(100),
            timing_burst_interval: Duration::from_millis(500),
            timing_burst_count: 4,
            timing_interval: Duration::from_secs(3),
        }
    }
}

impl ReceiverConfig {
    /// The largest latency, in frames, the playback ring can absorb.
    ///
    /// Three quarters of the ring, minus the legacy offset. Sync packets asking for more
    /// are ignored.
    pub fn latency_ceiling(&self) -> u32 {
        let ring = u64::from(self.buffer_frames) * u64::from(self.frames_per_packet) * 3 / 4;
        let ceiling = ring.saturating_sub(u64::from(self.legacy_latency.offset_frames));
        u32::try_from(ceiling).unwrap_or(u32::MAX)
    }

    /// How long the pinger waits after having sent `requests_sent` timing requests.
    #[inline]
    pub fn timing_delay_after(&self, requests_sent: u64) -> Duration {
        if requests_sent <= u64::from(self.timing_burst_count) {
            self.timing_burst_interval
        } else {
            self.timing_interval
        }
    }

    pub fn validate(&self) -> Result<(), SetupError> {
        let f = self.diagnostic_drop_packet_fraction;

        if !(0. ..1.).contains(&f) {
            return Err(SetupError::InvalidConfig(
                "diagnostic_drop_packet_fraction must be in [0, 1)",
            ));
        }

        if self.udp_port_base != 0 && self.udp_port_range == 0 {
            return Err(SetupError::InvalidConfig(
                "udp_port_range must be non-zero when udp_port_base is set",
            ));
        }

        if self.receive_poll_interval.is_zero() {
            return Err(SetupError::InvalidConfig(
                "receive_poll_interval must be non-zero",
            ));
        }

        if self.resend_send_timeout.is_zero() {
            return Err(SetupError::InvalidConfig(
                "resend_send_timeout must be non-zero",
            ));
        }

        if self.timing_burst_interval.is_zero() || self.timing_interval.is_zero() {
            return Err(SetupError::InvalidConfig(
                "timing request intervals must be non-zero",
            ));
        }

        Ok(())
    }
}

/// CD-quality audio, the rate of most senders.
pub const DEFAULT_INPUT_RATE: NonZeroU32 = NonZeroU32::new(44100).unwrap();

/// What the session manager negotiated for one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamParams {
    /// Nominal frame rate of the source.
    pub input_rate: NonZeroU32,
    /// Lower latency bound, in frames. `0` means unbounded.
    pub minimum_latency: u32,
    /// Upper latency bound, in frames. `0` means unbounded.
    pub maximum_latency: u32,
    /// Protocol version announced by the peer, if any.
    pub peer_version: Option<u32>,
}

impl Default for StreamParams {
    fn default() -> Self {
        Self {
            input_rate: DEFAULT_INPUT_RATE,
            minimum_latency: 0,
            maximum_latency: 0,
            peer_version: None,
        }
    }
}

impl StreamParams {
    pub fn validate(&self) -> Result<(), SetupError> {
        if self.minimum_latency != 0
            && self.maximum_latency != 0
            && self.minimum_latency > self.maximum_latency
        {
            return Err(SetupError::InvalidConfig(
                "minimum_latency exceeds maximum_latency",
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_latency_ceiling() {
        assert_eq!(ReceiverConfig::default().latency_ceiling(), 259311);
    }

    #[test]
    fn legacy_policy_triggers() {
        let policy = LegacyLatencyPolicy::default();

        assert!(policy.applies(7, None));
        assert!(!policy.applies(0, None));
        assert!(!policy.applies(0, Some(0)));
        assert!(policy.applies(0, Some(1)));
        assert!(policy.applies(0, Some(353)));
        assert!(!policy.applies(0, Some(354)));
        assert!(!policy.applies(0, Some(370)));
        assert!(policy.applies(0, Some(371)));
        assert!(policy.applies(0, Some(u32::MAX)));
    }

    #[test]
    fn timing_schedule() {
        let config = ReceiverConfig::default();

        for sent in 1..=4 {
            assert_eq!(config.timing_delay_after(sent), Duration::from_millis(500));
        }

        assert_eq!(config.timing_delay_after(5), Duration::from_secs(3));
        assert_eq!(config.timing_delay_after(1000), Duration::from_secs(3));
    }

    #[test]
    fn validation() {
        assert!(ReceiverConfig::default().validate().is_ok());

        let bad_fraction = ReceiverConfig {
            diagnostic_drop_packet_fraction: 1.,
            ..Default::default()
        };
        assert!(matches!(
            bad_fraction.validate(),
            Err(SetupError::InvalidConfig(_))
        ));

        let bad_range = ReceiverConfig {
            udp_port_range: 0,
            ..Default::default()
        };
        assert!(bad_range.validate().is_err());

        let ephemeral = ReceiverConfig {
            udp_port_base: 0,
            udp_port_range: 0,
            ..Default::default()
        };
        assert!(ephemeral.validate().is_ok());

        let inverted = StreamParams {
            minimum_latency: 88200,
            maximum_latency: 11025,
            ..Default::default()
        };
        assert!(inverted.validate().is_err());
        assert!(StreamParams::default().validate().is_ok());
    }
}
