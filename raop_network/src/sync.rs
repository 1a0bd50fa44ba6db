//! Sync packet handling: latency resolution and anchoring.
//!
//! Both steps are pure functions of the timing state, so the control receiver can run them
//! under the connection's lock in one go.

use raop_proto::control::SyncPacket;
use raop_utils::wrap;

use crate::{
    config::ReceiverConfig,
    state::{Anchor, TimingState},
};

/// The latency a sync packet asks for, after policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LatencyDecision {
    /// The configured user latency, verbatim.
    UserSupplied(u32),
    /// Derived from the sync packet, then clamped to the stream's bounds.
    Resolved(u32),
    /// Larger than the playback ring can absorb. The previous latency stays.
    Rejected { requested: u32, ceiling: u32 },
}

impl LatencyDecision {
    /// The latency to adopt, if any.
    #[inline(always)]
    pub const fn latency(&self) -> Option<u32> {
        match *self {
            Self::UserSupplied(l) | Self::Resolved(l) => Some(l),
            Self::Rejected { .. } => None,
        }
    }
}

/// Decides which latency to apply for `sync`.
pub fn resolve_latency(
    config: &ReceiverConfig,
    minimum: u32,
    maximum: u32,
    peer_version: Option<u32>,
    sync: &SyncPacket,
) -> LatencyDecision {
    if let Some(latency) = config.user_latency {
        return LatencyDecision::UserSupplied(latency);
    }

    let mut latency = sync.latency_frames();

    let policy = &config.legacy_latency;
    if policy.applies(sync.flags, peer_version) {
        latency = latency.saturating_add(policy.offset_frames);
    }

    if maximum != 0 && latency > maximum {
        latency = maximum;
    }

    if minimum != 0 && latency < minimum {
        latency = minimum;
    }

    let ceiling = config.latency_ceiling();

    if latency > ceiling {
        return LatencyDecision::Rejected {
            requested: latency,
            ceiling,
        };
    }

    LatencyDecision::Resolved(latency)
}

/// Applies a latency decision to the state, returning whether the latency changed.
pub(crate) fn apply_latency(state: &mut TimingState, decision: LatencyDecision) -> bool {
    match decision.latency() {
        Some(latency) if latency != state.latency => {
            state.latency = latency;
            true
        }
        _ => false,
    }
}

/// Makes `sync` the reference anchor.
///
/// The first sync after audio has started flowing also becomes the initial anchor, the
/// baseline against which the source frame rate is measured. Later syncs measure that rate
/// up to the reference they replace.
pub(crate) fn update_anchor(state: &mut TimingState, sync: &SyncPacket) {
    let anchor = Anchor {
        timestamp: sync.sync_timestamp,
        remote_time: sync.remote_time.to_nanos(),
    };

    match state.initial_reference {
        None if state.packets_since_flush > 0 => state.initial_reference = Some(anchor),
        None => (),
        // measured up to the anchor being replaced
        Some(initial) => {
            state.remote_frame_rate = state.reference.and_then(|reference| {
                let nanos = wrap::modulo_64_offset(initial.remote_time, reference.remote_time);
                let frames = wrap::modulo_32_offset(initial.timestamp, reference.timestamp);
                (nanos != 0).then(|| f64::from(frames) / nanos as f64)
            });
        }
    }

    if let Some(previous) = state.reference {
        state.previous_anchor_time_difference = Some(wrap::modulo_64_offset(
            previous.remote_time,
            anchor.remote_time,
        ));
        state.previous_anchor_frame_difference =
            Some(wrap::modulo_32_offset(previous.timestamp, anchor.timestamp));
    }

    state.reference = Some(anchor);
    state.latency_delayed_timestamp = sync.rtp_timestamp_less_latency;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StreamParams;
    use raop_proto::NtpTimestamp;
    use raop_utils::time::NANOS_PER_SEC;

    fn sync(latency: u32, flags: u16) -> SyncPacket {
        SyncPacket {
            flags,
            rtp_timestamp_less_latency: 1_000_000,
            remote_time: NtpTimestamp::from_parts(100, 0),
            sync_timestamp: 1_000_000u32.wrapping_add(latency),
        }
    }

    fn config() -> ReceiverConfig {
        ReceiverConfig {
            legacy_latency: crate::LegacyLatencyPolicy {
                trigger_flags: vec![],
                version_ranges: vec![],
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn latency_is_clamped() {
        let config = config();

        assert_eq!(
            resolve_latency(&config, 11025, 88200, None, &sync(5000, 0)),
            LatencyDecision::Resolved(11025)
        );
        assert_eq!(
            resolve_latency(&config, 11025, 88200, None, &sync(99000, 0)),
            LatencyDecision::Resolved(88200)
        );
        assert_eq!(
            resolve_latency(&config, 11025, 88200, None, &sync(77175, 0)),
            LatencyDecision::Resolved(77175)
        );

        // unbounded
        assert_eq!(
            resolve_latency(&config, 0, 0, None, &sync(5000, 0)),
            LatencyDecision::Resolved(5000)
        );
    }

    #[test]
    fn latency_ceiling() {
        let config = config();
        let ceiling = config.latency_ceiling();

        assert_eq!(
            resolve_latency(&config, 0, 0, None, &sync(ceiling, 0)),
            LatencyDecision::Resolved(ceiling)
        );
        assert_eq!(
            resolve_latency(&config, 0, 0, None, &sync(ceiling + 1, 0)),
            LatencyDecision::Rejected {
                requested: ceiling + 1,
                ceiling
            }
        );
    }

    #[test]
    fn user_latency_wins() {
        let config = ReceiverConfig {
            user_latency: Some(99_999),
            ..Default::default()
        };

        assert_eq!(
            resolve_latency(&config, 11025, 88200, Some(200), &sync(5000, 7)),
            LatencyDecision::UserSupplied(99_999)
        );
    }

    #[test]
    fn legacy_offset() {
        let config = ReceiverConfig::default();

        assert_eq!(
            resolve_latency(&config, 0, 0, None, &sync(77175, 7)),
            LatencyDecision::Resolved(88200)
        );
        assert_eq!(
            resolve_latency(&config, 0, 0, Some(200), &sync(77175, 0)),
            LatencyDecision::Resolved(88200)
        );
        assert_eq!(
            resolve_latency(&config, 0, 0, Some(366), &sync(77175, 0)),
            LatencyDecision::Resolved(77175)
        );
    }

    #[test]
    fn wrapped_sync_latency() {
        let config = config();
        let sync = SyncPacket {
            flags: 0,
            rtp_timestamp_less_latency: u32::MAX - 999,
            remote_time: NtpTimestamp::ZERO,
            sync_timestamp: 10_000,
        };

        assert_eq!(
            resolve_latency(&config, 0, 0, None, &sync),
            LatencyDecision::Resolved(11_000)
        );
    }

    #[test]
    fn rejected_latency_keeps_the_previous_one() {
        let mut state = TimingState::new(&StreamParams::default());
        state.latency = 88200;

        let rejected = LatencyDecision::Rejected {
            requested: 1 << 20,
            ceiling: 259311,
        };
        assert!(!apply_latency(&mut state, rejected));
        assert_eq!(state.latency, 88200);

        assert!(!apply_latency(&mut state, LatencyDecision::Resolved(88200)));
        assert!(apply_latency(&mut state, LatencyDecision::Resolved(77175)));
        assert_eq!(state.latency, 77175);
    }

    #[test]
    fn anchoring() {
        let mut state = TimingState::new(&StreamParams::default());

        let at = |timestamp, seconds| SyncPacket {
            flags: 0,
            rtp_timestamp_less_latency: timestamp - 77175,
            remote_time: NtpTimestamp::from_parts(seconds, 0),
            sync_timestamp: timestamp,
        };

        // no audio yet: no initial anchor
        update_anchor(&mut state, &at(100_000, 10));
        assert_eq!(state.initial_reference, None);
        assert_eq!(state.remote_frame_rate, None);
        assert_eq!(
            state.reference,
            Some(Anchor {
                timestamp: 100_000,
                remote_time: 10 * NANOS_PER_SEC
            })
        );
        assert_eq!(state.latency_delayed_timestamp, 100_000 - 77175);

        state.packets_since_flush = 1;

        // the initial anchor and the reference coincide: rate unknown
        update_anchor(&mut state, &at(144_100, 11));
        assert_eq!(
            state.initial_reference,
            Some(Anchor {
                timestamp: 144_100,
                remote_time: 11 * NANOS_PER_SEC
            })
        );
        assert_eq!(state.remote_frame_rate, None);
        assert_eq!(state.previous_anchor_time_difference, Some(NANOS_PER_SEC));
        assert_eq!(state.previous_anchor_frame_difference, Some(44_100));

        // the rate is measured up to the replaced reference, here the initial anchor itself
        update_anchor(&mut state, &at(232_300, 13));
        assert_eq!(state.remote_frame_rate, None);
        assert_eq!(state.reference.unwrap().timestamp, 232_300);

        // 88200 frames over the 2 s up to the replaced reference
        update_anchor(&mut state, &at(364_600, 14));
        let rate = state.remote_frame_rate.unwrap() * NANOS_PER_SEC as f64;
        assert!((rate - 44100.).abs() < 1e-6, "{rate}");
        assert_eq!(state.reference.unwrap().timestamp, 364_600);
        // the initial anchor stays put
        assert_eq!(state.initial_reference.unwrap().timestamp, 144_100);

        state.clear_anchors();
        assert_eq!(state.reference, None);
        assert_eq!(state.initial_reference, None);
        assert_eq!(state.packets_since_flush, 0);
    }
}
