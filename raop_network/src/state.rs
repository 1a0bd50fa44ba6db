//! The per-connection timing state, shared by every thread of a connection.

use core::num::NonZeroU32;

use crate::{clock::ClockModel, config::StreamParams};

/// A source frame clock value, and the sender wall clock time it plays at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Anchor {
    pub timestamp: u32,
    /// Remote time, in nanoseconds.
    pub remote_time: u64,
}

/// Everything the receive loops learn about a stream, behind the connection's mutex.
///
/// All fields are plain values, so readers take a copy ([`TimingSnapshot`]) and work on it
/// after releasing the lock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct TimingState {
    pub(crate) input_rate: NonZeroU32,
    pub(crate) minimum_latency: u32,
    pub(crate) maximum_latency: u32,
    pub(crate) peer_version: Option<u32>,
    /// Frames of delay applied before playout.
    pub(crate) latency: u32,

    /// The latest accepted sync anchor.
    pub(crate) reference: Option<Anchor>,
    /// The first anchor accepted since the last flush.
    pub(crate) initial_reference: Option<Anchor>,
    /// `rtp_timestamp_less_latency` of the latest accepted sync.
    pub(crate) latency_delayed_timestamp: u32,
    /// Frames per remote nanosecond from `initial_reference` to the reference preceding the
    /// latest sync, if measurable.
    pub(crate) remote_frame_rate: Option<f64>,
    /// Remote time between the two latest anchors.
    pub(crate) previous_anchor_time_difference: Option<u64>,
    /// Frames between the two latest anchors.
    pub(crate) previous_anchor_frame_difference: Option<u32>,

    pub(crate) clock: Option<ClockModel>,
    /// When the latest timing request left, on our clock.
    pub(crate) departure_time: Option<u64>,

    /// Audio packets handed to the sink since the last flush.
    pub(crate) packets_since_flush: u64,
    /// When a resend request last failed, on our clock.
    pub(crate) last_resend_error: Option<u64>,
}

impl TimingState {
    pub(crate) fn new(params: &StreamParams) -> Self {
        Self {
            input_rate: params.input_rate,
            minimum_latency: params.minimum_latency,
            maximum_latency: params.maximum_latency,
            peer_version: params.peer_version,
            latency: 0,
            reference: None,
            initial_reference: None,
            latency_delayed_timestamp: 0,
            remote_frame_rate: None,
            previous_anchor_time_difference: None,
            previous_anchor_frame_difference: None,
            clock: None,
            departure_time: None,
            packets_since_flush: 0,
            last_resend_error: None,
        }
    }

    /// Forgets the anchors, as a flush or resume invalidates them.
    ///
    /// The clock model survives: it describes the sender's clock, not the stream.
    pub(crate) fn clear_anchors(&mut self) {
        self.reference = None;
        self.initial_reference = None;
        self.remote_frame_rate = None;
        self.previous_anchor_time_difference = None;
        self.previous_anchor_frame_difference = None;
        self.packets_since_flush = 0;
    }

    #[inline(always)]
    pub(crate) fn snapshot(&self) -> TimingSnapshot {
        TimingSnapshot { state: *self }
    }
}

/// A consistent copy of a connection's timing state, for diagnostics and for the mapping
/// functions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimingSnapshot {
    pub(crate) state: TimingState,
}

impl TimingSnapshot {
    #[inline(always)]
    pub fn input_rate(&self) -> NonZeroU32 {
        self.state.input_rate
    }

    /// Current latency, in frames.
    #[inline(always)]
    pub fn latency(&self) -> u32 {
        self.state.latency
    }

    #[inline(always)]
    pub fn latency_bounds(&self) -> (u32, u32) {
        (self.state.minimum_latency, self.state.maximum_latency)
    }

    #[inline(always)]
    pub fn reference(&self) -> Option<Anchor> {
        self.state.reference
    }

    #[inline(always)]
    pub fn initial_reference(&self) -> Option<Anchor> {
        self.state.initial_reference
    }

    #[inline(always)]
    pub fn latency_delayed_timestamp(&self) -> u32 {
        self.state.latency_delayed_timestamp
    }

    /// Source frames per second, measured from the first anchor to the one before the latest.
    #[inline(always)]
    pub fn remote_frame_rate(&self) -> Option<f64> {
        self.state
            .remote_frame_rate
            .map(|r| r * raop_utils::time::NANOS_PER_SEC as f64)
    }

    /// Remote time and frames between the two latest anchors.
    #[inline(always)]
    pub fn previous_anchor_difference(&self) -> Option<(u64, u32)> {
        self.state
            .previous_anchor_time_difference
            .zip(self.state.previous_anchor_frame_difference)
    }

    #[inline(always)]
    pub fn clock(&self) -> Option<ClockModel> {
        self.state.clock
    }

    #[inline(always)]
    pub fn packets_since_flush(&self) -> u64 {
        self.state.packets_since_flush
    }

    /// Whether frames can be mapped to local times: an offset and an anchor are known.
    #[inline(always)]
    pub fn is_synchronized(&self) -> bool {
        self.state.reference.is_some() && self.state.clock.is_some()
    }
}
