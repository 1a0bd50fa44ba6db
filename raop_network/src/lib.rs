//! Receiver-side timing engine for RAOP-style streamed audio.
//!
//! This crate owns the runtime half of the protocol described in `raop_proto`: for every
//! stream connection it binds three UDP sockets (audio, control, timing), runs one blocking
//! receive loop per socket, and keeps a single mutex-protected timing state up to date:
//!
//! - the timing receiver (and the pinger it spawns) estimate the offset and drift between
//!   our monotonic clock and the sender's wall clock,
//! - the control receiver anchors the sender's frame clock to its wall clock on every sync
//!   packet, and resolves the playout latency,
//! - the audio receiver validates audio packets and hands them to a [`PacketSink`].
//!
//! The playback engine reads the state back through the frame ⇄ local time mapping on
//! [`Connection`], and asks for retransmissions through [`Connection::request_resend`].
//!
//! ## Scope
//!
//! - Sequencing, gap detection and decoding of audio belong to the [`PacketSink`].
//! - Parsing configuration files belongs to the embedding application: [`ReceiverConfig`]
//!   implements [`serde::Deserialize`], so any format will do.
//! - Logging goes through the [`log`] facade, the application installs the logger.

pub mod clock;
pub mod config;
pub mod connection;
pub mod error;
pub mod fault;
pub mod mapping;
mod receiver;
pub mod registry;
pub mod resend;
pub mod sink;
pub mod socket;
pub mod state;
pub mod sync;

pub use raop_proto as proto;
pub use raop_utils as utils;

pub use config::{LegacyLatencyPolicy, ReceiverConfig, StreamParams, VersionRange};
pub use connection::{Connection, LocalPorts, PeerAddrs, PortAllocator, ReferenceInfo, Sockets};
pub use resend::ResendOutcome;
pub use error::SetupError;
pub use mapping::{Mapping, MappingQuality};
pub use registry::ConnectionRegistry;
pub use sink::{PacketSink, QueuedPacket, RingSink};
pub use socket::DatagramSocket;
pub use state::{Anchor, TimingSnapshot};

use serde::{Deserialize, Serialize};

/// Identifies a stream connection in logs, in the registry and at the [`PacketSink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct ConnectionId(pub u32);

impl core::fmt::Display for ConnectionId {
    #[inline(always)]
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Connection {}", self.0)
    }
}
