//! Connection setup, lifecycle and the public timing API.
//!
//! A [`Connection`] owns three UDP sockets and, once started, one thread per socket plus
//! the timing pinger. All of them share one block of state, whose mutex protects the
//! connection's timing state.
//!
//! Teardown raises a stop flag that every loop checks at each socket read timeout, then
//! joins the threads in order: timing (which joins its pinger first), control, audio.

use core::net::SocketAddr;
use std::{
    net::{ToSocketAddrs, UdpSocket},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    thread,
};

use raop_proto::audio::AudioPacket;
use raop_utils::time;

use crate::{
    ConnectionId, SetupError,
    config::{ReceiverConfig, StreamParams},
    fault::PacketDropper,
    mapping::{self, Mapping},
    receiver::{Receiver, audio::AudioReceiver, control::ControlReceiver},
    resend::{self, ResendOutcome},
    sink::PacketSink,
    socket::DatagramSocket,
    state::{TimingSnapshot, TimingState},
};

/// The first three ports of the range may be handed out by the session manager directly,
/// so cycling through the range skips them after the first pass.
const PORT_RANGE_RESERVED: u16 = 3;

/// Hands out local UDP ports from `[udp_port_base, udp_port_base + udp_port_range)`.
///
/// One allocator is shared by every connection of a receiver, so successive connections
/// try successive ports.
#[derive(Debug, Default)]
pub struct PortAllocator {
    last: Mutex<Option<u16>>,
}

impl PortAllocator {
    pub const fn new() -> Self {
        Self {
            last: Mutex::new(None),
        }
    }

    /// The next port to try. `0` if `config` lets the OS choose.
    pub fn next(&self, config: &ReceiverConfig) -> u16 {
        let base = config.udp_port_base;

        if base == 0 {
            return 0;
        }

        let last_in_range = base.saturating_add(config.udp_port_range.saturating_sub(1));
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);

        let next = match *last {
            None => base,
            Some(p) if p >= last_in_range || p < base => {
                base.saturating_add(PORT_RANGE_RESERVED).min(last_in_range)
            }
            Some(p) => p + 1,
        };

        *last = Some(next);
        next
    }

    /// Starts over from the base port.
    pub fn reset(&self) {
        *self.last.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Binds a socket on `local`'s address (keeping its IPv6 scope id), on the first free
    /// port of the range. `local`'s own port is ignored.
    pub fn bind(&self, local: SocketAddr, config: &ReceiverConfig) -> Result<UdpSocket, SetupError> {
        let tries = config.udp_port_range.max(1);
        let mut addr = local;

        for attempt in 1..=tries {
            let port = self.next(config);
            addr.set_port(port);

            match UdpSocket::bind(addr) {
                Ok(sock) => return Ok(sock),
                Err(e)
                    if e.kind() == std::io::ErrorKind::AddrInUse
                        && port != 0
                        && attempt < tries =>
                {
                    continue;
                }
                Err(source) => {
                    return Err(SetupError::Bind {
                        base: config.udp_port_base,
                        range: config.udp_port_range,
                        source,
                    });
                }
            }
        }

        Err(SetupError::Bind {
            base: config.udp_port_base,
            range: config.udp_port_range,
            source: std::io::ErrorKind::AddrInUse.into(),
        })
    }
}

/// Where the peer listens for control and timing packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerAddrs {
    pub control: SocketAddr,
    pub timing: SocketAddr,
}

impl PeerAddrs {
    /// Resolves `host` on the ports negotiated at session setup, keeping only addresses of
    /// `local`'s family. Link-local IPv6 peers get `local`'s scope id.
    pub fn resolve(
        host: &str,
        control_port: u16,
        timing_port: u16,
        local: SocketAddr,
    ) -> Result<Self, SetupError> {
        let resolve_one = |port: u16| -> Result<SocketAddr, SetupError> {
            let resolve_err = |source| SetupError::Resolve {
                host: host.to_owned(),
                port,
                source,
            };

            let mut addr = (host, port)
                .to_socket_addrs()
                .map_err(|e| resolve_err(Some(e)))?
                .find(|a| a.is_ipv4() == local.is_ipv4())
                .ok_or_else(|| resolve_err(None))?;

            if let (SocketAddr::V6(a), SocketAddr::V6(l)) = (&mut addr, local) {
                a.set_scope_id(l.scope_id());
            }

            Ok(addr)
        };

        Ok(Self {
            control: resolve_one(control_port)?,
            timing: resolve_one(timing_port)?,
        })
    }
}

/// A connection's three sockets.
#[derive(Debug)]
pub struct Sockets<S> {
    pub audio: S,
    pub control: S,
    pub timing: S,
}

/// Local ports of a connection, to be advertised to the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LocalPorts {
    pub audio: u16,
    pub control: u16,
    pub timing: u16,
}

/// The latest anchor, with its remote time translated to our clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReferenceInfo {
    pub timestamp: u32,
    pub local_time: u64,
    pub remote_time: u64,
}

/// State shared by every thread of a connection.
pub(crate) struct Shared<S> {
    pub(crate) id: ConnectionId,
    pub(crate) config: Arc<ReceiverConfig>,
    pub(crate) sockets: Sockets<S>,
    pub(crate) peers: PeerAddrs,
    pub(crate) sink: Arc<dyn PacketSink>,
    pub(crate) dropper: PacketDropper,
    state: Mutex<TimingState>,
    running: AtomicBool,
    pub(crate) stop: AtomicBool,
    pinger: Mutex<Option<thread::Thread>>,
}

impl<S> Shared<S> {
    pub(crate) fn new(
        id: ConnectionId,
        config: Arc<ReceiverConfig>,
        params: &StreamParams,
        sockets: Sockets<S>,
        peers: PeerAddrs,
        sink: Arc<dyn PacketSink>,
    ) -> Self {
        Self {
            id,
            dropper: PacketDropper::new(config.diagnostic_drop_packet_fraction),
            config,
            sockets,
            peers,
            sink,
            state: Mutex::new(TimingState::new(params)),
            running: AtomicBool::new(false),
            stop: AtomicBool::new(false),
            pinger: Mutex::new(None),
        }
    }

    /// Locks the timing state.
    ///
    /// The state is a set of plain fields, so a panic while holding the lock can't leave it
    /// half-updated in a way that matters: poisoning is ignored.
    #[inline]
    pub(crate) fn lock(&self) -> MutexGuard<'_, TimingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[inline(always)]
    pub(crate) fn should_stop(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    #[inline(always)]
    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    #[inline(always)]
    pub(crate) fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    pub(crate) fn set_pinger(&self, pinger: thread::Thread) {
        *self.pinger.lock().unwrap_or_else(PoisonError::into_inner) = Some(pinger);
    }

    fn wake_pinger(&self) {
        if let Some(pinger) = self
            .pinger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            pinger.unpark();
        }
    }

    /// Hands a validated audio packet to the sink.
    pub(crate) fn deliver(&self, packet: &AudioPacket<'_>) {
        self.lock().packets_since_flush += 1;
        self.sink.put_packet(self.id, packet);
    }
}

/// One stream connection.
///
/// Created by [`setup`](Connection::setup) (or [`with_sockets`](Connection::with_sockets)),
/// its threads run between [`start`](Connection::start) and
/// [`teardown`](Connection::teardown). Dropping a running connection tears it down.
pub struct Connection<S: DatagramSocket = UdpSocket> {
    shared: Arc<Shared<S>>,
    /// Timing, control and audio threads, in that order.
    threads: Vec<thread::JoinHandle<()>>,
}

impl Connection<UdpSocket> {
    /// Binds the connection's sockets and resolves the peer's ports.
    ///
    /// `local` is our end of the session's TCP connection: sockets are bound on its
    /// address, and the peer is looked up in its address family.
    #[allow(clippy::too_many_arguments)]
    pub fn setup(
        id: ConnectionId,
        config: Arc<ReceiverConfig>,
        params: StreamParams,
        local: SocketAddr,
        peer_host: &str,
        peer_control_port: u16,
        peer_timing_port: u16,
        ports: &PortAllocator,
        sink: Arc<dyn PacketSink>,
    ) -> Result<Self, SetupError> {
        config.validate()?;
        params.validate()?;

        let peers = PeerAddrs::resolve(peer_host, peer_control_port, peer_timing_port, local)?;

        let sockets = Sockets {
            audio: ports.bind(local, &config)?,
            control: ports.bind(local, &config)?,
            timing: ports.bind(local, &config)?,
        };

        let connection = Self::with_sockets(id, config, params, sockets, peers, sink)?;

        if let Ok(p) = connection.local_ports() {
            log::debug!(
                "{id}: set up with {peer_host} (control {}, timing {}), local ports audio {}, \
                control {}, timing {}",
                peers.control,
                peers.timing,
                p.audio,
                p.control,
                p.timing,
            );
        }

        Ok(connection)
    }
}

impl<S: DatagramSocket> Connection<S> {
    /// Builds a connection over already bound sockets.
    pub fn with_sockets(
        id: ConnectionId,
        config: Arc<ReceiverConfig>,
        params: StreamParams,
        sockets: Sockets<S>,
        peers: PeerAddrs,
        sink: Arc<dyn PacketSink>,
    ) -> Result<Self, SetupError> {
        config.validate()?;
        params.validate()?;

        Ok(Self {
            shared: Arc::new(Shared::new(id, config, &params, sockets, peers, sink)),
            threads: Vec::with_capacity(3),
        })
    }

    #[inline(always)]
    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    #[inline(always)]
    pub fn peers(&self) -> PeerAddrs {
        self.shared.peers
    }

    pub fn local_ports(&self) -> std::io::Result<LocalPorts> {
        let s = &self.shared.sockets;
        Ok(LocalPorts {
            audio: s.audio.local_addr()?.port(),
            control: s.control.local_addr()?.port(),
            timing: s.timing.local_addr()?.port(),
        })
    }

    #[inline(always)]
    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    /// Spawns the receive threads. Starting a running connection is ignored.
    pub fn start(&mut self) -> Result<(), SetupError> {
        let id = self.id();

        if !self.threads.is_empty() {
            log::warn!("{id}: start requested on an already running connection, ignored");
            return Ok(());
        }

        self.shared.stop.store(false, Ordering::Release);

        let shared = Arc::clone(&self.shared);
        self.spawn("timing", move || crate::receiver::timing::run(shared))?;

        let shared = Arc::clone(&self.shared);
        self.spawn("control", move || {
            ControlReceiver::new(Arc::clone(&shared)).start(&shared, &shared.sockets.control)
        })?;

        let shared = Arc::clone(&self.shared);
        self.spawn("audio", move || {
            AudioReceiver::new(Arc::clone(&shared)).start(&shared, &shared.sockets.audio)
        })?;

        self.shared.set_running(true);
        log::debug!("{id}: started");

        Ok(())
    }

    fn spawn(
        &mut self,
        channel: &str,
        f: impl FnOnce() + Send + 'static,
    ) -> Result<(), SetupError> {
        let res = thread::Builder::new()
            .name(format!("raop-{channel}-{}", self.id().0))
            .spawn(f);

        match res {
            Ok(handle) => {
                self.threads.push(handle);
                Ok(())
            }
            Err(e) => {
                self.teardown();
                Err(SetupError::Spawn(e))
            }
        }
    }

    /// Stops and joins every thread of the connection. Idempotent.
    pub fn teardown(&mut self) {
        if self.threads.is_empty() {
            return;
        }

        let id = self.id();

        self.shared.set_running(false);
        self.shared.stop.store(true, Ordering::Release);
        self.shared.wake_pinger();

        for handle in self.threads.drain(..) {
            let name = handle.thread().name().unwrap_or("receiver").to_owned();
            if handle.join().is_err() {
                log::warn!("{id}: thread {name} panicked");
            }
        }

        log::debug!("{id}: torn down");
    }

    /// A consistent copy of the timing state.
    #[inline]
    pub fn snapshot(&self) -> TimingSnapshot {
        self.shared.lock().snapshot()
    }

    /// Whether an anchor and a clock offset are known, i.e. whether the mapping
    /// functions return meaningful values.
    #[inline]
    pub fn have_timestamp_timing_information(&self) -> bool {
        self.snapshot().is_synchronized()
    }

    /// The clock offset (remote minus local, two's complement) extrapolated to now.
    pub fn offset_now(&self) -> Option<u64> {
        let clock = self.shared.lock().clock?;
        Some(clock.offset_at(time::local_now()))
    }

    /// Current latency, in frames.
    #[inline]
    pub fn latency(&self) -> u32 {
        self.shared.lock().latency
    }

    /// The local time at which frame `timestamp` plays, before latency.
    pub fn frame_to_local_time(&self, timestamp: u32) -> Mapping<u64> {
        let snapshot = self.snapshot();
        mapping::frame_to_local_time(self.id(), &snapshot.state, timestamp, time::local_now())
    }

    /// The frame playing at local time `time`, before latency.
    pub fn local_time_to_frame(&self, local_time: u64) -> Mapping<u32> {
        let snapshot = self.snapshot();
        mapping::local_time_to_frame(self.id(), &snapshot.state, local_time, time::local_now())
    }

    pub fn reference_timestamp_info(&self) -> Option<ReferenceInfo> {
        let state = self.snapshot().state;
        let (reference, clock) = state.reference.zip(state.clock)?;

        Some(ReferenceInfo {
            timestamp: reference.timestamp,
            local_time: clock.remote_to_local(reference.remote_time, time::local_now()),
            remote_time: reference.remote_time,
        })
    }

    /// Forgets the stream's anchors, on a flush or a resume. The clock offset is kept.
    pub fn flush(&self) {
        self.shared.lock().clear_anchors();
        log::debug!("{}: anchors cleared", self.id());
    }

    /// Asks the peer to retransmit `count` packets starting at sequence number `first`.
    ///
    /// Called from the playback side when it detects a gap. Never blocks for longer than
    /// the configured send timeout.
    pub fn request_resend(&self, first: u16, count: u16) -> ResendOutcome {
        resend::request_resend(&self.shared, first, count, time::local_now())
    }
}

impl<S: DatagramSocket> Drop for Connection<S> {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl<S: DatagramSocket> core::fmt::Debug for Connection<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .field("peers", &self.shared.peers)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{sink::QueuedPacket, socket::mock::RecordingSocket};
    use core::time::Duration;
    use std::time::Instant;

    /// A sink keeping a copy of everything.
    #[derive(Default)]
    pub(crate) struct Recorder(Mutex<Vec<QueuedPacket>>);

    impl PacketSink for Recorder {
        fn put_packet(&self, connection: ConnectionId, packet: &AudioPacket<'_>) {
            self.0
                .lock()
                .unwrap()
                .extend(QueuedPacket::new(connection, packet));
        }
    }

    pub(crate) fn recorded(sink: &Recorder) -> Vec<QueuedPacket> {
        sink.0.lock().unwrap().clone()
    }

    fn peers() -> PeerAddrs {
        PeerAddrs {
            control: SocketAddr::from(([127, 0, 0, 1], 6001)),
            timing: SocketAddr::from(([127, 0, 0, 1], 6002)),
        }
    }

    pub(crate) fn recording_shared_with(
        config: ReceiverConfig,
        params: StreamParams,
    ) -> (Arc<Shared<RecordingSocket>>, Arc<Recorder>) {
        let sink = Arc::new(Recorder::default());

        let sockets = Sockets {
            audio: RecordingSocket::default(),
            control: RecordingSocket::default(),
            timing: RecordingSocket::default(),
        };

        let shared = Shared::new(
            ConnectionId(1),
            Arc::new(config),
            &params,
            sockets,
            peers(),
            sink.clone(),
        );

        (Arc::new(shared), sink)
    }

    pub(crate) fn recording_shared() -> (Arc<Shared<RecordingSocket>>, Arc<Recorder>) {
        recording_shared_with(ReceiverConfig::default(), StreamParams::default())
    }

    /// A connection whose control socket is `control`.
    pub(crate) fn mock_shared(control: RecordingSocket) -> Arc<Shared<RecordingSocket>> {
        let sockets = Sockets {
            audio: RecordingSocket::default(),
            control,
            timing: RecordingSocket::default(),
        };

        Arc::new(Shared::new(
            ConnectionId(2),
            Arc::new(ReceiverConfig::default()),
            &StreamParams::default(),
            sockets,
            peers(),
            Arc::new(Recorder::default()),
        ))
    }

    fn loopback_config() -> Arc<ReceiverConfig> {
        Arc::new(ReceiverConfig {
            udp_port_base: 0,
            receive_poll_interval: Duration::from_millis(20),
            ..Default::default()
        })
    }

    #[test]
    fn port_allocation_cycles_past_the_reserved_ports() {
        let config = ReceiverConfig {
            udp_port_base: 6001,
            udp_port_range: 6,
            ..Default::default()
        };

        let ports = PortAllocator::new();
        let sequence: Vec<u16> = (0..10).map(|_| ports.next(&config)).collect();

        assert_eq!(
            sequence,
            [6001, 6002, 6003, 6004, 6005, 6006, 6004, 6005, 6006, 6004]
        );

        ports.reset();
        assert_eq!(ports.next(&config), 6001);

        let ephemeral = ReceiverConfig {
            udp_port_base: 0,
            ..Default::default()
        };
        assert_eq!(ports.next(&ephemeral), 0);
    }

    #[test]
    fn setup_rejects_bad_configuration() {
        let config = Arc::new(ReceiverConfig {
            diagnostic_drop_packet_fraction: 2.,
            ..Default::default()
        });

        let res = Connection::setup(
            ConnectionId(0),
            config,
            StreamParams::default(),
            SocketAddr::from(([127, 0, 0, 1], 0)),
            "127.0.0.1",
            6001,
            6002,
            &PortAllocator::new(),
            Arc::new(Recorder::default()),
        );

        assert!(matches!(res, Err(SetupError::InvalidConfig(_))));
    }

    #[test]
    fn lifecycle() {
        let ports = PortAllocator::new();

        let mut connection = Connection::setup(
            ConnectionId(7),
            loopback_config(),
            StreamParams::default(),
            SocketAddr::from(([127, 0, 0, 1], 0)),
            "127.0.0.1",
            6001,
            6002,
            &ports,
            Arc::new(Recorder::default()),
        )
        .unwrap();

        let local = connection.local_ports().unwrap();
        assert_ne!(local.audio, 0);
        assert_ne!(local.audio, local.control);
        assert_ne!(local.control, local.timing);

        assert!(!connection.is_running());
        assert_eq!(connection.request_resend(0, 1), ResendOutcome::Inactive);

        connection.start().unwrap();
        assert!(connection.is_running());

        // duplicate start
        connection.start().unwrap();
        assert_eq!(connection.threads.len(), 3);

        // nothing received yet
        assert!(!connection.have_timestamp_timing_information());
        assert_eq!(connection.offset_now(), None);
        assert_eq!(connection.reference_timestamp_info(), None);
        assert!(!connection.frame_to_local_time(1234).is_synchronized());
        assert!(!connection.local_time_to_frame(time::local_now()).is_synchronized());

        let begin = Instant::now();
        connection.teardown();
        assert!(begin.elapsed() < Duration::from_secs(2));
        assert!(!connection.is_running());
        assert!(connection.threads.is_empty());

        // idempotent
        connection.teardown();
    }

    #[test]
    fn flush_clears_anchors() {
        let (shared, _) = recording_shared();

        {
            let mut state = shared.lock();
            state.clock = Some(crate::clock::ClockModel::new(5, 0));
            state.reference = Some(crate::Anchor {
                timestamp: 1,
                remote_time: 2,
            });
            state.packets_since_flush = 10;
        }

        let connection = Connection {
            shared: Arc::clone(&shared),
            threads: Vec::new(),
        };

        assert!(connection.have_timestamp_timing_information());
        assert!(connection.reference_timestamp_info().is_some());

        connection.flush();

        assert!(!connection.have_timestamp_timing_information());
        let snapshot = connection.snapshot();
        assert_eq!(snapshot.packets_since_flush(), 0);
        assert_eq!(snapshot.clock(), Some(crate::clock::ClockModel::new(5, 0)));
    }
}
