//! A receiver talking to a simulated sender over loopback.

use std::{
    net::{SocketAddr, UdpSocket},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use raop_network::{
    Connection, ConnectionId, MappingQuality, PortAllocator, QueuedPacket, ReceiverConfig,
    ResendOutcome, RingSink, StreamParams,
    proto::{
        NtpTimestamp,
        audio::AudioKind,
        control::{ResendRequest, SyncPacket},
        timing::{TimingReply, TimingRequest},
    },
    utils::{
        queue::rtrb,
        time::{self, NANOS_PER_MILLI, NANOS_PER_SEC},
    },
};

/// The simulated sender's clock runs this far ahead of ours.
const REMOTE_AHEAD: u64 = 5_000 * NANOS_PER_SEC;

const LOCALHOST: [u8; 4] = [127, 0, 0, 1];

fn remote_now() -> NtpTimestamp {
    NtpTimestamp::from_nanos(time::local_now() + REMOTE_AHEAD)
}

fn wait_for(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

fn pop_packet(rx: &mut rtrb::Consumer<QueuedPacket>) -> QueuedPacket {
    let mut packet = None;
    wait_for("an audio packet", || {
        packet = rx.pop().ok();
        packet.is_some()
    });
    packet.unwrap()
}

fn rtp_audio(sequence: u16, timestamp: u32) -> Vec<u8> {
    let mut buf = vec![0u8; 12 + 32];
    buf[0] = 0x80;
    buf[1] = 0x60;
    buf[2..4].copy_from_slice(&sequence.to_be_bytes());
    buf[4..8].copy_from_slice(&timestamp.to_be_bytes());
    for (i, b) in buf[12..].iter_mut().enumerate() {
        *b = i as u8;
    }
    buf
}

fn resent_audio(sequence: u16, timestamp: u32) -> Vec<u8> {
    let mut buf = vec![0x80, 0xd6, 0, 1];
    buf.extend(rtp_audio(sequence, timestamp));
    buf
}

/// The sender's end: where it listens for control and timing packets, and where it sends
/// audio from.
struct Sender {
    control: UdpSocket,
    timing: UdpSocket,
    audio: UdpSocket,
}

impl Sender {
    fn bind() -> Self {
        let bind = || UdpSocket::bind(SocketAddr::from((LOCALHOST, 0))).unwrap();
        Self {
            control: bind(),
            timing: bind(),
            audio: bind(),
        }
    }

    fn port(sock: &UdpSocket) -> u16 {
        sock.local_addr().unwrap().port()
    }

    /// Answers timing requests until `stop` is raised, returns how many were answered.
    fn answer_timing(sock: UdpSocket, stop: Arc<AtomicBool>) -> thread::JoinHandle<u32> {
        sock.set_read_timeout(Some(Duration::from_millis(20)))
            .unwrap();

        thread::spawn(move || {
            let mut buf = [0u8; 128];
            let mut answered = 0;

            while !stop.load(Ordering::Acquire) {
                let Ok((n, src)) = sock.recv_from(&mut buf) else {
                    continue;
                };

                if TimingRequest::parse(&buf[..n]).is_err() {
                    continue;
                }

                let receive_time = remote_now();
                let reply = TimingReply {
                    origin: NtpTimestamp::ZERO,
                    receive_time,
                    transmit_time: remote_now(),
                };

                sock.send_to(&reply.encode(7), src).unwrap();
                answered += 1;
            }

            answered
        })
    }
}

fn config() -> Arc<ReceiverConfig> {
    Arc::new(ReceiverConfig {
        udp_port_base: 0,
        receive_poll_interval: Duration::from_millis(20),
        timing_burst_interval: Duration::from_millis(10),
        timing_burst_count: 8,
        ..Default::default()
    })
}

fn connect(sender: &Sender, sink: RingSink) -> Connection {
    let mut connection = Connection::setup(
        ConnectionId(3),
        config(),
        StreamParams::default(),
        SocketAddr::from((LOCALHOST, 0)),
        "127.0.0.1",
        Sender::port(&sender.control),
        Sender::port(&sender.timing),
        &PortAllocator::new(),
        Arc::new(sink),
    )
    .unwrap();

    connection.start().unwrap();
    connection
}

#[test]
fn streams_against_a_simulated_sender() {
    let sender = Sender::bind();
    let (sink, mut rx) = RingSink::new(16);
    let mut connection = connect(&sender, sink);

    let local = connection.local_ports().unwrap();
    let receiver_audio = SocketAddr::from((LOCALHOST, local.audio));
    let receiver_control = SocketAddr::from((LOCALHOST, local.control));

    let stop = Arc::new(AtomicBool::new(false));
    let responder = Sender::answer_timing(sender.timing.try_clone().unwrap(), stop.clone());

    wait_for("a clock offset", || connection.offset_now().is_some());

    let error = connection.offset_now().unwrap().wrapping_sub(REMOTE_AHEAD) as i64;
    assert!(
        error.unsigned_abs() < 20 * NANOS_PER_MILLI,
        "offset off by {error} ns"
    );

    // audio
    sender
        .audio
        .send_to(&rtp_audio(100, 44100), receiver_audio)
        .unwrap();

    let packet = pop_packet(&mut rx);
    assert_eq!(packet.connection, ConnectionId(3));
    assert_eq!(packet.kind, AudioKind::Data);
    assert_eq!(packet.sequence, 100);
    assert_eq!(packet.timestamp, 44100);
    assert_eq!(packet.payload.len(), 32);
    assert_eq!(packet.payload[5], 5);

    // anchor frame 44100 at the sender's present, with half a second of latency
    let sent_at = time::local_now();
    let sync = SyncPacket {
        flags: 0,
        rtp_timestamp_less_latency: 44100 - 22050,
        remote_time: remote_now(),
        sync_timestamp: 44100,
    };
    sender
        .control
        .send_to(&sync.encode(), receiver_control)
        .unwrap();

    wait_for("an anchor", || connection.have_timestamp_timing_information());

    assert_eq!(connection.latency(), 22050);

    let snapshot = connection.snapshot();
    assert_eq!(snapshot.packets_since_flush(), 1);
    assert_eq!(snapshot.latency_delayed_timestamp(), 44100 - 22050);
    assert_eq!(snapshot.initial_reference(), snapshot.reference());

    let anchor_time = connection.frame_to_local_time(44100);
    assert_eq!(anchor_time.quality, MappingQuality::NominalRate);
    let error = anchor_time.value.wrapping_sub(sent_at) as i64;
    assert!(
        error.unsigned_abs() < 20 * NANOS_PER_MILLI,
        "anchor off by {error} ns"
    );

    let one_second_later = connection.frame_to_local_time(88200);
    let step = one_second_later.value.wrapping_sub(anchor_time.value) as i64;
    assert!((step - NANOS_PER_SEC as i64).abs() < NANOS_PER_MILLI as i64);

    let frame = connection.local_time_to_frame(anchor_time.value);
    assert!(frame.is_synchronized());
    assert!(frame.value.abs_diff(44100) <= 44, "frame {}", frame.value);

    let info = connection.reference_timestamp_info().unwrap();
    assert_eq!(info.timestamp, 44100);
    assert_eq!(info.remote_time, sync.remote_time.to_nanos());

    // gap detected on the playback side
    assert_eq!(connection.request_resend(101, 2), ResendOutcome::Sent);

    sender
        .control
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    let mut buf = [0u8; 64];
    let (n, _) = sender.control.recv_from(&mut buf).unwrap();
    assert_eq!(
        ResendRequest::parse(&buf[..n]).unwrap(),
        ResendRequest { first: 101, count: 2 }
    );

    sender
        .control
        .send_to(&resent_audio(101, 44452), receiver_control)
        .unwrap();

    let packet = pop_packet(&mut rx);
    assert_eq!(packet.kind, AudioKind::Resend);
    assert_eq!(packet.sequence, 101);
    assert_eq!(packet.timestamp, 44452);

    let begin = Instant::now();
    connection.teardown();
    assert!(begin.elapsed() < Duration::from_secs(2));
    assert_eq!(connection.request_resend(101, 2), ResendOutcome::Inactive);

    stop.store(true, Ordering::Release);
    assert!(responder.join().unwrap() > 0);
}

#[test]
fn sync_without_clock_is_dropped() {
    // nobody answers timing requests
    let sender = Sender::bind();
    let (sink, _rx) = RingSink::new(4);
    let connection = connect(&sender, sink);

    let receiver_control =
        SocketAddr::from((LOCALHOST, connection.local_ports().unwrap().control));

    let sync = SyncPacket {
        flags: 7,
        rtp_timestamp_less_latency: 1000,
        remote_time: remote_now(),
        sync_timestamp: 23050,
    };
    sender
        .control
        .send_to(&sync.encode(), receiver_control)
        .unwrap();

    thread::sleep(Duration::from_millis(200));

    let snapshot = connection.snapshot();
    assert_eq!(snapshot.reference(), None);
    assert_eq!(snapshot.latency(), 0);
    assert!(!connection.have_timestamp_timing_information());
    assert!(!connection.frame_to_local_time(23050).is_synchronized());

    // the pinger kept asking
    sender
        .timing
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let mut buf = [0u8; 64];
    let (n, _) = sender.timing.recv_from(&mut buf).unwrap();
    assert!(TimingRequest::parse(&buf[..n]).is_ok());
}
