//! Integration tests for RtpSession, its transmitters and the error hooks
//!
//! Use TEST_LOG environment variable to control tracing verbosity (like -v, -vv, -vvv):
//!
//! ```bash
//! TEST_LOG=2 cargo test --test session -- --nocapture
//! ```

use rtprelay::framing::encode_frame;
use rtprelay::pump;
use rtprelay::{
    Destination, DriveMode, Endpoint, Error, ErrorHooks, RtpPacket, RtpSession, SessionParams,
    SocketHandle, TcpDestinations, TcpTransmitter, Transmitter, UdpTransmitter,
};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::thread;
use std::time::{Duration, Instant};

static INIT: Once = Once::new();

// ============================================================================
// Tracing Initialization
// ============================================================================

/// Initialize tracing based on TEST_LOG environment variable
fn init_tracing() {
    INIT.call_once(|| {
        if let Ok(level_str) = std::env::var("TEST_LOG") {
            let verbosity = level_str.parse::<u8>().unwrap_or(0);

            if verbosity > 0 {
                let level = match verbosity {
                    1 => "info",
                    2 => "debug",
                    _ => "trace", // 3 or more
                };

                let filter = format!("rtprelay={}", level);
                let _ = tracing_subscriber::fmt()
                    .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
                    .with_target(true)
                    .with_test_writer()
                    .try_init();
            }
        }
    });
}

// ============================================================================
// Helper Functions
// ============================================================================

const DEADLINE: Duration = Duration::from_secs(5);

fn localhost() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 0))
}

fn udp_session(params: SessionParams) -> (RtpSession, SocketAddr) {
    let transmitter = UdpTransmitter::bind(localhost(), params.max_packet_size).unwrap();
    let addr = transmitter.local_addr().unwrap();
    (RtpSession::create(params, Box::new(transmitter)).unwrap(), addr)
}

fn tcp_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind(localhost()).unwrap();
    let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    let (server, _) = listener.accept().unwrap();
    (client, server)
}

fn packet(ssrc: u32, seq: u16) -> Vec<u8> {
    RtpPacket::new(ssrc, seq, u32::from(seq) * 160, 96, false, vec![seq as u8; 20]).to_bytes()
}

/// Drains `session` until `count` packets were seen, polling when the
/// session is externally driven.
fn drain_until(session: &RtpSession, count: usize) -> Vec<(u32, u16)> {
    let start = Instant::now();
    let mut seen = Vec::new();
    while seen.len() < count && start.elapsed() < DEADLINE {
        if session.drive_mode() == DriveMode::External {
            session.poll().unwrap();
        }
        let mut access = session.begin_data_access();
        let stats = pump::drain(&mut access, |p| seen.push((p.ssrc, p.sequence_number)));
        assert_eq!(stats.fetched, stats.disposed);
        drop(access);
        thread::sleep(Duration::from_millis(5));
    }
    seen
}

#[derive(Default)]
struct CountingHooks {
    sends: AtomicUsize,
    receives: AtomicUsize,
}

impl ErrorHooks for CountingHooks {
    fn on_send_error(&self, handle: SocketHandle, destinations: &mut TcpDestinations) {
        self.sends.fetch_add(1, Ordering::SeqCst);
        destinations.remove(handle);
    }

    fn on_receive_error(&self, handle: SocketHandle, destinations: &mut TcpDestinations) {
        self.receives.fetch_add(1, Ordering::SeqCst);
        destinations.remove(handle);
    }
}

// ============================================================================
// Receive Path
// ============================================================================

#[test]
fn packets_are_drained_per_source_in_order() {
    init_tracing();
    let (session, addr) = udp_session(SessionParams::default());
    let sender = UdpSocket::bind(localhost()).unwrap();

    for seq in 0..3 {
        sender.send_to(&packet(0xa, seq), addr).unwrap();
        sender.send_to(&packet(0xb, seq + 100), addr).unwrap();
    }

    let seen = drain_until(&session, 6);

    let a: Vec<_> = seen.iter().filter(|(s, _)| *s == 0xa).map(|(_, q)| *q).collect();
    let b: Vec<_> = seen.iter().filter(|(s, _)| *s == 0xb).map(|(_, q)| *q).collect();
    assert_eq!(a, vec![0, 1, 2]);
    assert_eq!(b, vec![100, 101, 102]);
}

#[test]
fn drain_hands_out_every_packet_once() {
    init_tracing();
    let (session, addr) = udp_session(SessionParams::default());
    let sender = UdpSocket::bind(localhost()).unwrap();
    for seq in 0..4 {
        sender.send_to(&packet(1, seq), addr).unwrap();
    }

    let start = Instant::now();
    while session.outstanding() < 4 && start.elapsed() < DEADLINE {
        session.poll().unwrap();
    }

    let mut access = session.begin_data_access();
    assert_eq!(access.sources_with_data(), vec![1]);
    let stats = pump::drain(&mut access, |_| {});
    assert_eq!(stats.sources, 1);
    assert_eq!(stats.fetched, 4);
    assert_eq!(stats.disposed, 4);
    assert_eq!(access.outstanding(), 0);
    assert!(access.sources_with_data().is_empty());
    assert_eq!(access.fetched(), access.disposed());
}

#[test]
fn dropped_packet_counts_as_disposed() {
    init_tracing();
    let (session, addr) = udp_session(SessionParams::default());
    UdpSocket::bind(localhost())
        .unwrap()
        .send_to(&packet(3, 1), addr)
        .unwrap();

    let start = Instant::now();
    while session.outstanding() == 0 && start.elapsed() < DEADLINE {
        session.poll().unwrap();
    }

    let mut access = session.begin_data_access();
    {
        let pending = access.next_packet(3).expect("queued packet");
        assert_eq!(pending.sequence_number, 1);
    }
    assert_eq!(access.fetched(), 1);
    assert_eq!(access.disposed(), 1);
    assert!(access.next_packet(3).is_none());
}

#[test]
fn rtcp_and_own_packets_are_not_queued() {
    init_tracing();
    let params = SessionParams {
        ssrc: Some(42),
        ..SessionParams::default()
    };
    let (session, addr) = udp_session(params);
    let sender = UdpSocket::bind(localhost()).unwrap();

    sender.send_to(&[0x80, 200, 0, 0], addr).unwrap();
    sender.send_to(&packet(42, 1), addr).unwrap();
    sender.send_to(&packet(7, 1), addr).unwrap();

    let seen = drain_until(&session, 1);
    // Give stragglers a chance to show up.
    thread::sleep(Duration::from_millis(20));
    session.poll().unwrap();

    assert_eq!(seen, vec![(7, 1)]);
    assert_eq!(session.outstanding(), 0);
}

#[test]
fn malformed_packet_fails_maintenance() {
    init_tracing();
    let (session, addr) = udp_session(SessionParams::default());
    UdpSocket::bind(localhost())
        .unwrap()
        .send_to(&[0x40, 0x60, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0], addr)
        .unwrap();

    let start = Instant::now();
    let result = loop {
        match session.poll() {
            Ok(0) if start.elapsed() < DEADLINE => continue,
            other => break other,
        }
    };
    assert!(matches!(result, Err(Error::MalformedPacket(_))));
}

// ============================================================================
// Drive Modes
// ============================================================================

#[test]
fn internal_drive_refuses_explicit_poll() {
    init_tracing();
    let params = SessionParams {
        drive_mode: DriveMode::Internal,
        maintenance_interval: Duration::from_millis(20),
        ..SessionParams::default()
    };
    let (session, addr) = udp_session(params);

    assert!(matches!(session.poll(), Err(Error::InternalDriveActive)));

    let sender = UdpSocket::bind(localhost()).unwrap();
    for seq in 0..5 {
        sender.send_to(&packet(9, seq), addr).unwrap();
    }

    let seen = drain_until(&session, 5);
    assert_eq!(seen.len(), 5);
    session.check_maintenance().unwrap();
}

#[test]
fn internal_drive_reports_failure_once() {
    init_tracing();
    let params = SessionParams {
        drive_mode: DriveMode::Internal,
        maintenance_interval: Duration::from_millis(20),
        ..SessionParams::default()
    };
    let (session, addr) = udp_session(params);
    UdpSocket::bind(localhost())
        .unwrap()
        .send_to(&[0x00, 0x00], addr)
        .unwrap();

    let start = Instant::now();
    let result = loop {
        match session.check_maintenance() {
            Ok(()) if start.elapsed() < DEADLINE => thread::sleep(Duration::from_millis(10)),
            other => break other,
        }
    };

    match result {
        Err(Error::MaintenanceFailed(inner)) => {
            assert!(matches!(*inner, Error::MalformedPacket(_)))
        }
        other => panic!("expected maintenance failure, got {other:?}"),
    }
    assert!(session.check_maintenance().is_ok());
}

// ============================================================================
// Send Path and Destinations
// ============================================================================

#[test]
fn sent_packets_advance_sequence_and_timestamp() {
    init_tracing();
    let params = SessionParams {
        ssrc: Some(0xfeed),
        ..SessionParams::default()
    };
    let (session, _) = udp_session(params);
    let receiver = UdpSocket::bind(localhost()).unwrap();
    receiver.set_read_timeout(Some(DEADLINE)).unwrap();
    session
        .add_destination(Endpoint::Udp(receiver.local_addr().unwrap()))
        .unwrap();

    session.send_default(b"one").unwrap();
    session.send_packet(b"two", 0, true, 320).unwrap();
    session.send_default(b"three").unwrap();

    let mut buf = [0u8; 1600];
    let mut packets = Vec::new();
    for _ in 0..3 {
        let (len, _) = receiver.recv_from(&mut buf).unwrap();
        packets.push(RtpPacket::parse(&buf[..len]).unwrap().unwrap());
    }

    assert!(packets.iter().all(|p| p.ssrc == 0xfeed));
    assert_eq!(packets[1].sequence_number, packets[0].sequence_number.wrapping_add(1));
    assert_eq!(packets[2].sequence_number, packets[1].sequence_number.wrapping_add(1));
    assert_eq!(packets[1].timestamp, packets[0].timestamp.wrapping_add(160));
    assert_eq!(packets[2].timestamp, packets[1].timestamp.wrapping_add(320));
    assert_eq!(packets[0].payload_type, 96);
    assert_eq!((packets[1].payload_type, packets[1].marker), (0, true));
    assert_eq!(packets[2].payload, b"three".to_vec());
}

#[test]
fn destination_set_rejects_duplicates_and_mismatches() {
    init_tracing();
    let (session, _) = udp_session(SessionParams::default());
    let peer: SocketAddr = "127.0.0.1:9".parse().unwrap();

    let destination = session.add_destination(Endpoint::Udp(peer)).unwrap();
    assert_eq!(destination, Destination::Udp(peer));
    assert!(matches!(
        session.add_destination(Endpoint::Udp(peer)),
        Err(Error::DuplicateDestination(_))
    ));
    assert!(matches!(
        session.remove_destination(&Destination::Tcp(3)),
        Err(Error::TransportMismatch { expected: "udp", got: "tcp" })
    ));

    session.remove_destination(&destination).unwrap();
    assert!(session.destinations().is_empty());
    assert!(matches!(
        session.remove_destination(&destination),
        Err(Error::DestinationNotFound(_))
    ));
}

#[test]
fn destroyed_session_is_inert() {
    init_tracing();
    let (session, _) = udp_session(SessionParams::default());
    let session = Arc::new(session);
    let clone = session.clone();

    session.destroy();
    session.destroy();

    assert!(clone.is_destroyed());
    assert!(matches!(clone.poll(), Err(Error::SessionDestroyed)));
    assert!(matches!(clone.send_default(b"x"), Err(Error::SessionDestroyed)));
    assert!(matches!(
        clone.add_destination(Endpoint::Udp("127.0.0.1:9".parse().unwrap())),
        Err(Error::SessionDestroyed)
    ));
}

// ============================================================================
// TCP Transmitter and Error Hooks
// ============================================================================

#[test]
fn tcp_frames_are_received() {
    init_tracing();
    let (mut client, server) = tcp_pair();
    let session = RtpSession::create(
        SessionParams::default(),
        Box::new(TcpTransmitter::new(SessionParams::default().max_packet_size)),
    )
    .unwrap();
    session.add_destination(Endpoint::Tcp(server)).unwrap();

    let mut stream = Vec::new();
    for seq in 0..3 {
        stream.extend(encode_frame(&packet(5, seq), 1564).unwrap());
    }
    // Split mid-frame to exercise reassembly.
    client.write_all(&stream[..10]).unwrap();
    client.flush().unwrap();
    thread::sleep(Duration::from_millis(20));
    client.write_all(&stream[10..]).unwrap();

    let seen = drain_until(&session, 3);
    assert_eq!(seen, vec![(5, 0), (5, 1), (5, 2)]);
}

#[test]
fn tcp_send_is_framed() {
    init_tracing();
    let (mut client, server) = tcp_pair();
    let session = RtpSession::create(
        SessionParams::default(),
        Box::new(TcpTransmitter::new(1564)),
    )
    .unwrap();
    session.add_destination(Endpoint::Tcp(server)).unwrap();
    session.send_default(b"hello").unwrap();

    client.set_read_timeout(Some(DEADLINE)).unwrap();
    let mut header = [0u8; 2];
    client.read_exact(&mut header).unwrap();
    let len = u16::from_be_bytes(header) as usize;
    let mut body = vec![0u8; len];
    client.read_exact(&mut body).unwrap();

    let packet = RtpPacket::parse(&body).unwrap().unwrap();
    assert_eq!(packet.payload, b"hello".to_vec());
    assert_eq!(packet.ssrc, session.ssrc());
}

#[test]
fn peer_close_triggers_receive_hook() {
    init_tracing();
    let hooks = Arc::new(CountingHooks::default());
    let (client, server) = tcp_pair();
    let mut transmitter = TcpTransmitter::with_hooks(1564, hooks.clone());
    transmitter.add_destination(Endpoint::Tcp(server)).unwrap();
    drop(client);

    let start = Instant::now();
    let mut packets = Vec::new();
    while hooks.receives.load(Ordering::SeqCst) == 0 && start.elapsed() < DEADLINE {
        transmitter.poll(&mut packets).unwrap();
        thread::sleep(Duration::from_millis(5));
    }

    assert_eq!(hooks.receives.load(Ordering::SeqCst), 1);
    assert_eq!(hooks.sends.load(Ordering::SeqCst), 0);
    assert!(transmitter.destinations().is_empty());
    assert!(packets.is_empty());
}

#[test]
fn send_failure_triggers_send_hook() {
    init_tracing();
    let hooks = Arc::new(CountingHooks::default());
    let (client, server) = tcp_pair();
    let mut transmitter = TcpTransmitter::with_hooks(1564, hooks.clone());
    transmitter.add_destination(Endpoint::Tcp(server)).unwrap();
    drop(client);

    // The first write after the peer closed provokes a reset; a later one fails.
    let start = Instant::now();
    while hooks.sends.load(Ordering::SeqCst) == 0 && start.elapsed() < DEADLINE {
        transmitter.send(&packet(1, 1)).unwrap();
        thread::sleep(Duration::from_millis(10));
    }

    assert_eq!(hooks.sends.load(Ordering::SeqCst), 1);
    assert!(transmitter.destinations().is_empty());
}

#[test]
fn stalled_peer_backlog_stays_bounded() {
    init_tracing();
    let hooks = Arc::new(CountingHooks::default());
    let (_client, server) = tcp_pair();
    let limit = 16 * 1024;
    let mut transmitter = TcpTransmitter::with_hooks(1564, hooks.clone()).with_send_backlog(limit);
    transmitter.add_destination(Endpoint::Tcp(server)).unwrap();

    // The client never reads, so the kernel buffers fill and the rest queues.
    let payload = RtpPacket::new(5, 0, 0, 96, false, vec![0x55; 1000]).to_bytes();
    for _ in 0..20_000 {
        transmitter.send(&payload).unwrap();
        assert!(transmitter.backlog() <= limit);
    }

    assert!(transmitter.backlog() > 0);
    assert_eq!(transmitter.destinations().len(), 1);
    assert_eq!(hooks.sends.load(Ordering::SeqCst), 0);
}

#[test]
fn oversized_frame_still_reports_earlier_receive_failure() {
    init_tracing();
    let hooks = Arc::new(CountingHooks::default());
    let (closed_client, closed_server) = tcp_pair();
    let (mut bad_client, bad_server) = tcp_pair();
    let bad_handle = bad_server.as_raw_fd();

    let mut transmitter = TcpTransmitter::with_hooks(1564, hooks.clone());
    transmitter.add_destination(Endpoint::Tcp(closed_server)).unwrap();
    transmitter.add_destination(Endpoint::Tcp(bad_server)).unwrap();

    drop(closed_client);
    bad_client.write_all(&[0xff, 0xff]).unwrap();
    thread::sleep(Duration::from_millis(50));

    let mut packets = Vec::new();
    let result = transmitter.poll(&mut packets);

    assert!(matches!(result, Err(Error::FrameTooLarge { .. })));
    assert_eq!(hooks.receives.load(Ordering::SeqCst), 1);
    assert_eq!(transmitter.destinations(), vec![Destination::Tcp(bad_handle)]);
}

#[test]
fn tcp_transmitter_rejects_udp_endpoint() {
    let mut transmitter = TcpTransmitter::new(1564);
    let result = transmitter.add_destination(Endpoint::Udp("127.0.0.1:9".parse().unwrap()));
    assert!(matches!(
        result,
        Err(Error::TransportMismatch { expected: "tcp", got: "udp" })
    ));
}
