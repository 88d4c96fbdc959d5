//! Loopback Example - one sender streaming into the relay
//!
//! ## What it shows
//!
//! - The relay runs on its own thread and reports each packet over a channel
//! - The sender connects over TCP and streams 20 framed RTP packets, with
//!   the marker bit set on every fifth
//! - The sender stays connected until every packet was observed, then the
//!   relay is shut down through its [`ShutdownHandle`]
//!
//! # Usage
//!
//! ```bash
//! cargo run --example loopback
//! ```

use rtprelay::framing::encode_frame;
use rtprelay::{RelayConfig, RtpPacket, DEFAULT_MAX_PACKET_SIZE};
use std::io::Write;
use std::net::{SocketAddr, TcpStream};
use std::process::ExitCode;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

const PACKET_COUNT: u16 = 20;
const SSRC: u32 = 0x1234_5678;

fn main() -> ExitCode {
    let relay_config = RelayConfig {
        listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        poll_interval: Duration::from_millis(50),
        accept_poll_interval: Duration::from_millis(50),
        ..RelayConfig::default()
    };

    let mut relay = rtprelay::Relay::new(relay_config).expect("Failed to start relay");
    let relay_addr = relay.local_addr();
    let shutdown = relay.shutdown_handle();
    println!("Relay listening on {}\n", relay_addr);

    let (tx, rx) = mpsc::channel();
    let relay_thread = thread::spawn(move || {
        relay.run(|packet| {
            let _ = tx.send((packet.sequence_number, packet.marker));
        })
    });

    // Sender
    let mut stream = TcpStream::connect(relay_addr).expect("Failed to connect");
    for i in 0..PACKET_COUNT {
        let marker = (i + 1) % 5 == 0;
        let packet = RtpPacket::new(SSRC, i, u32::from(i) * 160, 96, marker, vec![i as u8; 160]);
        let frame = encode_frame(&packet.to_bytes(), DEFAULT_MAX_PACKET_SIZE).expect("Failed to frame packet");
        stream.write_all(&frame).expect("Failed to send packet");
    }
    println!("Sent {} packets", PACKET_COUNT);

    let mut received = 0;
    while received < PACKET_COUNT {
        match rx.recv_timeout(Duration::from_secs(5)) {
            Ok((seq, marker)) => {
                println!("Relay got seq={} marker={}", seq, marker);
                received += 1;
            }
            Err(_) => break,
        }
    }

    drop(stream);
    shutdown.shutdown();
    let result = relay_thread.join().expect("Relay thread panicked");

    if let Err(err) = result {
        eprintln!("Relay failed: {}", err);
        return ExitCode::FAILURE;
    }
    if received != PACKET_COUNT {
        eprintln!("Only {} of {} packets observed", received, PACKET_COUNT);
        return ExitCode::FAILURE;
    }

    println!("\nAll {} packets relayed", PACKET_COUNT);
    ExitCode::SUCCESS
}
