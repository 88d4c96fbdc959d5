//! Relay server - logs every RTP packet the connected peer streams
//!
//! Listens for one peer at a time. When the peer goes away the relay returns
//! to listening and the next peer gets a fresh session.
//!
//! # Usage
//!
//! ```bash
//! cargo run --example relay_server -- --bind 0.0.0.0:15000 -vv
//! cargo run --example relay_server -- --transport udp --bind 127.0.0.1:5004
//! cargo run --example relay_server -- --config relay.toml
//! ```

use clap::Parser;
use config::Config;
use rtprelay::{Relay, RelayConfig};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

// ============================================================================
// Tracing Initialization
// ============================================================================

/// Initialize tracing for the rtprelay crate based on verbosity level
fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => return, // No tracing
        1 => "info",
        2 => "debug",
        _ => "trace", // 3 or more
    };

    let filter = format!("rtprelay={}", level);
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

// ============================================================================
// CLI Argument Parsing
// ============================================================================

#[derive(Parser)]
#[command(author, version, about = "Single-client RTP relay", long_about = None)]
struct Args {
    /// Address to bind the relay to (overrides the config file)
    #[arg(short, long)]
    bind: Option<String>,

    /// Transport type: tcp or udp (overrides the config file)
    #[arg(short, long)]
    transport: Option<String>,

    /// Increase logging verbosity (-v: info, -vv: debug, -vvv: trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Configuration file path (TOML format)
    #[arg(long)]
    config: Option<String>,
}

fn load_config(args: &Args) -> Result<RelayConfig, rtprelay::Error> {
    let mut builder = Config::builder();
    if let Some(path) = &args.config {
        builder = builder.add_source(config::File::with_name(path));
    }
    if let Some(bind) = &args.bind {
        builder = builder.set_override("listen_addr", bind.as_str())?;
    }
    if let Some(transport) = &args.transport {
        builder = builder.set_override("transport_type", transport.as_str())?;
    }
    RelayConfig::from_config(&builder.build()?)
}

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose);

    let relay_config = match load_config(&args) {
        Ok(c) => c,
        Err(err) => {
            eprintln!("Invalid configuration: {}", err);
            return ExitCode::FAILURE;
        }
    };

    let mut relay = match Relay::new(relay_config) {
        Ok(r) => r,
        Err(err) => {
            eprintln!("Failed to start relay: {}", err);
            return ExitCode::FAILURE;
        }
    };
    println!(
        "Relay ({}) listening on {}",
        relay.config().transport,
        relay.local_addr()
    );

    let result = relay.run(|packet| {
        println!(
            "ssrc={:08x} seq={} ts={} pt={} marker={} len={}",
            packet.ssrc,
            packet.sequence_number,
            packet.timestamp,
            packet.payload_type,
            packet.marker,
            packet.payload.len()
        );
    });

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Relay failed: {}", err);
            ExitCode::FAILURE
        }
    }
}
