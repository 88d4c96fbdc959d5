//! Transport layer underneath the RTP session.
//!
//! A [`Transmitter`] moves raw packets over one kind of socket (TCP or UDP)
//! and owns the session's destination set. Failures on an individual TCP
//! destination are reported through [`ErrorHooks`] instead of being returned
//! as errors.

pub mod health;
pub mod select;
mod tcp;
mod udp;

pub use select::{Selector, SocketHandle, SocketSet};
pub use tcp::{TcpDestinations, TcpTransmitter, DEFAULT_MAX_SEND_BACKLOG};
pub use udp::UdpTransmitter;

use crate::error::Error;
use std::fmt;
use std::net::{SocketAddr, TcpStream};
use std::str::FromStr;
use tracing::warn;

// ============================================================================
// Transport Kind
// ============================================================================

/// Which socket type the relay runs over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Stream transport, one length-prefixed packet per frame.
    Tcp,
    /// Datagram transport, one packet per datagram.
    Udp,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Tcp => "tcp",
            TransportKind::Udp => "udp",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(TransportKind::Tcp),
            "udp" => Ok(TransportKind::Udp),
            _ => Err(Error::InvalidTransportType {
                got: s.to_string(),
                valid: vec!["tcp".to_string(), "udp".to_string()],
            }),
        }
    }
}

// ============================================================================
// Destinations
// ============================================================================

/// Identity of a destination in a session's active set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Destination {
    /// A connected stream, identified by its socket handle.
    Tcp(SocketHandle),
    /// A datagram peer address.
    Udp(SocketAddr),
}

impl Destination {
    fn kind(&self) -> TransportKind {
        match self {
            Destination::Tcp(_) => TransportKind::Tcp,
            Destination::Udp(_) => TransportKind::Udp,
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Tcp(handle) => write!(f, "tcp socket {handle}"),
            Destination::Udp(addr) => write!(f, "udp {addr}"),
        }
    }
}

/// What a caller hands to [`Transmitter::add_destination`].
#[derive(Debug)]
pub enum Endpoint {
    /// A connected stream. The transmitter takes ownership and switches it to
    /// non-blocking mode.
    Tcp(TcpStream),
    /// A datagram peer address.
    Udp(SocketAddr),
}

impl Endpoint {
    fn kind(&self) -> TransportKind {
        match self {
            Endpoint::Tcp(_) => TransportKind::Tcp,
            Endpoint::Udp(_) => TransportKind::Udp,
        }
    }
}

// ============================================================================
// Transmitter Trait
// ============================================================================

/// Raw packet transport used by [`RtpSession`](crate::RtpSession).
///
/// Implementations never block: `poll` reads whatever is available right now
/// and `send` queues what the socket does not accept immediately.
pub trait Transmitter: Send {
    fn kind(&self) -> TransportKind;

    /// Reads all currently available data and appends each complete raw
    /// packet to `packets`.
    ///
    /// Destination-level failures go to the error hooks. Only fatal problems
    /// (malformed framing, socket-level errors on a datagram socket) are
    /// returned.
    fn poll(&mut self, packets: &mut Vec<Vec<u8>>) -> Result<(), Error>;

    /// Sends one raw packet to every destination.
    fn send(&mut self, packet: &[u8]) -> Result<(), Error>;

    fn add_destination(&mut self, endpoint: Endpoint) -> Result<Destination, Error>;
    fn remove_destination(&mut self, destination: &Destination) -> Result<(), Error>;
    fn clear_destinations(&mut self);
    fn destinations(&self) -> Vec<Destination>;

    /// Handles that become readable when `poll` has work to do.
    fn socket_handles(&self) -> Vec<SocketHandle>;
}

pub(crate) fn mismatch(expected: TransportKind, got: TransportKind) -> Error {
    Error::TransportMismatch {
        expected: expected.as_str(),
        got: got.as_str(),
    }
}

// ============================================================================
// Error Hooks
// ============================================================================

/// Callbacks the TCP transmitter invokes when I/O on a destination fails.
///
/// Both default bodies remove the failed destination from the active set.
/// Hooks do not change the relay's connection state; the relay notices the
/// loss through its next health probe.
pub trait ErrorHooks: Send + Sync {
    /// Writing to `handle` failed.
    fn on_send_error(&self, handle: SocketHandle, destinations: &mut TcpDestinations) {
        warn!(handle, "Error sending over socket, removing destination");
        destinations.remove(handle);
    }

    /// Reading from `handle` failed or the peer closed its side.
    fn on_receive_error(&self, handle: SocketHandle, destinations: &mut TcpDestinations) {
        warn!(handle, "Error receiving from socket, removing destination");
        destinations.remove(handle);
    }
}

/// Stock hooks: remove the failed destination and log it.
#[derive(Debug, Clone, Copy, Default)]
pub struct RemoveDestinationHooks;

impl ErrorHooks for RemoveDestinationHooks {}
