//! UDP transmitter: one RTP packet per datagram on a single bound socket.

use super::*;
use crate::error::Error;

use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::os::fd::AsRawFd;
use tracing::{debug, info, instrument, trace, warn};

const MAX_READS_PER_POLL: usize = 64;

/// Non-blocking datagram transmitter.
///
/// Datagram sockets have no per-peer connection, so send and receive failures
/// are logged rather than routed through [`ErrorHooks`].
#[derive(Debug)]
pub struct UdpTransmitter {
    socket: UdpSocket,
    destinations: Vec<SocketAddr>,
    max_packet_size: usize,
    recv_buf: Vec<u8>,
}

impl UdpTransmitter {
    /// Binds a datagram socket on `addr`.
    #[instrument]
    pub fn bind(addr: SocketAddr, max_packet_size: usize) -> Result<Self, Error> {
        let socket = UdpSocket::bind(addr).map_err(|source| Error::Bind { addr, source })?;
        Self::from_socket(socket, max_packet_size)
    }

    /// Wraps an already bound socket and switches it to non-blocking mode.
    pub fn from_socket(socket: UdpSocket, max_packet_size: usize) -> Result<Self, Error> {
        socket.set_nonblocking(true)?;
        let local_addr = socket.local_addr()?;
        info!(%local_addr, "Datagram socket ready");
        Ok(Self {
            socket,
            destinations: Vec::new(),
            max_packet_size,
            // One spare byte tells an oversized datagram from one that fits exactly.
            recv_buf: vec![0; max_packet_size + 1],
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.socket.local_addr()?)
    }

    pub fn handle(&self) -> SocketHandle {
        self.socket.as_raw_fd()
    }
}

impl Transmitter for UdpTransmitter {
    fn kind(&self) -> TransportKind {
        TransportKind::Udp
    }

    #[instrument(skip(self, packets))]
    fn poll(&mut self, packets: &mut Vec<Vec<u8>>) -> Result<(), Error> {
        for _ in 0..MAX_READS_PER_POLL {
            match self.socket.recv_from(&mut self.recv_buf) {
                Ok((sz, from)) if sz > self.max_packet_size => {
                    warn!(%from, max = self.max_packet_size, "Dropping oversized datagram");
                }
                Ok((sz, from)) => {
                    trace!(%from, len = sz, "Received datagram");
                    packets.push(self.recv_buf[..sz].to_vec());
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                // ICMP port unreachable from an earlier send surfaces here.
                Err(err) if err.kind() == ErrorKind::ConnectionRefused => {
                    warn!(?err, "Datagram peer unreachable");
                }
                Err(err) => return Err(err.into()),
            }
        }

        if !packets.is_empty() {
            debug!(count = packets.len(), "Received packets");
        }
        Ok(())
    }

    #[instrument(skip(self, packet))]
    fn send(&mut self, packet: &[u8]) -> Result<(), Error> {
        if packet.len() > self.max_packet_size {
            return Err(Error::FrameTooLarge {
                len: packet.len(),
                max: self.max_packet_size,
            });
        }
        for addr in &self.destinations {
            match self.socket.send_to(packet, addr) {
                Ok(_) => trace!(%addr, len = packet.len(), "Sent datagram"),
                Err(err) => warn!(%addr, ?err, "Error sending datagram"),
            }
        }
        Ok(())
    }

    fn add_destination(&mut self, endpoint: Endpoint) -> Result<Destination, Error> {
        let addr = match endpoint {
            Endpoint::Udp(addr) => addr,
            other => return Err(mismatch(TransportKind::Udp, other.kind())),
        };
        if self.destinations.contains(&addr) {
            return Err(Error::DuplicateDestination(Destination::Udp(addr).to_string()));
        }
        info!(%addr, "Added destination");
        self.destinations.push(addr);
        Ok(Destination::Udp(addr))
    }

    fn remove_destination(&mut self, destination: &Destination) -> Result<(), Error> {
        let Destination::Udp(addr) = destination else {
            return Err(mismatch(TransportKind::Udp, destination.kind()));
        };
        match self.destinations.iter().position(|d| d == addr) {
            Some(index) => {
                self.destinations.remove(index);
                info!(%addr, "Removed destination");
                Ok(())
            }
            None => Err(Error::DestinationNotFound(destination.to_string())),
        }
    }

    fn clear_destinations(&mut self) {
        self.destinations.clear();
    }

    fn destinations(&self) -> Vec<Destination> {
        self.destinations.iter().copied().map(Destination::Udp).collect()
    }

    fn socket_handles(&self) -> Vec<SocketHandle> {
        vec![self.handle()]
    }
}
