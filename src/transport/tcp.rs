//! TCP transmitter.
//!
//! Each destination is a connected, non-blocking stream carrying RTP packets
//! behind a 2-byte big-endian length prefix. Reads are bounded per poll so a
//! busy peer cannot monopolise the caller; level-triggered readiness brings
//! the caller back for the rest.

use super::*;
use crate::error::Error;
use crate::rtp::framing::{encode_frame, FrameDecoder};

use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::fd::AsRawFd;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, trace, warn};

// Matches the receive buffer size the relay has always used for stream sockets.
const MAX_READ_SIZE: usize = 65535;
const MAX_READS_PER_POLL: usize = 64;

/// Default bound on the bytes queued for a destination that is not reading.
pub const DEFAULT_MAX_SEND_BACKLOG: usize = 4 * MAX_READ_SIZE;

// Internal data type for a single stream destination
#[derive(Debug)]
struct TcpDestination {
    handle: SocketHandle,
    stream: TcpStream,
    peer_addr: Option<SocketAddr>,
    decoder: FrameDecoder,
    send_buf: Vec<u8>,
}

// Internal data type for read_available
enum ReadResult {
    Ok,
    Disconnected,
}

// Internal data type for flush
enum WriteResult {
    Ok,
    Failed,
}

/// The active destination set of a [`TcpTransmitter`].
///
/// Handed to [`ErrorHooks`] so a hook can drop the destination that failed.
#[derive(Debug, Default)]
pub struct TcpDestinations {
    entries: Vec<TcpDestination>,
}

impl TcpDestinations {
    /// Removes the destination for `handle`, closing the transmitter's copy of
    /// the stream. Returns false if it was not present.
    pub fn remove(&mut self, handle: SocketHandle) -> bool {
        match self.entries.iter().position(|d| d.handle == handle) {
            Some(index) => {
                let dest = self.entries.remove(index);
                info!(handle, peer_addr = ?dest.peer_addr, "Removed destination");
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, handle: SocketHandle) -> bool {
        self.entries.iter().any(|d| d.handle == handle)
    }

    pub fn handles(&self) -> Vec<SocketHandle> {
        self.entries.iter().map(|d| d.handle).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Non-blocking stream transmitter with injectable [`ErrorHooks`].
pub struct TcpTransmitter {
    destinations: TcpDestinations,
    hooks: Arc<dyn ErrorHooks>,
    max_packet_size: usize,
    max_send_backlog: usize,
    read_buf: Vec<u8>,
}

impl std::fmt::Debug for TcpTransmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransmitter")
            .field("destinations", &self.destinations)
            .field("max_packet_size", &self.max_packet_size)
            .field("max_send_backlog", &self.max_send_backlog)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Constructors
// ============================================================================

impl TcpTransmitter {
    /// Creates a transmitter that removes failed destinations.
    pub fn new(max_packet_size: usize) -> Self {
        Self::with_hooks(max_packet_size, Arc::new(RemoveDestinationHooks))
    }

    /// Creates a transmitter that reports destination failures to `hooks`.
    pub fn with_hooks(max_packet_size: usize, hooks: Arc<dyn ErrorHooks>) -> Self {
        Self {
            destinations: TcpDestinations::default(),
            hooks,
            max_packet_size,
            max_send_backlog: DEFAULT_MAX_SEND_BACKLOG,
            read_buf: vec![0; MAX_READ_SIZE],
        }
    }

    /// Limits how many unsent bytes may queue per destination. Frames that
    /// would exceed it are dropped for that destination.
    pub fn with_send_backlog(mut self, max_send_backlog: usize) -> Self {
        self.max_send_backlog = max_send_backlog;
        self
    }

    /// The largest number of unsent bytes queued for any destination.
    pub fn backlog(&self) -> usize {
        self.destinations
            .entries
            .iter()
            .map(|d| d.send_buf.len())
            .max()
            .unwrap_or(0)
    }
}

// ============================================================================
// Internal Connection I/O
// ============================================================================

impl TcpDestination {
    fn read_available(&mut self, read_buf: &mut [u8]) -> ReadResult {
        let handle = self.handle;
        let peer_addr = &self.peer_addr;

        for _ in 0..MAX_READS_PER_POLL {
            match self.stream.read(read_buf) {
                Ok(0) => {
                    info!(handle, ?peer_addr, "Connection closed by peer");
                    return ReadResult::Disconnected;
                }
                Ok(sz) => {
                    trace!(handle, len = sz, "Read data from socket");
                    self.decoder.extend(&read_buf[..sz]);
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    if err.kind() == ErrorKind::ConnectionReset {
                        warn!(handle, ?peer_addr, "Connection reset");
                    } else {
                        error!(handle, ?peer_addr, ?err, "Error reading from socket");
                    }
                    return ReadResult::Disconnected;
                }
            }
        }
        ReadResult::Ok
    }

    fn flush(&mut self) -> WriteResult {
        let handle = self.handle;
        let peer_addr = &self.peer_addr;
        let mut send_pos = 0;

        while send_pos < self.send_buf.len() {
            match self.stream.write(&self.send_buf[send_pos..]) {
                Ok(0) => {
                    warn!(handle, remaining = self.send_buf.len() - send_pos, "Write to socket returned 0");
                    break;
                }
                Ok(sz) => {
                    send_pos += sz;
                    trace!(handle, len = sz, remaining = self.send_buf.len() - send_pos, "Wrote to socket");
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    if err.kind() == ErrorKind::BrokenPipe {
                        warn!(handle, ?peer_addr, "Broken pipe");
                    } else if err.kind() == ErrorKind::ConnectionReset {
                        warn!(handle, ?peer_addr, "Connection reset");
                    } else {
                        error!(handle, ?peer_addr, ?err, "Error writing to socket");
                    }
                    return WriteResult::Failed;
                }
            }
        }

        self.send_buf.drain(..send_pos);
        WriteResult::Ok
    }
}

fn drain_frames(decoder: &mut FrameDecoder, packets: &mut Vec<Vec<u8>>) -> Result<(), Error> {
    while let Some(frame) = decoder.next_frame()? {
        packets.push(frame);
    }
    Ok(())
}

// ============================================================================
// Transmitter Trait Implementation
// ============================================================================

impl Transmitter for TcpTransmitter {
    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }

    #[instrument(skip(self, packets))]
    fn poll(&mut self, packets: &mut Vec<Vec<u8>>) -> Result<(), Error> {
        let mut send_failures = Vec::new();
        let mut receive_failures = Vec::new();
        let mut decode_error = None;
        let read_buf = &mut self.read_buf;

        for dest in self.destinations.entries.iter_mut() {
            if !dest.send_buf.is_empty() {
                if let WriteResult::Failed = dest.flush() {
                    send_failures.push(dest.handle);
                    continue;
                }
            }

            let result = dest.read_available(read_buf);

            if let ReadResult::Disconnected = result {
                receive_failures.push(dest.handle);
            }

            // Frames that arrived before an EOF are still delivered.
            if let Err(err) = drain_frames(&mut dest.decoder, packets) {
                decode_error = Some(err);
                break;
            }
        }

        // Failures seen before a decode error still reach the hooks.
        for handle in send_failures {
            self.hooks.on_send_error(handle, &mut self.destinations);
        }
        for handle in receive_failures {
            self.hooks.on_receive_error(handle, &mut self.destinations);
        }
        if let Some(err) = decode_error {
            return Err(err);
        }

        if !packets.is_empty() {
            debug!(count = packets.len(), "Received packets");
        }
        Ok(())
    }

    #[instrument(skip(self, packet))]
    fn send(&mut self, packet: &[u8]) -> Result<(), Error> {
        let frame = encode_frame(packet, self.max_packet_size)?;
        let mut send_failures = Vec::new();

        for dest in self.destinations.entries.iter_mut() {
            // Make room from what the socket accepts now before queueing more.
            if !dest.send_buf.is_empty() {
                if let WriteResult::Failed = dest.flush() {
                    send_failures.push(dest.handle);
                    continue;
                }
            }
            if dest.send_buf.len() + frame.len() > self.max_send_backlog {
                warn!(
                    handle = dest.handle,
                    backlog = dest.send_buf.len(),
                    limit = self.max_send_backlog,
                    "Send backlog full, dropping packet"
                );
                continue;
            }

            dest.send_buf.extend_from_slice(&frame);
            if let WriteResult::Failed = dest.flush() {
                send_failures.push(dest.handle);
            }
        }

        for handle in send_failures {
            self.hooks.on_send_error(handle, &mut self.destinations);
        }
        Ok(())
    }

    #[instrument(skip(self))]
    fn add_destination(&mut self, endpoint: Endpoint) -> Result<Destination, Error> {
        let stream = match endpoint {
            Endpoint::Tcp(stream) => stream,
            other => return Err(mismatch(TransportKind::Tcp, other.kind())),
        };

        let handle = stream.as_raw_fd();
        if self.destinations.contains(handle) {
            return Err(Error::DuplicateDestination(Destination::Tcp(handle).to_string()));
        }

        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        let peer_addr = stream.peer_addr().ok();
        info!(handle, ?peer_addr, "Added destination");

        self.destinations.entries.push(TcpDestination {
            handle,
            stream,
            peer_addr,
            decoder: FrameDecoder::new(self.max_packet_size),
            send_buf: Vec::new(),
        });
        Ok(Destination::Tcp(handle))
    }

    #[instrument(skip(self))]
    fn remove_destination(&mut self, destination: &Destination) -> Result<(), Error> {
        let Destination::Tcp(handle) = destination else {
            return Err(mismatch(TransportKind::Tcp, destination.kind()));
        };
        if self.destinations.remove(*handle) {
            Ok(())
        } else {
            Err(Error::DestinationNotFound(destination.to_string()))
        }
    }

    fn clear_destinations(&mut self) {
        for handle in self.destinations.handles() {
            self.destinations.remove(handle);
        }
    }

    fn destinations(&self) -> Vec<Destination> {
        self.destinations
            .handles()
            .into_iter()
            .map(Destination::Tcp)
            .collect()
    }

    fn socket_handles(&self) -> Vec<SocketHandle> {
        self.destinations.handles()
    }
}
