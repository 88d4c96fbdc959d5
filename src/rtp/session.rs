//! RTP session: a transmitter, its received packets and the sender state.

use super::packet::RtpPacket;
use super::sources::{DataAccess, SourceTable, Ssrc};
use crate::config::DEFAULT_MAX_PACKET_SIZE;
use crate::error::Error;
use crate::transport::{
    Destination, Endpoint, Selector, SocketSet, Transmitter, DEFAULT_MAX_SEND_BACKLOG,
};

use mio::Waker;
use parking_lot::Mutex;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, instrument, trace, warn};

const DEFAULT_PAYLOAD_TYPE: u8 = 96;
const DEFAULT_TIMESTAMP_INCREMENT: u32 = 160;
const DEFAULT_MAINTENANCE_INTERVAL: Duration = Duration::from_millis(100);

// ============================================================================
// Parameters
// ============================================================================

/// Who runs session maintenance (reading the transport and queueing packets).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DriveMode {
    /// The owner calls [`RtpSession::poll`] once per tick.
    #[default]
    External,
    /// A background thread runs maintenance; [`RtpSession::poll`] is refused.
    Internal,
}

impl DriveMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriveMode::External => "external",
            DriveMode::Internal => "internal",
        }
    }
}

impl fmt::Display for DriveMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DriveMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "external" => Ok(DriveMode::External),
            "internal" => Ok(DriveMode::Internal),
            _ => Err(Error::InvalidDriveMode {
                got: s.to_string(),
                valid: vec!["external".to_string(), "internal".to_string()],
            }),
        }
    }
}

/// Settings applied when a session is created.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionParams {
    pub max_packet_size: usize,
    /// Unsent bytes a stream destination may queue before packets are dropped.
    pub max_send_backlog: usize,
    /// Queue received packets that carry the session's own SSRC.
    pub accept_own_packets: bool,
    /// Fixed SSRC for sent packets; random when `None`.
    pub ssrc: Option<Ssrc>,
    pub default_payload_type: u8,
    pub default_marker: bool,
    pub default_timestamp_increment: u32,
    pub drive_mode: DriveMode,
    /// Upper bound on one wait of the background maintenance thread.
    pub maintenance_interval: Duration,
}

impl Default for SessionParams {
    fn default() -> Self {
        Self {
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            max_send_backlog: DEFAULT_MAX_SEND_BACKLOG,
            accept_own_packets: false,
            ssrc: None,
            default_payload_type: DEFAULT_PAYLOAD_TYPE,
            default_marker: false,
            default_timestamp_increment: DEFAULT_TIMESTAMP_INCREMENT,
            drive_mode: DriveMode::External,
            maintenance_interval: DEFAULT_MAINTENANCE_INTERVAL,
        }
    }
}

// ============================================================================
// Shared State
// ============================================================================

// The transmitter and the source table have separate locks. Maintenance
// releases the transmitter before it touches the sources.
struct Shared {
    transmitter: Mutex<Box<dyn Transmitter>>,
    sources: Mutex<SourceTable>,
    maintenance_error: Mutex<Option<Error>>,
    destroyed: AtomicBool,
}

impl Shared {
    fn maintain(&self) -> Result<usize, Error> {
        let mut raw = Vec::new();
        self.transmitter.lock().poll(&mut raw)?;
        if raw.is_empty() {
            return Ok(0);
        }

        let mut packets = Vec::with_capacity(raw.len());
        for bytes in &raw {
            match RtpPacket::parse(bytes)? {
                Some(packet) => packets.push(packet),
                None => trace!(len = bytes.len(), "Ignoring RTCP packet"),
            }
        }

        let mut sources = self.sources.lock();
        let queued = packets
            .into_iter()
            .map(|packet| sources.insert(packet))
            .filter(|&inserted| inserted)
            .count();
        trace!(queued, "Queued received packets");
        Ok(queued)
    }

    fn check_alive(&self) -> Result<(), Error> {
        if self.destroyed.load(Ordering::Acquire) {
            Err(Error::SessionDestroyed)
        } else {
            Ok(())
        }
    }
}

struct SenderState {
    ssrc: Ssrc,
    sequence_number: u16,
    timestamp: u32,
}

// Handle to the background maintenance thread
struct Maintenance {
    stop: Arc<AtomicBool>,
    waker: Arc<Waker>,
    thread: JoinHandle<()>,
}

impl Maintenance {
    fn spawn(shared: Arc<Shared>, interval: Duration) -> Result<Self, Error> {
        let selector = Selector::new()?;
        let waker = selector.waker();
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();

        let thread = std::thread::Builder::new()
            .name("rtp-maintenance".to_string())
            .spawn(move || run_maintenance(shared, thread_stop, selector, interval))?;

        Ok(Self { stop, waker, thread })
    }

    fn wake(&self) {
        if let Err(err) = self.waker.wake() {
            warn!(?err, "Failed to wake maintenance thread");
        }
        self.thread.thread().unpark();
    }

    fn stop(self) {
        self.stop.store(true, Ordering::Release);
        self.wake();
        if self.thread.join().is_err() {
            error!("Maintenance thread panicked");
        }
    }
}

fn run_maintenance(shared: Arc<Shared>, stop: Arc<AtomicBool>, mut selector: Selector, interval: Duration) {
    debug!("Maintenance thread started");
    let mut sockets = SocketSet::new();

    while !stop.load(Ordering::Acquire) {
        let handles = shared.transmitter.lock().socket_handles();
        if handles.is_empty() {
            std::thread::park_timeout(interval);
            continue;
        }

        sockets.clear();
        handles.into_iter().for_each(|handle| sockets.push(handle));

        match selector.select(&mut sockets, interval) {
            Ok(0) => continue,
            Ok(_) => {}
            // A destination was removed while its handle was being registered.
            Err(Error::InvalidHandle { handle }) => {
                debug!(handle, "Destination went away, refreshing handles");
                continue;
            }
            Err(err) => {
                error!(?err, "Maintenance wait failed");
                *shared.maintenance_error.lock() = Some(err);
                break;
            }
        }

        if stop.load(Ordering::Acquire) {
            break;
        }
        if let Err(err) = shared.maintain() {
            error!(?err, "Maintenance failed");
            *shared.maintenance_error.lock() = Some(err);
            break;
        }
    }
    debug!("Maintenance thread stopped");
}

// ============================================================================
// RtpSession
// ============================================================================

/// An RTP session over one [`Transmitter`].
///
/// The session is `Send + Sync`: one thread can drain received packets while
/// another sends. After [`destroy`](Self::destroy) every operation fails with
/// [`Error::SessionDestroyed`].
pub struct RtpSession {
    shared: Arc<Shared>,
    sender: Mutex<SenderState>,
    params: SessionParams,
    maintenance: Mutex<Option<Maintenance>>,
}

impl fmt::Debug for RtpSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtpSession")
            .field("ssrc", &self.sender.lock().ssrc)
            .field("drive_mode", &self.params.drive_mode)
            .field("destroyed", &self.shared.destroyed.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl RtpSession {
    /// Creates a session over `transmitter`.
    ///
    /// In [`DriveMode::Internal`] this starts the background maintenance
    /// thread.
    pub fn create(params: SessionParams, transmitter: Box<dyn Transmitter>) -> Result<Self, Error> {
        let ssrc = params.ssrc.unwrap_or_else(rand::random);
        let sender = SenderState {
            ssrc,
            sequence_number: rand::random(),
            timestamp: rand::random(),
        };

        let shared = Arc::new(Shared {
            transmitter: Mutex::new(transmitter),
            sources: Mutex::new(SourceTable::new(ssrc, params.accept_own_packets)),
            maintenance_error: Mutex::new(None),
            destroyed: AtomicBool::new(false),
        });

        let maintenance = match params.drive_mode {
            DriveMode::External => None,
            DriveMode::Internal => Some(Maintenance::spawn(shared.clone(), params.maintenance_interval)?),
        };

        info!(ssrc, drive_mode = %params.drive_mode, "Session created");
        Ok(Self {
            shared,
            sender: Mutex::new(sender),
            params,
            maintenance: Mutex::new(maintenance),
        })
    }

    pub fn ssrc(&self) -> Ssrc {
        self.sender.lock().ssrc
    }

    pub fn drive_mode(&self) -> DriveMode {
        self.params.drive_mode
    }

    pub fn params(&self) -> &SessionParams {
        &self.params
    }

    /// Runs one round of maintenance: reads everything the transport has
    /// and queues the RTP packets per source. Returns the number queued.
    pub fn poll(&self) -> Result<usize, Error> {
        self.shared.check_alive()?;
        if self.params.drive_mode == DriveMode::Internal {
            return Err(Error::InternalDriveActive);
        }
        self.shared.maintain()
    }

    /// Reports a failure of the background maintenance thread.
    ///
    /// The failure is returned once; the thread has stopped by then. Always
    /// `Ok` in [`DriveMode::External`].
    pub fn check_maintenance(&self) -> Result<(), Error> {
        self.shared.check_alive()?;
        match self.shared.maintenance_error.lock().take() {
            Some(err) => Err(Error::MaintenanceFailed(Box::new(err))),
            None => Ok(()),
        }
    }

    /// Locks the received packets for draining.
    pub fn begin_data_access(&self) -> DataAccess<'_> {
        DataAccess::new(self.shared.sources.lock())
    }

    /// Packets queued and not yet fetched.
    pub fn outstanding(&self) -> usize {
        self.shared.sources.lock().outstanding()
    }

    #[instrument(skip(self))]
    pub fn add_destination(&self, endpoint: Endpoint) -> Result<Destination, Error> {
        self.shared.check_alive()?;
        let destination = self.shared.transmitter.lock().add_destination(endpoint)?;
        if let Some(maintenance) = self.maintenance.lock().as_ref() {
            maintenance.wake();
        }
        Ok(destination)
    }

    #[instrument(skip(self))]
    pub fn remove_destination(&self, destination: &Destination) -> Result<(), Error> {
        self.shared.check_alive()?;
        self.shared.transmitter.lock().remove_destination(destination)
    }

    pub fn destinations(&self) -> Vec<Destination> {
        self.shared.transmitter.lock().destinations()
    }

    /// Sends `payload` to every destination as the next packet of this
    /// session's stream.
    pub fn send_packet(
        &self,
        payload: &[u8],
        payload_type: u8,
        marker: bool,
        timestamp_increment: u32,
    ) -> Result<(), Error> {
        self.shared.check_alive()?;
        let bytes = {
            let mut sender = self.sender.lock();
            let packet = RtpPacket::new(
                sender.ssrc,
                sender.sequence_number,
                sender.timestamp,
                payload_type,
                marker,
                payload.to_vec(),
            );
            sender.sequence_number = sender.sequence_number.wrapping_add(1);
            sender.timestamp = sender.timestamp.wrapping_add(timestamp_increment);
            packet.to_bytes()
        };
        self.shared.transmitter.lock().send(&bytes)
    }

    /// [`send_packet`](Self::send_packet) with the session's default payload
    /// type, marker and timestamp increment.
    pub fn send_default(&self, payload: &[u8]) -> Result<(), Error> {
        self.send_packet(
            payload,
            self.params.default_payload_type,
            self.params.default_marker,
            self.params.default_timestamp_increment,
        )
    }

    /// Stops maintenance, drops every destination and discards queued
    /// packets. Idempotent.
    #[instrument(skip(self))]
    pub fn destroy(&self) {
        if self.shared.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(maintenance) = self.maintenance.lock().take() {
            maintenance.stop();
        }
        self.shared.transmitter.lock().clear_destinations();
        self.shared.sources.lock().clear();
        info!(ssrc = self.ssrc(), "Session destroyed");
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared.destroyed.load(Ordering::Acquire)
    }
}

impl Drop for RtpSession {
    fn drop(&mut self) {
        self.destroy();
    }
}
