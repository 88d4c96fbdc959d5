//! Single-client relay: connection lifecycle and packet pump.
//!
//! The relay is a two-state machine. While `Listening` it waits on the
//! listening socket and accepts one peer; while `Streaming` it probes the
//! peer's health, waits on the peer socket and drains the session on
//! readiness. A lost peer sends it back to `Listening` without restarting
//! anything else.

mod binding;
pub mod pump;

pub use binding::ActiveBinding;
pub use pump::DrainStats;

use crate::config::RelayConfig;
use crate::error::Error;
use crate::rtp::{DriveMode, RtpPacket};
use crate::transport::{
    ErrorHooks, RemoveDestinationHooks, Selector, SocketHandle, SocketSet, TransportKind,
    UdpTransmitter,
};

use mio::Waker;
use std::fmt;
use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, trace, warn};

/// Pause after an empty pump tick in [`DriveMode::Internal`], bounding how
/// often the relay wakes while the background thread catches up.
pub const INTERNAL_DRIVE_BACKOFF: Duration = Duration::from_millis(5);

/// Externally visible connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Listening,
    Streaming,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Listening => f.write_str("listening"),
            ConnectionState::Streaming => f.write_str("streaming"),
        }
    }
}

/// What one [`Relay::step`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    /// The wait elapsed or was woken with nothing to do.
    Idle,
    /// A peer was accepted and a binding created.
    Connected { peer_addr: SocketAddr },
    /// The peer went away and its binding was destroyed.
    Disconnected,
    /// A pump tick ran.
    Drained(DrainStats),
    /// Shutdown was requested through a [`ShutdownHandle`].
    ShutdownRequested,
}

/// Lifetime counters of a relay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub bindings_created: u64,
    pub bindings_destroyed: u64,
    pub packets_drained: u64,
}

/// Stops a running relay from another thread.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    /// Requests shutdown and interrupts the relay's current wait.
    pub fn shutdown(&self) {
        self.flag.store(true, Ordering::Release);
        if let Err(err) = self.waker.wake() {
            error!(?err, "Failed to wake relay");
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

// A binding exists exactly while streaming.
#[derive(Debug)]
enum Phase {
    Listening,
    Streaming(ActiveBinding),
}

// ============================================================================
// Relay
// ============================================================================

/// Accepts one peer at a time and pumps its RTP packets.
pub struct Relay {
    config: RelayConfig,
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
    hooks: Arc<dyn ErrorHooks>,
    phase: Phase,
    sockets: SocketSet,
    selector: Selector,
    shutdown: Arc<AtomicBool>,
    stats: RelayStats,
}

impl fmt::Debug for Relay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Relay")
            .field("local_addr", &self.local_addr)
            .field("transport", &self.config.transport)
            .field("phase", &self.phase)
            .field("sockets", &self.sockets)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl Relay {
    /// Binds the relay socket. Failed destinations are removed by the stock
    /// [`RemoveDestinationHooks`].
    pub fn new(config: RelayConfig) -> Result<Self, Error> {
        Self::with_hooks(config, Arc::new(RemoveDestinationHooks))
    }

    /// Binds the relay socket, reporting destination failures to `hooks`.
    ///
    /// For TCP the relay starts `Listening`. For UDP the datagram socket is
    /// the peer: the binding is created here and the relay stays `Streaming`.
    #[instrument(skip(hooks))]
    pub fn with_hooks(config: RelayConfig, hooks: Arc<dyn ErrorHooks>) -> Result<Self, Error> {
        let selector = Selector::new()?;
        let mut stats = RelayStats::default();

        let (listener, local_addr, phase, sockets) = match config.transport {
            TransportKind::Tcp => {
                let addr = config.listen_addr;
                let listener = TcpListener::bind(addr).map_err(|source| Error::Bind { addr, source })?;
                listener.set_nonblocking(true)?;
                let local_addr = listener.local_addr()?;
                let sockets = SocketSet::with_handle(listener.as_raw_fd());
                info!(%local_addr, "Listening for connections");
                (Some(listener), local_addr, Phase::Listening, sockets)
            }
            TransportKind::Udp => {
                let transmitter = UdpTransmitter::bind(config.listen_addr, config.max_packet_size)?;
                let local_addr = transmitter.local_addr()?;
                let binding = ActiveBinding::datagram(transmitter, &config.session_params())?;
                let sockets = SocketSet::with_handle(binding.handle());
                stats.bindings_created += 1;
                info!(%local_addr, "Receiving datagrams");
                (None, local_addr, Phase::Streaming(binding), sockets)
            }
        };

        Ok(Self {
            config,
            listener,
            local_addr,
            hooks,
            phase,
            sockets,
            selector,
            shutdown: Arc::new(AtomicBool::new(false)),
            stats,
        })
    }

    pub fn state(&self) -> ConnectionState {
        match self.phase {
            Phase::Listening => ConnectionState::Listening,
            Phase::Streaming(_) => ConnectionState::Streaming,
        }
    }

    /// The handles the relay currently waits on, with the flags of the last
    /// wait.
    pub fn socket_set(&self) -> &SocketSet {
        &self.sockets
    }

    /// Handle of the listening socket; `None` for UDP.
    pub fn listener_handle(&self) -> Option<SocketHandle> {
        self.listener.as_ref().map(|l| l.as_raw_fd())
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn binding(&self) -> Option<&ActiveBinding> {
        match &self.phase {
            Phase::Listening => None,
            Phase::Streaming(binding) => Some(binding),
        }
    }

    pub fn stats(&self) -> RelayStats {
        self.stats
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            flag: self.shutdown.clone(),
            waker: self.selector.waker(),
        }
    }

    /// Runs one iteration of the relay loop.
    ///
    /// Blocks for at most the accept or poll interval of the current state.
    /// Returned errors are fatal.
    pub fn step<F>(&mut self, on_packet: F) -> Result<RelayEvent, Error>
    where
        F: FnMut(&RtpPacket),
    {
        if self.shutdown.load(Ordering::Acquire) {
            return Ok(RelayEvent::ShutdownRequested);
        }

        match &self.phase {
            Phase::Listening => {
                let ready = self
                    .selector
                    .select(&mut self.sockets, self.config.accept_poll_interval)?;
                if ready == 0 || !self.sockets.is_ready(0) {
                    return Ok(RelayEvent::Idle);
                }
                match self.accept()? {
                    Some(binding) => {
                        let peer_addr = binding.peer_addr().unwrap_or(self.local_addr);
                        self.transition(Phase::Streaming(binding));
                        Ok(RelayEvent::Connected { peer_addr })
                    }
                    None => Ok(RelayEvent::Idle),
                }
            }
            Phase::Streaming(binding) => {
                if !binding.is_established() {
                    info!("Peer disconnected");
                    self.transition(Phase::Listening);
                    return Ok(RelayEvent::Disconnected);
                }

                let ready = self
                    .selector
                    .select(&mut self.sockets, self.config.poll_interval)?;
                // The background thread may have queued packets without the
                // peer socket still being readable.
                let queued = binding.session().drive_mode() == DriveMode::Internal
                    && binding.session().outstanding() > 0;
                if ready == 0 && !queued {
                    return Ok(RelayEvent::Idle);
                }

                let drained = pump::tick(binding, on_packet)?;
                self.stats.packets_drained += drained.fetched as u64;
                if drained.fetched == 0 && binding.session().drive_mode() == DriveMode::Internal {
                    // The peer socket stays readable until the background
                    // thread reads it.
                    std::thread::sleep(INTERNAL_DRIVE_BACKOFF);
                }
                Ok(RelayEvent::Drained(drained))
            }
        }
    }

    /// Steps until shutdown is requested or a fatal error occurs.
    pub fn run<F>(&mut self, mut on_packet: F) -> Result<(), Error>
    where
        F: FnMut(&RtpPacket),
    {
        info!(local_addr = %self.local_addr, transport = %self.config.transport, "Relay running");
        loop {
            match self.step(&mut on_packet) {
                Ok(RelayEvent::ShutdownRequested) => {
                    info!("Relay shutting down");
                    return Ok(());
                }
                Ok(RelayEvent::Idle) => trace!("Relay idle"),
                Ok(event) => debug!(?event, "Relay event"),
                Err(err) => {
                    error!(?err, "Relay stopped");
                    return Err(err);
                }
            }
        }
    }

    fn accept(&self) -> Result<Option<ActiveBinding>, Error> {
        let Some(listener) = &self.listener else {
            return Ok(None);
        };

        match listener.accept() {
            Ok((stream, peer_addr)) => {
                info!(%peer_addr, "Accepted connection");
                let params = self.config.session_params();
                match ActiveBinding::accept(stream, peer_addr, &params, self.hooks.clone()) {
                    Ok(binding) => Ok(Some(binding)),
                    Err(Error::PeerSetup(err)) => {
                        warn!(%peer_addr, ?err, "Dropping connection that failed setup");
                        Ok(None)
                    }
                    Err(err) => Err(err),
                }
            }
            // Readiness without a pending connection, e.g. the client gave up.
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
                debug!(?err, "No connection to accept");
                Ok(None)
            }
            Err(err) => {
                error!(?err, "Failed to accept connection");
                Err(Error::Accept(err))
            }
        }
    }

    // The only place the phase changes. Leaving `Streaming` destroys the
    // binding; the socket set always follows the new phase.
    fn transition(&mut self, next: Phase) {
        let previous = std::mem::replace(&mut self.phase, next);
        if let Phase::Streaming(binding) = previous {
            binding.destroy();
            self.stats.bindings_destroyed += 1;
        }

        let handle = match &self.phase {
            Phase::Listening => self.listener_handle(),
            Phase::Streaming(binding) => {
                self.stats.bindings_created += 1;
                Some(binding.handle())
            }
        };
        match handle {
            Some(handle) => {
                if self.sockets.replace(0, handle).is_none() {
                    self.sockets.push(handle);
                }
            }
            None => self.sockets.clear(),
        }

        info!(state = %self.state(), sockets = ?self.sockets.handles(), "Connection state changed");
    }
}
