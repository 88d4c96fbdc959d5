//! The per-connection state of a streaming relay.

use crate::error::Error;
use crate::rtp::{RtpSession, SessionParams};
use crate::transport::health;
use crate::transport::{Destination, Endpoint, ErrorHooks, SocketHandle, TcpTransmitter, UdpTransmitter};

use std::net::{SocketAddr, TcpStream};
use std::os::fd::AsRawFd;
use std::sync::Arc;
use tracing::{debug, info, instrument};

#[derive(Debug)]
enum Peer {
    Tcp { stream: TcpStream, peer_addr: SocketAddr },
    Datagram { handle: SocketHandle },
}

/// One accepted peer together with the session built for it.
///
/// Created whole on accept and destroyed whole on disconnect. The relay
/// watches the peer socket for readiness and probes it for health while the
/// session's transmitter owns its own handle to the same connection.
#[derive(Debug)]
pub struct ActiveBinding {
    peer: Peer,
    session: Arc<RtpSession>,
    destination: Option<Destination>,
}

impl ActiveBinding {
    /// Builds a session for a freshly accepted stream and registers the peer
    /// as its only destination.
    ///
    /// Socket failures on `stream` itself are reported as
    /// [`Error::PeerSetup`]; the peer is gone, not the relay.
    #[instrument(skip(stream, params, hooks))]
    pub fn accept(
        stream: TcpStream,
        peer_addr: SocketAddr,
        params: &SessionParams,
        hooks: Arc<dyn ErrorHooks>,
    ) -> Result<Self, Error> {
        stream.set_nonblocking(true).map_err(Error::PeerSetup)?;
        let transmit_stream = stream.try_clone().map_err(Error::PeerSetup)?;

        let transmitter = TcpTransmitter::with_hooks(params.max_packet_size, hooks)
            .with_send_backlog(params.max_send_backlog);
        let session = Arc::new(RtpSession::create(params.clone(), Box::new(transmitter))?);
        let destination = session
            .add_destination(Endpoint::Tcp(transmit_stream))
            .map_err(|err| match err {
                Error::Io(err) => Error::PeerSetup(err),
                other => other,
            })?;

        info!(%peer_addr, handle = stream.as_raw_fd(), ssrc = session.ssrc(), "Binding created");
        Ok(Self {
            peer: Peer::Tcp { stream, peer_addr },
            session,
            destination: Some(destination),
        })
    }

    /// Builds a session on a bound datagram socket. Datagram peers are not
    /// known up front, so the session starts without destinations.
    pub fn datagram(transmitter: UdpTransmitter, params: &SessionParams) -> Result<Self, Error> {
        let handle = transmitter.handle();
        let session = Arc::new(RtpSession::create(params.clone(), Box::new(transmitter))?);

        info!(handle, ssrc = session.ssrc(), "Datagram binding created");
        Ok(Self {
            peer: Peer::Datagram { handle },
            session,
            destination: None,
        })
    }

    /// The handle the relay waits on.
    pub fn handle(&self) -> SocketHandle {
        match &self.peer {
            Peer::Tcp { stream, .. } => stream.as_raw_fd(),
            Peer::Datagram { handle } => *handle,
        }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        match &self.peer {
            Peer::Tcp { peer_addr, .. } => Some(*peer_addr),
            Peer::Datagram { .. } => None,
        }
    }

    /// Whether the peer is still connected. Always true for datagrams.
    pub fn is_established(&self) -> bool {
        match &self.peer {
            Peer::Tcp { stream, .. } => health::is_established(stream),
            Peer::Datagram { .. } => true,
        }
    }

    pub fn session(&self) -> &Arc<RtpSession> {
        &self.session
    }

    /// The destination registered for the peer, if any.
    pub fn destination(&self) -> Option<Destination> {
        self.destination
    }

    /// Tears the binding down: the destination is removed, the session is
    /// destroyed and the peer socket closed.
    #[instrument(skip(self))]
    pub fn destroy(self) {
        if let Some(destination) = &self.destination {
            // The error hooks may have removed it already.
            if self.session.destinations().contains(destination) {
                if let Err(err) = self.session.remove_destination(destination) {
                    debug!(?err, "Failed to remove destination");
                }
            }
        }
        self.session.destroy();
        info!(handle = self.handle(), peer_addr = ?self.peer_addr(), "Binding destroyed");
    }
}
