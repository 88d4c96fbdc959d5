//! rtprelay - A single-client RTP relay core over TCP and UDP
//!
//! The relay binds a listening socket, serves exactly one peer at a time, notices when that
//! peer's connection goes away and rebuilds its session state without restarting the process.
//! Received RTP packets are drained per source (SSRC) on every readiness event.
//!
//! The building blocks are usable on their own: the level-triggered [`Selector`], the
//! [`RtpSession`] engine with its TCP and UDP [`Transmitter`]s, and the injectable
//! [`ErrorHooks`].
//!
//! Unix only: socket handles are raw file descriptors.

// Internal-only modules
pub(crate) mod config;
pub(crate) mod error;
pub(crate) mod relay;
pub(crate) mod rtp;
pub(crate) mod transport;

// These are the intended public API
pub use crate::config::{resolve_addr, RelayConfig, DEFAULT_LISTEN_ADDR, DEFAULT_MAX_PACKET_SIZE};
pub use error::Error;
pub use relay::pump;
pub use relay::{
    ActiveBinding, ConnectionState, DrainStats, Relay, RelayEvent, RelayStats, ShutdownHandle,
    INTERNAL_DRIVE_BACKOFF,
};
pub use rtp::framing;
pub use rtp::{
    DataAccess, DriveMode, HeaderExtension, PendingPacket, RtpPacket, RtpSession, SessionParams,
    SourceTable, Ssrc, RTP_HEADER_SIZE, RTP_VERSION,
};
pub use transport::health;
pub use transport::{
    Destination, Endpoint, ErrorHooks, RemoveDestinationHooks, Selector, SocketHandle, SocketSet,
    TcpDestinations, TcpTransmitter, Transmitter, TransportKind, UdpTransmitter,
    DEFAULT_MAX_SEND_BACKLOG,
};

/// Convenient re-exports of commonly used types.
pub mod prelude {
    pub use crate::config::RelayConfig;
    pub use crate::error::Error;
    pub use crate::relay::{ConnectionState, DrainStats, Relay, RelayEvent, ShutdownHandle};
    pub use crate::rtp::{DriveMode, RtpPacket, RtpSession, SessionParams};
    pub use crate::transport::{ErrorHooks, TransportKind};
}
