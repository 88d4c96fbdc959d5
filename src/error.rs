use std::net::SocketAddr;
use thiserror::Error;

/// The error type for rtprelay operations.
///
/// Errors returned from the relay loop are fatal: the relay does not restart
/// itself. Peer-level failures (a send or receive error on the active
/// connection) never surface here; they are handled by the
/// [`ErrorHooks`](crate::ErrorHooks) and observed as a disconnect.
#[derive(Error, Debug)]
pub enum Error {
    // ============================================================================
    // I/O and Networking Errors
    // ============================================================================

    /// Low-level I/O error from the operating system.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The provided socket address could not be parsed or resolved.
    #[error("Invalid socket address '{0}'")]
    InvalidAddress(String),

    /// Binding the listening (or datagram) socket failed at startup.
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    /// Accepting a pending connection failed.
    #[error("Failed to accept incoming connection: {0}")]
    Accept(#[source] std::io::Error),

    /// An accepted connection could not be prepared for streaming, usually
    /// because the peer reset it before it was taken off the accept queue.
    /// The relay drops the connection and keeps listening.
    #[error("Failed to set up accepted connection: {0}")]
    PeerSetup(#[source] std::io::Error),

    /// The readiness multiplexer failed at the system level.
    #[error("Poll error: {0}")]
    Poll(String),

    /// A socket handle in the set could not be polled.
    #[error("Invalid socket handle {handle}")]
    InvalidHandle {
        /// The offending handle.
        handle: i32,
    },

    /// Polling requires at least one socket handle.
    #[error("Socket set is empty")]
    EmptySocketSet,

    // ============================================================================
    // Protocol Errors
    // ============================================================================

    /// Received bytes do not form a valid RTP packet.
    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    /// A length-prefixed frame exceeds the configured maximum packet size.
    #[error("Frame of {len} bytes exceeds maximum packet size {max}")]
    FrameTooLarge { len: usize, max: usize },

    // ============================================================================
    // Session Errors
    // ============================================================================

    /// Maintenance was invoked explicitly while the session runs its own
    /// background maintenance task.
    #[error("Session maintenance is internally driven; explicit poll is not allowed")]
    InternalDriveActive,

    /// The background maintenance task stopped with an error.
    #[error("Background maintenance failed: {0}")]
    MaintenanceFailed(Box<Error>),

    /// The session was destroyed and can no longer be used.
    #[error("Session has been destroyed")]
    SessionDestroyed,

    /// The destination kind does not match the transmitter kind.
    #[error("Destination kind {got} does not match {expected} transmitter")]
    TransportMismatch {
        expected: &'static str,
        got: &'static str,
    },

    /// The destination is already part of the active set.
    #[error("Destination {0} already added")]
    DuplicateDestination(String),

    /// Attempted to remove a destination that is not in the active set.
    #[error("Destination {0} not found")]
    DestinationNotFound(String),

    // ============================================================================
    // Configuration Errors
    // ============================================================================

    /// Configuration file parsing or key lookup failed.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Invalid value for `transport_type` configuration key.
    #[error("Invalid transport type '{got}', expected one of: {}", .valid.join(", "))]
    InvalidTransportType { got: String, valid: Vec<String> },

    /// Invalid value for `drive_mode` configuration key.
    #[error("Invalid drive mode '{got}', expected one of: {}", .valid.join(", "))]
    InvalidDriveMode { got: String, valid: Vec<String> },

    /// A configuration value is out of range.
    #[error("Invalid value for '{key}': {reason}")]
    InvalidConfigValue { key: String, reason: String },
}
