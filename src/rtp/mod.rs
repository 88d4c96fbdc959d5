//! Minimal RTP session engine.
//!
//! Covers what the relay needs from a session: fixed-header validation,
//! stream framing, per-source receive queues, a destination set and a sender
//! path. RTCP packets are recognised on receive and dropped.

pub mod framing;
mod packet;
mod session;
mod sources;

pub use packet::{HeaderExtension, RtpPacket, RTP_HEADER_SIZE, RTP_VERSION};
pub use session::{DriveMode, RtpSession, SessionParams};
pub use sources::{DataAccess, PendingPacket, SourceTable, Ssrc};
