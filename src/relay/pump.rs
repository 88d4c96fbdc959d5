//! Session packet pump: one maintenance step followed by a full drain.

use super::ActiveBinding;
use crate::error::Error;
use crate::rtp::{DataAccess, DriveMode, RtpPacket};

use tracing::{debug, trace};

/// Counters for one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainStats {
    /// Sources that had queued packets.
    pub sources: usize,
    pub fetched: usize,
    pub disposed: usize,
}

/// Runs one pump tick on `binding`.
///
/// In [`DriveMode::External`] this performs the session's maintenance; in
/// [`DriveMode::Internal`] it only reports a failure of the background
/// thread. Every queued packet is then handed to `on_packet` and disposed of.
pub fn tick<F>(binding: &ActiveBinding, on_packet: F) -> Result<DrainStats, Error>
where
    F: FnMut(&RtpPacket),
{
    let session = binding.session();
    match session.drive_mode() {
        DriveMode::External => {
            session.poll()?;
        }
        DriveMode::Internal => session.check_maintenance()?,
    }

    let mut access = session.begin_data_access();
    Ok(drain(&mut access, on_packet))
}

/// Fetches every queued packet, source by source in discovery order and
/// oldest first within a source, disposing of each after `on_packet`.
pub fn drain<F>(access: &mut DataAccess<'_>, mut on_packet: F) -> DrainStats
where
    F: FnMut(&RtpPacket),
{
    let mut stats = DrainStats::default();
    let disposed_before = access.disposed();

    for ssrc in access.sources_with_data() {
        stats.sources += 1;
        while let Some(packet) = access.next_packet(ssrc) {
            stats.fetched += 1;
            trace!(
                ssrc,
                seq = packet.sequence_number,
                marker = packet.marker,
                len = packet.payload.len(),
                "Packet"
            );
            on_packet(&packet);
            packet.dispose();
        }
    }

    stats.disposed = (access.disposed() - disposed_before) as usize;
    if stats.fetched > 0 {
        debug!(sources = stats.sources, fetched = stats.fetched, "Drained packets");
    }
    stats
}
