//! Per-source receive queues.

use super::packet::RtpPacket;

use parking_lot::MutexGuard;
use std::collections::VecDeque;
use std::ops::Deref;
use tracing::trace;

/// Synchronization source identifier.
pub type Ssrc = u32;

#[derive(Debug)]
struct Source {
    ssrc: Ssrc,
    queue: VecDeque<RtpPacket>,
    received: u64,
}

/// Received packets grouped by SSRC.
///
/// Sources are kept in the order they were first seen and each keeps its
/// packets in arrival order.
#[derive(Debug)]
pub struct SourceTable {
    own_ssrc: Ssrc,
    accept_own_packets: bool,
    sources: Vec<Source>,
    fetched: u64,
    disposed: u64,
}

impl SourceTable {
    pub fn new(own_ssrc: Ssrc, accept_own_packets: bool) -> Self {
        Self {
            own_ssrc,
            accept_own_packets,
            sources: Vec::new(),
            fetched: 0,
            disposed: 0,
        }
    }

    /// Queues `packet` under its SSRC. Returns false if it was dropped
    /// because it carries the session's own SSRC.
    pub fn insert(&mut self, packet: RtpPacket) -> bool {
        if packet.ssrc == self.own_ssrc && !self.accept_own_packets {
            trace!(ssrc = packet.ssrc, "Dropping packet with own SSRC");
            return false;
        }

        let ssrc = packet.ssrc;
        let source = match self.sources.iter().position(|s| s.ssrc == ssrc) {
            Some(index) => &mut self.sources[index],
            None => {
                trace!(ssrc, "New source");
                self.sources.push(Source {
                    ssrc,
                    queue: VecDeque::new(),
                    received: 0,
                });
                let last = self.sources.len() - 1;
                &mut self.sources[last]
            }
        };
        source.received += 1;
        source.queue.push_back(packet);
        true
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    /// Packets received from `ssrc` over the lifetime of the table.
    pub fn received(&self, ssrc: Ssrc) -> u64 {
        self.sources
            .iter()
            .find(|s| s.ssrc == ssrc)
            .map_or(0, |s| s.received)
    }

    /// Packets queued and not yet fetched.
    pub fn outstanding(&self) -> usize {
        self.sources.iter().map(|s| s.queue.len()).sum()
    }

    pub fn clear(&mut self) {
        self.sources.clear();
    }

    fn pop(&mut self, ssrc: Ssrc) -> Option<RtpPacket> {
        let packet = self
            .sources
            .iter_mut()
            .find(|s| s.ssrc == ssrc)?
            .queue
            .pop_front()?;
        self.fetched += 1;
        Some(packet)
    }
}

// ============================================================================
// Data Access
// ============================================================================

/// Exclusive access to a session's received packets.
///
/// Maintenance cannot queue new packets while this guard is alive; dropping
/// it releases the table.
pub struct DataAccess<'a> {
    table: MutexGuard<'a, SourceTable>,
}

impl<'a> DataAccess<'a> {
    pub(crate) fn new(table: MutexGuard<'a, SourceTable>) -> Self {
        Self { table }
    }

    /// SSRCs with at least one queued packet, in discovery order.
    pub fn sources_with_data(&self) -> Vec<Ssrc> {
        self.table
            .sources
            .iter()
            .filter(|s| !s.queue.is_empty())
            .map(|s| s.ssrc)
            .collect()
    }

    /// Removes the oldest queued packet of `ssrc`.
    ///
    /// The packet borrows this guard, so it has to be disposed of (or
    /// dropped) before the next one is fetched.
    pub fn next_packet(&mut self, ssrc: Ssrc) -> Option<PendingPacket<'_>> {
        let table = &mut *self.table;
        let packet = table.pop(ssrc)?;
        Some(PendingPacket {
            packet,
            disposed: &mut table.disposed,
        })
    }

    /// Total packets fetched from this session.
    pub fn fetched(&self) -> u64 {
        self.table.fetched
    }

    /// Total fetched packets that have been disposed of.
    pub fn disposed(&self) -> u64 {
        self.table.disposed
    }

    pub fn outstanding(&self) -> usize {
        self.table.outstanding()
    }
}

impl std::fmt::Debug for DataAccess<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataAccess")
            .field("sources", &self.table.source_count())
            .field("outstanding", &self.table.outstanding())
            .finish()
    }
}

/// A packet fetched from a [`DataAccess`] guard.
///
/// Dereferences to the [`RtpPacket`]. Disposal is recorded when it is
/// dropped or passed to [`dispose`](Self::dispose).
#[derive(Debug)]
pub struct PendingPacket<'a> {
    packet: RtpPacket,
    disposed: &'a mut u64,
}

impl PendingPacket<'_> {
    pub fn dispose(self) {}
}

impl Deref for PendingPacket<'_> {
    type Target = RtpPacket;

    fn deref(&self) -> &RtpPacket {
        &self.packet
    }
}

impl Drop for PendingPacket<'_> {
    fn drop(&mut self) {
        *self.disposed += 1;
    }
}
