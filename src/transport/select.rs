//! Readiness multiplexer over an ordered set of socket handles.
//!
//! [`Selector::select`] gives level-triggered semantics on top of mio's
//! edge-triggered poll: every call registers the handles afresh, so a handle
//! that is still readable is reported again on the next call. Registrations
//! are removed before the call returns, which keeps no state tied to handles
//! that the caller may close afterwards.

use crate::error::Error;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use std::io::ErrorKind;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// Raw OS socket handle.
pub type SocketHandle = RawFd;

const WAKE_TOKEN: Token = Token(usize::MAX);
const DEFAULT_EVENTS_CAPACITY: usize = 8;

// ============================================================================
// SocketSet
// ============================================================================

/// Ordered socket handles with one readiness flag per handle.
///
/// Flag `i` always belongs to handle `i`; both sequences change together.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SocketSet {
    handles: Vec<SocketHandle>,
    flags: Vec<bool>,
}

impl SocketSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a set holding exactly `handle`.
    pub fn with_handle(handle: SocketHandle) -> Self {
        let mut set = Self::new();
        set.push(handle);
        set
    }

    /// Appends a handle with a cleared flag.
    pub fn push(&mut self, handle: SocketHandle) {
        self.handles.push(handle);
        self.flags.push(false);
    }

    /// Replaces the handle at `index`, clearing its flag. Returns the previous
    /// handle, or `None` if `index` is out of range.
    pub fn replace(&mut self, index: usize, handle: SocketHandle) -> Option<SocketHandle> {
        let slot = self.handles.get_mut(index)?;
        let previous = std::mem::replace(slot, handle);
        self.flags[index] = false;
        Some(previous)
    }

    pub fn clear(&mut self) {
        self.handles.clear();
        self.flags.clear();
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn handles(&self) -> &[SocketHandle] {
        &self.handles
    }

    /// Readiness flags from the last [`Selector::select`] call, in handle order.
    pub fn flags(&self) -> &[bool] {
        &self.flags
    }

    pub fn is_ready(&self, index: usize) -> bool {
        self.flags.get(index).copied().unwrap_or(false)
    }

    fn clear_flags(&mut self) {
        self.flags.iter_mut().for_each(|flag| *flag = false);
    }

    fn first_index_of(&self, handle: SocketHandle) -> usize {
        self.handles
            .iter()
            .position(|&h| h == handle)
            .unwrap_or_default()
    }
}

// ============================================================================
// Selector
// ============================================================================

/// Blocking, bounded wait for input readiness on a [`SocketSet`].
///
/// Owns a mio [`Waker`] so another thread can cut a wait short; see
/// [`Selector::waker`].
#[derive(Debug)]
pub struct Selector {
    poll: Poll,
    events: Events,
    waker: Arc<Waker>,
}

impl Selector {
    pub fn new() -> Result<Self, Error> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        Ok(Self {
            poll,
            events: Events::with_capacity(DEFAULT_EVENTS_CAPACITY),
            waker,
        })
    }

    /// Waker that makes a pending or the next [`select`](Self::select) return
    /// early with zero ready handles.
    pub fn waker(&self) -> Arc<Waker> {
        self.waker.clone()
    }

    /// Waits up to `timeout` for at least one handle in `sockets` to become
    /// readable, hung up, or errored.
    ///
    /// Updates the flags of `sockets` in place and returns the number of
    /// ready handles: 0 on timeout, on wake, or when the wait was interrupted
    /// by a signal. A handle listed more than once gets the same flag at each
    /// position.
    pub fn select(&mut self, sockets: &mut SocketSet, timeout: Duration) -> Result<usize, Error> {
        if sockets.is_empty() {
            return Err(Error::EmptySocketSet);
        }
        sockets.clear_flags();

        if self.events.capacity() < sockets.len() + 1 {
            self.events = Events::with_capacity(sockets.len() + 1);
        }

        let mut registered = Vec::with_capacity(sockets.len());
        for (index, &handle) in sockets.handles.iter().enumerate() {
            if sockets.handles[..index].contains(&handle) {
                continue;
            }
            if let Err(err) = self.register(handle, index) {
                debug!(handle, ?err, "Failed to register socket handle");
                self.deregister_all(&registered);
                return Err(Error::InvalidHandle { handle });
            }
            registered.push(handle);
        }

        let outcome = self.poll.poll(&mut self.events, Some(timeout));

        if outcome.is_ok() {
            for event in self.events.iter() {
                if event.token() == WAKE_TOKEN {
                    trace!("Selector woken");
                    continue;
                }
                let Token(index) = event.token();
                if event.is_readable() || event.is_read_closed() || event.is_error() {
                    sockets.flags[index] = true;
                }
            }
        }

        self.deregister_all(&registered);

        match outcome {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::Interrupted => {
                sockets.clear_flags();
                return Ok(0);
            }
            Err(err) => return Err(Error::Poll(err.to_string())),
        }

        for index in 0..sockets.len() {
            let first = sockets.first_index_of(sockets.handles[index]);
            sockets.flags[index] = sockets.flags[first];
        }

        let ready = sockets.flags.iter().filter(|&&flag| flag).count();
        trace!(ready, total = sockets.len(), "Select finished");
        Ok(ready)
    }

    fn register(&self, handle: SocketHandle, index: usize) -> std::io::Result<()> {
        if handle < 0 {
            return Err(std::io::Error::from_raw_os_error(libc::EBADF));
        }
        self.poll
            .registry()
            .register(&mut SourceFd(&handle), Token(index), Interest::READABLE)
    }

    fn deregister_all(&self, handles: &[SocketHandle]) {
        for handle in handles {
            if let Err(err) = self.poll.registry().deregister(&mut SourceFd(handle)) {
                trace!(handle, ?err, "Failed to deregister socket handle");
            }
        }
    }
}
