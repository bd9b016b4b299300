//! # Endpoint — Socket State
//!
//! An endpoint owns exactly one receive queue and one send queue, its
//! connection state, a deferred-error slot, the out-of-band mark, and the
//! splice edges. Endpoints live in a slab-backed table and are referenced by
//! copyable handles — splice links and peers are plain handles, so the object
//! graph stays acyclic and the consumer/producer head/tail discipline needs
//! no back-pointers.
//!
//! [`Core`] bundles the table with the arena and the drained wakeup list;
//! protocol implementations receive it to manipulate peer queues.

use std::time::Duration;

use quanta::Instant;
use slab::Slab;

use crate::arena::Arena;
use crate::error::SockError;
use crate::proto::Addr;
use crate::sockbuf::Sockbuf;
use crate::splice::SpliceLink;

// ─── Handles ────────────────────────────────────────────────────────────────

/// Handle to an endpoint in the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointHandle(pub usize);

/// Which queue of an endpoint an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueSide {
    Recv,
    Send,
}

// ─── Lifecycle State ────────────────────────────────────────────────────────

/// Connection-lifecycle state, orthogonal to the per-queue `cant_more` flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    Created,
    Bound,
    Listening,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

// ─── Endpoint ───────────────────────────────────────────────────────────────

/// A communication endpoint: two queues plus connection state.
#[derive(Debug)]
pub struct Endpoint {
    pub state: EndpointState,
    pub rcv: Sockbuf,
    pub snd: Sockbuf,

    // Option flags.
    pub nonblocking: bool,
    pub oob_inline: bool,
    pub linger: Option<Duration>,
    /// Instant the lingering close gives up, armed on the first attempt.
    pub close_deadline: Option<Instant>,

    /// Error recorded by an asynchronous event, surfaced to the next call.
    pub error: Option<SockError>,

    // Out-of-band bookkeeping.
    /// Bytes of ordinary data queued ahead of the urgent mark.
    pub oob_mark: usize,
    /// The read pointer sits exactly at the mark.
    pub at_mark: bool,
    /// Urgent byte held out of line (when not delivered inline).
    pub oob_byte: Option<u8>,

    /// Connected peer, when the protocol wires endpoints directly.
    pub peer: Option<EndpointHandle>,
    /// Outbound splice link for which this endpoint is the source.
    pub splice_to: Option<SpliceLink>,
    /// Endpoint that splices into this one (this endpoint is the drain).
    pub splice_from: Option<EndpointHandle>,

    // Listen state.
    pub backlog: Vec<EndpointHandle>,
    pub backlog_limit: usize,
    pub bound_addr: Option<Addr>,

    /// Still referenced by a file descriptor.
    pub file_ref: bool,
    /// Destruction-deferral count (active splice link, backlog membership).
    pub refs: u32,
}

impl Endpoint {
    fn new() -> Self {
        Endpoint {
            state: EndpointState::Created,
            rcv: Sockbuf::new(),
            snd: Sockbuf::new(),
            nonblocking: false,
            oob_inline: false,
            linger: None,
            close_deadline: None,
            error: None,
            oob_mark: 0,
            at_mark: false,
            oob_byte: None,
            peer: None,
            splice_to: None,
            splice_from: None,
            backlog: Vec::new(),
            backlog_limit: 0,
            bound_addr: None,
            file_ref: true,
            refs: 0,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == EndpointState::Connected
    }

    /// Take-and-clear the deferred error (peeking reads use `error` directly).
    pub fn take_error(&mut self) -> Option<SockError> {
        self.error.take()
    }

    pub fn queue(&self, side: QueueSide) -> &Sockbuf {
        match side {
            QueueSide::Recv => &self.rcv,
            QueueSide::Send => &self.snd,
        }
    }

    pub fn queue_mut(&mut self, side: QueueSide) -> &mut Sockbuf {
        match side {
            QueueSide::Recv => &mut self.rcv,
            QueueSide::Send => &mut self.snd,
        }
    }
}

// ─── Endpoint Table ─────────────────────────────────────────────────────────

/// Slab-backed endpoint arena addressed by handles.
#[derive(Debug, Default)]
pub struct EndpointTable {
    slab: Slab<Endpoint>,
}

impl EndpointTable {
    pub fn new() -> Self {
        EndpointTable { slab: Slab::new() }
    }

    pub fn insert(&mut self) -> EndpointHandle {
        EndpointHandle(self.slab.insert(Endpoint::new()))
    }

    pub fn get(&self, h: EndpointHandle) -> Option<&Endpoint> {
        self.slab.get(h.0)
    }

    pub fn get_mut(&mut self, h: EndpointHandle) -> Option<&mut Endpoint> {
        self.slab.get_mut(h.0)
    }

    /// Disjoint mutable borrows of two endpoints, for the pair-wise paths
    /// (loopback delivery, splice moves).
    pub fn pair_mut(
        &mut self,
        a: EndpointHandle,
        b: EndpointHandle,
    ) -> Option<(&mut Endpoint, &mut Endpoint)> {
        self.slab.get2_mut(a.0, b.0)
    }

    pub fn remove(&mut self, h: EndpointHandle) -> Option<Endpoint> {
        if self.slab.contains(h.0) {
            Some(self.slab.remove(h.0))
        } else {
            None
        }
    }

    pub fn contains(&self, h: EndpointHandle) -> bool {
        self.slab.contains(h.0)
    }

    pub fn len(&self) -> usize {
        self.slab.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slab.is_empty()
    }

    pub fn handles(&self) -> impl Iterator<Item = EndpointHandle> + '_ {
        self.slab.iter().map(|(k, _)| EndpointHandle(k))
    }
}

// ─── Wakeups ────────────────────────────────────────────────────────────────

/// A readiness wakeup drained by the embedding layer.
///
/// While a queue is splice-active its user-facing wakeups are suppressed;
/// the event instead targets the splice source so the splice engine gets
/// pumped (`splice_pump` set, `endpoint` = the link's source).
#[derive(Debug, Clone, Copy)]
pub struct Wakeup {
    pub endpoint: EndpointHandle,
    pub side: QueueSide,
    pub splice_pump: bool,
    /// Current byte count (data for readable, space for writable).
    pub bytes: usize,
    /// End-of-file or pending-error condition rode along.
    pub eof: bool,
}

// ─── Core ───────────────────────────────────────────────────────────────────

/// Endpoint table + arena + wakeup list: everything the engines and protocol
/// implementations share.
pub struct Core {
    pub eps: EndpointTable,
    pub arena: Arena,
    events: Vec<Wakeup>,
}

impl Core {
    pub fn new(arena: Arena) -> Self {
        Core {
            eps: EndpointTable::new(),
            arena,
            events: Vec::new(),
        }
    }

    /// Post a readable wakeup for `h` (data arrived, EOF, or error pending).
    pub fn wake_readable(&mut self, h: EndpointHandle) {
        let Some(ep) = self.eps.get(h) else { return };
        let eof = ep.rcv.cant_more || ep.error.is_some();
        let bytes = ep.rcv.cc();
        if ep.rcv.splice_active {
            // This endpoint is a splice source: pump the link, not the user.
            self.events.push(Wakeup {
                endpoint: h,
                side: QueueSide::Recv,
                splice_pump: true,
                bytes,
                eof,
            });
            return;
        }
        self.events.push(Wakeup {
            endpoint: h,
            side: QueueSide::Recv,
            splice_pump: false,
            bytes,
            eof,
        });
    }

    /// Post a writable wakeup for `h` (space opened up, EOF, or error).
    pub fn wake_writable(&mut self, h: EndpointHandle) {
        let Some(ep) = self.eps.get(h) else { return };
        let eof = ep.snd.cant_more || ep.error.is_some();
        let bytes = ep.snd.space_available();
        if ep.snd.splice_active {
            // This endpoint drains a splice: more room means the link's
            // source can move again.
            if let Some(src) = ep.splice_from {
                self.events.push(Wakeup {
                    endpoint: src,
                    side: QueueSide::Recv,
                    splice_pump: true,
                    bytes,
                    eof,
                });
            }
            return;
        }
        self.events.push(Wakeup {
            endpoint: h,
            side: QueueSide::Send,
            splice_pump: false,
            bytes,
            eof,
        });
    }

    /// Record an asynchronous error and wake every waiter on both queues.
    pub fn defer_error(&mut self, h: EndpointHandle, err: SockError) {
        if let Some(ep) = self.eps.get_mut(h) {
            if ep.error.is_none() {
                ep.error = Some(err);
            }
        }
        self.wake_readable(h);
        self.wake_writable(h);
    }

    /// Drain pending wakeups.
    pub fn take_events(&mut self) -> Vec<Wakeup> {
        std::mem::take(&mut self.events)
    }

    pub fn pending_events(&self) -> usize {
        self.events.len()
    }
}
