//! # Stack — Public Facade
//!
//! Bundles the [`Core`] with one protocol implementation and exposes the
//! endpoint lifecycle, the configuration surface, the transport-facing
//! inbound delivery path, and readiness queries. The send/receive/splice
//! engines extend this type from their own modules.

use std::time::Duration;

use bytes::Bytes;
use quanta::Instant;
use tracing::debug;

use crate::arena::{Arena, Record, ResourceLimits, SegmentKind, SEGMENT_CAPACITY};
use crate::endpoint::{Core, Endpoint, EndpointHandle, EndpointState, Wakeup};
use crate::error::SockError;
use crate::proto::{Addr, Protocol, ShutdownDirection};
use crate::sockbuf::QueueStats;

/// Default high-water mark for freshly created queues.
pub const DEFAULT_HIWAT: usize = 16 * 1024;

// ─── Wait Reasons ───────────────────────────────────────────────────────────

/// Why a resumable operation suspended. The embedder re-steps the operation
/// after a wakeup for the matching queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitKind {
    /// Waiting for the send queue's sleep-lock.
    SendLock,
    /// Waiting for send-side space.
    SendSpace,
    /// Waiting for the receive queue's sleep-lock.
    RecvLock,
    /// Waiting for receive-side data.
    RecvData,
    /// Waiting for disconnection to complete (lingering close).
    Drain,
}

// ─── Readiness ──────────────────────────────────────────────────────────────

/// Readiness snapshot for polling collaborators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub ready: bool,
    /// Auxiliary byte count: queued data (readable) or free space (writable).
    pub bytes: usize,
    /// EOF or pending-error condition.
    pub eof: bool,
}

// ─── Options ────────────────────────────────────────────────────────────────

/// Flow-control-relevant configuration options.
#[derive(Debug, Clone, Copy)]
pub enum SockOption {
    SendBuf(usize),
    RecvBuf(usize),
    SendLowat(usize),
    RecvLowat(usize),
    SendTimeout(Option<Duration>),
    RecvTimeout(Option<Duration>),
    Linger(Option<Duration>),
    NonBlocking(bool),
    OobInline(bool),
}

// ─── Stack ──────────────────────────────────────────────────────────────────

/// The buffering core wired to one protocol implementation.
pub struct Stack<P: Protocol> {
    pub core: Core,
    pub proto: P,
}

impl<P: Protocol> Stack<P> {
    pub fn new(proto: P) -> Self {
        Stack::with_limits(proto, ResourceLimits::default())
    }

    pub fn with_limits(proto: P, limits: ResourceLimits) -> Self {
        Stack {
            core: Core::new(Arena::new(limits)),
            proto,
        }
    }

    // ─── Lifecycle ──────────────────────────────────────────────────────

    /// Create an endpoint with default queue reservations.
    pub fn socket(&mut self) -> Result<EndpointHandle, SockError> {
        let h = self.core.eps.insert();
        {
            let arena = &mut self.core.arena;
            let ep = self.core.eps.get_mut(h).expect("fresh endpoint");
            if let Err(e) = ep.snd.reserve(arena, DEFAULT_HIWAT) {
                self.core.eps.remove(h);
                return Err(e);
            }
            if let Err(e) = ep.rcv.reserve(arena, DEFAULT_HIWAT) {
                let hiwat = ep.snd.hiwat();
                let _ = arena.rereserve(hiwat, 0);
                self.core.eps.remove(h);
                return Err(e);
            }
        }
        if let Err(e) = self.proto.attach(&mut self.core, h) {
            self.core.eps.remove(h);
            return Err(e);
        }
        Ok(h)
    }

    pub fn bind(&mut self, h: EndpointHandle, addr: &Addr) -> Result<(), SockError> {
        self.proto.bind(&mut self.core, h, addr)?;
        let ep = self.ep_mut(h)?;
        ep.bound_addr = Some(addr.clone());
        if ep.state == EndpointState::Created {
            ep.state = EndpointState::Bound;
        }
        Ok(())
    }

    pub fn listen(&mut self, h: EndpointHandle, backlog: usize) -> Result<(), SockError> {
        self.proto.listen(&mut self.core, h)?;
        let ep = self.ep_mut(h)?;
        ep.backlog_limit = backlog.max(1);
        ep.state = EndpointState::Listening;
        Ok(())
    }

    pub fn connect(&mut self, h: EndpointHandle, addr: &Addr) -> Result<(), SockError> {
        let ep = self.ep(h)?;
        if ep.is_connected() {
            return Err(SockError::IsConnected);
        }
        self.proto.connect(&mut self.core, h, addr)
    }

    /// Wire two endpoints directly together (a pair).
    pub fn connect2(&mut self, a: EndpointHandle, b: EndpointHandle) -> Result<(), SockError> {
        if self.ep(a)?.is_connected() || self.ep(b)?.is_connected() {
            return Err(SockError::IsConnected);
        }
        self.proto.connect2(&mut self.core, a, b)
    }

    /// Pop one queued connection off a listening endpoint's backlog.
    pub fn accept(&mut self, h: EndpointHandle) -> Result<EndpointHandle, SockError> {
        let ep = self.ep_mut(h)?;
        if ep.state != EndpointState::Listening {
            return Err(SockError::InvalidArgument);
        }
        if ep.backlog.is_empty() {
            return Err(SockError::WouldBlock);
        }
        let child = ep.backlog.remove(0);
        if let Some(c) = self.core.eps.get_mut(child) {
            c.refs = c.refs.saturating_sub(1);
        }
        if let Err(e) = self.proto.accept(&mut self.core, child) {
            // Put the connection back where it was; the caller may retry.
            if let Some(c) = self.core.eps.get_mut(child) {
                c.refs += 1;
            }
            if let Some(ep) = self.core.eps.get_mut(h) {
                ep.backlog.insert(0, child);
            }
            return Err(e);
        }
        Ok(child)
    }

    /// Shut down one or both halves. Idempotent: repeating a direction has no
    /// further observable effect.
    pub fn shutdown(&mut self, h: EndpointHandle, dir: ShutdownDirection) -> Result<(), SockError> {
        if matches!(dir, ShutdownDirection::Read | ShutdownDirection::Both) {
            let ep = self.ep_mut(h)?;
            if !ep.rcv.cant_more {
                ep.rcv.cant_more = true;
                self.core.wake_readable(h);
            }
        }
        if matches!(dir, ShutdownDirection::Write | ShutdownDirection::Both) {
            let ep = self.ep_mut(h)?;
            if !ep.snd.cant_more {
                ep.snd.cant_more = true;
                self.proto.shutdown_write(&mut self.core, h)?;
                self.core.wake_writable(h);
            }
        }
        Ok(())
    }

    /// Release the caller's file reference and tear the endpoint down.
    ///
    /// An endpoint still sourcing or draining a splice is detached from the
    /// link first. With linger configured, a connection-oriented endpoint
    /// that is still draining reports `WouldBlock`; the caller re-invokes
    /// until disconnection completes (or gives up and calls [`Stack::abort`]).
    pub fn close(&mut self, h: EndpointHandle) -> Result<(), SockError> {
        // Abort-and-detach before destruction, never destruction with links.
        if self.ep(h)?.splice_to.is_some() {
            self.unsplice(h, false)?;
        }
        if let Some(src) = self.ep(h)?.splice_from {
            self.unsplice(src, true)?;
        }
        let children = std::mem::take(&mut self.ep_mut(h)?.backlog);
        for child in children {
            self.proto.abort(&mut self.core, child);
            if let Some(c) = self.core.eps.get_mut(child) {
                c.refs = c.refs.saturating_sub(1);
                c.file_ref = false;
            }
            self.try_free(child);
        }

        let state = self.ep(h)?.state;
        if matches!(
            state,
            EndpointState::Connected | EndpointState::Connecting
        ) {
            self.proto.disconnect(&mut self.core, h)?;
        }

        let ep = self.ep_mut(h)?;
        if ep.state == EndpointState::Disconnecting && !ep.nonblocking {
            if let Some(linger) = ep.linger {
                // Linger: keep the endpoint alive until the protocol
                // finishes draining, but no longer than the configured
                // duration past the first close attempt.
                let now = Instant::now();
                let deadline = *ep.close_deadline.get_or_insert(now + linger);
                if now < deadline {
                    return Err(SockError::WouldBlock);
                }
            }
        }
        ep.file_ref = false;
        ep.rcv.cant_more = true;
        ep.snd.cant_more = true;
        self.try_free(h);
        Ok(())
    }

    /// Initiate an orderly disconnect without releasing the file reference.
    pub fn disconnect(&mut self, h: EndpointHandle) -> Result<(), SockError> {
        match self.ep(h)?.state {
            EndpointState::Disconnecting => Err(SockError::AlreadyInProgress),
            EndpointState::Connected | EndpointState::Connecting => {
                self.proto.disconnect(&mut self.core, h)
            }
            _ => Err(SockError::NotConnected),
        }
    }

    /// Drop the connection immediately and free the endpoint.
    pub fn abort(&mut self, h: EndpointHandle) -> Result<(), SockError> {
        if self.ep(h)?.splice_to.is_some() {
            self.unsplice(h, false)?;
        }
        if let Some(src) = self.ep(h)?.splice_from {
            self.unsplice(src, true)?;
        }
        self.proto.abort(&mut self.core, h);
        let ep = self.ep_mut(h)?;
        ep.file_ref = false;
        ep.state = EndpointState::Disconnected;
        self.try_free(h);
        Ok(())
    }

    /// Free the endpoint if nothing defers destruction anymore.
    pub(crate) fn try_free(&mut self, h: EndpointHandle) {
        let Some(ep) = self.core.eps.get(h) else { return };
        if ep.file_ref || ep.refs > 0 {
            return;
        }
        self.proto.detach(&mut self.core, h);
        let Some(mut ep) = self.core.eps.remove(h) else { return };
        debug!(endpoint = h.0, "freeing endpoint");
        // Rights-carrying control records go through the disposal hook,
        // never into the void.
        for rec in ep.rcv.drain_all().into_iter().chain(ep.snd.drain_all()) {
            for seg in rec.segments {
                self.core.arena.release_charge();
                if seg.kind == SegmentKind::Control {
                    self.proto.dispose_control(&mut self.core, seg);
                }
            }
        }
        let _ = self.core.arena.rereserve(ep.rcv.hiwat(), 0);
        let _ = self.core.arena.rereserve(ep.snd.hiwat(), 0);
    }

    // ─── Configuration ──────────────────────────────────────────────────

    pub fn set_option(&mut self, h: EndpointHandle, opt: SockOption) -> Result<(), SockError> {
        let arena = &mut self.core.arena;
        let ep = self
            .core
            .eps
            .get_mut(h)
            .ok_or(SockError::InvalidArgument)?;
        match opt {
            SockOption::SendBuf(n) => ep.snd.reserve(arena, n)?,
            SockOption::RecvBuf(n) => ep.rcv.reserve(arena, n)?,
            SockOption::SendLowat(n) => ep.snd.set_lowat(n)?,
            SockOption::RecvLowat(n) => ep.rcv.set_lowat(n)?,
            SockOption::SendTimeout(t) => ep.snd.timeo = t,
            SockOption::RecvTimeout(t) => ep.rcv.timeo = t,
            SockOption::Linger(d) => ep.linger = d,
            SockOption::NonBlocking(v) => ep.nonblocking = v,
            SockOption::OobInline(v) => ep.oob_inline = v,
        }
        Ok(())
    }

    /// Opaque option passthrough to the protocol (peer credentials etc.).
    pub fn proto_control(
        &mut self,
        h: EndpointHandle,
        option: u32,
        value: &[u8],
    ) -> Result<Bytes, SockError> {
        self.proto.control(&mut self.core, h, option, value)
    }

    // ─── Transport-Facing Inbound Path ──────────────────────────────────

    /// Producer path: the transport pushes inbound bytes into `h`'s receive
    /// queue. Appends at the tail only; returns the number of bytes taken
    /// (streams may take a prefix when space is short, atomic protocols take
    /// all or nothing).
    pub fn deliver_inbound(&mut self, h: EndpointHandle, data: Bytes) -> Result<usize, SockError> {
        let atomic = self.proto.caps().atomic;
        let arena = &mut self.core.arena;
        let ep = self
            .core
            .eps
            .get_mut(h)
            .ok_or(SockError::InvalidArgument)?;
        if ep.rcv.cant_more {
            return Err(SockError::Pipe);
        }
        let space = ep.rcv.space_available();
        let take = if atomic {
            if data.len() > space {
                return Err(SockError::NoBufs);
            }
            data.len()
        } else {
            data.len().min(space)
        };
        if take == 0 {
            return Ok(0);
        }

        let mut segments = Vec::new();
        let mut off = 0;
        while off < take {
            let end = (off + SEGMENT_CAPACITY).min(take);
            match arena.adopt(SegmentKind::Data, data.slice(off..end)) {
                Ok(seg) => segments.push(seg),
                Err(e) => {
                    // Discard the partially built record, charges included.
                    for seg in segments {
                        arena.release(seg);
                    }
                    return Err(e);
                }
            }
            off = end;
        }
        let record = Record::new(segments);
        if atomic {
            ep.rcv.append_record(record);
        } else {
            ep.rcv.append_stream(record);
        }
        self.core.wake_readable(h);
        Ok(take)
    }

    /// Producer path: the transport records an asynchronous error. The first
    /// wins, both sides wake, and the next send/receive surfaces it.
    pub fn inject_error(&mut self, h: EndpointHandle, err: SockError) {
        self.core.defer_error(h, err);
    }

    // ─── Readiness & Introspection ──────────────────────────────────────

    /// Readable: data present, closed-for-receive, pending error, or a
    /// non-empty accept backlog.
    pub fn readable(&self, h: EndpointHandle) -> Readiness {
        let Some(ep) = self.core.eps.get(h) else {
            return Readiness {
                ready: false,
                bytes: 0,
                eof: false,
            };
        };
        let eof = ep.rcv.cant_more || ep.error.is_some();
        let ready = ep.rcv.cc() >= ep.rcv.lowat().max(1) || eof || !ep.backlog.is_empty();
        Readiness {
            ready,
            bytes: ep.rcv.cc(),
            eof,
        }
    }

    /// Writable: space present, closed-for-send, or pending error.
    pub fn writable(&self, h: EndpointHandle) -> Readiness {
        let Some(ep) = self.core.eps.get(h) else {
            return Readiness {
                ready: false,
                bytes: 0,
                eof: false,
            };
        };
        let eof = ep.snd.cant_more || ep.error.is_some();
        let space = ep.snd.space_available();
        Readiness {
            ready: space > ep.snd.lowat() || eof,
            bytes: space,
            eof,
        }
    }

    /// Surface and clear the deferred error.
    pub fn take_error(&mut self, h: EndpointHandle) -> Option<SockError> {
        self.core.eps.get_mut(h).and_then(Endpoint::take_error)
    }

    pub fn queue_stats(&self, h: EndpointHandle) -> Option<(QueueStats, QueueStats)> {
        self.core
            .eps
            .get(h)
            .map(|ep| (ep.rcv.stats(), ep.snd.stats()))
    }

    /// Drain pending wakeups.
    pub fn take_events(&mut self) -> Vec<Wakeup> {
        self.core.take_events()
    }

    // ─── Internal ───────────────────────────────────────────────────────

    pub(crate) fn ep(&self, h: EndpointHandle) -> Result<&Endpoint, SockError> {
        self.core.eps.get(h).ok_or(SockError::InvalidArgument)
    }

    pub(crate) fn ep_mut(&mut self, h: EndpointHandle) -> Result<&mut Endpoint, SockError> {
        self.core.eps.get_mut(h).ok_or(SockError::InvalidArgument)
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
