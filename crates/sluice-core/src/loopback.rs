//! # Loopback Protocols
//!
//! Two in-process protocol implementations that wire endpoints to each
//! other with no transport underneath:
//!
//! - [`LoopbackStream`]: connection-oriented byte stream. A sender's
//!   send-space is the peer's remaining receive-space (the occupancy
//!   mirror), so backpressure comes straight from the reader.
//! - [`LoopbackDgram`]: connectionless atomic records with source
//!   addresses and rights-carrying control passthrough.
//!
//! Both double as the reference protocols for the engine tests.

use std::collections::HashMap;

use tracing::{debug, trace};

use crate::arena::{Record, SegmentKind};
use crate::endpoint::{Core, EndpointHandle, EndpointState};
use crate::error::SockError;
use crate::proto::{Addr, ProtoCaps, Protocol};
use crate::stack::DEFAULT_HIWAT;

// ─── Stream ─────────────────────────────────────────────────────────────────

/// Connection-oriented loopback byte stream.
#[derive(Debug, Default)]
pub struct LoopbackStream {
    listeners: HashMap<String, EndpointHandle>,
}

impl LoopbackStream {
    pub fn new() -> Self {
        LoopbackStream::default()
    }

    /// Mirror the reader's queue occupancy back onto the writer's send side
    /// and note whether the reader's queue actually changed.
    fn refresh_mirror(core: &mut Core, writer: EndpointHandle, reader: EndpointHandle) {
        let Some((w, r)) = core.eps.pair_mut(writer, reader) else {
            return;
        };
        w.snd.mirror_occupancy(r.rcv.cc());
    }

    fn peer_of(core: &Core, h: EndpointHandle) -> Result<EndpointHandle, SockError> {
        core.eps
            .get(h)
            .ok_or(SockError::InvalidArgument)?
            .peer
            .ok_or(SockError::NotConnected)
    }
}

impl Protocol for LoopbackStream {
    fn caps(&self) -> ProtoCaps {
        ProtoCaps {
            atomic: false,
            connection_required: true,
            addresses: false,
            rights: false,
        }
    }

    fn bind(&mut self, core: &mut Core, h: EndpointHandle, addr: &Addr) -> Result<(), SockError> {
        if self.listeners.contains_key(&addr.0) {
            return Err(SockError::Busy);
        }
        self.listeners.insert(addr.0.clone(), h);
        let ep = core.eps.get_mut(h).ok_or(SockError::InvalidArgument)?;
        ep.bound_addr = Some(addr.clone());
        Ok(())
    }

    fn listen(&mut self, core: &mut Core, h: EndpointHandle) -> Result<(), SockError> {
        let ep = core.eps.get(h).ok_or(SockError::InvalidArgument)?;
        if ep.bound_addr.is_none() {
            return Err(SockError::InvalidArgument);
        }
        Ok(())
    }

    /// Connect to a listener: a fresh child endpoint lands on its backlog
    /// and becomes the caller's peer.
    fn connect(&mut self, core: &mut Core, h: EndpointHandle, addr: &Addr) -> Result<(), SockError> {
        let listener = *self
            .listeners
            .get(&addr.0)
            .ok_or(SockError::ConnectionReset)?;
        {
            let l = core.eps.get(listener).ok_or(SockError::ConnectionReset)?;
            if l.state != EndpointState::Listening {
                return Err(SockError::ConnectionReset);
            }
            if l.backlog.len() >= l.backlog_limit {
                return Err(SockError::ConnectionReset);
            }
        }

        let child = core.eps.insert();
        {
            let arena = &mut core.arena;
            let c = core.eps.get_mut(child).ok_or(SockError::InvalidArgument)?;
            if let Err(e) = c.snd.reserve(arena, DEFAULT_HIWAT) {
                core.eps.remove(child);
                return Err(e);
            }
            if let Err(e) = c.rcv.reserve(arena, DEFAULT_HIWAT) {
                let hiwat = c.snd.hiwat();
                let _ = arena.rereserve(hiwat, 0);
                core.eps.remove(child);
                return Err(e);
            }
            c.state = EndpointState::Connected;
            c.peer = Some(h);
            c.refs += 1; // backlog membership defers destruction
        }
        {
            let ep = core.eps.get_mut(h).ok_or(SockError::InvalidArgument)?;
            ep.state = EndpointState::Connected;
            ep.peer = Some(child);
        }
        core.eps
            .get_mut(listener)
            .ok_or(SockError::ConnectionReset)?
            .backlog
            .push(child);
        debug!(caller = h.0, child = child.0, listener = listener.0, "stream connected");
        core.wake_readable(listener);
        Ok(())
    }

    fn connect2(
        &mut self,
        core: &mut Core,
        a: EndpointHandle,
        b: EndpointHandle,
    ) -> Result<(), SockError> {
        let (ea, eb) = core.eps.pair_mut(a, b).ok_or(SockError::InvalidArgument)?;
        ea.peer = Some(b);
        eb.peer = Some(a);
        ea.state = EndpointState::Connected;
        eb.state = EndpointState::Connected;
        Ok(())
    }

    fn accept(&mut self, core: &mut Core, h: EndpointHandle) -> Result<(), SockError> {
        // The child was wired at connect time; nothing left to do.
        let _ = core.eps.get(h).ok_or(SockError::InvalidArgument)?;
        Ok(())
    }

    fn disconnect(&mut self, core: &mut Core, h: EndpointHandle) -> Result<(), SockError> {
        let peer = {
            let ep = core.eps.get_mut(h).ok_or(SockError::InvalidArgument)?;
            ep.state = EndpointState::Disconnected;
            ep.snd.cant_more = true;
            ep.rcv.cant_more = true;
            ep.peer.take()
        };
        if let Some(p) = peer {
            if let Some(pe) = core.eps.get_mut(p) {
                pe.state = EndpointState::Disconnected;
                pe.rcv.cant_more = true;
                pe.snd.cant_more = true;
                pe.peer = None;
            }
            core.wake_readable(p);
            core.wake_writable(p);
        }
        core.wake_readable(h);
        core.wake_writable(h);
        Ok(())
    }

    fn send(
        &mut self,
        core: &mut Core,
        h: EndpointHandle,
        record: Record,
        _addr: Option<&Addr>,
    ) -> Result<(), SockError> {
        let peer = Self::peer_of(core, h)?;
        let len = record.len();
        {
            let (w, r) = core
                .eps
                .pair_mut(h, peer)
                .ok_or(SockError::NotConnected)?;
            if r.rcv.cant_more {
                // Reader gone: the record's charges go back to the arena.
                core.arena.release_record(record);
                return Err(SockError::Pipe);
            }
            r.rcv.append_stream(record);
            w.snd.mirror_occupancy(r.rcv.cc());
        }
        trace!(from = h.0, to = peer.0, bytes = len, "stream delivery");
        core.wake_readable(peer);
        Ok(())
    }

    fn send_oob(&mut self, core: &mut Core, h: EndpointHandle, byte: u8) -> Result<(), SockError> {
        let peer = Self::peer_of(core, h)?;
        let inline = core
            .eps
            .get(peer)
            .ok_or(SockError::NotConnected)?
            .oob_inline;
        if inline {
            let seg = core.arena.allocate(SegmentKind::OutOfBand, &[byte])?;
            let pe = core.eps.get_mut(peer).ok_or(SockError::NotConnected)?;
            if pe.rcv.cant_more {
                core.arena.release(seg);
                return Err(SockError::Pipe);
            }
            // The mark sits just before the urgent byte.
            pe.oob_mark = pe.rcv.cc();
            pe.at_mark = pe.oob_mark == 0;
            pe.rcv.append_record(Record::from_segment(seg));
        } else {
            let pe = core.eps.get_mut(peer).ok_or(SockError::NotConnected)?;
            if pe.rcv.cant_more {
                return Err(SockError::Pipe);
            }
            pe.oob_mark = pe.rcv.cc();
            pe.at_mark = pe.oob_mark == 0;
            pe.oob_byte = Some(byte);
        }
        Self::refresh_mirror(core, h, peer);
        core.wake_readable(peer);
        Ok(())
    }

    fn recv_oob(
        &mut self,
        core: &mut Core,
        h: EndpointHandle,
        peek: bool,
    ) -> Result<u8, SockError> {
        let ep = core.eps.get_mut(h).ok_or(SockError::InvalidArgument)?;
        if ep.oob_inline {
            return Err(SockError::InvalidArgument);
        }
        let byte = ep.oob_byte.ok_or(SockError::InvalidArgument)?;
        if !peek {
            ep.oob_byte = None;
        }
        Ok(byte)
    }

    /// Window update: the reader consumed bytes, so the writer's mirrored
    /// occupancy shrinks and blocked writers wake.
    fn rcvd(&mut self, core: &mut Core, h: EndpointHandle) {
        let Some(peer) = core.eps.get(h).and_then(|ep| ep.peer) else {
            return;
        };
        Self::refresh_mirror(core, peer, h);
        core.wake_writable(peer);
    }

    fn shutdown_write(&mut self, core: &mut Core, h: EndpointHandle) -> Result<(), SockError> {
        let Some(peer) = core.eps.get(h).and_then(|ep| ep.peer) else {
            return Ok(());
        };
        if let Some(pe) = core.eps.get_mut(peer) {
            if !pe.rcv.cant_more {
                pe.rcv.cant_more = true;
                core.wake_readable(peer);
            }
        }
        Ok(())
    }

    fn abort(&mut self, core: &mut Core, h: EndpointHandle) {
        let _ = self.disconnect(core, h);
    }

    fn detach(&mut self, core: &mut Core, h: EndpointHandle) {
        if let Some(ep) = core.eps.get(h) {
            if let Some(addr) = &ep.bound_addr {
                self.listeners.remove(&addr.0);
            }
        }
    }
}

// ─── Datagram ───────────────────────────────────────────────────────────────

/// Connectionless loopback datagram protocol.
#[derive(Debug, Default)]
pub struct LoopbackDgram {
    bound: HashMap<String, EndpointHandle>,
}

impl LoopbackDgram {
    pub fn new() -> Self {
        LoopbackDgram::default()
    }

    fn resolve(&self, addr: &Addr) -> Result<EndpointHandle, SockError> {
        self.bound
            .get(&addr.0)
            .copied()
            .ok_or(SockError::ConnectionReset)
    }
}

impl Protocol for LoopbackDgram {
    fn caps(&self) -> ProtoCaps {
        ProtoCaps {
            atomic: true,
            connection_required: false,
            addresses: true,
            rights: true,
        }
    }

    fn bind(&mut self, core: &mut Core, h: EndpointHandle, addr: &Addr) -> Result<(), SockError> {
        if self.bound.contains_key(&addr.0) {
            return Err(SockError::Busy);
        }
        self.bound.insert(addr.0.clone(), h);
        let ep = core.eps.get_mut(h).ok_or(SockError::InvalidArgument)?;
        ep.bound_addr = Some(addr.clone());
        ep.state = EndpointState::Bound;
        Ok(())
    }

    /// Datagram connect only pins a default destination.
    fn connect(&mut self, core: &mut Core, h: EndpointHandle, addr: &Addr) -> Result<(), SockError> {
        let dest = self.resolve(addr)?;
        let ep = core.eps.get_mut(h).ok_or(SockError::InvalidArgument)?;
        ep.peer = Some(dest);
        ep.state = EndpointState::Connected;
        Ok(())
    }

    fn disconnect(&mut self, core: &mut Core, h: EndpointHandle) -> Result<(), SockError> {
        let ep = core.eps.get_mut(h).ok_or(SockError::InvalidArgument)?;
        ep.peer = None;
        ep.state = if ep.bound_addr.is_some() {
            EndpointState::Bound
        } else {
            EndpointState::Created
        };
        Ok(())
    }

    fn send(
        &mut self,
        core: &mut Core,
        h: EndpointHandle,
        record: Record,
        addr: Option<&Addr>,
    ) -> Result<(), SockError> {
        let dest = match addr {
            Some(a) => self.resolve(a)?,
            None => core
                .eps
                .get(h)
                .ok_or(SockError::InvalidArgument)?
                .peer
                .ok_or(SockError::DestAddrRequired)?,
        };

        // The receiver learns who sent this via a leading address segment.
        let source = core
            .eps
            .get(h)
            .ok_or(SockError::InvalidArgument)?
            .bound_addr
            .clone();
        let mut segments = Vec::with_capacity(record.segments.len() + 1);
        if let Some(src) = source {
            let seg = core.arena.allocate(SegmentKind::Address, src.0.as_bytes())?;
            segments.push(seg);
        }
        segments.extend(record.segments);
        let record = Record::new(segments);

        let d = core.eps.get_mut(dest).ok_or(SockError::ConnectionReset)?;
        if d.rcv.cant_more {
            core.arena.release_record(record);
            return Err(SockError::Pipe);
        }
        if record.len() > d.rcv.space_available() {
            // Datagram custom: a full receiver drops silently.
            trace!(from = h.0, to = dest.0, bytes = record.len(), "datagram dropped, receiver full");
            core.arena.release_record(record);
            return Ok(());
        }
        d.rcv.append_record(record);
        core.wake_readable(dest);
        Ok(())
    }

    fn detach(&mut self, core: &mut Core, h: EndpointHandle) {
        if let Some(ep) = core.eps.get(h) {
            if let Some(addr) = &ep.bound_addr {
                self.bound.remove(&addr.0);
            }
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
