//! # Protocol Request Surface
//!
//! The capability interface between the buffering core and a protocol
//! implementation. The core drives connection setup, record hand-off, and
//! shutdown through these requests and consumes their side effects; it never
//! inspects protocol-private state.
//!
//! Implementations receive `&mut Core` so they can manipulate peer queues
//! (a local pair protocol appends straight into the peer's receive queue).
//! Three flavors exist: connection-oriented stream, connectionless datagram,
//! and local rights-passing — the [`crate::loopback`] module ships the local
//! pair implementations.

use bytes::Bytes;

use crate::arena::{Record, Segment};
use crate::endpoint::{Core, EndpointHandle};
use crate::error::SockError;

// ─── Capabilities ───────────────────────────────────────────────────────────

/// Static properties of a protocol that steer the send/receive engines.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProtoCaps {
    /// Records are delivered whole or not at all (datagram-like).
    pub atomic: bool,
    /// Sending/receiving requires an established connection.
    pub connection_required: bool,
    /// Datagrams carry source addresses that the receive path returns.
    pub addresses: bool,
    /// Control records may carry transferable rights and need disposal.
    pub rights: bool,
}

// ─── Addressing & Control ───────────────────────────────────────────────────

/// Opaque endpoint address. The core only moves these around; interpretation
/// is the protocol's business.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Addr(pub String);

impl Addr {
    pub fn new(name: impl Into<String>) -> Self {
        Addr(name.into())
    }
}

/// A control/ancillary message in caller-visible form.
#[derive(Debug, Clone)]
pub struct ControlMsg {
    pub data: Bytes,
    /// Carries transferable rights; must be disposed, never silently dropped.
    pub rights: bool,
}

/// Which half of an endpoint a shutdown applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownDirection {
    Read,
    Write,
    Both,
}

// ─── Protocol Trait ─────────────────────────────────────────────────────────

/// Protocol-request callback surface.
///
/// Every request returns a result; the default bodies reject requests the
/// protocol flavor does not implement.
#[allow(unused_variables)]
pub trait Protocol {
    fn caps(&self) -> ProtoCaps;

    /// A new endpoint was created.
    fn attach(&mut self, core: &mut Core, h: EndpointHandle) -> Result<(), SockError> {
        Ok(())
    }

    /// The endpoint is being destroyed.
    fn detach(&mut self, core: &mut Core, h: EndpointHandle) {}

    fn bind(&mut self, core: &mut Core, h: EndpointHandle, addr: &Addr) -> Result<(), SockError> {
        Err(SockError::OpNotSupported)
    }

    fn listen(&mut self, core: &mut Core, h: EndpointHandle) -> Result<(), SockError> {
        Err(SockError::OpNotSupported)
    }

    fn connect(&mut self, core: &mut Core, h: EndpointHandle, addr: &Addr) -> Result<(), SockError> {
        Err(SockError::OpNotSupported)
    }

    /// Wire two endpoints of the same protocol directly together.
    fn connect2(
        &mut self,
        core: &mut Core,
        a: EndpointHandle,
        b: EndpointHandle,
    ) -> Result<(), SockError> {
        Err(SockError::OpNotSupported)
    }

    fn disconnect(&mut self, core: &mut Core, h: EndpointHandle) -> Result<(), SockError> {
        Err(SockError::OpNotSupported)
    }

    /// A queued connection is being accepted off the backlog.
    fn accept(&mut self, core: &mut Core, h: EndpointHandle) -> Result<(), SockError> {
        Ok(())
    }

    /// Hand an assembled record to the transport.
    fn send(
        &mut self,
        core: &mut Core,
        h: EndpointHandle,
        record: Record,
        addr: Option<&Addr>,
    ) -> Result<(), SockError>;

    /// Hand a single urgent byte to the transport.
    fn send_oob(&mut self, core: &mut Core, h: EndpointHandle, byte: u8) -> Result<(), SockError> {
        Err(SockError::OpNotSupported)
    }

    /// Fetch the pending urgent byte (peek leaves it in place).
    fn recv_oob(
        &mut self,
        core: &mut Core,
        h: EndpointHandle,
        peek: bool,
    ) -> Result<u8, SockError> {
        Err(SockError::OpNotSupported)
    }

    /// Receive-window update: the endpoint's receive queue shrank.
    fn rcvd(&mut self, core: &mut Core, h: EndpointHandle) {}

    /// Drop the connection without the usual goodbyes.
    fn abort(&mut self, core: &mut Core, h: EndpointHandle) {}

    /// Forward a write-side shutdown to the peer/transport.
    fn shutdown_write(&mut self, core: &mut Core, h: EndpointHandle) -> Result<(), SockError> {
        Ok(())
    }

    /// Opaque option passthrough (peer credentials and friends).
    fn control(
        &mut self,
        core: &mut Core,
        h: EndpointHandle,
        option: u32,
        value: &[u8],
    ) -> Result<Bytes, SockError> {
        Err(SockError::OpNotSupported)
    }

    /// Convert a queued control segment into its caller-visible form
    /// (e.g. turn in-flight rights into live descriptors).
    fn externalize_control(&mut self, core: &mut Core, seg: Segment) -> ControlMsg {
        ControlMsg {
            data: seg.bytes,
            rights: false,
        }
    }

    /// Dispose of a control segment the caller did not collect. Rights riding
    /// in it must be reclaimed here, never silently dropped.
    fn dispose_control(&mut self, core: &mut Core, seg: Segment) {
        drop(seg);
    }
}
