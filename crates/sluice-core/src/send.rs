//! # Send Engine
//!
//! Copies caller bytes into arena segments, packs them into records, and
//! hands each assembled record to the protocol. Flow control, atomic-record
//! sizing, and out-of-band dispatch live here.
//!
//! A send is a resumable operation: [`SendOp::step`] runs until the transfer
//! completes, fails, or must suspend, and the embedder re-steps it after a
//! wakeup for the send queue. The sleep-lock is held across suspensions (one
//! sender at a time per queue) and released on every exit path. Partial
//! progress is always observable through [`SendOp::bytes_sent`].

use quanta::Instant;
use tracing::trace;

use bytes::{Buf, Bytes};

use crate::arena::{Record, SegmentKind, RECORD_HEADER_ROOM, SEGMENT_CAPACITY};
use crate::endpoint::{EndpointHandle, EndpointState};
use crate::error::SockError;
use crate::proto::{Addr, ControlMsg, Protocol};
use crate::stack::{Stack, WaitKind};

/// Extra send-side room granted to out-of-band transfers.
pub const OOB_PRIORITY_ROOM: usize = 1024;

// ─── Flags & Progress ───────────────────────────────────────────────────────

/// Per-call send flags.
#[derive(Debug, Clone, Copy, Default)]
pub struct SendFlags {
    /// Urgent data: dispatched through the out-of-band protocol request,
    /// bypassing atomicity and size checks.
    pub oob: bool,
    /// Never suspend, even on a blocking endpoint.
    pub dontwait: bool,
}

/// Outcome of one [`SendOp::step`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStep {
    /// Transfer complete; all requested bytes were delivered.
    Done(usize),
    /// Suspended; re-step after the matching wakeup.
    Blocked(WaitKind),
}

// ─── SendOp ─────────────────────────────────────────────────────────────────

/// A resumable send operation.
#[derive(Debug)]
pub struct SendOp {
    h: EndpointHandle,
    data: Bytes,
    addr: Option<Addr>,
    control: Option<ControlMsg>,
    flags: SendFlags,
    sent: usize,
    holds_lock: bool,
    lock_waiting: bool,
    wait_registered: bool,
    wait_started: Option<Instant>,
    interrupted: bool,
}

impl SendOp {
    pub fn new(h: EndpointHandle, data: Bytes) -> Self {
        SendOp {
            h,
            data,
            addr: None,
            control: None,
            flags: SendFlags::default(),
            sent: 0,
            holds_lock: false,
            lock_waiting: false,
            wait_registered: false,
            wait_started: None,
            interrupted: false,
        }
    }

    pub fn to_addr(mut self, addr: Addr) -> Self {
        self.addr = Some(addr);
        self
    }

    pub fn with_control(mut self, control: ControlMsg) -> Self {
        self.control = Some(control);
        self
    }

    pub fn with_flags(mut self, flags: SendFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Bytes delivered so far; valid even after an error, so callers can tell
    /// partial progress from none.
    pub fn bytes_sent(&self) -> usize {
        self.sent
    }

    /// Cancel a suspended operation: the next `step` cleans up and returns
    /// `Interrupted`, leaving [`bytes_sent`](Self::bytes_sent) intact.
    pub fn interrupt(&mut self) {
        self.interrupted = true;
    }

    /// Run the send until done, failed, or suspended.
    pub fn step<P: Protocol>(&mut self, stack: &mut Stack<P>) -> Result<SendStep, SockError> {
        if self.interrupted {
            return self.fail(stack, SockError::Interrupted);
        }
        let caps = stack.proto.caps();

        // Sleep-lock acquisition: one long-running sender per queue.
        if !self.holds_lock {
            let ep = stack.ep_mut(self.h)?;
            if ep.snd.try_lock() {
                self.holds_lock = true;
                if self.lock_waiting {
                    ep.snd.lock_waiters -= 1;
                    self.lock_waiting = false;
                }
            } else if ep.nonblocking || self.flags.dontwait {
                return Err(SockError::WouldBlock);
            } else {
                if !self.lock_waiting {
                    ep.snd.lock_waiters += 1;
                    self.lock_waiting = true;
                }
                return Ok(SendStep::Blocked(WaitKind::SendLock));
            }
        }

        loop {
            let (cant, pending_err, state, has_peer, nonblocking, space_raw, lowat, hiwat, timeo) = {
                let ep = stack.ep(self.h)?;
                (
                    ep.snd.cant_more,
                    ep.error,
                    ep.state,
                    ep.peer.is_some(),
                    ep.nonblocking,
                    ep.snd.space_available(),
                    ep.snd.lowat(),
                    ep.snd.hiwat(),
                    ep.snd.timeo,
                )
            };

            if cant {
                return self.fail(stack, SockError::Pipe);
            }
            if let Some(err) = pending_err {
                stack.ep_mut(self.h)?.error = None;
                return self.fail(stack, err);
            }
            if state != EndpointState::Connected {
                if caps.connection_required {
                    return self.fail(stack, SockError::NotConnected);
                }
                if self.addr.is_none() && !has_peer {
                    return self.fail(stack, SockError::DestAddrRequired);
                }
            }

            let resid = self.data.len();
            let clen = self.control.as_ref().map(|c| c.data.len()).unwrap_or(0);
            if resid == 0 && clen == 0 {
                return self.finish(stack);
            }

            if !self.flags.oob {
                // Atomic transfers must fit the configured buffer whole, and
                // control records always must.
                if (caps.atomic && resid + clen > hiwat) || clen > hiwat {
                    return self.fail(stack, SockError::MsgSize);
                }
            }

            let space = space_raw + if self.flags.oob { OOB_PRIORITY_ROOM } else { 0 };
            if space < resid + clen && (caps.atomic || space < lowat.max(1) || space < clen) {
                if nonblocking || self.flags.dontwait {
                    return self.fail(stack, SockError::WouldBlock);
                }
                if let Some(t) = timeo {
                    match self.wait_started {
                        Some(started) if started.elapsed() >= t => {
                            return self.fail(stack, SockError::WouldBlock);
                        }
                        None => self.wait_started = Some(Instant::now()),
                        _ => {}
                    }
                }
                let ep = stack.ep_mut(self.h)?;
                if !self.wait_registered {
                    ep.snd.waiters += 1;
                    self.wait_registered = true;
                }
                trace!(endpoint = self.h.0, space, resid, "send suspended on space");
                return Ok(SendStep::Blocked(WaitKind::SendSpace));
            }

            // Progressing: leave the wait roster.
            if self.wait_registered {
                stack.ep_mut(self.h)?.snd.waiters -= 1;
                self.wait_registered = false;
                self.wait_started = None;
            }

            if self.flags.oob {
                // Urgent bytes take the out-of-band protocol request, one at
                // a time, in order.
                while !self.data.is_empty() {
                    let byte = self.data[0];
                    if let Err(e) = stack.proto.send_oob(&mut stack.core, self.h, byte) {
                        return self.fail(stack, e);
                    }
                    self.data.advance(1);
                    self.sent += 1;
                }
                return self.finish(stack);
            }

            // Copy phase: pack into arena-sized chunks. Atomic records keep
            // header room in their first segment.
            let chunk = resid.min(space - clen);
            let mut segments = Vec::new();
            if let Some(c) = self.control.take() {
                match stack.core.arena.adopt(SegmentKind::Control, c.data.clone()) {
                    Ok(seg) => segments.push(seg),
                    Err(e) => return self.discard_and_fail(stack, segments, e),
                }
            }
            let mut off = 0;
            let mut first_data = caps.atomic;
            while off < chunk {
                let cap = if first_data {
                    SEGMENT_CAPACITY - RECORD_HEADER_ROOM
                } else {
                    SEGMENT_CAPACITY
                };
                first_data = false;
                let end = (off + cap).min(chunk);
                match stack
                    .core
                    .arena
                    .adopt(SegmentKind::Data, self.data.slice(off..end))
                {
                    Ok(seg) => segments.push(seg),
                    Err(e) => return self.discard_and_fail(stack, segments, e),
                }
                off = end;
            }
            self.data.advance(chunk);

            let record = Record::new(segments);
            if let Err(e) = stack.proto.send(&mut stack.core, self.h, record, self.addr.as_ref()) {
                return self.fail(stack, e);
            }
            self.sent += chunk;

            if self.data.is_empty() {
                return self.finish(stack);
            }
            // More to send; recompute space (and likely suspend) next pass.
        }
    }

    // ─── Exit Paths ─────────────────────────────────────────────────────

    fn finish<P: Protocol>(&mut self, stack: &mut Stack<P>) -> Result<SendStep, SockError> {
        self.release(stack);
        Ok(SendStep::Done(self.sent))
    }

    /// A record begun but not fully built is discarded whole, never
    /// partially enqueued.
    fn discard_and_fail<P: Protocol>(
        &mut self,
        stack: &mut Stack<P>,
        segments: Vec<crate::arena::Segment>,
        err: SockError,
    ) -> Result<SendStep, SockError> {
        for seg in segments {
            stack.core.arena.release(seg);
        }
        self.fail(stack, err)
    }

    fn fail<P: Protocol>(
        &mut self,
        stack: &mut Stack<P>,
        err: SockError,
    ) -> Result<SendStep, SockError> {
        self.release(stack);
        Err(err)
    }

    fn release<P: Protocol>(&mut self, stack: &mut Stack<P>) {
        if let Ok(ep) = stack.ep_mut(self.h) {
            if self.wait_registered {
                ep.snd.waiters -= 1;
                self.wait_registered = false;
            }
            if self.lock_waiting {
                ep.snd.lock_waiters -= 1;
                self.lock_waiting = false;
            }
            if self.holds_lock {
                ep.snd.unlock();
                self.holds_lock = false;
            }
        }
    }
}

// ─── Convenience ────────────────────────────────────────────────────────────

impl<P: Protocol> Stack<P> {
    /// One-pass send: completes what fits immediately. A short write
    /// reports its byte count; `WouldBlock` means zero progress.
    pub fn send(&mut self, h: EndpointHandle, data: Bytes) -> Result<usize, SockError> {
        let op = SendOp::new(h, data).with_flags(SendFlags {
            oob: false,
            dontwait: true,
        });
        self.one_pass(op)
    }

    /// One-pass addressed send (datagram style).
    pub fn send_to(
        &mut self,
        h: EndpointHandle,
        data: Bytes,
        addr: &Addr,
    ) -> Result<usize, SockError> {
        let op = SendOp::new(h, data).to_addr(addr.clone()).with_flags(SendFlags {
            oob: false,
            dontwait: true,
        });
        self.one_pass(op)
    }

    /// One-pass out-of-band send.
    pub fn send_oob(&mut self, h: EndpointHandle, data: Bytes) -> Result<usize, SockError> {
        let op = SendOp::new(h, data).with_flags(SendFlags {
            oob: true,
            dontwait: true,
        });
        self.one_pass(op)
    }

    fn one_pass(&mut self, mut op: SendOp) -> Result<usize, SockError> {
        match op.step(self) {
            Ok(SendStep::Done(n)) => Ok(n),
            Ok(SendStep::Blocked(_)) => unreachable!("dontwait send cannot suspend"),
            Err(SockError::WouldBlock) if op.bytes_sent() > 0 => Ok(op.bytes_sent()),
            Err(e) => Err(e),
        }
    }
}
