//! # Receive Engine
//!
//! Copies queued bytes out to a caller, handling leading address and control
//! records, out-of-band extraction, peek mode, datagram truncation, and the
//! blocking rules around the low-water mark.
//!
//! Like sending, receiving is a resumable operation: [`RecvOp::step`] runs
//! until it can hand back a result, fail, or must suspend for data. The
//! receive queue's sleep-lock is held across suspensions and released on
//! every exit path.

use bytes::{Bytes, BytesMut};
use quanta::Instant;
use tracing::trace;

use crate::arena::SegmentKind;
use crate::endpoint::{EndpointHandle, EndpointState};
use crate::error::SockError;
use crate::proto::{Addr, ControlMsg, Protocol};
use crate::stack::{Stack, WaitKind};

// ─── Flags & Result ─────────────────────────────────────────────────────────

/// Per-call receive flags.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecvFlags {
    /// Copy without consuming. Peeks never externalize control records.
    pub peek: bool,
    /// Fetch the pending out-of-band byte instead of ordinary data.
    pub oob: bool,
    /// Keep re-blocking until the full request is satisfied (or EOF/error).
    pub waitall: bool,
    /// Never suspend, even on a blocking endpoint.
    pub dontwait: bool,
    /// Caller supplied a control sink; queued control records are
    /// externalized instead of disposed.
    pub want_control: bool,
}

/// What a completed receive produced.
#[derive(Debug, Default)]
pub struct RecvResult {
    pub data: Bytes,
    pub addr: Option<Addr>,
    pub control: Vec<ControlMsg>,
    /// A datagram was larger than the caller's buffer; the rest was dropped.
    pub truncated: bool,
    /// The read stopped exactly at the out-of-band mark.
    pub at_mark: bool,
    /// The queue is closed and drained.
    pub eof: bool,
}

/// Outcome of one [`RecvOp::step`] call.
#[derive(Debug)]
pub enum RecvStep {
    Done(RecvResult),
    Blocked(WaitKind),
}

// ─── RecvOp ─────────────────────────────────────────────────────────────────

/// A resumable receive operation.
#[derive(Debug)]
pub struct RecvOp {
    h: EndpointHandle,
    cap: usize,
    flags: RecvFlags,
    collected: BytesMut,
    addr: Option<Addr>,
    control: Vec<ControlMsg>,
    truncated: bool,
    holds_lock: bool,
    lock_waiting: bool,
    wait_registered: bool,
    wait_started: Option<Instant>,
    interrupted: bool,
}

impl RecvOp {
    pub fn new(h: EndpointHandle, cap: usize) -> Self {
        RecvOp {
            h,
            cap,
            flags: RecvFlags::default(),
            collected: BytesMut::new(),
            addr: None,
            control: Vec::new(),
            truncated: false,
            holds_lock: false,
            lock_waiting: false,
            wait_registered: false,
            wait_started: None,
            interrupted: false,
        }
    }

    pub fn with_flags(mut self, flags: RecvFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Bytes collected so far (partial progress under `Interrupted`).
    pub fn bytes_received(&self) -> usize {
        self.collected.len()
    }

    /// Cancel a suspended operation; the next `step` returns `Interrupted`.
    pub fn interrupt(&mut self) {
        self.interrupted = true;
    }

    /// Run the receive until a result is ready, an error fires, or the
    /// operation must suspend for data.
    pub fn step<P: Protocol>(&mut self, stack: &mut Stack<P>) -> Result<RecvStep, SockError> {
        if self.interrupted {
            self.release(stack);
            return Err(SockError::Interrupted);
        }
        let caps = stack.proto.caps();

        // Out-of-band short-circuit: independent of ordinary flow and of the
        // sleep-lock.
        if self.flags.oob {
            let byte = stack
                .proto
                .recv_oob(&mut stack.core, self.h, self.flags.peek)?;
            let mut res = RecvResult::default();
            res.data = Bytes::copy_from_slice(&[byte]);
            return Ok(RecvStep::Done(res));
        }

        if !self.holds_lock {
            let ep = stack.ep_mut(self.h)?;
            if ep.rcv.try_lock() {
                self.holds_lock = true;
                if self.lock_waiting {
                    ep.rcv.lock_waiters -= 1;
                    self.lock_waiting = false;
                }
            } else if ep.nonblocking || self.flags.dontwait {
                return Err(SockError::WouldBlock);
            } else {
                if !self.lock_waiting {
                    ep.rcv.lock_waiters += 1;
                    self.lock_waiting = true;
                }
                return Ok(RecvStep::Blocked(WaitKind::RecvLock));
            }
        }

        loop {
            let (cc, cant, pending_err, state, nonblocking, lowat, timeo) = {
                let ep = stack.ep(self.h)?;
                (
                    ep.rcv.cc(),
                    ep.rcv.cant_more,
                    ep.error,
                    ep.state,
                    ep.nonblocking,
                    ep.rcv.lowat(),
                    ep.rcv.timeo,
                )
            };

            let want = self.cap - self.collected.len();
            let enough = cc > 0
                && (cc >= want || cc >= lowat.max(1))
                && !(self.flags.waitall && cc < want);

            if !enough {
                if !self.collected.is_empty() && !self.flags.waitall {
                    // Partial progress beats waiting for more.
                    return self.finish(stack);
                }
                if cc > 0 && (cant || pending_err.is_some()) {
                    // The queue can never fill further; deliver what it holds.
                } else if cc == 0 && !self.collected.is_empty() {
                    // waitall ran into EOF, an error, or an empty queue with
                    // a partial result in hand.
                    if cant || pending_err.is_some() || nonblocking || self.flags.dontwait {
                        return self.finish(stack);
                    }
                    return self.suspend(stack, nonblocking, timeo);
                } else if cc == 0 {
                    if let Some(err) = pending_err {
                        if !self.flags.peek {
                            stack.ep_mut(self.h)?.error = None;
                        }
                        return self.fail(stack, err);
                    }
                    if cant {
                        return self.finish(stack);
                    }
                    if caps.connection_required
                        && matches!(
                            state,
                            EndpointState::Created | EndpointState::Bound | EndpointState::Listening
                        )
                    {
                        return self.fail(stack, SockError::NotConnected);
                    }
                    return self.suspend(stack, nonblocking, timeo);
                } else {
                    return self.suspend(stack, nonblocking, timeo);
                }
            }

            // Progressing: leave the wait roster.
            if self.wait_registered {
                stack.ep_mut(self.h)?.rcv.waiters -= 1;
                self.wait_registered = false;
                self.wait_started = None;
            }

            let consumed = self.copy_phase(stack, caps.addresses, caps.atomic)?;

            if consumed > 0 && !self.flags.peek {
                stack.proto.rcvd(&mut stack.core, self.h);
            }

            // One record per call for datagrams; peeks never loop.
            if caps.atomic || self.flags.peek {
                return self.finish(stack);
            }
            if self.cap == self.collected.len() {
                return self.finish(stack);
            }
            let ep = stack.ep(self.h)?;
            if ep.at_mark && ep.oob_mark == 0 {
                // Stop at the out-of-band mark; the caller resumes past it.
                return self.finish(stack);
            }
            if ep.rcv.cc() == 0 && !self.flags.waitall {
                return self.finish(stack);
            }
            // More queued stream data, or waitall heading back into the wait
            // decision.
        }
    }

    // ─── Copy Phase ─────────────────────────────────────────────────────

    /// Strip leading address/control segments, then copy bulk bytes from the
    /// front record. Returns bulk bytes consumed (0 in peek mode).
    fn copy_phase<P: Protocol>(
        &mut self,
        stack: &mut Stack<P>,
        addresses: bool,
        atomic: bool,
    ) -> Result<usize, SockError> {
        let mut pending_control: Vec<crate::arena::Segment> = Vec::new();
        let mut consumed = 0usize;

        {
            let core = &mut stack.core;
            let ep = core.eps.get_mut(self.h).ok_or(SockError::InvalidArgument)?;

            if self.flags.peek {
                if addresses {
                    if let Some(front) = ep.rcv.front() {
                        if let Some(seg) = front.segments.first() {
                            if seg.kind == SegmentKind::Address {
                                self.addr = Some(Addr(
                                    String::from_utf8_lossy(&seg.bytes).into_owned(),
                                ));
                            }
                        }
                    }
                }
                let want = self.cap - self.collected.len();
                for b in ep.rcv.peek_front(want) {
                    self.collected.extend_from_slice(&b);
                }
                if let Some(front) = ep.rcv.front() {
                    if atomic && front.data_len() > self.cap {
                        self.truncated = true;
                    }
                }
                return Ok(0);
            }

            // Strip the leading address record.
            if addresses {
                if let Some(seg) = ep.rcv.take_front_segment(SegmentKind::Address) {
                    self.addr = Some(Addr(String::from_utf8_lossy(&seg.bytes).into_owned()));
                    core.arena.release_charge();
                }
            }
            // Strip leading control segments.
            while let Some(seg) = ep.rcv.take_front_segment(SegmentKind::Control) {
                core.arena.release_charge();
                pending_control.push(seg);
            }

            // Bulk copy, bounded by the out-of-band mark.
            let mut want = self.cap - self.collected.len();
            if ep.oob_mark > 0 {
                want = want.min(ep.oob_mark);
            }
            let front_data = ep.rcv.front().map(|r| r.data_len()).unwrap_or(0);
            let n = want.min(front_data);
            if n > 0 {
                let was_at_mark = ep.at_mark && ep.oob_mark == 0;
                // The consume may stop short of `n` at an interior control
                // segment; only what actually came out counts.
                for b in ep.rcv.free_front(&mut core.arena, n) {
                    consumed += b.len();
                    self.collected.extend_from_slice(&b);
                }
                if ep.oob_mark > 0 {
                    ep.oob_mark -= consumed;
                    ep.at_mark = ep.oob_mark == 0;
                } else if was_at_mark && consumed > 0 {
                    // Read moved past the mark.
                    ep.at_mark = false;
                }
            }

            // An oversized datagram loses its tail; the caller sees the flag.
            if atomic && n < front_data {
                ep.rcv.drop_front_record(&mut core.arena);
                self.truncated = true;
            }
        }

        // Externalize or dispose stripped control records outside the
        // endpoint borrow.
        for seg in pending_control {
            if self.flags.want_control {
                let msg = stack.proto.externalize_control(&mut stack.core, seg);
                self.control.push(msg);
            } else {
                stack.proto.dispose_control(&mut stack.core, seg);
            }
        }
        Ok(consumed)
    }

    // ─── Exit Paths ─────────────────────────────────────────────────────

    fn suspend<P: Protocol>(
        &mut self,
        stack: &mut Stack<P>,
        nonblocking: bool,
        timeo: Option<std::time::Duration>,
    ) -> Result<RecvStep, SockError> {
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
            ep.rcv.waiters += 1;
            self.wait_registered = true;
        }
        trace!(endpoint = self.h.0, "receive suspended on data");
        Ok(RecvStep::Blocked(WaitKind::RecvData))
    }

    fn finish<P: Protocol>(&mut self, stack: &mut Stack<P>) -> Result<RecvStep, SockError> {
        let (at_mark, eof) = {
            let ep = stack.ep(self.h)?;
            (
                ep.at_mark && ep.oob_mark == 0,
                ep.rcv.cant_more && ep.rcv.cc() == 0,
            )
        };
        self.release(stack);
        let mut res = std::mem::take(self).into_result();
        res.at_mark = at_mark;
        res.eof = eof;
        Ok(RecvStep::Done(res))
    }

    fn fail<P: Protocol>(
        &mut self,
        stack: &mut Stack<P>,
        err: SockError,
    ) -> Result<RecvStep, SockError> {
        self.release(stack);
        Err(err)
    }

    fn release<P: Protocol>(&mut self, stack: &mut Stack<P>) {
        if let Ok(ep) = stack.ep_mut(self.h) {
            if self.wait_registered {
                ep.rcv.waiters -= 1;
                self.wait_registered = false;
            }
            if self.lock_waiting {
                ep.rcv.lock_waiters -= 1;
                self.lock_waiting = false;
            }
            if self.holds_lock {
                ep.rcv.unlock();
                self.holds_lock = false;
            }
        }
    }

    fn into_result(self) -> RecvResult {
        RecvResult {
            data: self.collected.freeze(),
            addr: self.addr,
            control: self.control,
            truncated: self.truncated,
            at_mark: false,
            eof: false,
        }
    }
}

impl Default for RecvOp {
    fn default() -> Self {
        RecvOp::new(EndpointHandle(usize::MAX), 0)
    }
}

// ─── Convenience ────────────────────────────────────────────────────────────

impl<P: Protocol> Stack<P> {
    /// One-pass receive: returns what is immediately available, or
    /// `WouldBlock` on an empty, still-open queue.
    pub fn recv(&mut self, h: EndpointHandle, cap: usize) -> Result<RecvResult, SockError> {
        let mut op = RecvOp::new(h, cap).with_flags(RecvFlags {
            dontwait: true,
            ..RecvFlags::default()
        });
        match op.step(self)? {
            RecvStep::Done(res) => Ok(res),
            RecvStep::Blocked(_) => unreachable!("dontwait receive cannot suspend"),
        }
    }

    /// One-pass out-of-band fetch.
    pub fn recv_oob(&mut self, h: EndpointHandle, peek: bool) -> Result<u8, SockError> {
        let mut op = RecvOp::new(h, 1).with_flags(RecvFlags {
            oob: true,
            peek,
            dontwait: true,
            ..RecvFlags::default()
        });
        match op.step(self)? {
            RecvStep::Done(res) => Ok(res.data[0]),
            RecvStep::Blocked(_) => unreachable!("oob fetch cannot suspend"),
        }
    }
}
