//! # Splice Engine
//!
//! Forwards bytes from one endpoint's receive queue directly into another
//! endpoint's send path, with an optional total-byte budget and an optional
//! idle timeout. A link is a single directed edge; an endpoint sources at
//! most one link and drains at most one.
//!
//! While a link is active, both involved queues are splice-active: user
//! wakeups on them are suppressed and replaced by splice-pump events naming
//! the link's source. The embedder feeds those events into
//! [`Stack::splice_pump`]. The idle timer is poll-driven: call
//! [`Stack::check_splice_idle`] from the embedder's clock.

use std::time::Duration;

use quanta::Instant;
use tracing::{debug, trace};

use crate::arena::{Record, Segment, SegmentKind};
use crate::endpoint::EndpointHandle;
use crate::error::SockError;
use crate::proto::Protocol;
use crate::stack::Stack;

// ─── Link ───────────────────────────────────────────────────────────────────

/// Lifecycle of a splice link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpliceState {
    /// Forwarding normally.
    Active,
    /// Source is closed for receive; the queued remainder still drains.
    Draining,
    /// Link dissolved; the endpoints are ordinary again.
    TornDown,
}

/// A directed splice edge, stored on the source endpoint.
#[derive(Debug, Clone)]
pub struct SpliceLink {
    pub drain: EndpointHandle,
    /// Total-byte cap; `None` forwards until EOF or error.
    pub budget: Option<u64>,
    /// Bytes forwarded so far.
    pub moved: u64,
    pub idle: Option<Duration>,
    pub last_activity: Instant,
    pub state: SpliceState,
}

impl SpliceLink {
    fn budget_left(&self) -> u64 {
        match self.budget {
            Some(b) => b.saturating_sub(self.moved),
            None => u64::MAX,
        }
    }
}

/// Outcome of one forwarding pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveOutcome {
    /// Bytes were forwarded (possibly zero); the link remains up.
    Continue(usize),
    /// The pass ended the link (budget reached, EOF, or error).
    Done,
}

// ─── Engine ─────────────────────────────────────────────────────────────────

impl<P: Protocol> Stack<P> {
    /// Establish a splice link from `src`'s receive queue into `drain`'s
    /// send path. One synchronous forwarding pass runs before the queues
    /// are marked splice-active, so immediate failures surface here.
    pub fn splice(
        &mut self,
        src: EndpointHandle,
        drain: EndpointHandle,
        max_bytes: Option<u64>,
        idle: Option<Duration>,
    ) -> Result<(), SockError> {
        {
            let s = self.ep(src)?;
            let d = self.ep(drain)?;
            if s.splice_to.is_some() || d.splice_from.is_some() {
                return Err(SockError::Busy);
            }
            if matches!(d.state, crate::endpoint::EndpointState::Listening) {
                return Err(SockError::OpNotSupported);
            }
            if !s.is_connected() || !d.is_connected() {
                return Err(SockError::NotConnected);
            }
        }

        {
            let ep = self.ep_mut(src)?;
            ep.splice_to = Some(SpliceLink {
                drain,
                budget: max_bytes,
                moved: 0,
                idle,
                last_activity: Instant::now(),
                state: SpliceState::Active,
            });
            ep.refs += 1;
        }
        {
            let d = self.ep_mut(drain)?;
            d.splice_from = Some(src);
            d.refs += 1;
        }
        debug!(
            source = src.0,
            drain = drain.0,
            budget = ?max_bytes,
            "splice link established"
        );

        // First pass runs with user wakeups still live; callers see an
        // immediate error instead of a silently dead link.
        match self.move_once(src) {
            Ok(MoveOutcome::Done) => return Ok(()),
            Ok(MoveOutcome::Continue(_)) => {}
            Err(err) => {
                self.unsplice(src, false)?;
                return Err(err);
            }
        }

        let ep = self.ep_mut(src)?;
        ep.rcv.splice_active = true;
        let d = self.ep_mut(drain)?;
        d.snd.splice_active = true;
        Ok(())
    }

    /// Dissolve the link sourced at `src`. `notify` wakes any ordinary
    /// readers blocked on the source's receive queue.
    pub fn unsplice(&mut self, src: EndpointHandle, notify: bool) -> Result<(), SockError> {
        let drain = {
            let ep = self.ep_mut(src)?;
            let Some(link) = ep.splice_to.take() else {
                return Err(SockError::InvalidArgument);
            };
            ep.rcv.splice_active = false;
            ep.refs = ep.refs.saturating_sub(1);
            link.drain
        };
        if let Some(d) = self.core.eps.get_mut(drain) {
            d.snd.splice_active = false;
            d.splice_from = None;
            d.refs = d.refs.saturating_sub(1);
        }
        debug!(source = src.0, drain = drain.0, "splice link torn down");
        if notify {
            self.core.wake_readable(src);
        }
        self.try_free(src);
        self.try_free(drain);
        Ok(())
    }

    /// Run forwarding passes for the link sourced at `src` until no further
    /// progress is possible. This is the handler for splice-pump events.
    pub fn splice_pump(&mut self, src: EndpointHandle) -> Result<(), SockError> {
        loop {
            match self.move_once(src)? {
                MoveOutcome::Done => return Ok(()),
                MoveOutcome::Continue(0) => return Ok(()),
                MoveOutcome::Continue(_) => {}
            }
        }
    }

    /// One forwarding pass: lift bytes out of the source's receive queue and
    /// hand them to the drain's send path, honoring the drain's space, the
    /// remaining budget, and out-of-band ordering.
    pub fn move_once(&mut self, src: EndpointHandle) -> Result<MoveOutcome, SockError> {
        let (drain, budget_left) = {
            let ep = self.ep(src)?;
            let Some(link) = ep.splice_to.as_ref() else {
                return Ok(MoveOutcome::Done);
            };
            if link.state == SpliceState::TornDown {
                return Ok(MoveOutcome::Done);
            }
            (link.drain, link.budget_left())
        };

        // Teardown conditions checked before moving anything.
        let (src_err, src_cant, src_cc) = {
            let ep = self.ep(src)?;
            (ep.error, ep.rcv.cant_more, ep.rcv.cc())
        };
        let (drain_err, drain_cant, drain_space) = {
            let d = self.ep(drain)?;
            (d.error, d.snd.cant_more, d.snd.space_available())
        };
        if src_err.is_some() || drain_err.is_some() || drain_cant {
            self.unsplice(src, true)?;
            return Ok(MoveOutcome::Done);
        }
        if budget_left == 0 {
            self.unsplice(src, true)?;
            return Ok(MoveOutcome::Done);
        }
        if src_cant && src_cc == 0 {
            // EOF: the queue drained dry with no producer left.
            self.unsplice(src, true)?;
            return Ok(MoveOutcome::Done);
        }
        if src_cant {
            if let Some(link) = self.ep_mut(src)?.splice_to.as_mut() {
                link.state = SpliceState::Draining;
            }
        }

        let len = src_cc
            .min(drain_space)
            .min(usize::try_from(budget_left).unwrap_or(usize::MAX));
        if len == 0 {
            return Ok(MoveOutcome::Continue(0));
        }

        // Lift whole records (splitting the boundary segment) out of the
        // source, then tell the source protocol its window opened.
        let records = {
            let core = &mut self.core;
            let ep = core.eps.get_mut(src).ok_or(SockError::InvalidArgument)?;
            ep.rcv.detach_front(&mut core.arena, len)
        };
        self.proto.rcvd(&mut self.core, src);
        trace!(source = src.0, drain = drain.0, bytes = len, "splice move");

        // Re-inject out-of-band bytes individually at their original
        // relative positions; everything else forwards as bulk.
        let mut bulk: Vec<Segment> = Vec::new();
        let forward_err = (|| -> Result<(), SockError> {
            for record in records {
                for seg in record.segments {
                    if seg.kind == SegmentKind::OutOfBand {
                        self.flush_bulk(drain, &mut bulk)?;
                        for &byte in seg.bytes.iter() {
                            self.proto.send_oob(&mut self.core, drain, byte)?;
                        }
                        self.core.arena.release(seg);
                    } else {
                        bulk.push(seg);
                    }
                }
                // Record boundaries carry meaning (leading control and
                // address segments); each source record becomes at most one
                // drain-side send, never part of a merged run.
                self.flush_bulk(drain, &mut bulk)?;
            }
            Ok(())
        })();

        if let Err(err) = forward_err {
            // Anything the engine failed to hand over is gone; charge it
            // back and surface the failure on the source.
            for seg in bulk {
                self.core.arena.release(seg);
            }
            self.core.defer_error(src, err);
            self.unsplice(src, true)?;
            return Ok(MoveOutcome::Done);
        }

        let depleted = {
            let ep = self.ep_mut(src)?;
            let Some(link) = ep.splice_to.as_mut() else {
                return Ok(MoveOutcome::Done);
            };
            link.moved += len as u64;
            link.last_activity = Instant::now();
            link.budget_left() == 0
        };
        if depleted {
            self.unsplice(src, true)?;
            return Ok(MoveOutcome::Done);
        }
        let ep = self.ep(src)?;
        if ep.rcv.cant_more && ep.rcv.cc() == 0 {
            self.unsplice(src, true)?;
            return Ok(MoveOutcome::Done);
        }
        Ok(MoveOutcome::Continue(len))
    }

    fn flush_bulk(
        &mut self,
        drain: EndpointHandle,
        bulk: &mut Vec<Segment>,
    ) -> Result<(), SockError> {
        if bulk.is_empty() {
            return Ok(());
        }
        let record = Record::new(std::mem::take(bulk));
        self.proto.send(&mut self.core, drain, record, None)
    }

    /// Poll-driven idle sweep: tear down any link whose idle timeout has
    /// elapsed, recording `TimedOut` as the source's deferred error.
    pub fn check_splice_idle(&mut self) {
        let expired: Vec<EndpointHandle> = self
            .core
            .eps
            .handles()
            .filter(|&h| {
                self.core
                    .eps
                    .get(h)
                    .and_then(|ep| ep.splice_to.as_ref())
                    .map(|link| {
                        link.state != SpliceState::TornDown
                            && link
                                .idle
                                .map(|t| link.last_activity.elapsed() >= t)
                                .unwrap_or(false)
                    })
                    .unwrap_or(false)
            })
            .collect();
        for src in expired {
            debug!(source = src.0, "splice idle timeout");
            self.core.defer_error(src, SockError::TimedOut);
            let _ = self.unsplice(src, true);
        }
    }

    /// Bytes forwarded so far by the link sourced at `src`.
    pub fn splice_moved(&self, src: EndpointHandle) -> Option<u64> {
        self.ep(src).ok()?.splice_to.as_ref().map(|l| l.moved)
    }

    /// Whether `src` currently sources an active link.
    pub fn is_spliced(&self, src: EndpointHandle) -> bool {
        self.ep(src)
            .map(|ep| ep.splice_to.is_some())
            .unwrap_or(false)
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_left_saturates() {
        let link = SpliceLink {
            drain: EndpointHandle(0),
            budget: Some(10),
            moved: 25,
            idle: None,
            last_activity: Instant::now(),
            state: SpliceState::Active,
        };
        assert_eq!(link.budget_left(), 0);
    }

    #[test]
    fn unbounded_budget_never_depletes() {
        let link = SpliceLink {
            drain: EndpointHandle(0),
            budget: None,
            moved: u64::MAX - 1,
            idle: None,
            last_activity: Instant::now(),
            state: SpliceState::Active,
        };
        assert_eq!(link.budget_left(), u64::MAX);
    }
}
