//! # Buffer Segment Arena
//!
//! Fixed-capacity chained buffer segments plus the process-wide charge
//! accounting behind them. Payload storage is `bytes::Bytes`, so a "large
//! external allocation referenced by multiple segments" is simply a shared
//! refcounted buffer: every holder keeps a private (offset, length) view and
//! the shared storage is immutable by construction. Splitting a segment never
//! copies; it narrows two views over the same allocation.
//!
//! The arena is an explicitly injected context — there is no global state.
//! Every reservation and allocation goes through one [`Arena`], and callers
//! treat allocation failure as `NoBufs`, never as something to block on.

use bytes::Bytes;

use crate::error::SockError;

/// Bytes of payload a single segment can carry.
pub const SEGMENT_CAPACITY: usize = 2048;

/// Room reserved in the first segment of an atomic record so a protocol can
/// prepend its header without reallocating.
pub const RECORD_HEADER_ROOM: usize = 64;

// ─── Segment Kinds ──────────────────────────────────────────────────────────

/// Ownership tag for a buffer segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    /// Ordinary bulk payload.
    Data,
    /// Urgent byte(s) delivered at a marked position.
    OutOfBand,
    /// Ancillary/control payload (may carry transferable rights).
    Control,
    /// Source address, leads the first record of a datagram.
    Address,
}

impl SegmentKind {
    /// Whether bytes of this kind count toward `datacc`.
    pub fn is_data(self) -> bool {
        matches!(self, SegmentKind::Data | SegmentKind::OutOfBand)
    }
}

// ─── Segment ────────────────────────────────────────────────────────────────

/// The smallest unit of queued storage: a kind tag plus a view into a
/// refcounted allocation.
#[derive(Debug, Clone)]
pub struct Segment {
    pub kind: SegmentKind,
    pub bytes: Bytes,
}

impl Segment {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Split this segment at `at`, returning the tail as a new segment.
    /// Both halves keep referencing the same underlying allocation.
    pub fn split_off(&mut self, at: usize) -> Segment {
        Segment {
            kind: self.kind,
            bytes: self.bytes.split_off(at),
        }
    }
}

// ─── Record ─────────────────────────────────────────────────────────────────

/// One logical unit of queued data: a datagram, or a chunk of a stream.
///
/// Address and control segments only ever lead a record; the record's kind is
/// the kind of its first segment.
#[derive(Debug, Clone, Default)]
pub struct Record {
    pub segments: Vec<Segment>,
}

impl Record {
    pub fn new(segments: Vec<Segment>) -> Self {
        Record { segments }
    }

    pub fn from_segment(seg: Segment) -> Self {
        Record {
            segments: vec![seg],
        }
    }

    /// Total payload length across all segments.
    pub fn len(&self) -> usize {
        self.segments.iter().map(Segment::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.iter().all(Segment::is_empty)
    }

    /// Kind of the first segment (`Data` for an empty record).
    pub fn kind(&self) -> SegmentKind {
        self.segments
            .first()
            .map(|s| s.kind)
            .unwrap_or(SegmentKind::Data)
    }

    /// Bulk bytes only (data + out-of-band), excluding control/address.
    pub fn data_len(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| s.kind.is_data())
            .map(Segment::len)
            .sum()
    }

    /// Arena charge for this record.
    pub fn charge(&self) -> usize {
        self.segments.len() * SEGMENT_CAPACITY
    }
}

// ─── Resource Limits ────────────────────────────────────────────────────────

/// Process-wide budgets for queue reservations and segment allocation.
#[derive(Debug, Clone)]
pub struct ResourceLimits {
    /// Ceiling on the summed high-water reservations of all queues.
    pub max_reserved: usize,
    /// Ceiling on outstanding segment charges.
    pub max_charge: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        ResourceLimits {
            max_reserved: 16 * 1024 * 1024,
            max_charge: 16 * 1024 * 1024,
        }
    }
}

// ─── Arena ──────────────────────────────────────────────────────────────────

/// Segment allocator with bounded capacity.
///
/// Charges are coarse: one [`SEGMENT_CAPACITY`] unit per segment, mirroring a
/// cluster allocator. Exact payload accounting lives in the queue (`cc`).
pub struct Arena {
    limits: ResourceLimits,
    charged: usize,
    reserved: usize,
}

impl Arena {
    pub fn new(limits: ResourceLimits) -> Self {
        Arena {
            limits,
            charged: 0,
            reserved: 0,
        }
    }

    /// Allocate a segment holding a copy of `data`.
    ///
    /// `data` must fit in one segment; callers pack larger transfers into
    /// multiple allocations. Fails with `NoBufs` when the charge ceiling
    /// would be crossed — never blocks.
    pub fn allocate(&mut self, kind: SegmentKind, data: &[u8]) -> Result<Segment, SockError> {
        debug_assert!(data.len() <= SEGMENT_CAPACITY);
        self.charge_one()?;
        Ok(Segment {
            kind,
            bytes: Bytes::copy_from_slice(data),
        })
    }

    /// Adopt an externally produced buffer as a segment without copying.
    ///
    /// Used by the inbound delivery path, where the transport already owns a
    /// refcounted allocation. Views longer than one segment are split by the
    /// caller.
    pub fn adopt(&mut self, kind: SegmentKind, bytes: Bytes) -> Result<Segment, SockError> {
        self.charge_one()?;
        Ok(Segment { kind, bytes })
    }

    /// Return a segment's charge to the arena.
    pub fn release(&mut self, segment: Segment) {
        drop(segment);
        self.charged = self.charged.saturating_sub(SEGMENT_CAPACITY);
    }

    /// Return one segment charge while the bytes live on elsewhere
    /// (externalized control data, consumed views handed to a caller).
    pub fn release_charge(&mut self) {
        self.charged = self.charged.saturating_sub(SEGMENT_CAPACITY);
    }

    /// Return a whole record's charges.
    pub fn release_record(&mut self, record: Record) {
        for seg in record.segments {
            self.release(seg);
        }
    }

    /// Account for a segment split: one view became two. Splits are
    /// bookkeeping-only and may transiently overshoot the ceiling.
    pub fn note_split(&mut self) {
        self.charged += SEGMENT_CAPACITY;
    }

    /// Admission control for queue resizing: move a queue's reservation from
    /// `old` to `new` bytes, rejecting if the global ceiling would be crossed.
    pub fn rereserve(&mut self, old: usize, new: usize) -> Result<(), SockError> {
        let next = self.reserved.saturating_sub(old).saturating_add(new);
        if next > self.limits.max_reserved {
            return Err(SockError::NoBufs);
        }
        self.reserved = next;
        Ok(())
    }

    /// Outstanding segment charge in bytes.
    pub fn charged(&self) -> usize {
        self.charged
    }

    /// Summed queue reservations in bytes.
    pub fn reserved(&self) -> usize {
        self.reserved
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    fn charge_one(&mut self) -> Result<(), SockError> {
        if self.charged + SEGMENT_CAPACITY > self.limits.max_charge {
            return Err(SockError::NoBufs);
        }
        self.charged += SEGMENT_CAPACITY;
        Ok(())
    }
}

impl Default for Arena {
    fn default() -> Self {
        Arena::new(ResourceLimits::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_arena() -> Arena {
        Arena::new(ResourceLimits {
            max_reserved: 8192,
            max_charge: 2 * SEGMENT_CAPACITY,
        })
    }

    #[test]
    fn allocate_and_release_balances_charge() {
        let mut arena = small_arena();
        let seg = arena.allocate(SegmentKind::Data, b"hello").unwrap();
        assert_eq!(arena.charged(), SEGMENT_CAPACITY);
        arena.release(seg);
        assert_eq!(arena.charged(), 0);
    }

    #[test]
    fn allocate_fails_at_ceiling() {
        let mut arena = small_arena();
        let _a = arena.allocate(SegmentKind::Data, b"a").unwrap();
        let _b = arena.allocate(SegmentKind::Data, b"b").unwrap();
        assert_eq!(
            arena.allocate(SegmentKind::Data, b"c").unwrap_err(),
            SockError::NoBufs
        );
    }

    #[test]
    fn rereserve_enforces_global_ceiling() {
        let mut arena = small_arena();
        arena.rereserve(0, 4096).unwrap();
        arena.rereserve(0, 4096).unwrap();
        assert_eq!(arena.rereserve(0, 1).unwrap_err(), SockError::NoBufs);
        // Shrinking an existing reservation always succeeds.
        arena.rereserve(4096, 1024).unwrap();
        assert_eq!(arena.reserved(), 5120);
    }

    #[test]
    fn segment_split_shares_storage() {
        let mut arena = Arena::default();
        let mut seg = arena
            .adopt(SegmentKind::Data, Bytes::from_static(b"abcdef"))
            .unwrap();
        let tail = seg.split_off(4);
        assert_eq!(&seg.bytes[..], b"abcd");
        assert_eq!(&tail.bytes[..], b"ef");
    }

    #[test]
    fn record_length_is_sum_of_segments() {
        let rec = Record::new(vec![
            Segment {
                kind: SegmentKind::Address,
                bytes: Bytes::from_static(b"@a"),
            },
            Segment {
                kind: SegmentKind::Data,
                bytes: Bytes::from_static(b"payload"),
            },
        ]);
        assert_eq!(rec.len(), 9);
        assert_eq!(rec.data_len(), 7);
        assert_eq!(rec.kind(), SegmentKind::Address);
    }
}
