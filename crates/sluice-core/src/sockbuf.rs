//! # Sockbuf — Endpoint Queue
//!
//! A watermark-bounded FIFO of records, one per direction of every endpoint.
//! Tracks exact byte counters, the sleep-lock that serializes long-running
//! structural access, and the splice-active flag that reroutes wakeups.
//!
//! ## Ordering discipline
//!
//! The consumer only ever removes from the head, the producer only ever
//! appends at the tail. That is what lets a short-held producer run against a
//! sleeping lock-holder without either side freeing storage the other still
//! references.
//!
//! ## Counters
//!
//! - `cc` — total queued bytes, every segment kind
//! - `datacc` — bulk bytes only (data + out-of-band)
//! - `mbcnt` — arena charge (one `SEGMENT_CAPACITY` unit per segment)
//!
//! All three are exact sums over the queued records at all times; the tests
//! and `debug_assert`s hold the implementation to that.

use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;

use crate::arena::{Arena, Record, Segment, SegmentKind, SEGMENT_CAPACITY};
use crate::error::SockError;

// ─── Stats Snapshot ─────────────────────────────────────────────────────────

/// Counter snapshot for export by the embedding layer.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub cc: usize,
    pub datacc: usize,
    pub mbcnt: usize,
    pub hiwat: usize,
    pub lowat: usize,
    pub records: usize,
}

// ─── Sockbuf ────────────────────────────────────────────────────────────────

/// One direction's queue of an endpoint.
#[derive(Debug, Default)]
pub struct Sockbuf {
    records: VecDeque<Record>,
    cc: usize,
    datacc: usize,
    mbcnt: usize,
    hiwat: usize,
    lowat: usize,
    /// Deadline for blocking waits on this queue; `None` waits forever.
    pub timeo: Option<Duration>,
    /// Sleep-lock: held by at most one long-running operation.
    locked: bool,
    /// Operations blocked on the sleep-lock.
    pub lock_waiters: u32,
    /// Flows suspended waiting for data/space on this queue.
    pub waiters: u32,
    /// This side can accept no more data (shutdown or peer gone).
    pub cant_more: bool,
    /// A splice link owns this queue; user-facing wakeups are suppressed.
    pub splice_active: bool,
}

impl Sockbuf {
    pub fn new() -> Self {
        Sockbuf::default()
    }

    // ─── Reservation & Watermarks ───────────────────────────────────────

    /// Resize the high-water mark, subject to the arena's global ceiling.
    /// The low-water mark is clamped down to the new high-water mark.
    pub fn reserve(&mut self, arena: &mut Arena, hiwat: usize) -> Result<(), SockError> {
        if hiwat == 0 {
            return Err(SockError::InvalidArgument);
        }
        arena.rereserve(self.hiwat, hiwat)?;
        self.hiwat = hiwat;
        if self.lowat > self.hiwat {
            self.lowat = self.hiwat;
        }
        Ok(())
    }

    /// Set the low-water mark; rejected if it would exceed the high-water mark.
    pub fn set_lowat(&mut self, lowat: usize) -> Result<(), SockError> {
        if lowat > self.hiwat {
            return Err(SockError::InvalidArgument);
        }
        self.lowat = lowat;
        Ok(())
    }

    pub fn hiwat(&self) -> usize {
        self.hiwat
    }

    pub fn lowat(&self) -> usize {
        self.lowat
    }

    /// Bytes of room left before the high-water mark, floored at zero.
    pub fn space_available(&self) -> usize {
        self.hiwat.saturating_sub(self.cc)
    }

    /// Overwrite this queue's occupancy with another queue's byte count.
    ///
    /// Local pair protocols keep no records on the send side; the sender's
    /// send-space is defined as the peer's remaining receive-space, so the
    /// peer's `cc` is mirrored here after every delivery and consumption.
    /// Only valid on a queue that never holds records of its own.
    pub fn mirror_occupancy(&mut self, cc: usize) {
        debug_assert!(self.records.is_empty());
        self.cc = cc;
        self.datacc = cc;
        self.mbcnt = cc.div_ceil(SEGMENT_CAPACITY) * SEGMENT_CAPACITY;
    }

    // ─── Counters ───────────────────────────────────────────────────────

    pub fn cc(&self) -> usize {
        self.cc
    }

    pub fn datacc(&self) -> usize {
        self.datacc
    }

    pub fn mbcnt(&self) -> usize {
        self.mbcnt
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            cc: self.cc,
            datacc: self.datacc,
            mbcnt: self.mbcnt,
            hiwat: self.hiwat,
            lowat: self.lowat,
            records: self.records.len(),
        }
    }

    // ─── Sleep-Lock ─────────────────────────────────────────────────────

    /// Try to take the sleep-lock. Returns `false` when another operation
    /// holds it; the caller then registers as a lock waiter and suspends.
    pub fn try_lock(&mut self) -> bool {
        if self.locked {
            return false;
        }
        self.locked = true;
        true
    }

    /// Release the sleep-lock. Must run on every exit path of a holder.
    pub fn unlock(&mut self) {
        debug_assert!(self.locked, "unlock of an unheld sockbuf lock");
        self.locked = false;
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    // ─── Append (producer side, tail only) ──────────────────────────────

    /// Enqueue a record at the tail.
    pub fn append_record(&mut self, record: Record) {
        self.add_counters(&record);
        self.records.push_back(record);
        self.debug_check();
    }

    /// Enqueue stream data, compacting into the tail record when it is plain
    /// bulk data. Record boundaries are meaningless for streams, so this keeps
    /// the record count proportional to interleaved control traffic only.
    pub fn append_stream(&mut self, record: Record) {
        self.add_counters(&record);
        match self.records.back_mut() {
            Some(tail)
                if tail.kind() == SegmentKind::Data
                    && record.kind() == SegmentKind::Data
                    && record.segments.iter().all(|s| s.kind == SegmentKind::Data) =>
            {
                tail.segments.extend(record.segments);
            }
            _ => self.records.push_back(record),
        }
        self.debug_check();
    }

    // ─── Consume (consumer side, head only) ─────────────────────────────

    pub fn front(&self) -> Option<&Record> {
        self.records.front()
    }

    /// Remove and return the first segment of the front record when it has
    /// the given kind. Used to strip leading address/control segments.
    pub fn take_front_segment(&mut self, kind: SegmentKind) -> Option<Segment> {
        let front = self.records.front_mut()?;
        if front.segments.first()?.kind != kind {
            return None;
        }
        let seg = front.segments.remove(0);
        self.cc -= seg.len();
        if seg.kind.is_data() {
            self.datacc -= seg.len();
        }
        self.mbcnt -= SEGMENT_CAPACITY;
        if front.segments.is_empty() {
            self.records.pop_front();
        }
        self.debug_check();
        Some(seg)
    }

    /// Consume up to `n` leading bulk bytes from the front record, splitting
    /// a segment in place when `n` lands inside it. Returns the consumed byte
    /// views; fully drained segments return their charge to the arena.
    ///
    /// Stops at the front record's boundary and at any non-data segment —
    /// callers loop for streams, re-stripping control as it surfaces.
    pub fn free_front(&mut self, arena: &mut Arena, n: usize) -> Vec<Bytes> {
        let mut out = Vec::new();
        let mut remaining = n;
        while remaining > 0 {
            let Some(front) = self.records.front_mut() else {
                break;
            };
            let Some(seg) = front.segments.first_mut() else {
                self.records.pop_front();
                break;
            };
            if !seg.kind.is_data() {
                break;
            }
            if seg.len() <= remaining {
                let seg = front.segments.remove(0);
                remaining -= seg.len();
                self.cc -= seg.len();
                self.datacc -= seg.len();
                self.mbcnt -= SEGMENT_CAPACITY;
                out.push(seg.bytes.clone());
                arena.release(seg);
                if front.segments.is_empty() {
                    self.records.pop_front();
                    break;
                }
            } else {
                // Split inside the segment: consumed view leaves the queue,
                // the tail stays as the (shrunk) leading segment.
                let taken = seg.bytes.split_to(remaining);
                self.cc -= taken.len();
                self.datacc -= taken.len();
                out.push(taken);
                remaining = 0;
            }
        }
        self.debug_check();
        out
    }

    /// Copy up to `n` leading bulk bytes from the front record without
    /// consuming them (peek mode).
    pub fn peek_front(&self, n: usize) -> Vec<Bytes> {
        let mut out = Vec::new();
        let mut remaining = n;
        if let Some(front) = self.records.front() {
            for seg in &front.segments {
                if remaining == 0 {
                    break;
                }
                if !seg.kind.is_data() {
                    continue;
                }
                let take = seg.len().min(remaining);
                out.push(seg.bytes.slice(..take));
                remaining -= take;
            }
        }
        out
    }

    /// Detach up to `n` bytes of leading records for the splice path,
    /// splitting the boundary record (and segment) when `n` falls inside it.
    /// Every segment kind moves; nothing is released — ownership transfers to
    /// the caller.
    pub fn detach_front(&mut self, arena: &mut Arena, n: usize) -> Vec<Record> {
        let mut out = Vec::new();
        let mut remaining = n;
        while remaining > 0 {
            let Some(front) = self.records.front() else {
                break;
            };
            let flen = front.len();
            if flen <= remaining {
                let rec = self.records.pop_front().unwrap();
                self.sub_counters(&rec);
                remaining -= flen;
                out.push(rec);
            } else {
                // Carve `remaining` bytes off the front record.
                let front = self.records.front_mut().unwrap();
                let mut carved = Vec::new();
                while remaining > 0 {
                    let seg = front.segments.first_mut().unwrap();
                    if seg.len() <= remaining {
                        let seg = front.segments.remove(0);
                        remaining -= seg.len();
                        carved.push(seg);
                    } else {
                        let mut head = seg.clone();
                        head.bytes = seg.bytes.split_to(remaining);
                        arena.note_split();
                        remaining = 0;
                        carved.push(head);
                    }
                }
                let rec = Record::new(carved);
                self.sub_counters(&rec);
                // The split head counted toward the carved record's charge,
                // but the tail segment it split from is still queued.
                self.mbcnt += SEGMENT_CAPACITY;
                out.push(rec);
            }
        }
        self.debug_check();
        out
    }

    /// Discard the remainder of the front record (datagram truncation),
    /// returning its charges to the arena.
    pub fn drop_front_record(&mut self, arena: &mut Arena) {
        if let Some(rec) = self.records.pop_front() {
            self.sub_counters(&rec);
            arena.release_record(rec);
        }
        self.debug_check();
    }

    /// Drain every queued record (queue release). The caller disposes of
    /// control records through the protocol hook before releasing charges.
    pub fn drain_all(&mut self) -> Vec<Record> {
        let drained: Vec<Record> = self.records.drain(..).collect();
        self.cc = 0;
        self.datacc = 0;
        self.mbcnt = 0;
        drained
    }

    // ─── Internal ───────────────────────────────────────────────────────

    fn add_counters(&mut self, rec: &Record) {
        self.cc += rec.len();
        self.datacc += rec.data_len();
        self.mbcnt += rec.charge();
    }

    fn sub_counters(&mut self, rec: &Record) {
        self.cc -= rec.len();
        self.datacc -= rec.data_len();
        self.mbcnt -= rec.charge();
    }

    fn debug_check(&self) {
        debug_assert_eq!(
            self.cc,
            self.records.iter().map(Record::len).sum::<usize>(),
            "cc out of sync with queued records"
        );
        debug_assert_eq!(
            self.datacc,
            self.records.iter().map(Record::data_len).sum::<usize>(),
            "datacc out of sync with queued records"
        );
        debug_assert_eq!(
            self.mbcnt,
            self.records.iter().map(Record::charge).sum::<usize>(),
            "mbcnt out of sync with queued segments"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::ResourceLimits;

    fn arena() -> Arena {
        Arena::default()
    }

    fn data_record(arena: &mut Arena, bytes: &[u8]) -> Record {
        Record::from_segment(arena.allocate(SegmentKind::Data, bytes).unwrap())
    }

    // ─── Counters ───────────────────────────────────────────────────────

    #[test]
    fn append_updates_all_counters() {
        let mut a = arena();
        let mut sb = Sockbuf::new();
        sb.reserve(&mut a, 4096).unwrap();

        sb.append_record(data_record(&mut a, b"hello"));
        assert_eq!(sb.cc(), 5);
        assert_eq!(sb.datacc(), 5);
        assert_eq!(sb.mbcnt(), SEGMENT_CAPACITY);

        let ctl = Record::from_segment(a.allocate(SegmentKind::Control, b"rights").unwrap());
        sb.append_record(ctl);
        assert_eq!(sb.cc(), 11);
        assert_eq!(sb.datacc(), 5, "control bytes are not data bytes");
    }

    #[test]
    fn free_front_inside_a_segment_splits_it() {
        let mut a = arena();
        let mut sb = Sockbuf::new();
        sb.reserve(&mut a, 4096).unwrap();
        sb.append_record(data_record(&mut a, b"abcdefgh"));

        let got = sb.free_front(&mut a, 3);
        assert_eq!(got.len(), 1);
        assert_eq!(&got[0][..], b"abc");
        assert_eq!(sb.cc(), 5);

        let rest = sb.free_front(&mut a, 16);
        assert_eq!(&rest[0][..], b"defgh");
        assert!(sb.is_empty());
        assert_eq!(sb.cc(), 0);
        assert_eq!(sb.mbcnt(), 0);
    }

    #[test]
    fn free_front_stops_at_interior_control_segment() {
        let mut a = arena();
        let mut sb = Sockbuf::new();
        sb.reserve(&mut a, 4096).unwrap();
        let rec = Record::new(vec![
            a.allocate(SegmentKind::Data, b"pre").unwrap(),
            a.allocate(SegmentKind::Control, b"rights").unwrap(),
            a.allocate(SegmentKind::Data, b"post").unwrap(),
        ]);
        sb.append_record(rec);

        let got = sb.free_front(&mut a, 32);
        let total: usize = got.iter().map(|b| b.len()).sum();
        assert_eq!(total, 3, "consumption must stop under the control segment");
        // The control segment now leads and can be stripped normally.
        let ctl = sb.take_front_segment(SegmentKind::Control).unwrap();
        assert_eq!(&ctl.bytes[..], b"rights");
        let rest = sb.free_front(&mut a, 32);
        assert_eq!(&rest[0][..], b"post");
    }

    #[test]
    fn free_front_stops_at_record_boundary() {
        let mut a = arena();
        let mut sb = Sockbuf::new();
        sb.reserve(&mut a, 4096).unwrap();
        sb.append_record(data_record(&mut a, b"one"));
        sb.append_record(data_record(&mut a, b"two"));

        let got = sb.free_front(&mut a, 10);
        let total: usize = got.iter().map(|b| b.len()).sum();
        assert_eq!(total, 3, "consumption must not cross the record boundary");
        assert_eq!(sb.cc(), 3);
    }

    #[test]
    fn append_stream_compacts_into_tail() {
        let mut a = arena();
        let mut sb = Sockbuf::new();
        sb.reserve(&mut a, 4096).unwrap();
        sb.append_stream(data_record(&mut a, b"aaa"));
        sb.append_stream(data_record(&mut a, b"bbb"));
        assert_eq!(sb.record_count(), 1);
        assert_eq!(sb.cc(), 6);

        let got = sb.free_front(&mut a, 6);
        let joined: Vec<u8> = got.iter().flat_map(|b| b.iter().copied()).collect();
        assert_eq!(joined, b"aaabbb");
    }

    // ─── Reservation ────────────────────────────────────────────────────

    #[test]
    fn reserve_rejected_past_global_ceiling() {
        let mut a = Arena::new(ResourceLimits {
            max_reserved: 4096,
            max_charge: 1 << 20,
        });
        let mut sb = Sockbuf::new();
        sb.reserve(&mut a, 4096).unwrap();
        let mut sb2 = Sockbuf::new();
        assert_eq!(sb2.reserve(&mut a, 1).unwrap_err(), SockError::NoBufs);
    }

    #[test]
    fn lowat_cannot_exceed_hiwat() {
        let mut a = arena();
        let mut sb = Sockbuf::new();
        sb.reserve(&mut a, 1024).unwrap();
        assert!(sb.set_lowat(1024).is_ok());
        assert_eq!(sb.set_lowat(1025).unwrap_err(), SockError::InvalidArgument);

        // Shrinking hiwat clamps an existing lowat.
        sb.set_lowat(1000).unwrap();
        sb.reserve(&mut a, 512).unwrap();
        assert_eq!(sb.lowat(), 512);
    }

    // ─── Detach (splice path) ───────────────────────────────────────────

    #[test]
    fn detach_front_splits_boundary_record() {
        let mut a = arena();
        let mut sb = Sockbuf::new();
        sb.reserve(&mut a, 4096).unwrap();
        sb.append_record(data_record(&mut a, b"0123456789"));

        let moved = sb.detach_front(&mut a, 4);
        assert_eq!(moved.len(), 1);
        assert_eq!(moved[0].len(), 4);
        assert_eq!(sb.cc(), 6);

        let rest = sb.free_front(&mut a, 6);
        let joined: Vec<u8> = rest.iter().flat_map(|b| b.iter().copied()).collect();
        assert_eq!(joined, b"456789");
    }

    #[test]
    fn detach_front_moves_whole_records_first() {
        let mut a = arena();
        let mut sb = Sockbuf::new();
        sb.reserve(&mut a, 4096).unwrap();
        sb.append_record(data_record(&mut a, b"aa"));
        sb.append_record(data_record(&mut a, b"bb"));
        sb.append_record(data_record(&mut a, b"cc"));

        let moved = sb.detach_front(&mut a, 5);
        let total: usize = moved.iter().map(Record::len).sum();
        assert_eq!(total, 5);
        assert_eq!(sb.cc(), 1);
    }

    // ─── Lock ───────────────────────────────────────────────────────────

    #[test]
    fn sleep_lock_is_exclusive() {
        let mut sb = Sockbuf::new();
        assert!(sb.try_lock());
        assert!(!sb.try_lock());
        sb.unlock();
        assert!(sb.try_lock());
    }

    #[test]
    fn space_floors_at_zero() {
        let mut a = arena();
        let mut sb = Sockbuf::new();
        sb.reserve(&mut a, 4).unwrap();
        sb.append_record(data_record(&mut a, b"abcdef"));
        assert_eq!(sb.space_available(), 0);
    }
}
