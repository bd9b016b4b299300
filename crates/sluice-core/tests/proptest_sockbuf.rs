//! Property-based tests for queue byte accounting.
//!
//! Model-checks the counter invariant: over arbitrary interleavings of
//! appends and consumptions, `cc` and `datacc` always equal the exact byte
//! content of the queue, and the arena's outstanding charge never leaks.

use bytes::Bytes;
use proptest::prelude::*;

use sluice_core::arena::{Arena, Record, Segment, SegmentKind};
use sluice_core::sockbuf::Sockbuf;
use sluice_core::{ResourceLimits, SEGMENT_CAPACITY};

// ─── Operations ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Op {
    /// Append a run of stream bytes (compacted into the data tail).
    Append(Vec<u8>),
    /// Consume up to this many leading bytes.
    Free(usize),
    /// Discard the whole front record.
    DropFront,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        prop::collection::vec(any::<u8>(), 1..5000).prop_map(Op::Append),
        (0usize..6000).prop_map(Op::Free),
        Just(Op::DropFront),
    ]
}

/// Pack a byte run into a record of segment-sized chunks.
fn build_record(arena: &mut Arena, data: &[u8]) -> Option<Record> {
    let mut segments: Vec<Segment> = Vec::new();
    for chunk in data.chunks(SEGMENT_CAPACITY) {
        match arena.allocate(SegmentKind::Data, chunk) {
            Ok(seg) => segments.push(seg),
            Err(_) => {
                for seg in segments {
                    arena.release(seg);
                }
                return None;
            }
        }
    }
    Some(Record::new(segments))
}

// ─── Counter Invariant ───────────────────────────────────────────────────────

proptest! {
    /// After every operation, `cc`/`datacc` match a simple byte-queue model
    /// and consumed bytes come back in order.
    #[test]
    fn counters_match_model(ops in prop::collection::vec(op_strategy(), 1..64)) {
        let mut arena = Arena::new(ResourceLimits::default());
        let mut sb = Sockbuf::new();
        sb.reserve(&mut arena, 1 << 20).unwrap();

        // Model: the exact byte content, with record boundaries flattened
        // away (appends here are all stream data, so the queue compacts
        // into a single data tail).
        let mut model: Vec<u8> = Vec::new();

        for op in ops {
            match op {
                Op::Append(data) => {
                    if let Some(record) = build_record(&mut arena, &data) {
                        sb.append_stream(record);
                        model.extend_from_slice(&data);
                    }
                }
                Op::Free(n) => {
                    let taken: Vec<u8> = sb
                        .free_front(&mut arena, n)
                        .iter()
                        .flat_map(|b| b.iter().copied())
                        .collect();
                    let expect: Vec<u8> = model.drain(..taken.len()).collect();
                    prop_assert_eq!(taken, expect);
                }
                Op::DropFront => {
                    sb.drop_front_record(&mut arena);
                    model.clear();
                }
            }
            prop_assert_eq!(sb.cc(), model.len());
            prop_assert_eq!(sb.datacc(), model.len());
            prop_assert!(sb.mbcnt() >= sb.cc());
        }

        // Draining everything returns every charge to the arena.
        let before = arena.charged();
        let len = sb.cc();
        sb.free_front(&mut arena, len);
        prop_assert_eq!(sb.cc(), 0);
        prop_assert!(arena.charged() <= before);
    }
}

proptest! {
    /// A consume of `n` bytes takes exactly `min(n, queued)` when the queue
    /// holds a single stream record.
    #[test]
    fn free_front_takes_exact_prefix(len in 1usize..4000, n in 0usize..8000) {
        let mut arena = Arena::new(ResourceLimits::default());
        let mut sb = Sockbuf::new();
        sb.reserve(&mut arena, 1 << 20).unwrap();

        let data: Vec<u8> = (0..len).map(|i| (i % 256) as u8).collect();
        let record = build_record(&mut arena, &data).unwrap();
        sb.append_stream(record);

        let taken: usize = sb.free_front(&mut arena, n).iter().map(Bytes::len).sum();
        prop_assert_eq!(taken, n.min(len));
        prop_assert_eq!(sb.cc(), len - n.min(len));
    }
}
