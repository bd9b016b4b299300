//! # Integration tests: endpoints, engines, and splice links end to end
//!
//! These tests drive the full vertical stack over the loopback protocols:
//! Send Engine → queue accounting → Receive Engine, and the splice path
//! from inbound delivery through forwarding into a drain's peer.
//!
//! No threads and no I/O — blocking shows up as `Blocked` steps, and the
//! tests play the embedder: drain wakeup events, pump splices, re-step
//! suspended operations.

use std::thread;
use std::time::Duration;

use bytes::Bytes;
use sluice_core::loopback::{LoopbackDgram, LoopbackStream};
use sluice_core::recv::{RecvFlags, RecvOp, RecvStep};
use sluice_core::send::{SendFlags, SendOp, SendStep};
use sluice_core::stack::{SockOption, Stack, WaitKind};
use sluice_core::{Addr, ControlMsg, EndpointHandle, ShutdownDirection, SockError};

// ─── Helpers ────────────────────────────────────────────────────────────────

fn stream_pair() -> (Stack<LoopbackStream>, EndpointHandle, EndpointHandle) {
    let mut stack = Stack::new(LoopbackStream::new());
    let a = stack.socket().unwrap();
    let b = stack.socket().unwrap();
    stack.connect2(a, b).unwrap();
    (stack, a, b)
}

/// Service every pending splice-pump event until the queue of events runs dry.
fn pump_splices(stack: &mut Stack<LoopbackStream>) {
    loop {
        let events = stack.take_events();
        if events.is_empty() {
            return;
        }
        for ev in events {
            if ev.splice_pump {
                stack.splice_pump(ev.endpoint).unwrap();
            }
        }
    }
}

// ─── Scenario A: blocking send across a small watermark ─────────────────────

#[test]
fn blocking_send_crosses_small_watermark() {
    let (mut stack, a, b) = stream_pair();
    stack.set_option(a, SockOption::SendBuf(4096)).unwrap();
    stack.set_option(a, SockOption::RecvBuf(4096)).unwrap();
    stack.set_option(b, SockOption::SendBuf(4096)).unwrap();
    stack.set_option(b, SockOption::RecvBuf(4096)).unwrap();

    let payload: Vec<u8> = (0..6000u32).map(|i| (i % 251) as u8).collect();
    let mut op = SendOp::new(a, Bytes::from(payload.clone()));

    let mut received = Vec::new();
    let mut blocks = 0;
    loop {
        match op.step(&mut stack).unwrap() {
            SendStep::Done(n) => {
                assert_eq!(n, 6000);
                break;
            }
            SendStep::Blocked(kind) => {
                assert_eq!(kind, WaitKind::SendSpace);
                blocks += 1;
                assert!(blocks < 16, "send never completed");
                // Play the reader: drain the peer so the writer can resume.
                let res = stack.recv(b, 8192).unwrap();
                received.extend_from_slice(&res.data);
                stack.take_events();
            }
        }
    }
    assert!(blocks >= 1, "6000 bytes over a 4096 watermark must block");

    loop {
        match stack.recv(b, 8192) {
            Ok(res) => received.extend_from_slice(&res.data),
            Err(SockError::WouldBlock) => break,
            Err(e) => panic!("unexpected receive error: {e}"),
        }
    }
    assert_eq!(received, payload);
}

// ─── Scenario B: write after shutdown ───────────────────────────────────────

#[test]
fn send_after_shutdown_write_is_pipe_with_no_bytes() {
    let (mut stack, a, _b) = stream_pair();
    stack.shutdown(a, ShutdownDirection::Write).unwrap();
    let mut op = SendOp::new(a, Bytes::from_static(b"doomed"));
    let err = op.step(&mut stack).unwrap_err();
    assert_eq!(err, SockError::Pipe);
    assert_eq!(op.bytes_sent(), 0);
}

// ─── Scenario C: splice byte budget ─────────────────────────────────────────

#[test]
fn splice_budget_caps_forwarding_and_tears_down() {
    let mut stack = Stack::new(LoopbackStream::new());
    let a = stack.socket().unwrap();
    let a2 = stack.socket().unwrap();
    let b = stack.socket().unwrap();
    let b2 = stack.socket().unwrap();
    stack.connect2(a, a2).unwrap();
    stack.connect2(b, b2).unwrap();

    stack.splice(a, b, Some(100), None).unwrap();
    assert!(stack.is_spliced(a));

    for chunk in 0..5 {
        let data = Bytes::from(vec![chunk as u8; 50]);
        stack.deliver_inbound(a, data).unwrap();
        pump_splices(&mut stack);
    }

    // Exactly the budget reached b's peer; the link dissolved at 100.
    let delivered = stack.recv(b2, 1024).unwrap();
    assert_eq!(delivered.data.len(), 100);
    assert!(!stack.is_spliced(a));

    // Whatever arrived after teardown stays queued on the source.
    let leftover = stack.recv(a, 1024).unwrap();
    assert_eq!(leftover.data.len(), 150);
}

// ─── Scenario D: splice idle timeout ────────────────────────────────────────

#[test]
fn splice_idle_timeout_tears_down_with_timed_out() {
    let mut stack = Stack::new(LoopbackStream::new());
    let a = stack.socket().unwrap();
    let a2 = stack.socket().unwrap();
    let b = stack.socket().unwrap();
    let b2 = stack.socket().unwrap();
    stack.connect2(a, a2).unwrap();
    stack.connect2(b, b2).unwrap();

    stack
        .splice(a, b, None, Some(Duration::from_millis(1)))
        .unwrap();
    thread::sleep(Duration::from_millis(10));
    stack.check_splice_idle();

    assert!(!stack.is_spliced(a));
    assert_eq!(stack.take_error(a), Some(SockError::TimedOut));
    assert!(matches!(stack.recv(b2, 64), Err(SockError::WouldBlock)));
}

// ─── Scenario E: nonblocking receive ────────────────────────────────────────

#[test]
fn nonblocking_recv_would_block_then_returns_appended_bytes() {
    let (mut stack, a, _b) = stream_pair();
    assert!(matches!(stack.recv(a, 64), Err(SockError::WouldBlock)));

    stack
        .deliver_inbound(a, Bytes::from_static(b"0123456789"))
        .unwrap();
    let res = stack.recv(a, 64).unwrap();
    assert_eq!(res.data.len(), 10);
    assert_eq!(stack.queue_stats(a).unwrap().0.cc, 0);
}

// ─── Round-trip and record boundaries ───────────────────────────────────────

#[test]
fn stream_roundtrip_across_multiple_calls() {
    let (mut stack, a, b) = stream_pair();
    stack.send(a, Bytes::from_static(b"first ")).unwrap();
    stack.send(a, Bytes::from_static(b"second ")).unwrap();
    stack.send(a, Bytes::from_static(b"third")).unwrap();

    let mut out = Vec::new();
    // Read in awkward sizes to cross the original call boundaries.
    for cap in [4usize, 9, 64] {
        if let Ok(res) = stack.recv(b, cap) {
            out.extend_from_slice(&res.data);
        }
    }
    assert_eq!(out, b"first second third");
}

#[test]
fn datagram_boundaries_survive_roundtrip() {
    let mut stack = Stack::new(LoopbackDgram::new());
    let tx = stack.socket().unwrap();
    let rx = stack.socket().unwrap();
    stack.bind(tx, &Addr::new("tx")).unwrap();
    stack.bind(rx, &Addr::new("rx")).unwrap();

    for msg in [&b"aa"[..], &b"bbbb"[..], &b"c"[..]] {
        stack
            .send_to(tx, Bytes::copy_from_slice(msg), &Addr::new("rx"))
            .unwrap();
    }
    for expect in [&b"aa"[..], &b"bbbb"[..], &b"c"[..]] {
        let res = stack.recv(rx, 64).unwrap();
        assert_eq!(&res.data[..], expect);
        assert_eq!(res.addr, Some(Addr::new("tx")));
    }
}

// ─── Shutdown idempotence ───────────────────────────────────────────────────

#[test]
fn shutdown_both_twice_is_observably_once() {
    let (mut stack, a, _b) = stream_pair();
    stack.shutdown(a, ShutdownDirection::Both).unwrap();
    let first_events = stack.take_events().len();
    assert!(first_events > 0);

    stack.shutdown(a, ShutdownDirection::Both).unwrap();
    assert_eq!(stack.take_events().len(), 0, "repeat shutdown must not re-wake");
}

// ─── Space invariant ────────────────────────────────────────────────────────

#[test]
fn nonblocking_sends_never_push_cc_past_hiwat() {
    let (mut stack, a, b) = stream_pair();
    stack.set_option(b, SockOption::RecvBuf(2048)).unwrap();
    stack.set_option(a, SockOption::SendBuf(2048)).unwrap();

    let mut total = 0;
    loop {
        match stack.send(a, Bytes::from(vec![7u8; 700])) {
            Ok(n) => total += n,
            Err(SockError::WouldBlock) => break,
            Err(e) => panic!("unexpected send error: {e}"),
        }
        let stats = stack.queue_stats(b).unwrap().0;
        assert!(
            stats.cc <= stats.hiwat,
            "receive queue overfilled: {} > {}",
            stats.cc,
            stats.hiwat
        );
        assert!(total <= 4096, "sender made impossible progress");
    }
    assert!(total > 0);
}

// ─── Interrupted waits keep partial progress ────────────────────────────────

#[test]
fn interrupted_send_reports_partial_progress() {
    let (mut stack, a, _b) = stream_pair();
    stack.set_option(a, SockOption::SendBuf(1024)).unwrap();

    let mut op = SendOp::new(a, Bytes::from(vec![1u8; 3000]));
    match op.step(&mut stack).unwrap() {
        SendStep::Blocked(WaitKind::SendSpace) => {}
        other => panic!("expected a suspended send, got {other:?}"),
    }
    let progress = op.bytes_sent();
    assert!(progress > 0);

    op.interrupt();
    assert_eq!(op.step(&mut stack).unwrap_err(), SockError::Interrupted);
    // The count survives the failure so the caller can resume correctly.
    assert_eq!(op.bytes_sent(), progress);
}

// ─── Deferred errors surface once ───────────────────────────────────────────

#[test]
fn deferred_error_clears_after_first_receive_but_not_peek() {
    let (mut stack, a, _b) = stream_pair();
    stack.inject_error(a, SockError::ConnectionReset);

    let mut peek = RecvOp::new(a, 16).with_flags(RecvFlags {
        peek: true,
        dontwait: true,
        ..RecvFlags::default()
    });
    assert_eq!(peek.step(&mut stack).unwrap_err(), SockError::ConnectionReset);

    // Peek left the error in place; the ordinary receive consumes it.
    assert!(matches!(
        stack.recv(a, 16),
        Err(SockError::ConnectionReset)
    ));
    assert!(matches!(stack.recv(a, 16), Err(SockError::WouldBlock)));
}

// ─── Receive blocks, producer wakes it ──────────────────────────────────────

#[test]
fn suspended_receive_resumes_after_delivery() {
    let (mut stack, a, _b) = stream_pair();
    let mut op = RecvOp::new(a, 32);
    match op.step(&mut stack).unwrap() {
        RecvStep::Blocked(WaitKind::RecvData) => {}
        other => panic!("expected a suspended receive, got {other:?}"),
    }

    stack.deliver_inbound(a, Bytes::from_static(b"payload")).unwrap();
    let woke = stack
        .take_events()
        .iter()
        .any(|ev| ev.endpoint == a && !ev.splice_pump);
    assert!(woke, "delivery must wake the blocked reader");

    match op.step(&mut stack).unwrap() {
        RecvStep::Done(res) => assert_eq!(&res.data[..], b"payload"),
        other => panic!("expected completion, got {other:?}"),
    }
}

// ─── Splice keeps record boundaries around control ──────────────────────────

#[test]
fn splice_forwards_control_bearing_records_intact() {
    let mut stack = Stack::new(LoopbackStream::new());
    let a = stack.socket().unwrap();
    let a2 = stack.socket().unwrap();
    let b = stack.socket().unwrap();
    let b2 = stack.socket().unwrap();
    stack.connect2(a, a2).unwrap();
    stack.connect2(b, b2).unwrap();

    // Plain data first, then a control-bearing record behind it.
    stack.send(a2, Bytes::from_static(b"lead")).unwrap();
    let mut op = SendOp::new(a2, Bytes::from_static(b"tail"))
        .with_control(ControlMsg {
            data: Bytes::from_static(b"rights"),
            rights: false,
        })
        .with_flags(SendFlags {
            oob: false,
            dontwait: true,
        });
    match op.step(&mut stack).unwrap() {
        SendStep::Done(4) => {}
        other => panic!("control-bearing send did not complete: {other:?}"),
    }
    stack.take_events();

    stack.splice(a, b, None, None).unwrap();
    pump_splices(&mut stack);

    // The drain's peer sees all the data and the control message; the
    // control record crossed the link as its own unit.
    let mut op = RecvOp::new(b2, 64).with_flags(RecvFlags {
        dontwait: true,
        want_control: true,
        ..RecvFlags::default()
    });
    match op.step(&mut stack).unwrap() {
        RecvStep::Done(res) => {
            assert_eq!(&res.data[..], b"leadtail");
            assert_eq!(res.control.len(), 1);
            assert_eq!(&res.control[0].data[..], b"rights");
        }
        other => panic!("expected completion, got {other:?}"),
    }
}

// ─── Splice forwards out-of-band bytes in position ──────────────────────────

#[test]
fn splice_preserves_inline_urgent_byte_position() {
    let mut stack = Stack::new(LoopbackStream::new());
    let a = stack.socket().unwrap();
    let a2 = stack.socket().unwrap();
    let b = stack.socket().unwrap();
    let b2 = stack.socket().unwrap();
    stack.connect2(a, a2).unwrap();
    stack.connect2(b, b2).unwrap();
    stack.set_option(a, SockOption::OobInline(true)).unwrap();
    stack.set_option(b2, SockOption::OobInline(true)).unwrap();

    // Build "abc" + urgent '!' + "def" on a's receive queue via its peer.
    stack.send(a2, Bytes::from_static(b"abc")).unwrap();
    stack.send_oob(a2, Bytes::from_static(b"!")).unwrap();
    stack.send(a2, Bytes::from_static(b"def")).unwrap();

    stack.splice(a, b, None, None).unwrap();
    pump_splices(&mut stack);

    let mut out = Vec::new();
    loop {
        match stack.recv(b2, 64) {
            Ok(res) => out.extend_from_slice(&res.data),
            Err(SockError::WouldBlock) => break,
            Err(e) => panic!("unexpected receive error: {e}"),
        }
    }
    assert_eq!(out, b"abc!def");
}
