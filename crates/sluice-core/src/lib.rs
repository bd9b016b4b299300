//! # sluice-core
//!
//! Byte-stream buffering and flow-control engine for socket-style
//! endpoints.
//!
//! Every endpoint owns a watermark-bounded receive queue and send queue;
//! resumable send/receive engines move bytes through them with blocking
//! semantics expressed as suspend-and-resume steps, and a splice engine
//! forwards bytes from one endpoint's receive queue straight into another's
//! send path under a byte budget and idle timeout. The whole crate is pure
//! logic: no I/O, no threads, no timers of its own — the embedder drains
//! wakeup events and polls the clock.
//!
//! ## Crate structure
//!
//! - [`error`] — Errno-shaped error taxonomy
//! - [`arena`] — Segment/record storage with global charge accounting
//! - [`sockbuf`] — Per-direction queue: counters, watermarks, sleep-lock
//! - [`proto`] — Protocol-request callback trait and capability flags
//! - [`endpoint`] — Endpoint table, lifecycle state, wakeup routing
//! - [`stack`] — Top-level façade: sockets, options, inbound delivery
//! - [`send`] — Resumable send engine
//! - [`recv`] — Resumable receive engine
//! - [`splice`] — Receive-to-send forwarding links
//! - [`loopback`] — In-process stream and datagram pair protocols

pub mod arena;
pub mod endpoint;
pub mod error;
pub mod loopback;
pub mod proto;
pub mod recv;
pub mod send;
pub mod sockbuf;
pub mod splice;
pub mod stack;

pub use arena::{Arena, ResourceLimits, SEGMENT_CAPACITY};
pub use endpoint::{EndpointHandle, EndpointState, QueueSide, Wakeup};
pub use error::SockError;
pub use proto::{Addr, ControlMsg, ProtoCaps, Protocol, ShutdownDirection};
pub use recv::{RecvFlags, RecvOp, RecvResult, RecvStep};
pub use send::{SendFlags, SendOp, SendStep};
pub use splice::{MoveOutcome, SpliceLink, SpliceState};
pub use stack::{Readiness, SockOption, Stack, WaitKind, DEFAULT_HIWAT};
