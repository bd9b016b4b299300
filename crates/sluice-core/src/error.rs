//! # Error Taxonomy
//!
//! Errno-shaped error codes surfaced by the buffering core. These map 1:1 to
//! the conditions a socket layer reports to its callers, so an embedding
//! syscall shim can translate them without inspecting context.
//!
//! Partial progress is never encoded in the error: resumable operations expose
//! a `bytes_*` getter so a caller can tell "moved some bytes, then hit
//! `Interrupted`" apart from "made no progress at all".

use thiserror::Error;

/// Error codes produced by queue, endpoint, and splice operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SockError {
    /// Message or control record too large for the configured buffer.
    #[error("message too large for buffer")]
    MsgSize,
    /// Buffer reservation or segment allocation refused.
    #[error("no buffer space available")]
    NoBufs,
    /// Write after the send side was shut down.
    #[error("broken pipe")]
    Pipe,
    /// Operation requires a connection that does not exist.
    #[error("endpoint is not connected")]
    NotConnected,
    /// Connectionless send with neither a destination nor a default peer.
    #[error("destination address required")]
    DestAddrRequired,
    /// Connect attempted on an already-connected endpoint.
    #[error("endpoint is already connected")]
    IsConnected,
    /// Disconnect attempted while one is already in progress.
    #[error("operation already in progress")]
    AlreadyInProgress,
    /// Splice target already participates in a link.
    #[error("endpoint busy")]
    Busy,
    /// Operation not supported by this endpoint/protocol combination.
    #[error("operation not supported")]
    OpNotSupported,
    /// Non-blocking call could make no progress (also: wait timeout elapsed).
    #[error("operation would block")]
    WouldBlock,
    /// Splice idle timeout fired.
    #[error("operation timed out")]
    TimedOut,
    /// Blocking wait was cancelled by the caller.
    #[error("interrupted")]
    Interrupted,
    /// Malformed request (bad watermarks, zero-length buffer, unknown handle).
    #[error("invalid argument")]
    InvalidArgument,
    /// Peer aborted the connection; delivered through the deferred-error slot.
    #[error("connection reset")]
    ConnectionReset,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_human_readable() {
        assert_eq!(SockError::Pipe.to_string(), "broken pipe");
        assert_eq!(SockError::MsgSize.to_string(), "message too large for buffer");
    }

    #[test]
    fn errors_are_comparable() {
        assert_eq!(SockError::WouldBlock, SockError::WouldBlock);
        assert_ne!(SockError::WouldBlock, SockError::TimedOut);
    }
}
