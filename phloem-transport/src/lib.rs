//! Phloem transport layer
//!
//! Non-blocking, frame-oriented TCP plumbing for the phloem load harness.
//! Connections never block the worker thread: reads drain whatever the socket
//! has, writes land in a bounded per-connection queue and are flushed when the
//! socket reports writable. Readiness is observed through a single [`Poller`]
//! per thread with a runtime-selectable backend.
//!
//! ## Wire unit
//!
//! Every unit on the wire is a frame:
//!
//! ```text
//! +--------------+-----------+------------------+
//! | length (u32) | kind (u8) | payload (length-1) |
//! +--------------+-----------+------------------+
//! ```
//!
//! `length` is big-endian and counts the kind byte plus the payload. Two kinds
//! exist: `Data` carries application bytes, `Ping` is an empty liveness frame
//! consumed by the transport's caller for deadline tracking.
//!
//! ## Backpressure
//!
//! [`NetChannel::send`] queues the encoded frame and opportunistically writes.
//! A partial write leaves bytes queued and the caller is expected to retry
//! [`NetChannel::flush`] when the socket becomes writable. The queue is
//! bounded: once `guaranteed_output_buffers` frames are pending, `send`
//! reports [`SendStatus::NoBuffers`] and the caller drops the attempt instead
//! of blocking.

use std::fmt;

/// Result type for transport operations
pub type Result<T> = std::result::Result<T, Error>;

/// Transport layer error types
#[derive(Debug)]
pub enum Error {
    /// I/O errors from the socket layer
    Io(std::io::Error),

    /// Connection establishment or teardown errors
    Connection(String),

    /// Peer closed the connection
    Closed,

    /// Malformed or oversized frame
    Frame(String),

    /// Configuration errors
    Config(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {e}"),
            Error::Connection(msg) => write!(f, "Connection error: {msg}"),
            Error::Closed => write!(f, "Connection closed by peer"),
            Error::Frame(msg) => write!(f, "Frame error: {msg}"),
            Error::Config(msg) => write!(f, "Configuration error: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

#[cfg(unix)]
impl From<nix::Error> for Error {
    fn from(err: nix::Error) -> Self {
        Error::Io(std::io::Error::from(err))
    }
}

pub mod channel;
pub mod frame;
pub mod poller;

pub use channel::{
    Acceptor, ChannelOptions, FlushStatus, HandshakeStatus, NetChannel, ReadStatus, SendStatus,
};
pub use frame::{FrameDecoder, FrameKind, FRAME_HEADER_LEN};
pub use poller::{Interest, IoEvent, Poller, PollerKind};
