//! Phloem core library
//!
//! The engine room of the phloem load harness: per-thread connection event
//! loops, tick-based rate pacing with randomized latency sampling, the worker
//! state machine, the thread supervisor, and the cross-thread statistics
//! pipeline feeding the monitor.

pub mod config;
pub mod conn;
pub mod error;
pub mod event_loop;
pub mod pacing;
pub mod stats;
pub mod threading;
pub mod timing;
pub mod worker;

pub use config::HarnessConfig;
pub use error::{Error, Result};

// Transport types used throughout the worker surface
pub use phloem_transport::{
    Acceptor, ChannelOptions, FlushStatus, NetChannel, PollerKind, ReadStatus, SendStatus,
};
