//! Readiness-driven connection multiplexing for one worker thread
//!
//! An [`EventLoop`] owns a poller and a registry of connections. New channels
//! are handed over through a locked pending list and only join the poller in
//! [`EventLoop::process_new_channels`], so accepting and registering may
//! happen on different threads without racing the read loop. Session logic
//! stays outside: the loop reports activations, payloads, and closes through
//! the [`ChannelEvents`] trait and never decodes a payload itself.
//!
//! Writes are queue-then-flush. Senders enqueue frames and call
//! [`EventLoop::request_flush`]; the flush itself runs when the poller
//! reports the socket writable, and a connection whose flush fails is closed.

use crate::conn::{ConnId, ConnState, ConnectionHandle, ConnectionRegistry};
use crate::error::{Error, Result};
use crate::timing;
use phloem_transport::{
    FlushStatus, FrameKind, HandshakeStatus, Interest, NetChannel, Poller, PollerKind, ReadStatus,
    SendStatus,
};
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// How many frames to read between checks of the read-phase deadline
const DEADLINE_CHECK_FRAMES: usize = 10;

/// Why a connection left the loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer went silent past its liveness window
    PingTimeout,
    /// Peer closed the socket
    PeerClosed,
    /// Read, write, or flush failed
    IoError,
    /// Malformed or unexpected frame
    ProtocolError,
    /// Session callback rejected the connection
    SessionError,
    /// Orderly local shutdown
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CloseReason::PingTimeout => "ping timeout",
            CloseReason::PeerClosed => "peer closed",
            CloseReason::IoError => "io error",
            CloseReason::ProtocolError => "protocol error",
            CloseReason::SessionError => "session error",
            CloseReason::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}

/// Callbacks from the event loop into the session layer
pub trait ChannelEvents {
    /// Transport setup finished; the connection is about to turn Active.
    /// Frames enqueued here are flushed by the loop. An error closes the
    /// connection and it never becomes Active.
    fn on_channel_active(&mut self, conn: &mut ConnectionHandle) -> Result<()>;

    /// A data frame arrived on an Active connection. An error closes the
    /// connection.
    fn on_payload(&mut self, conn: &mut ConnectionHandle, payload: &[u8]) -> Result<()>;

    /// The connection was removed from the loop. Fires exactly once per
    /// connection, whatever the reason.
    fn on_channel_close(&mut self, id: ConnId, reason: CloseReason);
}

enum ReadOutcome {
    Delivered,
    Drained,
    Close(CloseReason),
}

/// Per-thread connection multiplexer
pub struct EventLoop {
    poller: Poller,
    registry: ConnectionRegistry,
    pending: Mutex<Vec<NetChannel>>,
}

impl EventLoop {
    pub fn new(kind: PollerKind) -> Result<Self> {
        Ok(Self {
            poller: Poller::new(kind)?,
            registry: ConnectionRegistry::new(),
            pending: Mutex::new(Vec::new()),
        })
    }

    /// Hand a channel to the loop. It joins the poller on the next
    /// [`EventLoop::process_new_channels`] call, not here.
    pub fn add_channel(&self, channel: NetChannel) {
        self.pending.lock().unwrap().push(channel);
    }

    /// Drain the pending list into the registry, then drive transport setup
    /// for every connection still initializing. Connections whose setup
    /// completes get their ping deadlines armed and are reported through
    /// [`ChannelEvents::on_channel_active`] before turning Active.
    pub fn process_new_channels(&mut self, events: &mut impl ChannelEvents) -> Result<()> {
        let drained = std::mem::take(&mut *self.pending.lock().unwrap());
        for channel in drained {
            let id = self.registry.insert(channel);
            if let Some(handle) = self.registry.get(id) {
                self.poller.register(&handle.channel, id.index(), Interest::READ)?;
                trace!(conn = %id, peer = %handle.channel.peer_addr(), "channel registered");
            }
        }

        for id in self.registry.ids_in(ConnState::Initializing) {
            self.try_activate(id, events);
        }
        Ok(())
    }

    fn try_activate(&mut self, id: ConnId, events: &mut impl ChannelEvents) {
        enum Setup {
            Waiting,
            Ready,
            Failed(phloem_transport::Error),
        }

        let outcome = match self.registry.get_mut(id) {
            None => return,
            Some(handle) => match handle.channel.handshake_step() {
                Ok(HandshakeStatus::InProgress) => Setup::Waiting,
                Ok(HandshakeStatus::Established) => Setup::Ready,
                Err(e) => Setup::Failed(e),
            },
        };

        match outcome {
            Setup::Waiting => {}
            Setup::Failed(e) => {
                warn!(conn = %id, error = %e, "transport setup failed");
                self.close_channel(id, CloseReason::IoError, events);
            }
            Setup::Ready => {
                let now_ns = timing::now_ns();
                let activated = match self.registry.get_mut(id) {
                    None => return,
                    Some(handle) => {
                        handle.needs_flush = false;
                        handle.arm_ping_deadlines(now_ns);
                        match events.on_channel_active(handle) {
                            Ok(()) => {
                                handle.state = ConnState::Active;
                                true
                            }
                            Err(e) => {
                                warn!(conn = %id, error = %e, "session rejected connection");
                                false
                            }
                        }
                    }
                };
                if activated {
                    debug!(conn = %id, "connection active");
                    if let Err(e) = self.request_flush(id) {
                        warn!(conn = %id, error = %e, "flush registration failed");
                        self.close_channel(id, CloseReason::IoError, events);
                    }
                } else {
                    self.close_channel(id, CloseReason::SessionError, events);
                }
            }
        }
    }

    /// Service readiness until `stop_at_ns`. Readable connections are drained
    /// frame by frame, re-checking the deadline every few frames so one busy
    /// connection cannot eat the whole tick. Writable connections with queued
    /// bytes are flushed; a completed flush clears the flush mark and drops
    /// write interest.
    pub fn read_channels(&mut self, stop_at_ns: u64, events: &mut impl ChannelEvents) -> Result<()> {
        loop {
            let now_ns = timing::now_ns();
            if now_ns >= stop_at_ns {
                return Ok(());
            }
            let timeout = Duration::from_nanos(stop_at_ns - now_ns);
            let io_events = self.poller.poll(Some(timeout))?;
            for event in io_events {
                let id = ConnId::from_index(event.token);
                if event.read {
                    self.handle_readable(id, stop_at_ns, events);
                }
                if event.write {
                    self.handle_writable(id, events);
                }
            }
        }
    }

    fn handle_readable(&mut self, id: ConnId, stop_at_ns: u64, events: &mut impl ChannelEvents) {
        let mut frames = 0usize;
        loop {
            let outcome = match self.registry.get_mut(id) {
                None => return,
                Some(handle) => match handle.channel.read_frame() {
                    Ok(ReadStatus::Payload(payload)) => {
                        handle.mark_received();
                        if handle.state != ConnState::Active {
                            warn!(conn = %id, "data frame before activation");
                            ReadOutcome::Close(CloseReason::ProtocolError)
                        } else {
                            match events.on_payload(handle, &payload) {
                                Ok(()) => ReadOutcome::Delivered,
                                Err(e) => {
                                    warn!(conn = %id, error = %e, "session failed on payload");
                                    ReadOutcome::Close(CloseReason::SessionError)
                                }
                            }
                        }
                    }
                    Ok(ReadStatus::Ping) => {
                        handle.mark_received();
                        ReadOutcome::Delivered
                    }
                    Ok(ReadStatus::WouldBlock) => ReadOutcome::Drained,
                    Err(phloem_transport::Error::Closed) => {
                        ReadOutcome::Close(CloseReason::PeerClosed)
                    }
                    Err(phloem_transport::Error::Frame(msg)) => {
                        warn!(conn = %id, %msg, "bad frame");
                        ReadOutcome::Close(CloseReason::ProtocolError)
                    }
                    Err(e) => {
                        warn!(conn = %id, error = %e, "read failed");
                        ReadOutcome::Close(CloseReason::IoError)
                    }
                },
            };

            match outcome {
                ReadOutcome::Delivered => {
                    // The session may have queued a response
                    if let Err(e) = self.request_flush(id) {
                        warn!(conn = %id, error = %e, "flush registration failed");
                        self.close_channel(id, CloseReason::IoError, events);
                        return;
                    }
                    frames += 1;
                    if frames % DEADLINE_CHECK_FRAMES == 0 && timing::now_ns() >= stop_at_ns {
                        return;
                    }
                }
                ReadOutcome::Drained => return,
                ReadOutcome::Close(reason) => {
                    self.close_channel(id, reason, events);
                    return;
                }
            }
        }
    }

    fn handle_writable(&mut self, id: ConnId, events: &mut impl ChannelEvents) {
        enum Flush {
            Done,
            Partial,
            Failed,
        }

        let outcome = match self.registry.get_mut(id) {
            None => return,
            Some(handle) => match handle.channel.flush() {
                Ok(FlushStatus::Complete) => {
                    handle.needs_flush = false;
                    handle.mark_sent();
                    Flush::Done
                }
                Ok(FlushStatus::Pending(_)) => {
                    handle.mark_sent();
                    Flush::Partial
                }
                Err(e) => {
                    warn!(conn = %id, error = %e, "flush failed");
                    Flush::Failed
                }
            },
        };

        match outcome {
            Flush::Done => {
                if let Err(e) = self.poller.modify(id.index(), Interest::READ) {
                    warn!(conn = %id, error = %e, "interest update failed");
                    self.close_channel(id, CloseReason::IoError, events);
                }
            }
            Flush::Partial => {}
            Flush::Failed => self.close_channel(id, CloseReason::IoError, events),
        }
    }

    /// Walk every Active connection's ping windows. A connection that sent
    /// nothing over a send window gets an explicit ping; one that received
    /// nothing over a full liveness window is closed.
    pub fn check_pings(&mut self, now_ns: u64, events: &mut impl ChannelEvents) {
        enum Ping {
            Fine,
            SendFailed,
            TimedOut,
        }

        for id in self.registry.ids_in(ConnState::Active) {
            let outcome = match self.registry.get_mut(id) {
                None => continue,
                Some(handle) => {
                    let timeout_ns = handle.channel.ping_timeout().as_nanos() as u64;
                    let mut outcome = Ping::Fine;
                    if now_ns >= handle.next_ping_due_ns {
                        if !handle.sent_since_ping {
                            if let Err(e) = handle.channel.send_ping() {
                                warn!(conn = %id, error = %e, "ping send failed");
                                outcome = Ping::SendFailed;
                            } else {
                                trace!(conn = %id, "ping sent");
                            }
                        }
                        handle.sent_since_ping = false;
                        handle.next_ping_due_ns = now_ns + timeout_ns / 3;
                    }
                    if matches!(outcome, Ping::Fine) && now_ns >= handle.recv_deadline_ns {
                        if handle.received_since_ping {
                            handle.received_since_ping = false;
                            handle.recv_deadline_ns = now_ns + timeout_ns;
                        } else {
                            outcome = Ping::TimedOut;
                        }
                    }
                    outcome
                }
            };

            match outcome {
                Ping::Fine => {}
                Ping::SendFailed => self.close_channel(id, CloseReason::IoError, events),
                Ping::TimedOut => {
                    warn!(conn = %id, "ping timeout");
                    self.close_channel(id, CloseReason::PingTimeout, events);
                }
            }
        }
    }

    /// Queue a data frame. `NoBuffers` is returned to the caller untouched;
    /// an I/O failure closes the connection and propagates.
    pub fn send_to(
        &mut self,
        id: ConnId,
        payload: &[u8],
        events: &mut impl ChannelEvents,
    ) -> Result<SendStatus> {
        let outcome = match self.registry.get_mut(id) {
            None => return Err(Error::Connection(format!("{id} is not open"))),
            Some(handle) => match handle.channel.send(FrameKind::Data, payload) {
                Ok(SendStatus::NoBuffers) => Ok(SendStatus::NoBuffers),
                Ok(status) => {
                    handle.mark_sent();
                    Ok(status)
                }
                Err(e) => Err(e),
            },
        };

        match outcome {
            Ok(status) => Ok(status),
            Err(e) => {
                warn!(conn = %id, error = %e, "send failed");
                self.close_channel(id, CloseReason::IoError, events);
                Err(e.into())
            }
        }
    }

    /// Mark a connection for flushing if it has queued bytes, clearing the
    /// mark and write interest when the queue is empty. The flush itself
    /// happens in [`EventLoop::read_channels`] when the socket turns
    /// writable.
    pub fn request_flush(&mut self, id: ConnId) -> Result<()> {
        let Some(handle) = self.registry.get_mut(id) else {
            return Ok(());
        };
        if handle.channel.has_pending() {
            if !handle.needs_flush {
                handle.needs_flush = true;
                self.poller.modify(id.index(), Interest::READ_WRITE)?;
            }
        } else if handle.needs_flush {
            handle.needs_flush = false;
            self.poller.modify(id.index(), Interest::READ)?;
        }
        Ok(())
    }

    /// Remove a connection. Safe to call twice; the close callback fires only
    /// on the call that actually removes it.
    pub fn close_channel(&mut self, id: ConnId, reason: CloseReason, events: &mut impl ChannelEvents) {
        let Some(mut handle) = self.registry.remove(id) else {
            return;
        };
        if let Err(e) = self.poller.deregister(id.index()) {
            debug!(conn = %id, error = %e, "deregister failed");
        }
        handle.state = ConnState::Closing;
        handle.channel.close();
        debug!(conn = %id, %reason, "connection closed");
        events.on_channel_close(id, reason);
    }

    /// Close every connection with the Shutdown reason
    pub fn close_all(&mut self, events: &mut impl ChannelEvents) {
        for id in self.registry.ids() {
            self.close_channel(id, CloseReason::Shutdown, events);
        }
    }

    pub fn connection(&self, id: ConnId) -> Option<&ConnectionHandle> {
        self.registry.get(id)
    }

    pub fn connection_mut(&mut self, id: ConnId) -> Option<&mut ConnectionHandle> {
        self.registry.get_mut(id)
    }

    pub fn active_ids(&self) -> Vec<ConnId> {
        self.registry.ids_in(ConnState::Active)
    }

    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }
}
