//! Framed non-blocking TCP channel
//!
//! [`NetChannel`] wraps one TCP stream with frame decoding on the read side
//! and a bounded frame queue on the write side. All calls are non-blocking;
//! the owner drives the channel from readiness events. [`Acceptor`] is the
//! listening-side counterpart producing accepted channels.

use crate::frame::{encode_frame, frame_len, FrameDecoder, FrameKind};
use crate::{Error, Result};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::time::Duration;
use tracing::trace;

/// Per-connection transport tuning
#[derive(Debug, Clone)]
pub struct ChannelOptions {
    /// Liveness window: explicit pings go out every third of this, and a
    /// silent peer is declared dead after the full window.
    pub ping_timeout: Duration,
    /// Cap on queued outbound frames; `send` reports `NoBuffers` beyond it.
    pub guaranteed_output_buffers: usize,
    /// Queued-byte threshold that triggers an eager flush from `send`.
    /// Zero disables the threshold.
    pub high_water_mark: usize,
    /// Largest payload accepted in a single frame, either direction.
    pub max_fragment_size: usize,
    pub send_buf_size: Option<usize>,
    pub recv_buf_size: Option<usize>,
    pub tcp_no_delay: bool,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            ping_timeout: Duration::from_secs(10),
            guaranteed_output_buffers: 5000,
            high_water_mark: 0,
            max_fragment_size: crate::frame::DEFAULT_MAX_PAYLOAD,
            send_buf_size: None,
            recv_buf_size: None,
            tcp_no_delay: true,
        }
    }
}

/// Progress of a non-blocking connect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    InProgress,
    Established,
}

/// Outcome of one `read_frame` call
#[derive(Debug)]
pub enum ReadStatus {
    /// A complete data frame's payload
    Payload(Vec<u8>),
    /// A liveness frame; no payload
    Ping,
    /// Socket drained, nothing buffered
    WouldBlock,
}

/// Outcome of one `send` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// Frame accepted and nothing remains queued
    Flushed,
    /// Frame accepted; this many bytes await a flush
    Queued(usize),
    /// Outbound queue is at capacity; the frame was not accepted
    NoBuffers,
}

/// Outcome of one `flush` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushStatus {
    Complete,
    Pending(usize),
}

/// One framed, non-blocking TCP connection
pub struct NetChannel {
    stream: mio::net::TcpStream,
    peer: SocketAddr,
    decoder: FrameDecoder,
    read_buf: Vec<u8>,
    outbound: VecDeque<Vec<u8>>,
    front_pos: usize,
    queued_bytes: usize,
    connecting: bool,
    opts: ChannelOptions,
}

impl NetChannel {
    /// Start a non-blocking connect to `addr`
    ///
    /// The returned channel is not yet usable for I/O; poll it for
    /// writability and call [`handshake_step`](Self::handshake_step) until
    /// it reports `Established`.
    pub fn connect(addr: SocketAddr, opts: ChannelOptions) -> Result<Self> {
        let stream = mio::net::TcpStream::connect(addr)?;
        apply_socket_tuning(&stream, &opts)?;
        trace!(peer = %addr, "connecting");
        Ok(Self::from_parts(stream, addr, true, opts))
    }

    /// Wrap a freshly accepted stream
    pub fn accepted(
        stream: mio::net::TcpStream,
        peer: SocketAddr,
        opts: ChannelOptions,
    ) -> Result<Self> {
        apply_socket_tuning(&stream, &opts)?;
        trace!(peer = %peer, "accepted");
        Ok(Self::from_parts(stream, peer, false, opts))
    }

    fn from_parts(
        stream: mio::net::TcpStream,
        peer: SocketAddr,
        connecting: bool,
        opts: ChannelOptions,
    ) -> Self {
        let decoder = FrameDecoder::new(opts.max_fragment_size);
        Self {
            stream,
            peer,
            decoder,
            read_buf: vec![0u8; 8192],
            outbound: VecDeque::new(),
            front_pos: 0,
            queued_bytes: 0,
            connecting,
            opts,
        }
    }

    /// Advance an in-progress connect by one non-blocking step
    pub fn handshake_step(&mut self) -> Result<HandshakeStatus> {
        if !self.connecting {
            return Ok(HandshakeStatus::Established);
        }

        if let Some(err) = self.stream.take_error()? {
            return Err(Error::Connection(format!("connect to {} failed: {err}", self.peer)));
        }

        // Per mio's contract, peer_addr distinguishes "still connecting"
        // from "connected" once the socket polls writable.
        match self.stream.peer_addr() {
            Ok(_) => {
                self.connecting = false;
                trace!(peer = %self.peer, "connected");
                Ok(HandshakeStatus::Established)
            }
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(HandshakeStatus::InProgress),
            #[cfg(unix)]
            Err(e) if e.raw_os_error() == Some(nix::libc::EINPROGRESS) => {
                Ok(HandshakeStatus::InProgress)
            }
            Err(e) => Err(Error::Connection(format!("connect to {} failed: {e}", self.peer))),
        }
    }

    pub fn is_established(&self) -> bool {
        !self.connecting
    }

    /// Read the next frame, draining the socket as needed
    pub fn read_frame(&mut self) -> Result<ReadStatus> {
        loop {
            if let Some((kind, payload)) = self.decoder.next_frame()? {
                return Ok(match kind {
                    FrameKind::Data => ReadStatus::Payload(payload),
                    FrameKind::Ping => ReadStatus::Ping,
                });
            }

            match self.stream.read(&mut self.read_buf) {
                Ok(0) => return Err(Error::Closed),
                Ok(n) => {
                    self.decoder.feed(&self.read_buf[..n]);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(ReadStatus::WouldBlock)
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Queue one frame for sending
    ///
    /// The frame is not written to the socket here unless queued bytes cross
    /// the high-water mark; callers batch a burst and flush once.
    pub fn send(&mut self, kind: FrameKind, payload: &[u8]) -> Result<SendStatus> {
        if payload.len() > self.opts.max_fragment_size {
            return Err(Error::Frame(format!(
                "payload {} exceeds fragment size {}",
                payload.len(),
                self.opts.max_fragment_size
            )));
        }
        if self.outbound.len() >= self.opts.guaranteed_output_buffers {
            return Ok(SendStatus::NoBuffers);
        }

        let mut frame = Vec::with_capacity(frame_len(payload.len()));
        encode_frame(kind, payload, &mut frame);
        self.queued_bytes += frame.len();
        self.outbound.push_back(frame);

        if self.opts.high_water_mark > 0 && self.queued_bytes >= self.opts.high_water_mark {
            match self.flush()? {
                FlushStatus::Complete => return Ok(SendStatus::Flushed),
                FlushStatus::Pending(n) => return Ok(SendStatus::Queued(n)),
            }
        }
        Ok(SendStatus::Queued(self.queued_bytes))
    }

    /// Write queued frames until done or the socket pushes back
    pub fn flush(&mut self) -> Result<FlushStatus> {
        loop {
            let (front_len, res) = {
                let Some(front) = self.outbound.front() else {
                    return Ok(FlushStatus::Complete);
                };
                (front.len(), self.stream.write(&front[self.front_pos..]))
            };

            match res {
                Ok(0) => return Ok(FlushStatus::Pending(self.queued_bytes)),
                Ok(n) => {
                    self.front_pos += n;
                    self.queued_bytes -= n;
                    if self.front_pos == front_len {
                        self.outbound.pop_front();
                        self.front_pos = 0;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(FlushStatus::Pending(self.queued_bytes))
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Queue a ping frame and try to push it out
    pub fn send_ping(&mut self) -> Result<SendStatus> {
        if self.outbound.len() >= self.opts.guaranteed_output_buffers {
            // A full queue means data is already on its way to the peer,
            // which serves the same liveness purpose.
            return Ok(SendStatus::NoBuffers);
        }
        let mut frame = Vec::with_capacity(frame_len(0));
        encode_frame(FrameKind::Ping, &[], &mut frame);
        self.queued_bytes += frame.len();
        self.outbound.push_back(frame);
        match self.flush()? {
            FlushStatus::Complete => Ok(SendStatus::Flushed),
            FlushStatus::Pending(n) => Ok(SendStatus::Queued(n)),
        }
    }

    pub fn pending_bytes(&self) -> usize {
        self.queued_bytes
    }

    pub fn has_pending(&self) -> bool {
        self.queued_bytes > 0
    }

    pub fn ping_timeout(&self) -> Duration {
        self.opts.ping_timeout
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Shut the socket down; outstanding queued frames are dropped
    pub fn close(&mut self) {
        trace!(peer = %self.peer, "closing");
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
        self.outbound.clear();
        self.queued_bytes = 0;
        self.front_pos = 0;
    }
}

impl AsRawFd for NetChannel {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

impl std::fmt::Debug for NetChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetChannel")
            .field("peer", &self.peer)
            .field("connecting", &self.connecting)
            .field("queued_bytes", &self.queued_bytes)
            .finish()
    }
}

/// Non-blocking listener producing accepted [`NetChannel`]s
pub struct Acceptor {
    listener: mio::net::TcpListener,
    opts: ChannelOptions,
}

impl Acceptor {
    pub fn bind(addr: SocketAddr, opts: ChannelOptions) -> Result<Self> {
        let listener = mio::net::TcpListener::bind(addr)?;
        Ok(Self { listener, opts })
    }

    /// Accept one pending connection, if any
    pub fn accept(&self) -> Result<Option<NetChannel>> {
        match self.listener.accept() {
            Ok((stream, peer)) => {
                let channel = NetChannel::accepted(stream, peer, self.opts.clone())?;
                Ok(Some(channel))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}

impl AsRawFd for Acceptor {
    fn as_raw_fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }
}

fn apply_socket_tuning(stream: &mio::net::TcpStream, opts: &ChannelOptions) -> Result<()> {
    stream.set_nodelay(opts.tcp_no_delay)?;

    #[cfg(unix)]
    {
        use nix::sys::socket::{setsockopt, sockopt};
        let fd = unsafe { std::os::fd::BorrowedFd::borrow_raw(stream.as_raw_fd()) };
        if let Some(size) = opts.send_buf_size {
            setsockopt(&fd, sockopt::SndBuf, &size)?;
        }
        if let Some(size) = opts.recv_buf_size {
            setsockopt(&fd, sockopt::RcvBuf, &size)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    fn wait_established(channel: &mut NetChannel) {
        for _ in 0..500 {
            match channel.handshake_step().unwrap() {
                HandshakeStatus::Established => return,
                HandshakeStatus::InProgress => thread::sleep(Duration::from_millis(2)),
            }
        }
        panic!("connect did not complete");
    }

    fn read_until_frame(channel: &mut NetChannel) -> ReadStatus {
        for _ in 0..500 {
            match channel.read_frame().unwrap() {
                ReadStatus::WouldBlock => thread::sleep(Duration::from_millis(2)),
                other => return other,
            }
        }
        panic!("no frame arrived");
    }

    fn loopback_pair(opts: ChannelOptions) -> (NetChannel, NetChannel) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let mut client = NetChannel::connect(addr, opts.clone()).unwrap();
        let (accepted_std, peer) = listener.accept().unwrap();
        accepted_std.set_nonblocking(true).unwrap();
        let server =
            NetChannel::accepted(mio::net::TcpStream::from_std(accepted_std), peer, opts).unwrap();
        wait_established(&mut client);
        (client, server)
    }

    #[test]
    fn test_connect_send_receive() {
        let (mut client, mut server) = loopback_pair(ChannelOptions::default());

        let status = client.send(FrameKind::Data, b"quote").unwrap();
        assert!(matches!(status, SendStatus::Queued(_)));
        assert_eq!(client.flush().unwrap(), FlushStatus::Complete);

        match read_until_frame(&mut server) {
            ReadStatus::Payload(p) => assert_eq!(p, b"quote"),
            other => panic!("unexpected read status: {other:?}"),
        }
    }

    #[test]
    fn test_ping_frame_delivery() {
        let (mut client, mut server) = loopback_pair(ChannelOptions::default());

        let status = server.send_ping().unwrap();
        assert_eq!(status, SendStatus::Flushed);
        assert!(matches!(read_until_frame(&mut client), ReadStatus::Ping));
    }

    #[test]
    fn test_no_buffers_at_queue_capacity() {
        let opts = ChannelOptions { guaranteed_output_buffers: 2, ..Default::default() };
        let (mut client, mut server) = loopback_pair(opts);

        assert!(matches!(client.send(FrameKind::Data, b"a").unwrap(), SendStatus::Queued(_)));
        assert!(matches!(client.send(FrameKind::Data, b"b").unwrap(), SendStatus::Queued(_)));
        assert_eq!(client.send(FrameKind::Data, b"c").unwrap(), SendStatus::NoBuffers);

        // Draining the queue frees capacity again
        assert_eq!(client.flush().unwrap(), FlushStatus::Complete);
        assert!(matches!(client.send(FrameKind::Data, b"d").unwrap(), SendStatus::Queued(_)));

        let mut seen = 0;
        client.flush().unwrap();
        while seen < 3 {
            if let ReadStatus::Payload(_) = read_until_frame(&mut server) {
                seen += 1;
            }
        }
    }

    #[test]
    fn test_high_water_mark_triggers_flush() {
        let opts = ChannelOptions { high_water_mark: 64, ..Default::default() };
        let (mut client, mut server) = loopback_pair(opts);

        // Under the mark: stays queued
        let status = client.send(FrameKind::Data, &[1u8; 16]).unwrap();
        assert!(matches!(status, SendStatus::Queued(_)));
        assert!(client.has_pending());

        // Crossing the mark flushes without an explicit flush call
        let status = client.send(FrameKind::Data, &[2u8; 64]).unwrap();
        assert_eq!(status, SendStatus::Flushed);
        assert!(!client.has_pending());

        assert!(matches!(read_until_frame(&mut server), ReadStatus::Payload(_)));
        assert!(matches!(read_until_frame(&mut server), ReadStatus::Payload(_)));
    }

    #[test]
    fn test_backpressure_then_drain() {
        let opts = ChannelOptions {
            send_buf_size: Some(4096),
            recv_buf_size: Some(4096),
            ..Default::default()
        };
        let (mut client, mut server) = loopback_pair(opts);

        // Fill the kernel buffers against a silent reader until the socket
        // pushes back.
        let chunk = vec![0u8; 4096];
        let mut pending = false;
        for _ in 0..4096 {
            client.send(FrameKind::Data, &chunk).unwrap();
            if let FlushStatus::Pending(n) = client.flush().unwrap() {
                assert!(n > 0);
                pending = true;
                break;
            }
        }
        assert!(pending, "socket never reported backpressure");

        // Repeated flushes against a stalled peer stay pending
        assert!(matches!(client.flush().unwrap(), FlushStatus::Pending(_)));

        // Once the peer drains, a flush completes
        let reader = thread::spawn(move || {
            let mut frames = 0usize;
            loop {
                match server.read_frame() {
                    Ok(ReadStatus::Payload(_)) => frames += 1,
                    Ok(ReadStatus::Ping) => {}
                    Ok(ReadStatus::WouldBlock) => {
                        if frames > 0 {
                            break;
                        }
                        thread::sleep(Duration::from_millis(1));
                    }
                    Err(_) => break,
                }
            }
            (server, frames)
        });

        let mut complete = false;
        for _ in 0..1000 {
            if client.flush().unwrap() == FlushStatus::Complete {
                complete = true;
                break;
            }
            thread::sleep(Duration::from_millis(2));
        }
        assert!(complete, "flush never completed after peer drained");
        let (_server, frames) = reader.join().unwrap();
        assert!(frames > 0);
    }

    #[test]
    fn test_peer_close_surfaces_as_error() {
        let (mut client, mut server) = loopback_pair(ChannelOptions::default());
        server.close();

        let mut closed = false;
        for _ in 0..500 {
            match client.read_frame() {
                Err(Error::Closed) => {
                    closed = true;
                    break;
                }
                Ok(ReadStatus::WouldBlock) => thread::sleep(Duration::from_millis(2)),
                Ok(_) => {}
                Err(_) => {
                    closed = true;
                    break;
                }
            }
        }
        assert!(closed);
    }

    #[test]
    fn test_connect_refused() {
        // Bind then drop to get a port with no listener behind it
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut channel = match NetChannel::connect(addr, ChannelOptions::default()) {
            Ok(c) => c,
            Err(_) => return,
        };
        for _ in 0..500 {
            match channel.handshake_step() {
                Err(_) => return,
                Ok(HandshakeStatus::Established) => {
                    // Connect raced a reused port; nothing to assert
                    return;
                }
                Ok(HandshakeStatus::InProgress) => thread::sleep(Duration::from_millis(2)),
            }
        }
        panic!("refused connect neither failed nor completed");
    }

    #[test]
    fn test_acceptor_nonblocking() {
        let acceptor =
            Acceptor::bind("127.0.0.1:0".parse().unwrap(), ChannelOptions::default()).unwrap();
        assert!(acceptor.accept().unwrap().is_none());

        let addr = acceptor.local_addr().unwrap();
        let mut client = NetChannel::connect(addr, ChannelOptions::default()).unwrap();

        let mut accepted = None;
        for _ in 0..500 {
            if let Some(ch) = acceptor.accept().unwrap() {
                accepted = Some(ch);
                break;
            }
            thread::sleep(Duration::from_millis(2));
        }
        let mut accepted = accepted.expect("no connection accepted");
        wait_established(&mut client);

        client.send(FrameKind::Data, b"hello").unwrap();
        client.flush().unwrap();
        match read_until_frame(&mut accepted) {
            ReadStatus::Payload(p) => assert_eq!(p, b"hello"),
            other => panic!("unexpected read status: {other:?}"),
        }
    }
}
