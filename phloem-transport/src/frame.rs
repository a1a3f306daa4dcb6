//! Length-prefixed frame encoding and incremental decoding
//!
//! Frames are `[length: u32 BE][kind: u8][payload]` where `length` counts the
//! kind byte and the payload. The decoder accumulates raw socket bytes and
//! yields complete frames; partial frames stay buffered until more bytes
//! arrive.

use crate::{Error, Result};
use byteorder::{BigEndian, ByteOrder};

/// Bytes preceding the payload: u32 length + u8 kind
pub const FRAME_HEADER_LEN: usize = 5;

/// Default cap on a single frame's payload, matching the transport's
/// default fragment size.
pub const DEFAULT_MAX_PAYLOAD: usize = 6144;

/// Frame type discriminator carried after the length prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Application payload
    Data,
    /// Empty liveness frame
    Ping,
}

impl FrameKind {
    pub fn as_u8(self) -> u8 {
        match self {
            FrameKind::Data => 0,
            FrameKind::Ping => 1,
        }
    }

    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(FrameKind::Data),
            1 => Ok(FrameKind::Ping),
            other => Err(Error::Frame(format!("unknown frame kind: {other}"))),
        }
    }
}

/// Append one encoded frame to `out`
pub fn encode_frame(kind: FrameKind, payload: &[u8], out: &mut Vec<u8>) {
    let mut header = [0u8; FRAME_HEADER_LEN];
    BigEndian::write_u32(&mut header[..4], (payload.len() + 1) as u32);
    header[4] = kind.as_u8();
    out.extend_from_slice(&header);
    out.extend_from_slice(payload);
}

/// Encoded length of a frame carrying `payload_len` bytes
pub fn frame_len(payload_len: usize) -> usize {
    FRAME_HEADER_LEN + payload_len
}

/// Incremental frame decoder over a byte-accumulation buffer
///
/// `feed` appends raw socket bytes; `next_frame` yields complete frames in
/// order. The consumed prefix is compacted away once it grows past the
/// buffer's live contents, keeping the buffer from growing without bound.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    pos: usize,
    max_payload: usize,
}

impl FrameDecoder {
    pub fn new(max_payload: usize) -> Self {
        Self { buf: Vec::with_capacity(8192), pos: 0, max_payload }
    }

    /// Append raw bytes from the socket
    pub fn feed(&mut self, bytes: &[u8]) {
        self.compact();
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes currently buffered but not yet consumed
    pub fn buffered(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Decode the next complete frame, if one is buffered
    pub fn next_frame(&mut self) -> Result<Option<(FrameKind, Vec<u8>)>> {
        let avail = &self.buf[self.pos..];
        if avail.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let len = BigEndian::read_u32(&avail[..4]) as usize;
        if len == 0 {
            return Err(Error::Frame("zero-length frame".to_string()));
        }
        if len - 1 > self.max_payload {
            return Err(Error::Frame(format!(
                "frame payload {} exceeds limit {}",
                len - 1,
                self.max_payload
            )));
        }
        if avail.len() < 4 + len {
            return Ok(None);
        }

        let kind = FrameKind::from_u8(avail[4])?;
        let payload = avail[FRAME_HEADER_LEN..4 + len].to_vec();
        self.pos += 4 + len;
        Ok(Some((kind, payload)))
    }

    fn compact(&mut self) {
        if self.pos > 0 && self.pos >= self.buf.len() - self.pos {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
    }
}
