//! Market-data message codec
//!
//! One message per data frame, all integers big-endian. Layout:
//! `[type: u8][body]`.
//!
//! Bodies:
//! - LOGIN_REQUEST:  `[role: u8][name_len: u16][name]`
//! - LOGIN_ACK:      `[ping_timeout_sec: u32]`
//! - ITEM_REQUEST:   `[stream_id: u32][streaming: u8][name_len: u16][name]`
//! - REFRESH:        `[stream_id: u32][solicited: u8][fields]`
//! - UPDATE:         `[stream_id: u32][send_time_us: i64][fields]`
//! - GENERIC:        `[stream_id: u32][send_time_us: i64]`
//! - STATUS:         `[stream_id: u32][code: u8]`
//!
//! `fields` is the 28-byte MarketFields block: bid, ask, trade price as f64
//! plus a u32 sequence number. A `send_time_us` of zero means the message
//! carries no latency stamp.

use anyhow::{anyhow, bail, Result};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

const LOGIN_REQUEST: u8 = 1;
const LOGIN_ACK: u8 = 2;
const ITEM_REQUEST: u8 = 3;
const REFRESH: u8 = 4;
const UPDATE: u8 = 5;
const GENERIC: u8 = 6;
const STATUS: u8 = 7;

/// Login stream id, below the range item streams use
pub const LOGIN_STREAM_ID: u32 = 1;
/// First stream id assigned to requested items
pub const ITEM_STREAM_ID_START: u32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginRole {
    Consumer,
    Provider,
}

impl LoginRole {
    pub fn as_u8(self) -> u8 {
        match self {
            LoginRole::Consumer => 1,
            LoginRole::Provider => 2,
        }
    }

    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            1 => Ok(LoginRole::Consumer),
            2 => Ok(LoginRole::Provider),
            other => Err(anyhow!("unknown login role: {other}")),
        }
    }
}

/// Item rejection and stream-close codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    AlreadyOpen,
    CapacityExceeded,
}

impl StatusCode {
    pub fn as_u8(self) -> u8 {
        match self {
            StatusCode::AlreadyOpen => 1,
            StatusCode::CapacityExceeded => 2,
        }
    }

    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            1 => Ok(StatusCode::AlreadyOpen),
            2 => Ok(StatusCode::CapacityExceeded),
            other => Err(anyhow!("unknown status code: {other}")),
        }
    }
}

/// Fixed MarketPrice-like payload carried by refreshes and updates
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MarketFields {
    pub bid: f64,
    pub ask: f64,
    pub trade_price: f64,
    pub seq: u32,
}

impl MarketFields {
    pub const WIRE_LEN: usize = 28;

    fn encode(&self, out: &mut Vec<u8>) -> Result<()> {
        out.write_f64::<BigEndian>(self.bid)?;
        out.write_f64::<BigEndian>(self.ask)?;
        out.write_f64::<BigEndian>(self.trade_price)?;
        out.write_u32::<BigEndian>(self.seq)?;
        Ok(())
    }

    fn parse(cursor: &mut Cursor<&[u8]>) -> Result<Self> {
        Ok(Self {
            bid: cursor.read_f64::<BigEndian>()?,
            ask: cursor.read_f64::<BigEndian>()?,
            trade_price: cursor.read_f64::<BigEndian>()?,
            seq: cursor.read_u32::<BigEndian>()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    LoginRequest { username: String, role: LoginRole },
    LoginAck { ping_timeout_sec: u32 },
    ItemRequest { stream_id: u32, name: String, streaming: bool },
    Refresh { stream_id: u32, fields: MarketFields, solicited: bool },
    Update { stream_id: u32, fields: MarketFields, send_time_us: i64 },
    Generic { stream_id: u32, send_time_us: i64 },
    Status { stream_id: u32, code: StatusCode },
}

impl Message {
    /// Append the encoded message to `out`
    pub fn encode(&self, out: &mut Vec<u8>) -> Result<()> {
        match self {
            Message::LoginRequest { username, role } => {
                out.write_u8(LOGIN_REQUEST)?;
                out.write_u8(role.as_u8())?;
                write_str(out, username)?;
            }
            Message::LoginAck { ping_timeout_sec } => {
                out.write_u8(LOGIN_ACK)?;
                out.write_u32::<BigEndian>(*ping_timeout_sec)?;
            }
            Message::ItemRequest { stream_id, name, streaming } => {
                out.write_u8(ITEM_REQUEST)?;
                out.write_u32::<BigEndian>(*stream_id)?;
                out.write_u8(u8::from(*streaming))?;
                write_str(out, name)?;
            }
            Message::Refresh { stream_id, fields, solicited } => {
                out.write_u8(REFRESH)?;
                out.write_u32::<BigEndian>(*stream_id)?;
                out.write_u8(u8::from(*solicited))?;
                fields.encode(out)?;
            }
            Message::Update { stream_id, fields, send_time_us } => {
                out.write_u8(UPDATE)?;
                out.write_u32::<BigEndian>(*stream_id)?;
                out.write_i64::<BigEndian>(*send_time_us)?;
                fields.encode(out)?;
            }
            Message::Generic { stream_id, send_time_us } => {
                out.write_u8(GENERIC)?;
                out.write_u32::<BigEndian>(*stream_id)?;
                out.write_i64::<BigEndian>(*send_time_us)?;
            }
            Message::Status { stream_id, code } => {
                out.write_u8(STATUS)?;
                out.write_u32::<BigEndian>(*stream_id)?;
                out.write_u8(code.as_u8())?;
            }
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(64);
        self.encode(&mut out)?;
        Ok(out)
    }

    /// Parse one message from a complete data-frame payload
    pub fn parse(payload: &[u8]) -> Result<Message> {
        let mut cursor = Cursor::new(payload);
        let kind = cursor.read_u8()?;
        let message = match kind {
            LOGIN_REQUEST => {
                let role = LoginRole::from_u8(cursor.read_u8()?)?;
                let username = read_str(&mut cursor, payload)?;
                Message::LoginRequest { username, role }
            }
            LOGIN_ACK => Message::LoginAck { ping_timeout_sec: cursor.read_u32::<BigEndian>()? },
            ITEM_REQUEST => {
                let stream_id = cursor.read_u32::<BigEndian>()?;
                let streaming = cursor.read_u8()? != 0;
                let name = read_str(&mut cursor, payload)?;
                Message::ItemRequest { stream_id, name, streaming }
            }
            REFRESH => {
                let stream_id = cursor.read_u32::<BigEndian>()?;
                let solicited = cursor.read_u8()? != 0;
                let fields = MarketFields::parse(&mut cursor)?;
                Message::Refresh { stream_id, fields, solicited }
            }
            UPDATE => {
                let stream_id = cursor.read_u32::<BigEndian>()?;
                let send_time_us = cursor.read_i64::<BigEndian>()?;
                let fields = MarketFields::parse(&mut cursor)?;
                Message::Update { stream_id, fields, send_time_us }
            }
            GENERIC => {
                let stream_id = cursor.read_u32::<BigEndian>()?;
                let send_time_us = cursor.read_i64::<BigEndian>()?;
                Message::Generic { stream_id, send_time_us }
            }
            STATUS => {
                let stream_id = cursor.read_u32::<BigEndian>()?;
                let code = StatusCode::from_u8(cursor.read_u8()?)?;
                Message::Status { stream_id, code }
            }
            other => bail!("unknown message type: {other}"),
        };
        let consumed = cursor.position() as usize;
        if consumed != payload.len() {
            bail!("{} trailing bytes after message", payload.len() - consumed);
        }
        Ok(message)
    }
}

fn write_str(out: &mut Vec<u8>, s: &str) -> Result<()> {
    if s.len() > u16::MAX as usize {
        bail!("string field too long: {} bytes", s.len());
    }
    out.write_u16::<BigEndian>(s.len() as u16)?;
    out.extend_from_slice(s.as_bytes());
    Ok(())
}

fn read_str(cursor: &mut Cursor<&[u8]>, payload: &[u8]) -> Result<String> {
    let len = cursor.read_u16::<BigEndian>()? as usize;
    let start = cursor.position() as usize;
    let end = start
        .checked_add(len)
        .filter(|&e| e <= payload.len())
        .ok_or_else(|| anyhow!("string field runs past the end of the message"))?;
    let s = std::str::from_utf8(&payload[start..end])?.to_string();
    cursor.set_position(end as u64);
    Ok(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(message: Message) -> Message {
        let bytes = message.to_bytes().unwrap();
        Message::parse(&bytes).unwrap()
    }

    #[test]
    fn test_login_exchange_round_trip() {
        let request = Message::LoginRequest {
            username: "bench-0".to_string(),
            role: LoginRole::Consumer,
        };
        assert_eq!(round_trip(request.clone()), request);

        let ack = Message::LoginAck { ping_timeout_sec: 10 };
        assert_eq!(round_trip(ack.clone()), ack);
    }

    #[test]
    fn test_update_keeps_stamp_and_fields() {
        let update = Message::Update {
            stream_id: ITEM_STREAM_ID_START,
            fields: MarketFields { bid: 100.25, ask: 100.5, trade_price: 100.375, seq: 42 },
            send_time_us: 987_654_321,
        };
        match round_trip(update) {
            Message::Update { stream_id, fields, send_time_us } => {
                assert_eq!(stream_id, ITEM_STREAM_ID_START);
                assert_eq!(fields.seq, 42);
                assert_eq!(fields.bid, 100.25);
                assert_eq!(send_time_us, 987_654_321);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_item_request_with_name() {
        let request = Message::ItemRequest {
            stream_id: 6,
            name: "item-1234".to_string(),
            streaming: true,
        };
        assert_eq!(round_trip(request.clone()), request);
    }

    #[test]
    fn test_unknown_type_rejected() {
        assert!(Message::parse(&[99, 0, 0]).is_err());
    }

    #[test]
    fn test_truncated_body_rejected() {
        let bytes = Message::Generic { stream_id: 6, send_time_us: 1 }.to_bytes().unwrap();
        assert!(Message::parse(&bytes[..bytes.len() - 2]).is_err());
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = Message::LoginAck { ping_timeout_sec: 10 }.to_bytes().unwrap();
        bytes.push(0);
        assert!(Message::parse(&bytes).is_err());
    }

    #[test]
    fn test_name_length_is_bounded() {
        // Claims a 200-byte name but carries 2
        let bytes = vec![ITEM_REQUEST, 0, 0, 0, 6, 1, 0, 200, b'a', b'b'];
        assert!(Message::parse(&bytes).is_err());
    }

    #[test]
    fn test_status_codes_map_both_ways() {
        for code in [StatusCode::AlreadyOpen, StatusCode::CapacityExceeded] {
            assert_eq!(StatusCode::from_u8(code.as_u8()).unwrap(), code);
        }
        assert!(StatusCode::from_u8(0).is_err());
        assert!(StatusCode::from_u8(3).is_err());
    }
}
