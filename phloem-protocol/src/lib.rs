//! Market-data wire protocol and the provider/consumer sessions speaking it
//!
//! [`codec`] defines the framed message vocabulary. [`provider`] publishes
//! paced update streams to every connected consumer; [`consumer`] requests
//! items and turns stamped messages into latency samples. Both sides plug
//! into the worker loop through the `Session` trait from phloem-core.

pub mod codec;
pub mod consumer;
pub mod provider;

pub use codec::{
    LoginRole, MarketFields, Message, StatusCode, ITEM_STREAM_ID_START, LOGIN_STREAM_ID,
};
pub use consumer::ConsumerSession;
pub use provider::ProviderSession;

use phloem_core::conn::ConnectionHandle;
use phloem_core::error::{Error, Result};
use phloem_core::SendStatus;
use phloem_transport::FrameKind;

/// Queue one message on the connection's own channel. Session replies ride
/// the same flush cycle as burst traffic; a full queue at this point is a
/// session failure, not backpressure.
pub(crate) fn send_message(conn: &mut ConnectionHandle, message: &Message) -> Result<()> {
    let bytes = message.to_bytes()?;
    match conn.channel.send(FrameKind::Data, &bytes)? {
        SendStatus::NoBuffers => {
            Err(Error::Connection(format!("{}: no buffers for a session reply", conn.id)))
        }
        _ => {
            conn.mark_sent();
            Ok(())
        }
    }
}
