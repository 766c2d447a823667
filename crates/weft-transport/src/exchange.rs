//! One-shot request/reply over any byte connection.

use std::time::Duration;

use weft_core::{Connection, ConnectionError};
use weft_proto::{Message, ProtocolError};

/// Failures during a request/reply exchange.
#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    /// Envelope encode or decode failure.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Transport failure, including deadline expiry.
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// Send one message and await one reply.
///
/// The `timeout` applies separately to the send and the receive;
/// `Duration::ZERO` waits without a deadline. The reply's origin is stamped
/// from the connection's peer address.
///
/// # Errors
///
/// Encode/decode failures surface as [`ExchangeError::Protocol`], transport
/// failures and expiry as [`ExchangeError::Connection`].
pub async fn exchange(
    conn: &dyn Connection<Vec<u8>>,
    message: &Message,
    timeout: Duration,
) -> Result<Message, ExchangeError> {
    conn.write(message.serialize()?, timeout).await?;
    let reply = conn.read(timeout).await?;
    Ok(Message::deserialize(&reply, conn.address())?)
}
