//! Client-side resolution helper.

use std::time::Duration;

use weft_core::{Connection as _, ConnectionError};
use weft_proto::{Message, TOPIC_RESOLUTION, TOPIC_RESOLVE};
use weft_transport::exchange::{ExchangeError, exchange};
use weft_transport::tcp::{TcpConnectionConfig, dial};

use crate::ResolverError;

/// Ask the resolver at `resolver_addr` which broker serves `topic`.
///
/// Dials, sends one resolution request, and waits up to `timeout` for the
/// reply. A resolver that knows the topic answers with the broker address;
/// one that does not closes the connection without replying, which
/// surfaces here as [`ResolverError::NoResolution`] once the timeout (or
/// the close) is observed.
///
/// # Errors
///
/// [`ResolverError::NoResolution`] for silence or a dropped connection,
/// [`ResolverError::UnexpectedReply`] for a reply that is not a
/// resolution, and the transport/protocol variants for everything else.
pub async fn resolve_topic(
    resolver_addr: &str,
    topic: &str,
    timeout: Duration,
) -> Result<String, ResolverError> {
    let conn = dial(resolver_addr, &TcpConnectionConfig::default()).await?;
    let request = Message::new_async(TOPIC_RESOLVE, topic);
    let reply = match exchange(&conn, &request, timeout).await {
        Ok(reply) => reply,
        Err(ExchangeError::Connection(ConnectionError::Timeout | ConnectionError::Closed)) => {
            let _ = conn.close().await;
            return Err(ResolverError::NoResolution(topic.to_string()));
        }
        Err(ExchangeError::Connection(err)) => return Err(err.into()),
        Err(ExchangeError::Protocol(err)) => return Err(err.into()),
    };
    let _ = conn.close().await;

    if reply.topic() != TOPIC_RESOLUTION {
        return Err(ResolverError::UnexpectedReply(reply.topic().to_string()));
    }
    Ok(reply.payload().to_string())
}
