//! Topic resolution directory.
//!
//! Brokers register the topics they serve under their address; clients ask
//! the resolver which address serves a topic before connecting. Each
//! resolution is one short-lived connection: one framed request, at most
//! one framed reply. An unknown topic gets no reply at all; the connection
//! is closed and the client treats the silence as topic-unknown.

mod client;
mod server;

pub use client::resolve_topic;
pub use server::{ResolverConfig, ResolverServer};

use weft_core::ConnectionError;
use weft_proto::ProtocolError;

/// Resolution failures, on either side of the exchange.
#[derive(Debug, thiserror::Error)]
pub enum ResolverError {
    /// Envelope encode or decode failure.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Transport failure.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// The request was not a well-formed resolution request.
    #[error("malformed resolution request: {0}")]
    BadRequest(String),

    /// No broker address was produced for the topic. Covers an unknown
    /// topic, a slow resolver, and a dropped connection alike; the
    /// protocol does not distinguish them.
    #[error("no resolution for topic {0}")]
    NoResolution(String),

    /// The resolver answered with something other than a resolution.
    #[error("unexpected reply topic {0}")]
    UnexpectedReply(String),
}
