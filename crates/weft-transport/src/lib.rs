//! Transport implementations for the weft messaging substrate.
//!
//! Two transports implement the capability traits from `weft-core`:
//!
//! - [`tcp`]: framed messages over `tokio::net::TcpStream`, the production
//!   transport.
//! - [`channel`]: an in-process pair of queues with identical external
//!   behavior, used to exercise transport-agnostic code without sockets.
//!
//! [`exchange`] holds the one-shot request/reply helper built on top of
//! either transport.

pub mod channel;
pub mod exchange;
pub mod tcp;

pub use channel::{ChannelConnection, ChannelDialer, ChannelListener, channel_pair};
pub use exchange::{ExchangeError, exchange};
pub use tcp::{TcpConnection, TcpConnectionConfig, TcpListener, dial};
