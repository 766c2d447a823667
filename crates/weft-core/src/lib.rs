//! Core of the weft messaging substrate.
//!
//! Everything here is transport-agnostic. Concrete transports (TCP,
//! in-process channels) live in `weft-transport` and plug in through the
//! [`connection`] capability traits.
//!
//! # Components
//!
//! - [`connection`]: polymorphic `Connection`/`Listener` contract any
//!   transport must satisfy, plus the close/stop signal primitive
//! - [`sync_manager`]: blocking-call-over-async-channel correlation by
//!   sync token
//! - [`dispatch`]: the topic dispatch engine with its three concurrency
//!   modes
//! - [`limiter`]: token-bucket admission control
//! - [`metrics`]: named counter registries with check/get snapshot
//!   semantics
//! - [`status`]: shared lifecycle tri-state
//! - [`token`]: seeded random string generation for sync tokens and
//!   instance ids

pub mod connection;
pub mod dispatch;
pub mod limiter;
pub mod metrics;
pub mod status;
pub mod sync_manager;
pub mod token;

pub use connection::{CloseNotifier, CloseSignal, Connection, ConnectionError, Listener};
pub use dispatch::{DispatchError, TopicHandler, TopicManager, TopicManagerConfig};
pub use limiter::{TokenBucket, TokenBucketConfig};
pub use metrics::{MetricsRegistry, MetricsSnapshot};
pub use status::Status;
pub use sync_manager::{SyncError, SyncManager, SyncManagerConfig};
pub use token::TokenGenerator;
