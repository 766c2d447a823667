//! The polymorphic connection/listener contract.
//!
//! Any transport, whether TCP or in-process channels, implements
//! these capability traits and becomes interchangeable with every other
//! implementation. The dispatch and correlation layers consume connections
//! only through this contract and must not assume a concrete transport.
//!
//! Both traits are generic over the payload type `D`, so the same logic can
//! run over raw bytes, structured messages, or any transport-negotiated
//! type.
//!
//! # Timeouts
//!
//! Every blocking operation takes an explicit timeout; `Duration::ZERO`
//! means no deadline (block indefinitely). Closing a connection or stopping
//! a listener is the only cancellation primitive: it fires the close/stop
//! signal exactly once, unblocking anything selecting on it.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::metrics::MetricsSnapshot;
use crate::status::Status;

/// Transport-level errors surfaced to callers.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// Underlying I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The supplied deadline elapsed. Distinguishable from hard transport
    /// failure so callers can retry instead of aborting.
    #[error("deadline exceeded")]
    Timeout,

    /// The peer closed, or the connection/listener is already stopped.
    #[error("connection closed")]
    Closed,

    /// `close` was called on an already-closed connection. Closing twice is
    /// a caller bug, not an idempotent no-op.
    #[error("already closed")]
    AlreadyClosed,

    /// The peer violated the wire protocol.
    #[error("protocol violation: {0}")]
    Protocol(String),
}

/// Clonable handle that resolves once its owner closes or stops.
///
/// The Rust rendition of a close-notification channel: created alongside a
/// [`CloseNotifier`], it can be awaited from any number of tasks and fires
/// exactly once.
#[derive(Debug, Clone)]
pub struct CloseSignal {
    rx: watch::Receiver<bool>,
}

impl CloseSignal {
    /// Create a connected notifier/signal pair.
    pub fn pair() -> (CloseNotifier, Self) {
        let (tx, rx) = watch::channel(false);
        (CloseNotifier { tx }, Self { rx })
    }

    /// Resolve once the owner has closed. Returns immediately if it
    /// already has.
    pub async fn wait(mut self) {
        // A dropped notifier counts as closed.
        while !*self.rx.borrow() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Whether the owner has already closed.
    pub fn is_closed(&self) -> bool {
        *self.rx.borrow()
    }
}

/// Owning side of a [`CloseSignal`]. Held by the transport implementation;
/// notifying twice has no additional effect.
#[derive(Debug)]
pub struct CloseNotifier {
    tx: watch::Sender<bool>,
}

impl CloseNotifier {
    /// Fire the signal. All current and future waiters resolve. The value
    /// must land even when no signal handle is currently alive, so this
    /// never takes the receiver-gated `send` path.
    pub fn notify(&self) {
        self.tx.send_replace(true);
    }

    /// Whether the signal has been fired.
    pub fn is_notified(&self) -> bool {
        *self.tx.borrow()
    }

    /// A fresh signal handle observing this notifier.
    pub fn signal(&self) -> CloseSignal {
        CloseSignal {
            rx: self.tx.subscribe(),
        }
    }
}

/// One logical duplex channel to a peer.
///
/// Owned exclusively by whichever component accepted or dialed it. Within a
/// single connection, reads and writes are ordered as issued.
#[async_trait]
pub trait Connection<D: Send + 'static>: Send + Sync {
    /// Receive the next payload, blocking up to `timeout`
    /// (`Duration::ZERO` = no deadline).
    async fn read(&self, timeout: Duration) -> Result<D, ConnectionError>;

    /// Send a payload, blocking up to `timeout` (`Duration::ZERO` = no
    /// deadline).
    async fn write(&self, payload: D, timeout: Duration) -> Result<(), ConnectionError>;

    /// Close the connection and fire the close signal exactly once.
    ///
    /// # Errors
    ///
    /// A second close fails with [`ConnectionError::AlreadyClosed`].
    async fn close(&self) -> Result<(), ConnectionError>;

    /// Current lifecycle status.
    fn status(&self) -> Status;

    /// Signal that fires when the connection transitions to closed, for
    /// `select!`-style cancellation.
    fn close_signal(&self) -> CloseSignal;

    /// Peer address in transport-specific form.
    fn address(&self) -> String;

    /// Identity of this connection instance.
    fn instance_id(&self) -> &str;
}

/// Produces [`Connection`]s from a transport's accept queue.
#[async_trait]
pub trait Listener<D: Send + 'static>: Send + Sync {
    /// Accept the next pending connection, blocking up to `timeout`
    /// (`Duration::ZERO` = no deadline).
    ///
    /// # Errors
    ///
    /// Deadline expiry yields [`ConnectionError::Timeout`]; a stopped
    /// listener yields [`ConnectionError::Closed`]; transport failures
    /// yield [`ConnectionError::Io`].
    async fn accept(&self, timeout: Duration) -> Result<Box<dyn Connection<D>>, ConnectionError>;

    /// Stop the listener, unblocking any in-flight accept.
    ///
    /// # Errors
    ///
    /// A second stop fails with [`ConnectionError::AlreadyClosed`].
    async fn stop(&self) -> Result<(), ConnectionError>;

    /// Current lifecycle status.
    fn status(&self) -> Status;

    /// Signal that fires when the listener stops.
    fn stop_signal(&self) -> CloseSignal;

    /// Local address the listener is bound to.
    fn address(&self) -> String;

    /// Identity of this listener instance.
    fn instance_id(&self) -> &str;

    /// Snapshot counters without resetting.
    fn check_metrics(&self) -> MetricsSnapshot;

    /// Snapshot counters and reset them.
    fn get_metrics(&self) -> MetricsSnapshot;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn close_signal_fires_exactly_once_for_all_waiters() {
        let (notifier, signal) = CloseSignal::pair();
        let early = tokio::spawn(signal.clone().wait());

        assert!(!signal.is_closed());
        notifier.notify();
        assert!(signal.is_closed());
        early.await.unwrap();

        // Late waiters resolve immediately.
        notifier.signal().wait().await;

        // A second notify changes nothing.
        notifier.notify();
        assert!(notifier.is_notified());
    }

    #[tokio::test]
    async fn dropped_notifier_releases_waiters() {
        let (notifier, signal) = CloseSignal::pair();
        drop(notifier);
        signal.wait().await;
    }

    #[test]
    fn notify_lands_with_no_signal_alive() {
        let (notifier, signal) = CloseSignal::pair();
        drop(signal);

        assert!(!notifier.is_notified());
        notifier.notify();
        assert!(notifier.is_notified());
    }
}
