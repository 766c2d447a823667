//! In-process channel transport.
//!
//! [`channel_pair`] wires two connection ends together over `mpsc` queues.
//! The ends implement the same capability trait as the TCP transport, with
//! the same timeout and close semantics, so code written against
//! `Connection<D>` runs unchanged over either.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use weft_core::token::ALPHA_NUMERIC;
use weft_core::{
    CloseNotifier, CloseSignal, Connection, ConnectionError, Listener, MetricsRegistry,
    MetricsSnapshot, Status, TokenGenerator,
};

const INSTANCE_ID_LENGTH: usize = 16;
const CLIENTS_ACCEPTED: &str = "clients_accepted";

fn new_instance_id() -> String {
    TokenGenerator::from_entropy().generate(INSTANCE_ID_LENGTH, ALPHA_NUMERIC)
}

enum ReadRace<T> {
    Received(Result<Option<T>, ConnectionError>),
    LocalClosed,
    PeerClosed,
}

/// One end of an in-process connection.
pub struct ChannelConnection<D> {
    tx: mpsc::Sender<D>,
    rx: Mutex<mpsc::Receiver<D>>,
    notifier: CloseNotifier,
    peer_closed: CloseSignal,
    address: String,
    instance_id: String,
}

/// Two connected in-process ends with queues of the given capacity.
pub fn channel_pair<D: Send + 'static>(
    capacity: usize,
) -> (ChannelConnection<D>, ChannelConnection<D>) {
    let capacity = capacity.max(1);
    let (a_tx, b_rx) = mpsc::channel(capacity);
    let (b_tx, a_rx) = mpsc::channel(capacity);
    let (a_notifier, a_closed) = CloseSignal::pair();
    let (b_notifier, b_closed) = CloseSignal::pair();
    let a_id = new_instance_id();
    let b_id = new_instance_id();
    let a_address = format!("channel://{b_id}");
    let b_address = format!("channel://{a_id}");
    let a = ChannelConnection {
        tx: a_tx,
        rx: Mutex::new(a_rx),
        notifier: a_notifier,
        peer_closed: b_closed,
        address: a_address,
        instance_id: a_id,
    };
    let b = ChannelConnection {
        tx: b_tx,
        rx: Mutex::new(b_rx),
        notifier: b_notifier,
        peer_closed: a_closed,
        address: b_address,
        instance_id: b_id,
    };
    (a, b)
}

#[async_trait]
impl<D: Send + 'static> Connection<D> for ChannelConnection<D> {
    async fn read(&self, timeout: Duration) -> Result<D, ConnectionError> {
        let mut rx = self.rx.lock().await;
        if self.notifier.is_notified() {
            return Err(ConnectionError::Closed);
        }
        let closed = self.notifier.signal();
        let recv = async {
            if timeout.is_zero() {
                Ok(rx.recv().await)
            } else {
                tokio::time::timeout(timeout, rx.recv())
                    .await
                    .map_err(|_| ConnectionError::Timeout)
            }
        };
        let race = tokio::select! {
            biased;
            received = recv => ReadRace::Received(received),
            () = closed.wait() => ReadRace::LocalClosed,
            () = self.peer_closed.clone().wait() => ReadRace::PeerClosed,
        };
        match race {
            ReadRace::Received(received) => received?.ok_or(ConnectionError::Closed),
            ReadRace::LocalClosed => Err(ConnectionError::Closed),
            // Deliver anything the peer queued before closing, like TCP
            // delivers data that arrived ahead of a FIN.
            ReadRace::PeerClosed => rx.try_recv().map_err(|_| ConnectionError::Closed),
        }
    }

    async fn write(&self, payload: D, timeout: Duration) -> Result<(), ConnectionError> {
        if self.notifier.is_notified() || self.peer_closed.is_closed() {
            return Err(ConnectionError::Closed);
        }
        let send = async {
            if timeout.is_zero() {
                self.tx
                    .send(payload)
                    .await
                    .map_err(|_| ConnectionError::Closed)
            } else {
                match tokio::time::timeout(timeout, self.tx.send(payload)).await {
                    Ok(sent) => sent.map_err(|_| ConnectionError::Closed),
                    Err(_) => Err(ConnectionError::Timeout),
                }
            }
        };
        let closed = self.notifier.signal();
        let peer_closed = self.peer_closed.clone();
        tokio::select! {
            () = closed.wait() => Err(ConnectionError::Closed),
            () = peer_closed.wait() => Err(ConnectionError::Closed),
            sent = send => sent,
        }
    }

    async fn close(&self) -> Result<(), ConnectionError> {
        if self.notifier.is_notified() {
            return Err(ConnectionError::AlreadyClosed);
        }
        self.notifier.notify();
        Ok(())
    }

    fn status(&self) -> Status {
        if self.notifier.is_notified() {
            Status::Stopped
        } else {
            Status::Started
        }
    }

    fn close_signal(&self) -> CloseSignal {
        self.notifier.signal()
    }

    fn address(&self) -> String {
        self.address.clone()
    }

    fn instance_id(&self) -> &str {
        &self.instance_id
    }
}

/// Hands dialed connection ends to an accepting component.
pub struct ChannelListener<D> {
    accept_rx: Mutex<mpsc::Receiver<ChannelConnection<D>>>,
    dial_tx: mpsc::Sender<ChannelConnection<D>>,
    notifier: CloseNotifier,
    instance_id: String,
    metrics: MetricsRegistry,
}

/// Dialing side of a [`ChannelListener`].
#[derive(Clone)]
pub struct ChannelDialer<D> {
    tx: mpsc::Sender<ChannelConnection<D>>,
}

impl<D: Send + 'static> ChannelDialer<D> {
    /// Create a connected pair and hand one end to the listener.
    ///
    /// # Errors
    ///
    /// Fails with [`ConnectionError::Closed`] when the listener is gone.
    pub async fn dial(&self, capacity: usize) -> Result<ChannelConnection<D>, ConnectionError> {
        let (local, remote) = channel_pair(capacity);
        self.tx
            .send(remote)
            .await
            .map_err(|_| ConnectionError::Closed)?;
        Ok(local)
    }
}

impl<D: Send + 'static> ChannelListener<D> {
    /// Listener with a pending-dial queue of the given capacity.
    pub fn new(backlog: usize) -> Self {
        let (dial_tx, accept_rx) = mpsc::channel(backlog.max(1));
        let (notifier, _) = CloseSignal::pair();
        Self {
            accept_rx: Mutex::new(accept_rx),
            dial_tx,
            notifier,
            instance_id: new_instance_id(),
            metrics: MetricsRegistry::new(&[CLIENTS_ACCEPTED]),
        }
    }

    /// A handle clients use to dial this listener.
    pub fn dialer(&self) -> ChannelDialer<D> {
        ChannelDialer {
            tx: self.dial_tx.clone(),
        }
    }
}

#[async_trait]
impl<D: Send + 'static> Listener<D> for ChannelListener<D> {
    async fn accept(&self, timeout: Duration) -> Result<Box<dyn Connection<D>>, ConnectionError> {
        let mut accept_rx = self.accept_rx.lock().await;
        if self.notifier.is_notified() {
            return Err(ConnectionError::Closed);
        }
        let stopped = self.notifier.signal();
        let recv = async {
            if timeout.is_zero() {
                Ok(accept_rx.recv().await)
            } else {
                tokio::time::timeout(timeout, accept_rx.recv())
                    .await
                    .map_err(|_| ConnectionError::Timeout)
            }
        };
        let conn = tokio::select! {
            () = stopped.wait() => return Err(ConnectionError::Closed),
            received = recv => received?.ok_or(ConnectionError::Closed)?,
        };
        self.metrics.inc(CLIENTS_ACCEPTED);
        Ok(Box::new(conn))
    }

    async fn stop(&self) -> Result<(), ConnectionError> {
        if self.notifier.is_notified() {
            return Err(ConnectionError::AlreadyClosed);
        }
        self.notifier.notify();
        Ok(())
    }

    fn status(&self) -> Status {
        if self.notifier.is_notified() {
            Status::Stopped
        } else {
            Status::Started
        }
    }

    fn stop_signal(&self) -> CloseSignal {
        self.notifier.signal()
    }

    fn address(&self) -> String {
        format!("channel://{}", self.instance_id)
    }

    fn instance_id(&self) -> &str {
        &self.instance_id
    }

    fn check_metrics(&self) -> MetricsSnapshot {
        self.metrics.check_metrics()
    }

    fn get_metrics(&self) -> MetricsSnapshot {
        self.metrics.get_metrics()
    }
}
