//! Framed TCP transport.
//!
//! A [`TcpConnection`] carries length-prefixed frames over a
//! `tokio::net::TcpStream`. Reads and writes go through the framing layer
//! in `weft-proto`; the payload type is raw bytes, envelope encoding is the
//! caller's concern.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use weft_core::token::ALPHA_NUMERIC;
use weft_core::{
    CloseNotifier, CloseSignal, Connection, ConnectionError, Listener, MetricsRegistry,
    MetricsSnapshot, Status, TokenGenerator,
};
use weft_proto::{FrameReader, FramingError, MAX_FRAME_SIZE};

const INSTANCE_ID_LENGTH: usize = 16;

const BYTES_SENT: &str = "bytes_sent";
const BYTES_RECEIVED: &str = "bytes_received";
const MESSAGES_SENT: &str = "messages_sent";
const MESSAGES_RECEIVED: &str = "messages_received";
const CLIENTS_ACCEPTED: &str = "clients_accepted";
const CLIENTS_FAILED: &str = "clients_failed";

/// Per-connection tuning.
#[derive(Debug, Clone)]
pub struct TcpConnectionConfig {
    /// Socket read chunk size in bytes.
    pub read_chunk_size: usize,
    /// Upper bound on a single incoming frame. Oversize frames are a
    /// protocol violation.
    pub max_frame_size: usize,
}

impl Default for TcpConnectionConfig {
    fn default() -> Self {
        Self {
            read_chunk_size: 4096,
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

fn map_framing(err: FramingError) -> ConnectionError {
    match err {
        FramingError::Timeout => ConnectionError::Timeout,
        FramingError::Closed => ConnectionError::Closed,
        FramingError::Io(err) => ConnectionError::Io(err),
        err @ FramingError::TooLarge { .. } => ConnectionError::Protocol(err.to_string()),
    }
}

fn new_instance_id() -> String {
    TokenGenerator::from_entropy().generate(INSTANCE_ID_LENGTH, ALPHA_NUMERIC)
}

/// One framed TCP connection.
///
/// Concurrent reads serialize on the read half, concurrent writes on the
/// write half. `close` is owned by a single component; calling it twice is
/// an error.
pub struct TcpConnection {
    reader: Mutex<FrameReader<OwnedReadHalf>>,
    writer: Mutex<OwnedWriteHalf>,
    notifier: CloseNotifier,
    peer_address: String,
    instance_id: String,
    metrics: MetricsRegistry,
}

impl TcpConnection {
    fn from_stream(stream: TcpStream, config: &TcpConnectionConfig) -> Result<Self, ConnectionError> {
        let peer_address = stream.peer_addr()?.to_string();
        let (read_half, write_half) = stream.into_split();
        let (notifier, _) = CloseSignal::pair();
        Ok(Self {
            reader: Mutex::new(FrameReader::new(
                read_half,
                config.read_chunk_size,
                config.max_frame_size,
            )),
            writer: Mutex::new(write_half),
            notifier,
            peer_address,
            instance_id: new_instance_id(),
            metrics: MetricsRegistry::new(&[
                BYTES_SENT,
                BYTES_RECEIVED,
                MESSAGES_SENT,
                MESSAGES_RECEIVED,
            ]),
        })
    }

    /// Non-resetting traffic counter snapshot.
    pub fn check_metrics(&self) -> MetricsSnapshot {
        self.metrics.check_metrics()
    }

    /// Traffic counter snapshot; counters reset to zero.
    pub fn get_metrics(&self) -> MetricsSnapshot {
        self.metrics.get_metrics()
    }
}

/// Connect to `addr` and wrap the stream in a [`TcpConnection`].
///
/// One attempt, no retries.
///
/// # Errors
///
/// Connect failures surface as [`ConnectionError::Io`].
pub async fn dial(
    addr: &str,
    config: &TcpConnectionConfig,
) -> Result<TcpConnection, ConnectionError> {
    let stream = TcpStream::connect(addr).await?;
    TcpConnection::from_stream(stream, config)
}

#[async_trait]
impl Connection<Vec<u8>> for TcpConnection {
    async fn read(&self, timeout: Duration) -> Result<Vec<u8>, ConnectionError> {
        let mut reader = self.reader.lock().await;
        if self.notifier.is_notified() {
            return Err(ConnectionError::Closed);
        }
        let closed = self.notifier.signal();
        let frame = tokio::select! {
            () = closed.wait() => return Err(ConnectionError::Closed),
            frame = reader.read_frame(timeout) => frame.map_err(map_framing)?,
        };
        self.metrics.add(BYTES_RECEIVED, frame.len() as u64);
        self.metrics.inc(MESSAGES_RECEIVED);
        Ok(frame.to_vec())
    }

    async fn write(&self, payload: Vec<u8>, timeout: Duration) -> Result<(), ConnectionError> {
        let mut writer = self.writer.lock().await;
        if self.notifier.is_notified() {
            return Err(ConnectionError::Closed);
        }
        let closed = self.notifier.signal();
        tokio::select! {
            () = closed.wait() => return Err(ConnectionError::Closed),
            result = weft_proto::framing::write_frame(&mut *writer, &payload, timeout) => {
                result.map_err(map_framing)?;
            }
        }
        self.metrics.add(BYTES_SENT, payload.len() as u64);
        self.metrics.inc(MESSAGES_SENT);
        Ok(())
    }

    async fn close(&self) -> Result<(), ConnectionError> {
        if self.notifier.is_notified() {
            return Err(ConnectionError::AlreadyClosed);
        }
        self.notifier.notify();
        let mut writer = self.writer.lock().await;
        // Shutdown failures are expected when the peer is already gone.
        if let Err(err) = writer.shutdown().await {
            tracing::debug!(peer = %self.peer_address, %err, "shutdown after close");
        }
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
        self.peer_address.clone()
    }

    fn instance_id(&self) -> &str {
        &self.instance_id
    }
}

/// Accepts framed TCP connections.
///
/// Binds at construction. `stop` unblocks every in-flight `accept`.
pub struct TcpListener {
    inner: tokio::net::TcpListener,
    config: TcpConnectionConfig,
    notifier: CloseNotifier,
    local_address: String,
    instance_id: String,
    metrics: MetricsRegistry,
}

impl TcpListener {
    /// Bind to `addr` and start accepting.
    ///
    /// # Errors
    ///
    /// Bind failures surface as [`ConnectionError::Io`].
    pub async fn bind(addr: &str, config: TcpConnectionConfig) -> Result<Self, ConnectionError> {
        let inner = tokio::net::TcpListener::bind(addr).await?;
        let local_address = inner.local_addr()?.to_string();
        let (notifier, _) = CloseSignal::pair();
        Ok(Self {
            inner,
            config,
            notifier,
            local_address,
            instance_id: new_instance_id(),
            metrics: MetricsRegistry::new(&[CLIENTS_ACCEPTED, CLIENTS_FAILED]),
        })
    }
}

#[async_trait]
impl Listener<Vec<u8>> for TcpListener {
    async fn accept(
        &self,
        timeout: Duration,
    ) -> Result<Box<dyn Connection<Vec<u8>>>, ConnectionError> {
        if self.notifier.is_notified() {
            return Err(ConnectionError::Closed);
        }
        let stopped = self.notifier.signal();
        let accept = async {
            if timeout.is_zero() {
                self.inner.accept().await.map_err(ConnectionError::from)
            } else {
                match tokio::time::timeout(timeout, self.inner.accept()).await {
                    Ok(result) => result.map_err(ConnectionError::from),
                    Err(_) => Err(ConnectionError::Timeout),
                }
            }
        };

        let result = tokio::select! {
            () = stopped.wait() => Err(ConnectionError::Closed),
            result = accept => result,
        };
        match result {
            Ok((stream, _)) => match TcpConnection::from_stream(stream, &self.config) {
                Ok(conn) => {
                    self.metrics.inc(CLIENTS_ACCEPTED);
                    Ok(Box::new(conn))
                }
                Err(err) => {
                    self.metrics.inc(CLIENTS_FAILED);
                    Err(err)
                }
            },
            Err(err) => {
                if matches!(err, ConnectionError::Io(_)) {
                    self.metrics.inc(CLIENTS_FAILED);
                }
                Err(err)
            }
        }
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
        self.local_address.clone()
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
