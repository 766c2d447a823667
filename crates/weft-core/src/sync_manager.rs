//! Synchronous-call correlation over an asynchronous channel.
//!
//! A caller that wants request/response semantics over a fire-and-forget
//! send/receive channel registers interest in a fresh sync token, sends its
//! request carrying that token, and blocks on the returned receiver. The
//! manager matches inbound response messages to pending tokens and delivers
//! them; a private waiter task per request races four terminal events
//! (response delivered, explicit abort, manager-wide close, deadline expiry)
//! and exactly one of them fires per token.
//!
//! The token table is guarded by a single lock; waiter tasks touch it only
//! through the public operations, which rules out lost-wakeup and
//! double-delivery races.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use weft_proto::Message;

use crate::token::{ALPHA_NUMERIC, TokenGenerator};

/// Correlation errors.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The token is unknown: already consumed, aborted, timed out, or never
    /// registered. Expected under normal races (a late response after a
    /// timeout lands here) and must not be treated as fatal.
    #[error("no response channel found")]
    NoResponseChannel,
}

/// Sync manager configuration.
#[derive(Debug, Clone)]
pub struct SyncManagerConfig {
    /// Length of generated sync tokens.
    pub token_length: usize,
    /// Per-request deadline measured from registration. `Duration::ZERO`
    /// disables the deadline.
    pub deadline: Duration,
}

impl Default for SyncManagerConfig {
    fn default() -> Self {
        Self {
            token_length: 10,
            deadline: Duration::ZERO,
        }
    }
}

struct PendingRequest {
    response_tx: mpsc::Sender<Message>,
    abort_tx: Option<oneshot::Sender<()>>,
    response_limit: u64,
    delivered: u64,
}

type RequestTable = Arc<Mutex<HashMap<String, PendingRequest>>>;

/// Matches response messages to pending sync tokens.
pub struct SyncManager {
    requests: RequestTable,
    generator: Mutex<TokenGenerator>,
    close_tx: watch::Sender<bool>,
    config: SyncManagerConfig,
}

impl SyncManager {
    /// Manager with an entropy-seeded token generator.
    pub fn new(config: SyncManagerConfig) -> Self {
        Self::with_generator(config, TokenGenerator::from_entropy())
    }

    /// Manager with an explicit generator, for reproducible tests.
    pub fn with_generator(config: SyncManagerConfig, generator: TokenGenerator) -> Self {
        let (close_tx, _) = watch::channel(false);
        Self {
            requests: Arc::new(Mutex::new(HashMap::new())),
            generator: Mutex::new(generator),
            close_tx,
            config,
        }
    }

    /// Register a pending sync request and return its token plus the
    /// receiver the caller blocks on.
    ///
    /// The token is unique among currently pending tokens (regenerated on
    /// collision against the live table). The receiver yields at most
    /// `response_limit` messages (`0` is coerced to `1`) and is closed once
    /// the request reaches a terminal event.
    ///
    /// Must be called within a tokio runtime: each request spawns a private
    /// waiter task.
    pub fn init_response_channel(&self, response_limit: u64) -> (String, mpsc::Receiver<Message>) {
        let response_limit = response_limit.max(1);
        let limit = usize::try_from(response_limit).unwrap_or(usize::MAX);

        let (response_tx, response_rx) = mpsc::channel(limit);
        let (abort_tx, abort_rx) = oneshot::channel();
        let (out_tx, out_rx) = mpsc::channel(limit);

        let token = {
            let mut requests = lock(&self.requests);
            let mut generator = self
                .generator
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let mut token = generator.generate(self.config.token_length, ALPHA_NUMERIC);
            while requests.contains_key(&token) {
                token = generator.generate(self.config.token_length, ALPHA_NUMERIC);
            }
            requests.insert(
                token.clone(),
                PendingRequest {
                    response_tx,
                    abort_tx: Some(abort_tx),
                    response_limit,
                    delivered: 0,
                },
            );
            token
        };

        tokio::spawn(waiter(
            Arc::clone(&self.requests),
            token.clone(),
            response_rx,
            abort_rx,
            self.close_tx.subscribe(),
            self.config.deadline,
            out_tx,
            response_limit,
        ));

        (token, out_rx)
    }

    /// Deliver a response to the pending request matching its sync token
    /// and remove the entry once the response count reaches the limit.
    ///
    /// # Errors
    ///
    /// Fails with [`SyncError::NoResponseChannel`] when the token is
    /// unknown, a normal race outcome.
    pub fn add_sync_response(&self, message: Message) -> Result<(), SyncError> {
        let mut requests = lock(&self.requests);
        let token = message.sync_token().to_string();
        let entry = requests.get_mut(&token).ok_or(SyncError::NoResponseChannel)?;

        // Capacity equals the remaining limit, so this cannot be full.
        entry
            .response_tx
            .try_send(message)
            .map_err(|_| SyncError::NoResponseChannel)?;
        entry.delivered += 1;
        if entry.delivered >= entry.response_limit {
            requests.remove(&token);
        }
        Ok(())
    }

    /// Cancel a pending wait without delivering a response.
    ///
    /// # Errors
    ///
    /// Fails with [`SyncError::NoResponseChannel`] when the token is
    /// unknown.
    pub fn abort_sync_request(&self, token: &str) -> Result<(), SyncError> {
        let mut entry = lock(&self.requests)
            .remove(token)
            .ok_or(SyncError::NoResponseChannel)?;
        if let Some(abort_tx) = entry.abort_tx.take() {
            let _ = abort_tx.send(());
        }
        Ok(())
    }

    /// Unblock every outstanding waiter; their tokens are removed. Used on
    /// shutdown so call sites need no per-token bookkeeping. Lands even
    /// with no waiters alive, so requests registered mid-shutdown still
    /// observe the closed state.
    pub fn close(&self) {
        self.close_tx.send_replace(true);
    }

    /// Tokens of all currently pending requests, for introspection and
    /// metrics.
    pub fn open_sync_requests(&self) -> Vec<String> {
        lock(&self.requests).keys().cloned().collect()
    }
}

fn lock(requests: &RequestTable) -> std::sync::MutexGuard<'_, HashMap<String, PendingRequest>> {
    requests.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Private per-request waiter: forwards responses to the caller and resolves
/// exactly one terminal event. The abort and delivery paths remove the table
/// entry inside the public operations; the close and deadline paths remove
/// it here.
#[allow(clippy::too_many_arguments)]
async fn waiter(
    requests: RequestTable,
    token: String,
    mut response_rx: mpsc::Receiver<Message>,
    mut abort_rx: oneshot::Receiver<()>,
    mut close_rx: watch::Receiver<bool>,
    deadline: Duration,
    out_tx: mpsc::Sender<Message>,
    response_limit: u64,
) {
    let deadline_fut = async {
        if deadline.is_zero() {
            std::future::pending::<()>().await;
        } else {
            tokio::time::sleep(deadline).await;
        }
    };
    tokio::pin!(deadline_fut);

    let mut forwarded = 0u64;
    loop {
        tokio::select! {
            // Drain buffered responses before observing a concurrently
            // dropped abort sender.
            biased;
            message = response_rx.recv() => match message {
                Some(message) => {
                    if out_tx.send(message).await.is_err() {
                        // Caller dropped the receiver; treat as abort.
                        lock(&requests).remove(&token);
                        break;
                    }
                    forwarded += 1;
                    if forwarded >= response_limit {
                        break;
                    }
                }
                None => break,
            },
            _ = &mut abort_rx => break,
            _ = watch_closed(&mut close_rx) => {
                lock(&requests).remove(&token);
                break;
            }
            () = &mut deadline_fut => {
                lock(&requests).remove(&token);
                break;
            }
        }
    }
    // Dropping out_tx closes the caller's channel.
}

async fn watch_closed(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}
