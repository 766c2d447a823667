//! Token-bucket rate limiting.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;

/// Configuration for a [`TokenBucket`].
#[derive(Debug, Clone)]
pub struct TokenBucketConfig {
    /// Tokens available at construction.
    pub initial_tokens: u64,
    /// Ceiling the bucket refills toward.
    pub max_tokens: u64,
    /// Tokens added per refill tick.
    pub refill_rate: u64,
    /// Interval between refill ticks. Fixed for the bucket's lifetime;
    /// zero disables background refilling.
    pub refill_interval: Duration,
}

impl Default for TokenBucketConfig {
    fn default() -> Self {
        Self {
            initial_tokens: 100,
            max_tokens: 100,
            refill_rate: 10,
            refill_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug)]
struct Inner {
    tokens: u64,
    max_tokens: u64,
    refill_rate: u64,
}

/// A token bucket refilled by a background task.
///
/// [`consume`](Self::consume) is all or nothing: a request either takes its
/// full token count or takes none and is rejected. Refilling continues until
/// [`close`](Self::close) or drop.
pub struct TokenBucket {
    inner: Arc<Mutex<Inner>>,
    close_tx: watch::Sender<bool>,
}

impl TokenBucket {
    /// Start the bucket and its refill task.
    ///
    /// Must be called within a tokio runtime.
    pub fn new(config: TokenBucketConfig) -> Self {
        let inner = Arc::new(Mutex::new(Inner {
            tokens: config.initial_tokens.min(config.max_tokens),
            max_tokens: config.max_tokens,
            refill_rate: config.refill_rate,
        }));
        let (close_tx, mut close_rx) = watch::channel(false);

        if !config.refill_interval.is_zero() {
            let inner = Arc::clone(&inner);
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(config.refill_interval) => {
                            let mut inner = lock(&inner);
                            inner.tokens = inner
                                .tokens
                                .saturating_add(inner.refill_rate)
                                .min(inner.max_tokens);
                        }
                        changed = close_rx.changed() => {
                            if changed.is_err() || *close_rx.borrow() {
                                break;
                            }
                        }
                    }
                }
            });
        }

        Self { inner, close_tx }
    }

    /// Take `amount` tokens if all of them are available.
    ///
    /// Returns `false`, taking nothing, when the bucket holds fewer than
    /// `amount` tokens.
    pub fn consume(&self, amount: u64) -> bool {
        let mut inner = lock(&self.inner);
        if inner.tokens >= amount {
            inner.tokens -= amount;
            true
        } else {
            false
        }
    }

    /// Fill the bucket to its ceiling immediately.
    pub fn refill(&self) {
        let mut inner = lock(&self.inner);
        inner.tokens = inner.max_tokens;
    }

    /// Tokens currently available.
    pub fn available(&self) -> u64 {
        lock(&self.inner).tokens
    }

    /// Current refill rate.
    pub fn refill_rate(&self) -> u64 {
        lock(&self.inner).refill_rate
    }

    /// Change the tokens added per refill tick.
    pub fn set_refill_rate(&self, rate: u64) {
        lock(&self.inner).refill_rate = rate;
    }

    /// Current token ceiling.
    pub fn max_tokens(&self) -> u64 {
        lock(&self.inner).max_tokens
    }

    /// Change the token ceiling. A lowered ceiling clamps the current
    /// balance.
    pub fn set_max_tokens(&self, max: u64) {
        let mut inner = lock(&self.inner);
        inner.max_tokens = max;
        inner.tokens = inner.tokens.min(max);
    }

    /// Stop the refill task. The bucket keeps serving whatever tokens
    /// remain.
    pub fn close(&self) {
        self.close_tx.send_replace(true);
    }
}

impl Drop for TokenBucket {
    fn drop(&mut self) {
        self.close_tx.send_replace(true);
    }
}

fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> TokenBucketConfig {
        TokenBucketConfig {
            initial_tokens: 5,
            max_tokens: 10,
            refill_rate: 3,
            refill_interval: Duration::from_millis(100),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn consume_is_all_or_nothing() {
        let bucket = TokenBucket::new(config());

        assert!(bucket.consume(3));
        assert_eq!(bucket.available(), 2);
        // Too large; nothing is taken.
        assert!(!bucket.consume(3));
        assert_eq!(bucket.available(), 2);
        assert!(bucket.consume(2));
        assert!(!bucket.consume(1));
    }

    #[tokio::test(start_paused = true)]
    async fn refill_adds_rate_per_interval_capped_at_max() {
        let bucket = TokenBucket::new(config());
        assert!(bucket.consume(5));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(bucket.available(), 3);

        // Enough ticks to hit the ceiling.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(bucket.available(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_refill_fills_to_max() {
        let bucket = TokenBucket::new(config());
        assert!(bucket.consume(5));
        bucket.refill();
        assert_eq!(bucket.available(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn lowering_max_clamps_the_balance() {
        let bucket = TokenBucket::new(config());
        bucket.refill();
        bucket.set_max_tokens(4);
        assert_eq!(bucket.available(), 4);

        bucket.set_refill_rate(1);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(bucket.available(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn close_stops_refilling() {
        let bucket = TokenBucket::new(config());
        assert!(bucket.consume(5));
        bucket.close();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(bucket.available(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn initial_tokens_are_capped_at_max() {
        let bucket = TokenBucket::new(TokenBucketConfig {
            initial_tokens: 50,
            max_tokens: 10,
            ..config()
        });
        assert_eq!(bucket.available(), 10);
    }
}
