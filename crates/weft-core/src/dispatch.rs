//! The topic dispatch engine.
//!
//! [`TopicManager`] routes named calls to registered handlers under one of
//! three concurrency policies, selected purely by queue configuration, not
//! by separate code paths:
//!
//! | Mode | `topic_queue_size` | `queue_size` | `concurrent_calls` | Ordering |
//! |---|---|---|---|---|
//! | Sequential | 0 (rendezvous) | large | false | global FIFO across all topics |
//! | Topic-exclusive | large | large | false | FIFO within a topic; topics independent |
//! | Concurrent | any | any | true | none; calls overlap freely |
//!
//! One router task drains the global queue and forwards each call to its
//! topic's worker (or the fallback worker for unregistered topics). Each
//! worker consumes its own queue; in non-concurrent mode it runs the handler
//! to completion before dequeuing the next call, in concurrent mode every
//! dequeued call runs in its own task.
//!
//! [`TopicManager::handle_topic`] is the synchronous entry point: it
//! enqueues a call descriptor carrying a private reply channel and blocks
//! until the worker answers. Bounded queues make backpressure structural: a
//! slow handler or a full queue blocks (or, in non-blocking admission mode,
//! rejects) callers.
//!
//! Start and stop are caller-synchronized: the engine does not guard
//! against concurrent `close` calls racing construction.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};

/// An async call handler for one topic.
///
/// Errors are reported as strings and surface to callers as
/// [`DispatchError::Handler`].
pub type TopicHandler<A, R> =
    Arc<dyn Fn(A) -> BoxFuture<'static, Result<R, String>> + Send + Sync>;

/// Dispatch failures surfaced to `handle_topic` callers.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// No handler is registered for the topic and no fallback exists.
    #[error("no handler for topic {0}")]
    NoHandler(String),

    /// The global call queue is full (non-blocking admission only).
    #[error("queue full")]
    QueueFull,

    /// The topic's queue is full (non-blocking admission only).
    #[error("topic queue full")]
    TopicQueueFull,

    /// The per-call deadline elapsed before the handler finished.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// The engine has been closed.
    #[error("topic manager closed")]
    Closed,

    /// The handler itself failed.
    #[error("handler error: {0}")]
    Handler(String),
}

/// Queue and concurrency configuration.
///
/// See the module docs for how the three fields combine into the engine's
/// operating modes.
#[derive(Debug, Clone)]
pub struct TopicManagerConfig {
    /// Capacity of the global call queue (`0` is treated as `1`).
    pub queue_size: usize,
    /// Capacity of each per-topic queue. `0` selects rendezvous hand-off:
    /// the router waits for the worker to finish the call before forwarding
    /// the next one, giving global FIFO.
    pub topic_queue_size: usize,
    /// Run each dequeued call in its own task instead of serializing per
    /// topic.
    pub concurrent_calls: bool,
    /// Block callers when the global queue is full instead of rejecting
    /// with [`DispatchError::QueueFull`].
    pub queue_blocking: bool,
    /// Block the router when a topic queue is full instead of rejecting
    /// with [`DispatchError::TopicQueueFull`].
    pub topic_queue_blocking: bool,
    /// Per-call handler deadline. `Duration::ZERO` disables it.
    pub deadline: Duration,
}

impl Default for TopicManagerConfig {
    fn default() -> Self {
        Self::topic_exclusive()
    }
}

impl TopicManagerConfig {
    /// Global FIFO across all topics; one call at a time engine-wide.
    pub fn sequential() -> Self {
        Self {
            queue_size: 1024,
            topic_queue_size: 0,
            concurrent_calls: false,
            queue_blocking: true,
            topic_queue_blocking: true,
            deadline: Duration::ZERO,
        }
    }

    /// FIFO within each topic; topics run independently.
    pub fn topic_exclusive() -> Self {
        Self {
            topic_queue_size: 1024,
            ..Self::sequential()
        }
    }

    /// No ordering guarantee; calls overlap freely.
    pub fn concurrent() -> Self {
        Self {
            concurrent_calls: true,
            ..Self::topic_exclusive()
        }
    }
}

struct Call<A, R> {
    topic: String,
    args: A,
    reply: oneshot::Sender<Result<R, DispatchError>>,
    /// Present under rendezvous hand-off; the worker signals it when the
    /// call has been fully processed (non-concurrent) or dequeued
    /// (concurrent), releasing the router.
    handed_off: Option<oneshot::Sender<()>>,
}

/// Routes named calls to per-topic handlers under a configurable
/// concurrency policy.
pub struct TopicManager<A, R> {
    queue_tx: Mutex<Option<mpsc::Sender<Call<A, R>>>>,
    queue_blocking: bool,
}

impl<A, R> TopicManager<A, R>
where
    A: Send + 'static,
    R: Send + 'static,
{
    /// Build the engine and start its router and worker tasks.
    ///
    /// Topics are fixed for the engine's lifetime; there is no runtime
    /// registration. Calls to topics absent from `handlers` go to
    /// `fallback` when present and otherwise fail with
    /// [`DispatchError::NoHandler`].
    ///
    /// Must be called within a tokio runtime.
    pub fn new(
        config: TopicManagerConfig,
        handlers: HashMap<String, TopicHandler<A, R>>,
        fallback: Option<TopicHandler<A, R>>,
    ) -> Self {
        let rendezvous = config.topic_queue_size == 0;
        let topic_queue_size = config.topic_queue_size.max(1);

        let mut topic_queues = HashMap::with_capacity(handlers.len());
        for (topic, handler) in handlers {
            let (tx, rx) = mpsc::channel(topic_queue_size);
            topic_queues.insert(topic, tx);
            tokio::spawn(worker(rx, handler, config.concurrent_calls, config.deadline));
        }
        let fallback_queue = fallback.map(|handler| {
            let (tx, rx) = mpsc::channel(topic_queue_size);
            tokio::spawn(worker(rx, handler, config.concurrent_calls, config.deadline));
            tx
        });

        let (queue_tx, queue_rx) = mpsc::channel(config.queue_size.max(1));
        tokio::spawn(router(
            queue_rx,
            topic_queues,
            fallback_queue,
            rendezvous,
            config.topic_queue_blocking,
        ));

        Self {
            queue_tx: Mutex::new(Some(queue_tx)),
            queue_blocking: config.queue_blocking,
        }
    }

    /// Submit a call and block until its handler answers.
    ///
    /// External callers always see synchronous semantics; the internal
    /// queuing mode only affects ordering and overlap.
    ///
    /// # Errors
    ///
    /// See [`DispatchError`]. Capacity rejections (`QueueFull`,
    /// `TopicQueueFull`) only occur with non-blocking admission.
    pub async fn handle_topic(
        &self,
        topic: impl Into<String>,
        args: A,
    ) -> Result<R, DispatchError> {
        let queue_tx = self
            .queue_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(DispatchError::Closed)?;

        let (reply_tx, reply_rx) = oneshot::channel();
        let call = Call {
            topic: topic.into(),
            args,
            reply: reply_tx,
            handed_off: None,
        };

        if self.queue_blocking {
            queue_tx
                .send(call)
                .await
                .map_err(|_| DispatchError::Closed)?;
        } else {
            queue_tx.try_send(call).map_err(|err| match err {
                TrySendError::Full(_) => DispatchError::QueueFull,
                TrySendError::Closed(_) => DispatchError::Closed,
            })?;
        }

        reply_rx.await.map_err(|_| DispatchError::Closed)?
    }

    /// Stop accepting calls and let the router and workers drain. In-flight
    /// calls complete; subsequent `handle_topic` calls fail with
    /// [`DispatchError::Closed`].
    ///
    /// # Errors
    ///
    /// A second close fails with [`DispatchError::Closed`].
    pub fn close(&self) -> Result<(), DispatchError> {
        self.queue_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .map(|_| ())
            .ok_or(DispatchError::Closed)
    }

    /// Whether the engine has been closed.
    pub fn is_closed(&self) -> bool {
        self.queue_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

/// Single consumer of the global queue; forwards each call to its topic's
/// worker or the fallback worker.
async fn router<A: Send + 'static, R: Send + 'static>(
    mut queue_rx: mpsc::Receiver<Call<A, R>>,
    topic_queues: HashMap<String, mpsc::Sender<Call<A, R>>>,
    fallback_queue: Option<mpsc::Sender<Call<A, R>>>,
    rendezvous: bool,
    topic_queue_blocking: bool,
) {
    while let Some(mut call) = queue_rx.recv().await {
        let Some(queue) = topic_queues.get(&call.topic).or(fallback_queue.as_ref()) else {
            let _ = call
                .reply
                .send(Err(DispatchError::NoHandler(call.topic.clone())));
            continue;
        };

        let handed_off = if rendezvous {
            let (tx, rx) = oneshot::channel();
            call.handed_off = Some(tx);
            Some(rx)
        } else {
            None
        };

        if topic_queue_blocking {
            if queue.send(call).await.is_err() {
                // Worker gone; dropping the call closes its reply channel.
                continue;
            }
        } else {
            match queue.try_send(call) {
                Ok(()) => {}
                Err(TrySendError::Full(call)) => {
                    let _ = call.reply.send(Err(DispatchError::TopicQueueFull));
                    continue;
                }
                Err(TrySendError::Closed(_)) => continue,
            }
        }

        if let Some(rx) = handed_off {
            // Do not run ahead of a busy worker.
            let _ = rx.await;
        }
    }
}

/// Per-topic consumer. Serializes its topic unless `concurrent` is set.
async fn worker<A: Send + 'static, R: Send + 'static>(
    mut queue_rx: mpsc::Receiver<Call<A, R>>,
    handler: TopicHandler<A, R>,
    concurrent: bool,
    deadline: Duration,
) {
    while let Some(mut call) = queue_rx.recv().await {
        let handed_off = call.handed_off.take();
        if concurrent {
            if let Some(tx) = handed_off {
                let _ = tx.send(());
            }
            tokio::spawn(run_call(call, Arc::clone(&handler), deadline));
        } else {
            run_call(call, Arc::clone(&handler), deadline).await;
            if let Some(tx) = handed_off {
                let _ = tx.send(());
            }
        }
    }
}

async fn run_call<A, R>(call: Call<A, R>, handler: TopicHandler<A, R>, deadline: Duration) {
    let fut = handler(call.args);
    let result = if deadline.is_zero() {
        fut.await.map_err(DispatchError::Handler)
    } else {
        match tokio::time::timeout(deadline, fut).await {
            Ok(result) => result.map_err(DispatchError::Handler),
            Err(_) => Err(DispatchError::DeadlineExceeded),
        }
    };
    let _ = call.reply.send(result);
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::sync::Semaphore;
    use tokio::time::{Instant, sleep};

    use super::*;

    type Log = Arc<Mutex<Vec<String>>>;

    fn logging_handler(log: &Log, hold: Duration) -> TopicHandler<String, String> {
        let log = Arc::clone(log);
        Arc::new(move |tag: String| {
            let log = Arc::clone(&log);
            Box::pin(async move {
                log.lock().unwrap().push(tag.clone());
                sleep(hold).await;
                Ok(tag)
            })
        })
    }

    fn engine(
        config: TopicManagerConfig,
        topics: &[(&str, TopicHandler<String, String>)],
        fallback: Option<TopicHandler<String, String>>,
    ) -> Arc<TopicManager<String, String>> {
        let handlers = topics
            .iter()
            .map(|(topic, handler)| ((*topic).to_string(), Arc::clone(handler)))
            .collect();
        Arc::new(TopicManager::new(config, handlers, fallback))
    }

    #[tokio::test(start_paused = true)]
    async fn sequential_mode_preserves_global_submission_order() {
        let log: Log = Arc::default();
        let handler = logging_handler(&log, Duration::from_millis(20));
        let engine = engine(
            TopicManagerConfig::sequential(),
            &[("a", Arc::clone(&handler)), ("b", handler)],
            None,
        );

        let mut calls = Vec::new();
        for (topic, tag) in [("a", "a1"), ("b", "b1"), ("a", "a2"), ("b", "b2")] {
            let engine = Arc::clone(&engine);
            calls.push(tokio::spawn(async move {
                engine.handle_topic(topic, tag.to_string()).await
            }));
            // Space submissions so enqueue order matches program order.
            sleep(Duration::from_millis(1)).await;
        }
        for call in calls {
            call.await.unwrap().unwrap();
        }

        assert_eq!(*log.lock().unwrap(), vec!["a1", "b1", "a2", "b2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn topic_exclusive_serializes_within_topic_but_overlaps_topics() {
        let in_a = Arc::new(AtomicUsize::new(0));
        let max_a = Arc::new(AtomicUsize::new(0));
        let a_handler: TopicHandler<String, String> = {
            let (in_a, max_a) = (Arc::clone(&in_a), Arc::clone(&max_a));
            Arc::new(move |tag: String| {
                let (in_a, max_a) = (Arc::clone(&in_a), Arc::clone(&max_a));
                Box::pin(async move {
                    let now = in_a.fetch_add(1, Ordering::SeqCst) + 1;
                    max_a.fetch_max(now, Ordering::SeqCst);
                    sleep(Duration::from_millis(50)).await;
                    in_a.fetch_sub(1, Ordering::SeqCst);
                    Ok(tag)
                })
            })
        };
        let b_done: Log = Arc::default();
        let b_handler = logging_handler(&b_done, Duration::from_millis(1));

        let engine = engine(
            TopicManagerConfig::topic_exclusive(),
            &[("a", a_handler), ("b", b_handler)],
            None,
        );

        let started = Instant::now();
        let mut calls = Vec::new();
        for (topic, tag) in [("a", "a1"), ("a", "a2"), ("b", "b1")] {
            let engine = Arc::clone(&engine);
            calls.push(tokio::spawn(async move {
                engine.handle_topic(topic, tag.to_string()).await
            }));
        }
        for call in calls {
            call.await.unwrap().unwrap();
        }

        // Calls to "a" never interleaved with each other.
        assert_eq!(max_a.load(Ordering::SeqCst), 1);
        // "b" was not stuck behind "a"'s 100ms of serialized work.
        assert!(started.elapsed() < Duration::from_millis(150));
        assert_eq!(b_done.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_mode_overlaps_calls_on_one_topic() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_in_flight = Arc::new(AtomicUsize::new(0));
        let handler: TopicHandler<String, String> = {
            let (in_flight, max_in_flight) = (Arc::clone(&in_flight), Arc::clone(&max_in_flight));
            Arc::new(move |tag: String| {
                let (in_flight, max_in_flight) =
                    (Arc::clone(&in_flight), Arc::clone(&max_in_flight));
                Box::pin(async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    max_in_flight.fetch_max(now, Ordering::SeqCst);
                    sleep(Duration::from_millis(50)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok(tag)
                })
            })
        };
        let engine = engine(TopicManagerConfig::concurrent(), &[("a", handler)], None);

        let mut calls = Vec::new();
        for tag in ["a1", "a2", "a3"] {
            let engine = Arc::clone(&engine);
            calls.push(tokio::spawn(async move {
                engine.handle_topic("a", tag.to_string()).await
            }));
        }
        for call in calls {
            call.await.unwrap().unwrap();
        }

        assert!(max_in_flight.load(Ordering::SeqCst) > 1);
    }

    #[tokio::test]
    async fn unknown_topic_without_fallback_fails_immediately() {
        let log: Log = Arc::default();
        let handler = logging_handler(&log, Duration::ZERO);
        let engine = engine(TopicManagerConfig::topic_exclusive(), &[("a", handler)], None);

        let err = engine
            .handle_topic("missing", "x".to_string())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::NoHandler(topic) if topic == "missing"));
    }

    #[tokio::test]
    async fn unknown_topic_goes_to_fallback() {
        let log: Log = Arc::default();
        let fallback = logging_handler(&log, Duration::ZERO);
        let engine = engine(TopicManagerConfig::topic_exclusive(), &[], Some(fallback));

        let result = engine
            .handle_topic("anything", "x".to_string())
            .await
            .unwrap();
        assert_eq!(result, "x");
        assert_eq!(*log.lock().unwrap(), vec!["x"]);
    }

    #[tokio::test(start_paused = true)]
    async fn full_queues_reject_with_capacity_errors() {
        // Worker blocks on the gate; topic queue holds 1; global queue
        // holds 1; router blocks on the topic queue. Admission is
        // non-blocking at the front door only.
        let gate = Arc::new(Semaphore::new(0));
        let handler: TopicHandler<String, String> = {
            let gate = Arc::clone(&gate);
            Arc::new(move |tag: String| {
                let gate = Arc::clone(&gate);
                Box::pin(async move {
                    let _permit = gate.acquire().await.map_err(|e| e.to_string())?;
                    Ok(tag)
                })
            })
        };
        let config = TopicManagerConfig {
            queue_size: 1,
            topic_queue_size: 1,
            concurrent_calls: false,
            queue_blocking: false,
            topic_queue_blocking: true,
            deadline: Duration::ZERO,
        };
        let engine = engine(config, &[("a", handler)], None);

        let mut pending = Vec::new();
        // c1 occupies the worker, c2 fills the topic queue, c3 parks the
        // router, c4 fills the global queue.
        for tag in ["c1", "c2", "c3", "c4"] {
            let engine = Arc::clone(&engine);
            pending.push(tokio::spawn(async move {
                engine.handle_topic("a", tag.to_string()).await
            }));
            sleep(Duration::from_millis(1)).await;
        }

        let err = engine
            .handle_topic("a", "c5".to_string())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::QueueFull));

        gate.add_permits(8);
        for call in pending {
            call.await.unwrap().unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_bounds_handler_runtime() {
        let handler: TopicHandler<String, String> =
            Arc::new(|_| Box::pin(std::future::pending()));
        let config = TopicManagerConfig {
            deadline: Duration::from_millis(10),
            ..TopicManagerConfig::topic_exclusive()
        };
        let engine = engine(config, &[("a", handler)], None);

        let err = engine.handle_topic("a", "x".to_string()).await.unwrap_err();
        assert!(matches!(err, DispatchError::DeadlineExceeded));
    }

    #[tokio::test]
    async fn handler_errors_surface_to_the_caller() {
        let handler: TopicHandler<String, String> =
            Arc::new(|_| Box::pin(async { Err("boom".to_string()) }));
        let engine = engine(TopicManagerConfig::topic_exclusive(), &[("a", handler)], None);

        let err = engine.handle_topic("a", "x".to_string()).await.unwrap_err();
        assert!(matches!(err, DispatchError::Handler(msg) if msg == "boom"));
    }

    #[tokio::test]
    async fn closed_engine_rejects_calls_and_second_close() {
        let log: Log = Arc::default();
        let handler = logging_handler(&log, Duration::ZERO);
        let engine = engine(TopicManagerConfig::topic_exclusive(), &[("a", handler)], None);

        engine.close().unwrap();
        assert!(engine.is_closed());
        assert!(matches!(
            engine.handle_topic("a", "x".to_string()).await,
            Err(DispatchError::Closed)
        ));
        assert!(matches!(engine.close(), Err(DispatchError::Closed)));
    }
}
