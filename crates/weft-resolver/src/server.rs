//! The resolution server.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use weft_core::{Connection, ConnectionError, Listener, MetricsRegistry, MetricsSnapshot};
use weft_proto::{Message, TOPIC_RESOLUTION, TOPIC_RESOLVE};

use crate::ResolverError;

const RESOLUTIONS_ATTEMPTED: &str = "resolutions_attempted";
const RESOLUTIONS_SUCCEEDED: &str = "resolutions_succeeded";
const RESOLUTIONS_FAILED: &str = "resolutions_failed";

/// Per-server timeouts.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// How long to wait for the request frame on an accepted connection.
    pub receive_timeout: Duration,
    /// How long to wait for the reply frame to go out.
    pub send_timeout: Duration,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            receive_timeout: Duration::from_secs(5),
            send_timeout: Duration::from_secs(5),
        }
    }
}

/// Serves topic-to-broker-address lookups.
///
/// The topic map is mutated through [`register_topics`] and
/// [`unregister_topic`] while the serve loop runs; entries never expire on
/// their own. Start and stop are caller-synchronized: stop the listener to
/// end [`run`].
///
/// [`register_topics`]: Self::register_topics
/// [`unregister_topic`]: Self::unregister_topic
/// [`run`]: Self::run
pub struct ResolverServer {
    topics: Mutex<HashMap<String, String>>,
    metrics: MetricsRegistry,
    config: ResolverConfig,
}

impl ResolverServer {
    pub fn new(config: ResolverConfig) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            metrics: MetricsRegistry::new(&[
                RESOLUTIONS_ATTEMPTED,
                RESOLUTIONS_SUCCEEDED,
                RESOLUTIONS_FAILED,
            ]),
            config,
        }
    }

    /// Map each topic to the broker address. Later registrations overwrite
    /// earlier ones per topic.
    pub fn register_topics<I, T>(&self, broker_address: &str, topics: I)
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let mut map = self.lock_topics();
        for topic in topics {
            map.insert(topic.into(), broker_address.to_string());
        }
    }

    /// Remove a topic's mapping. Returns whether it existed.
    pub fn unregister_topic(&self, topic: &str) -> bool {
        self.lock_topics().remove(topic).is_some()
    }

    /// Non-resetting counter snapshot.
    pub fn check_metrics(&self) -> MetricsSnapshot {
        self.metrics.check_metrics()
    }

    /// Counter snapshot; counters reset to zero.
    pub fn get_metrics(&self) -> MetricsSnapshot {
        self.metrics.get_metrics()
    }

    /// Serve resolutions until the listener stops.
    ///
    /// Each accepted connection is handled in its own task. Per-connection
    /// protocol and transport errors are logged and never end the loop.
    pub async fn run(self: Arc<Self>, listener: Arc<dyn Listener<Vec<u8>>>) {
        loop {
            match listener.accept(Duration::ZERO).await {
                Ok(conn) => {
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(err) = server.serve_connection(conn).await {
                            server.metrics.inc(RESOLUTIONS_FAILED);
                            tracing::debug!(%err, "resolution not served");
                        }
                    });
                }
                Err(ConnectionError::Closed) => break,
                Err(err) => {
                    tracing::warn!(%err, "accept failed");
                }
            }
        }
        tracing::debug!(address = %listener.address(), "resolver stopped");
    }

    async fn serve_connection(
        &self,
        conn: Box<dyn Connection<Vec<u8>>>,
    ) -> Result<(), ResolverError> {
        self.metrics.inc(RESOLUTIONS_ATTEMPTED);
        let bytes = conn.read(self.config.receive_timeout).await?;
        let request = Message::deserialize(&bytes, conn.address())?;

        if request.topic() != TOPIC_RESOLVE {
            let _ = conn.close().await;
            return Err(ResolverError::BadRequest(format!(
                "expected topic {TOPIC_RESOLVE}, got {}",
                request.topic()
            )));
        }
        if request.origin().is_empty() {
            let _ = conn.close().await;
            return Err(ResolverError::BadRequest("empty origin".to_string()));
        }

        let lookup = self.lock_topics().get(request.payload()).cloned();
        match lookup {
            Some(broker_address) => {
                let reply = Message::new_async(TOPIC_RESOLUTION, broker_address);
                conn.write(reply.serialize()?, self.config.send_timeout)
                    .await?;
                self.metrics.inc(RESOLUTIONS_SUCCEEDED);
                let _ = conn.close().await;
                Ok(())
            }
            None => {
                // No NACK on the wire. The client's receive timeout is the
                // topic-unknown signal.
                tracing::debug!(topic = request.payload(), origin = request.origin(), "unknown topic");
                self.metrics.inc(RESOLUTIONS_FAILED);
                let _ = conn.close().await;
                Ok(())
            }
        }
    }

    fn lock_topics(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.topics.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_overwrites_and_unregisters() {
        let server = ResolverServer::new(ResolverConfig::default());
        server.register_topics("broker-a:1000", ["orders", "billing"]);
        server.register_topics("broker-b:2000", ["orders"]);

        assert_eq!(
            server.lock_topics().get("orders").map(String::as_str),
            Some("broker-b:2000")
        );
        assert!(server.unregister_topic("billing"));
        assert!(!server.unregister_topic("billing"));
    }
}
