//! End-to-end resolution over loopback TCP and the channel transport.

use std::sync::Arc;
use std::time::Duration;

use weft_core::{Connection, Listener};
use weft_proto::{Message, TOPIC_RESOLUTION, TOPIC_RESOLVE};
use weft_resolver::{ResolverConfig, ResolverError, ResolverServer, resolve_topic};
use weft_transport::channel::ChannelListener;
use weft_transport::tcp::{TcpConnectionConfig, TcpListener};

const REPLY_TIMEOUT: Duration = Duration::from_millis(500);

async fn start_tcp_resolver() -> (Arc<ResolverServer>, Arc<dyn Listener<Vec<u8>>>, String) {
    let listener = Arc::new(
        TcpListener::bind("127.0.0.1:0", TcpConnectionConfig::default())
            .await
            .unwrap(),
    );
    let addr = listener.address();
    let server = Arc::new(ResolverServer::new(ResolverConfig::default()));
    let listener: Arc<dyn Listener<Vec<u8>>> = listener;
    tokio::spawn(Arc::clone(&server).run(Arc::clone(&listener)));
    (server, listener, addr)
}

#[tokio::test]
async fn registered_topic_resolves_to_broker_address() {
    let (server, listener, addr) = start_tcp_resolver().await;
    server.register_topics("broker-a:9000", ["orders"]);

    let resolved = resolve_topic(&addr, "orders", REPLY_TIMEOUT).await.unwrap();
    assert_eq!(resolved, "broker-a:9000");

    let metrics = server.check_metrics();
    assert_eq!(metrics["resolutions_attempted"], 1);
    assert_eq!(metrics["resolutions_succeeded"], 1);
    assert_eq!(metrics["resolutions_failed"], 0);

    listener.stop().await.unwrap();
}

#[tokio::test]
async fn unknown_topic_yields_no_resolution() {
    let (server, listener, addr) = start_tcp_resolver().await;

    let err = resolve_topic(&addr, "nowhere", REPLY_TIMEOUT)
        .await
        .unwrap_err();
    assert!(matches!(err, ResolverError::NoResolution(topic) if topic == "nowhere"));
    assert_eq!(server.check_metrics()["resolutions_failed"], 1);

    listener.stop().await.unwrap();
}

#[tokio::test]
async fn unregistered_topic_stops_resolving() {
    let (server, listener, addr) = start_tcp_resolver().await;
    server.register_topics("broker-a:9000", ["orders"]);

    resolve_topic(&addr, "orders", REPLY_TIMEOUT).await.unwrap();
    assert!(server.unregister_topic("orders"));

    let err = resolve_topic(&addr, "orders", REPLY_TIMEOUT)
        .await
        .unwrap_err();
    assert!(matches!(err, ResolverError::NoResolution(_)));

    listener.stop().await.unwrap();
}

#[tokio::test]
async fn concurrent_clients_all_resolve() {
    let (server, listener, addr) = start_tcp_resolver().await;
    server.register_topics("broker-a:9000", ["orders", "billing"]);
    server.register_topics("broker-b:9001", ["shipping"]);

    let mut clients = Vec::new();
    for (topic, expected) in [
        ("orders", "broker-a:9000"),
        ("billing", "broker-a:9000"),
        ("shipping", "broker-b:9001"),
        ("orders", "broker-a:9000"),
    ] {
        let addr = addr.clone();
        clients.push(tokio::spawn(async move {
            let resolved = resolve_topic(&addr, topic, REPLY_TIMEOUT).await.unwrap();
            assert_eq!(resolved, expected);
        }));
    }
    for client in clients {
        client.await.unwrap();
    }
    assert_eq!(server.check_metrics()["resolutions_succeeded"], 4);

    listener.stop().await.unwrap();
}

// The serve loop only sees the capability traits, so it runs unchanged
// over the in-process transport.
#[tokio::test]
async fn resolver_serves_over_the_channel_transport() {
    let channel_listener = Arc::new(ChannelListener::<Vec<u8>>::new(4));
    let dialer = channel_listener.dialer();
    let server = Arc::new(ResolverServer::new(ResolverConfig::default()));
    server.register_topics("broker-a:9000", ["orders"]);

    let listener: Arc<dyn Listener<Vec<u8>>> = channel_listener;
    tokio::spawn(Arc::clone(&server).run(Arc::clone(&listener)));

    let conn = dialer.dial(4).await.unwrap();
    let request = Message::new_async(TOPIC_RESOLVE, "orders");
    conn.write(request.serialize().unwrap(), REPLY_TIMEOUT)
        .await
        .unwrap();
    let reply_bytes = conn.read(REPLY_TIMEOUT).await.unwrap();
    let reply = Message::deserialize(&reply_bytes, conn.address()).unwrap();

    assert_eq!(reply.topic(), TOPIC_RESOLUTION);
    assert_eq!(reply.payload(), "broker-a:9000");

    listener.stop().await.unwrap();
}
