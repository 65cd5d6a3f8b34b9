//! Multi-node FloodSub tests over the in-memory transport

use std::sync::Arc;
use std::time::Duration;
use tessera_core::transport::memory::{MemoryNetwork, MemoryTransport};
use tessera_core::{AddressBook, PeerId, PeerInfo, Transport};
use tessera_pubsub::{FloodPolicy, FloodSub, Message, PubSubConfig};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

const SETTLE: Duration = Duration::from_millis(150);

struct TestNode {
    info: PeerInfo,
    pubsub: FloodSub<MemoryTransport>,
}

async fn spawn_node(network: &MemoryNetwork, name: &str, config: PubSubConfig) -> TestNode {
    let transport = Arc::new(network.add_peer(PeerId::from_public_key(name.as_bytes())).await);
    let info = transport.local_info();
    let mut incoming = transport.incoming().unwrap();
    let pubsub = FloodSub::new(transport, AddressBook::shared(info.clone()), config);

    let server = pubsub.clone();
    tokio::spawn(async move {
        while let Some(inbound) = incoming.recv().await {
            let server = server.clone();
            tokio::spawn(async move {
                server.handle_inbound(inbound.remote, inbound.stream).await;
            });
        }
    });
    TestNode { info, pubsub }
}

async fn link(a: &TestNode, b: &TestNode) {
    a.pubsub.add_peer(b.info.clone()).await;
    b.pubsub.add_peer(a.info.clone()).await;
}

/// Collect every message a node's handler sees on `topic`
async fn collect(node: &TestNode, topic: &str) -> mpsc::UnboundedReceiver<Message> {
    let (tx, rx) = mpsc::unbounded_channel();
    node.pubsub
        .on_message(topic, move |m: &Message| {
            let _ = tx.send(m.clone());
        })
        .await;
    rx
}

async fn next(rx: &mut mpsc::UnboundedReceiver<Message>) -> Message {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for message")
        .expect("handler dropped")
}

#[tokio::test]
async fn test_chat_between_two_nodes() {
    let network = MemoryNetwork::new();
    let a = spawn_node(&network, "a", PubSubConfig::default()).await;
    let b = spawn_node(&network, "b", PubSubConfig::default()).await;
    link(&a, &b).await;

    a.pubsub.subscribe("chat").await;
    let mut received = collect(&a, "chat").await;

    b.pubsub.publish("chat", b"hi".to_vec()).await.unwrap();
    let first = next(&mut received).await;
    assert_eq!(first.from, b.info.peer_id);
    assert_eq!(first.seqno, 1);
    assert_eq!(first.data, b"hi");

    // Same payload again is a new message, not a duplicate
    b.pubsub.publish("chat", b"hi".to_vec()).await.unwrap();
    let second = next(&mut received).await;
    assert_eq!(second.seqno, 2);
    assert_eq!(second.data, b"hi");
}

#[tokio::test]
async fn test_triangle_delivers_exactly_once() {
    let network = MemoryNetwork::new();
    let a = spawn_node(&network, "a", PubSubConfig::default()).await;
    let b = spawn_node(&network, "b", PubSubConfig::default()).await;
    let c = spawn_node(&network, "c", PubSubConfig::default()).await;
    link(&a, &b).await;
    link(&b, &c).await;
    link(&c, &a).await;

    let mut inboxes = Vec::new();
    for node in [&a, &b, &c] {
        node.pubsub.subscribe("loop").await;
        inboxes.push(collect(node, "loop").await);
    }

    b.pubsub.publish("loop", b"round".to_vec()).await.unwrap();
    for inbox in inboxes.iter_mut() {
        assert_eq!(next(inbox).await.data, b"round");
    }

    sleep(SETTLE).await;
    for inbox in inboxes.iter_mut() {
        assert!(inbox.try_recv().is_err());
    }
}

#[tokio::test]
async fn test_unsubscribed_node_forwards_silently() {
    let network = MemoryNetwork::new();
    let a = spawn_node(&network, "a", PubSubConfig::default()).await;
    let relay = spawn_node(&network, "relay", PubSubConfig::default()).await;
    let c = spawn_node(&network, "c", PubSubConfig::default()).await;
    link(&a, &relay).await;
    link(&relay, &c).await;

    c.pubsub.subscribe("news").await;
    let mut at_c = collect(&c, "news").await;
    let mut at_relay = collect(&relay, "news").await;

    a.pubsub.publish("news", b"headline".to_vec()).await.unwrap();
    let message = next(&mut at_c).await;
    assert_eq!(message.from, a.info.peer_id);

    sleep(SETTLE).await;
    assert!(at_relay.try_recv().is_err());
}

#[tokio::test]
async fn test_unsubscribe_stops_delivery() {
    let network = MemoryNetwork::new();
    let a = spawn_node(&network, "a", PubSubConfig::default()).await;
    let b = spawn_node(&network, "b", PubSubConfig::default()).await;
    link(&a, &b).await;

    a.pubsub.subscribe("chat").await;
    let mut received = collect(&a, "chat").await;
    b.pubsub.publish("chat", b"one".to_vec()).await.unwrap();
    assert_eq!(next(&mut received).await.data, b"one");

    assert!(a.pubsub.unsubscribe("chat").await);
    b.pubsub.publish("chat", b"two".to_vec()).await.unwrap();
    sleep(SETTLE).await;
    assert!(received.try_recv().is_err());
}

#[tokio::test]
async fn test_interested_policy_skips_uninterested_peers() {
    let network = MemoryNetwork::new();
    let config = PubSubConfig {
        flood_policy: FloodPolicy::Interested,
        ..Default::default()
    };
    let a = spawn_node(&network, "a", config.clone()).await;
    let b = spawn_node(&network, "b", config.clone()).await;
    let relay = spawn_node(&network, "relay", config.clone()).await;
    let d = spawn_node(&network, "d", config).await;

    b.pubsub.subscribe("sports").await;
    d.pubsub.subscribe("sports").await;
    let mut at_b = collect(&b, "sports").await;
    let mut at_d = collect(&d, "sports").await;
    link(&a, &b).await;
    link(&a, &relay).await;
    link(&relay, &d).await;
    sleep(SETTLE).await;

    a.pubsub.publish("sports", b"score".to_vec()).await.unwrap();
    assert_eq!(next(&mut at_b).await.data, b"score");

    // The relay never announced the topic, so nothing reaches D through it
    sleep(SETTLE).await;
    assert!(at_d.try_recv().is_err());
}
