//! Integration tests for the Node public API.
//!
//! These tests exercise the public interface exposed through the Node facade
//! over real localhost TCP sockets.

use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use kademlia::{Id, KademliaConfig, Node};
use tokio::time::timeout;

/// Atomic port counter for unique port allocation across parallel tests.
static PORT_COUNTER: AtomicU16 = AtomicU16::new(31000);

fn test_addr() -> String {
    format!("127.0.0.1:{}", PORT_COUNTER.fetch_add(1, Ordering::SeqCst))
}

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::test]
async fn node_bind_and_identity() {
    let node = Node::bind(&test_addr()).await.expect("bind failed");

    let hex = node.id().to_hex();
    assert_eq!(hex.len(), 40, "id should be 40 hex chars");
    assert!(hex.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase()));

    assert!(node.local_addr().port() > 0);
    assert_eq!(node.node_ref().id, node.id());
    assert_eq!(node.node_ref().addr, node.local_addr().to_string());
}

#[tokio::test]
async fn bind_rejects_invalid_address() {
    assert!(Node::bind("not-an-address").await.is_err());
}

#[tokio::test]
async fn bind_rejects_invalid_config() {
    let config = KademliaConfig {
        replication_factor: 0,
        ..Default::default()
    };
    assert!(Node::bind_with_config(&test_addr(), config).await.is_err());
}

#[tokio::test]
async fn advertised_address_is_used_in_node_ref() {
    let advertised: std::net::SocketAddr = "203.0.113.5:4200".parse().expect("addr");
    let config = KademliaConfig {
        advertise_addr: Some(advertised),
        ..Default::default()
    };
    let node = Node::bind_with_config(&test_addr(), config).await.expect("bind failed");
    assert_eq!(node.node_ref().addr, "203.0.113.5:4200");
}

#[tokio::test]
async fn bind_with_chosen_id() {
    let id = Id::hash(b"fixed");
    let node = Node::bind_with_id(&test_addr(), id, KademliaConfig::default())
        .await
        .expect("bind failed");
    assert_eq!(node.id(), id);
}

#[tokio::test]
async fn isolated_node_fails_to_initialize() {
    let node = Node::bind(&test_addr()).await.expect("bind failed");
    let result = timeout(TEST_TIMEOUT, node.initialize()).await.expect("timed out");
    assert!(result.is_err());
}

#[tokio::test]
async fn unreachable_initial_contact_is_an_error() {
    let node = Node::bind(&test_addr()).await.expect("bind failed");
    let dead = test_addr();
    let result = timeout(TEST_TIMEOUT, node.add_initial_contact(&dead)).await.expect("timed out");
    assert!(result.is_err());
    assert!(node.contacts().await.is_empty());
}

#[tokio::test]
async fn seed_node_bootstraps_from_itself() {
    let node = Node::bind(&test_addr()).await.expect("bind failed");
    let own = node.node_ref().addr.clone();

    let found = timeout(TEST_TIMEOUT, node.bootstrap(&[own]))
        .await
        .expect("timed out")
        .expect("seed bootstrap");
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, node.id());
}

#[tokio::test]
async fn seed_node_stores_and_retrieves_locally() {
    let node = Node::bind(&test_addr()).await.expect("bind failed");
    let own = node.node_ref().addr.clone();
    node.bootstrap(&[own]).await.expect("seed bootstrap");

    let index = Id::hash(b"solo");
    let acked = node.store(index, b"value".to_vec(), Duration::from_secs(60)).await;
    assert_eq!(acked, 1);
    assert_eq!(node.retrieve(index).await, vec![b"value".to_vec()]);
    assert_eq!(node.data().await.len(), 1);
}

#[tokio::test]
async fn age_starts_near_zero() {
    let node = Node::bind(&test_addr()).await.expect("bind failed");
    assert!(node.age() < Duration::from_secs(5));
}

#[tokio::test]
async fn shutdown_stops_serving() {
    let node = Node::bind(&test_addr()).await.expect("bind failed");
    let addr = node.node_ref().addr.clone();
    node.shutdown().await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let caller = Node::bind(&test_addr()).await.expect("bind failed");
    let result = timeout(TEST_TIMEOUT, caller.add_initial_contact(&addr)).await.expect("timed out");
    assert!(result.is_err());
}
