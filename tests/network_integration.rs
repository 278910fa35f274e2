//! Multi-node integration tests over localhost TCP.
//!
//! A seed node bootstraps from itself, the others bootstrap from the seed,
//! then values are replicated and read back across the network.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use kademlia::{Id, KademliaConfig, Node, remote_age, remote_contacts, remote_data};
use tokio::time::timeout;

static PORT_COUNTER: AtomicU16 = AtomicU16::new(32000);

fn test_addr() -> String {
    format!("127.0.0.1:{}", PORT_COUNTER.fetch_add(1, Ordering::SeqCst))
}

const TEST_TIMEOUT: Duration = Duration::from_secs(20);
const RPC_TIMEOUT: Duration = Duration::from_secs(5);

fn test_config() -> KademliaConfig {
    KademliaConfig {
        replication_factor: 5,
        rpc_timeout: RPC_TIMEOUT,
        ..Default::default()
    }
}

async fn start_network(size: usize) -> Vec<Node> {
    let seed = Node::bind_with_config(&test_addr(), test_config()).await.expect("bind seed");
    let seed_addr = seed.node_ref().addr.clone();
    seed.bootstrap(&[seed_addr.clone()]).await.expect("seed bootstrap");

    let mut nodes = vec![seed];
    for _ in 1..size {
        let node = Node::bind_with_config(&test_addr(), test_config()).await.expect("bind");
        node.bootstrap(&[seed_addr.clone()]).await.expect("bootstrap from seed");
        nodes.push(node);
    }
    nodes
}

#[tokio::test]
async fn nodes_discover_each_other_through_seed() {
    timeout(TEST_TIMEOUT, async {
        let nodes = start_network(4).await;

        // The seed has been contacted by every joining node.
        let seed_contacts: HashSet<Id> = nodes[0].contacts().await.iter().map(|n| n.id).collect();
        for node in &nodes {
            assert!(seed_contacts.contains(&node.id()));
        }

        // A late joiner learns about earlier ones from the seed.
        let last_contacts: HashSet<Id> = nodes[3].contacts().await.iter().map(|n| n.id).collect();
        assert!(last_contacts.contains(&nodes[0].id()));
        assert!(last_contacts.contains(&nodes[1].id()));
    })
    .await
    .expect("timed out");
}

#[tokio::test]
async fn value_stored_on_one_node_is_retrieved_from_another() {
    timeout(TEST_TIMEOUT, async {
        let nodes = start_network(4).await;
        let index = Id::hash(b"shared key");

        let acked = nodes[1].store(index, b"payload".to_vec(), Duration::from_secs(300)).await;
        assert!(acked >= 1);

        let values = nodes[3].retrieve(index).await;
        assert_eq!(values, vec![b"payload".to_vec()]);
    })
    .await
    .expect("timed out");
}

#[tokio::test]
async fn distinct_values_accumulate_and_duplicates_collapse() {
    timeout(TEST_TIMEOUT, async {
        let nodes = start_network(3).await;
        let index = Id::hash(b"multi");

        nodes[0].store(index, b"a".to_vec(), Duration::from_secs(300)).await;
        nodes[1].store(index, b"b".to_vec(), Duration::from_secs(300)).await;
        nodes[2].store(index, b"a".to_vec(), Duration::from_secs(300)).await;

        let mut values = nodes[2].retrieve(index).await;
        values.sort();
        assert_eq!(values, vec![b"a".to_vec(), b"b".to_vec()]);
    })
    .await
    .expect("timed out");
}

#[tokio::test]
async fn large_values_are_retrieved_without_evicting_holders() {
    timeout(TEST_TIMEOUT, async {
        let nodes = start_network(3).await;
        let index = Id::hash(b"bulky");
        let first = vec![1u8; 700_000];
        let second = vec![2u8; 700_000];

        assert!(nodes[0].store(index, first.clone(), Duration::from_secs(300)).await >= 1);
        assert!(nodes[1].store(index, second.clone(), Duration::from_secs(300)).await >= 1);

        let mut values = nodes[2].retrieve(index).await;
        values.sort();
        assert_eq!(values, vec![first, second]);

        let known: HashSet<Id> = nodes[2].contacts().await.iter().map(|n| n.id).collect();
        assert!(known.contains(&nodes[0].id()));
        assert!(known.contains(&nodes[1].id()));
    })
    .await
    .expect("timed out");
}

#[tokio::test]
async fn erase_hides_value_network_wide() {
    timeout(TEST_TIMEOUT, async {
        let nodes = start_network(3).await;
        let index = Id::hash(b"ephemeral");

        nodes[0].store(index, b"secret".to_vec(), Duration::from_secs(300)).await;
        assert_eq!(nodes[2].retrieve(index).await.len(), 1);

        nodes[1].erase(index, b"secret".to_vec()).await;
        assert!(nodes[2].retrieve(index).await.is_empty());
        for node in &nodes {
            assert!(node.data().await.is_empty());
        }
    })
    .await
    .expect("timed out");
}

#[tokio::test]
async fn short_lifetime_values_expire() {
    timeout(TEST_TIMEOUT, async {
        let nodes = start_network(2).await;
        let index = Id::hash(b"short lived");

        nodes[0].store(index, b"blink".to_vec(), Duration::from_millis(300)).await;
        assert_eq!(nodes[1].retrieve(index).await.len(), 1);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(nodes[1].retrieve(index).await.is_empty());
    })
    .await
    .expect("timed out");
}

#[tokio::test]
async fn find_nodes_locates_target_node() {
    timeout(TEST_TIMEOUT, async {
        let nodes = start_network(5).await;
        let target = nodes[4].id();

        let found = nodes[1].find_nodes(target).await;
        assert_eq!(found.first().map(|n| n.id), Some(target));
    })
    .await
    .expect("timed out");
}

#[tokio::test]
async fn remote_diagnostics_report_node_state() {
    timeout(TEST_TIMEOUT, async {
        let nodes = start_network(2).await;
        let addr = nodes[0].node_ref().addr.clone();
        let index = Id::hash(b"diag");
        nodes[1].store(index, b"x".to_vec(), Duration::from_secs(300)).await;

        let contacts = remote_contacts(&addr, RPC_TIMEOUT).await.expect("contacts");
        assert!(contacts.iter().any(|n| n.id == nodes[1].id()));

        let data = remote_data(&addr, RPC_TIMEOUT).await.expect("data");
        assert!(data.iter().any(|e| e.index == index && e.value.value == b"x".to_vec()));

        assert!(remote_age(&addr, RPC_TIMEOUT).await.expect("age") < Duration::from_secs(60));
    })
    .await
    .expect("timed out");
}

#[tokio::test]
async fn bootstrap_to_dead_address_fails() {
    timeout(TEST_TIMEOUT, async {
        let node = Node::bind_with_config(&test_addr(), test_config()).await.expect("bind");
        let dead = test_addr();
        assert!(node.bootstrap(&[dead]).await.is_err());
    })
    .await
    .expect("timed out");
}

#[tokio::test]
async fn departed_node_is_evicted_on_lookup() {
    timeout(TEST_TIMEOUT, async {
        let nodes = start_network(3).await;
        let departed = nodes[2].id();
        nodes[2].shutdown().await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let found = nodes[0].find_nodes(departed).await;
        assert!(found.iter().all(|n| n.id != departed));
        assert!(nodes[0].contacts().await.iter().all(|n| n.id != departed));
    })
    .await
    .expect("timed out");
}
