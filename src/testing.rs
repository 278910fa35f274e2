//! In-process peer network for unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};

use crate::broker::Broker;
use crate::config::KademliaConfig;
use crate::identity::{Id, NodeRef};
use crate::protocols::{KademliaRpc, StoredValue};
use crate::responder::Responder;
use crate::routing::ContactTable;
use crate::storage::DataTable;

/// Id whose first byte is `prefix` and last byte is `tail`.
pub(crate) fn id_with_prefix(prefix: u8, tail: u8) -> Id {
    let mut bytes = [0u8; Id::BYTES];
    bytes[0] = prefix;
    bytes[Id::BYTES - 1] = tail;
    Id::from_bytes(bytes)
}

#[derive(Default)]
pub(crate) struct NetworkRegistry {
    peers: RwLock<HashMap<Id, Responder<Vec<u8>>>>,
}

impl NetworkRegistry {
    pub async fn register(&self, responder: &Responder<Vec<u8>>) {
        self.peers.write().await.insert(responder.id(), responder.clone());
    }

    pub async fn unregister(&self, id: &Id) {
        self.peers.write().await.remove(id);
    }

    async fn get(&self, id: &Id) -> Option<Responder<Vec<u8>>> {
        self.peers.read().await.get(id).cloned()
    }
}

#[derive(Clone)]
pub(crate) struct TestNetwork {
    registry: Arc<NetworkRegistry>,
    self_ref: NodeRef,
    failures: Arc<Mutex<HashSet<Id>>>,
    store_failures: Arc<Mutex<HashSet<Id>>>,
    routes: Arc<Mutex<HashMap<Id, Id>>>,
    pings: Arc<Mutex<Vec<Id>>>,
    find_calls: Arc<Mutex<Vec<Id>>>,
    stores: Arc<Mutex<Vec<(Id, Id)>>>,
    retrieves: Arc<Mutex<Vec<Id>>>,
}

impl TestNetwork {
    pub fn new(registry: Arc<NetworkRegistry>, self_ref: NodeRef) -> Self {
        Self {
            registry,
            self_ref,
            failures: Arc::new(Mutex::new(HashSet::new())),
            store_failures: Arc::new(Mutex::new(HashSet::new())),
            routes: Arc::new(Mutex::new(HashMap::new())),
            pings: Arc::new(Mutex::new(Vec::new())),
            find_calls: Arc::new(Mutex::new(Vec::new())),
            stores: Arc::new(Mutex::new(Vec::new())),
            retrieves: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub async fn set_failure(&self, node: Id, fail: bool) {
        let mut failures = self.failures.lock().await;
        if fail {
            failures.insert(node);
        } else {
            failures.remove(&node);
        }
    }

    /// Fail only `store` calls to `node`.
    pub async fn set_store_failure(&self, node: Id, fail: bool) {
        let mut failures = self.store_failures.lock().await;
        if fail {
            failures.insert(node);
        } else {
            failures.remove(&node);
        }
    }

    /// Deliver calls addressed to `claimed` to the peer registered as `actual`.
    pub async fn route_address(&self, claimed: Id, actual: Id) {
        self.routes.lock().await.insert(claimed, actual);
    }

    pub async fn ping_calls(&self) -> Vec<Id> {
        self.pings.lock().await.clone()
    }

    pub async fn find_calls(&self) -> Vec<Id> {
        self.find_calls.lock().await.clone()
    }

    /// `(peer, index)` for every store attempt, failed ones included.
    pub async fn store_calls(&self) -> Vec<(Id, Id)> {
        self.stores.lock().await.clone()
    }

    pub async fn retrieve_calls(&self) -> Vec<Id> {
        self.retrieves.lock().await.clone()
    }

    async fn resolve(&self, to: &NodeRef) -> Result<Responder<Vec<u8>>> {
        if self.failures.lock().await.contains(&to.id) {
            return Err(anyhow!("injected network failure"));
        }
        let actual = self.routes.lock().await.get(&to.id).copied().unwrap_or(to.id);
        self.registry
            .get(&actual)
            .await
            .ok_or_else(|| anyhow!("peer not reachable"))
    }
}

#[async_trait]
impl KademliaRpc for TestNetwork {
    type Value = Vec<u8>;

    async fn ping(&self, to: &NodeRef) -> Result<Id> {
        self.pings.lock().await.push(to.id);
        let peer = self.resolve(to).await?;
        Ok(peer.ping(&self.self_ref).await)
    }

    async fn store(&self, to: &NodeRef, index: Id, value: StoredValue<Vec<u8>>) -> Result<()> {
        self.stores.lock().await.push((to.id, index));
        if self.store_failures.lock().await.contains(&to.id) {
            return Err(anyhow!("injected store failure"));
        }
        let peer = self.resolve(to).await?;
        peer.store(&self.self_ref, index, value).await;
        Ok(())
    }

    async fn retrieve(&self, to: &NodeRef, index: Id) -> Result<Vec<StoredValue<Vec<u8>>>> {
        self.retrieves.lock().await.push(to.id);
        let peer = self.resolve(to).await?;
        Ok(peer.retrieve(&self.self_ref, index).await)
    }

    async fn find_nodes(&self, to: &NodeRef, target: Id) -> Result<Vec<NodeRef>> {
        self.find_calls.lock().await.push(to.id);
        let peer = self.resolve(to).await?;
        Ok(peer.find_nodes(&self.self_ref, target).await)
    }
}

pub(crate) struct TestNode {
    pub id: Id,
    pub node_ref: NodeRef,
    pub contacts: ContactTable,
    pub data: DataTable<Vec<u8>>,
    pub responder: Responder<Vec<u8>>,
    pub network: TestNetwork,
    pub broker: Broker<TestNetwork>,
}

impl TestNode {
    pub async fn new(registry: Arc<NetworkRegistry>) -> Self {
        Self::with_config(registry, Id::random(), KademliaConfig::default()).await
    }

    pub async fn with_config(registry: Arc<NetworkRegistry>, id: Id, config: KademliaConfig) -> Self {
        let node_ref = NodeRef::new(id, format!("mem://{}", &id.to_hex()[..8]));
        let network = TestNetwork::new(registry.clone(), node_ref.clone());
        let shared = Arc::new(network.clone());
        let contacts = ContactTable::spawn(id, shared.clone(), &config);
        let data = DataTable::spawn(&config);
        let responder = Responder::new(contacts.clone(), data.clone());
        let broker = Broker::new(shared, contacts.clone(), config);
        registry.register(&responder).await;
        Self {
            id,
            node_ref,
            contacts,
            data,
            responder,
            network,
            broker,
        }
    }
}
