//! # High-Level Node API
//!
//! A [`Node`] wires the components of a Kademlia peer together behind one
//! handle: the TCP transport, the contact and data tables, the responder
//! serving inbound calls and the broker issuing outbound ones.
//!
//! ## Quick Start
//!
//! ```ignore
//! let node = Node::bind("0.0.0.0:4200").await?;
//! node.bootstrap(&["198.51.100.7:4200".to_string()]).await?;
//!
//! let key = Id::hash(b"greeting");
//! node.store(key, b"hello".to_vec(), Duration::from_secs(3600)).await;
//! let values = node.retrieve(key).await;
//! ```
//!
//! ## Bootstrap
//!
//! 1. every well-known address is pinged; those that answer are added as
//!    confirmed contacts
//! 2. one lookup on the node's own id populates the table
//! 3. an empty lookup result is a fatal bootstrap failure
//!
//! A seed node bootstraps from its own address: it answers its own ping and
//! becomes the single entry of its table.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::broker::Broker;
use crate::config::KademliaConfig;
use crate::identity::{Id, NodeRef};
use crate::protocols::StoredEntry;
use crate::responder::Responder;
use crate::routing::ContactTable;
use crate::rpc::{self, RpcNode};
use crate::storage::DataTable;

pub struct Node {
    id: Id,
    node_ref: NodeRef,
    local_addr: SocketAddr,
    network: Arc<RpcNode>,
    contacts: ContactTable,
    data: DataTable<Vec<u8>>,
    responder: Responder<Vec<u8>>,
    broker: Broker<RpcNode>,
    listener: JoinHandle<()>,
}

impl Node {
    /// Bind to `addr` with default parameters and a random id.
    pub async fn bind(addr: &str) -> Result<Self> {
        Self::bind_with_config(addr, KademliaConfig::default()).await
    }

    pub async fn bind_with_config(addr: &str, config: KademliaConfig) -> Result<Self> {
        Self::create(addr, Id::random(), config).await
    }

    /// Bind with a caller-chosen id.
    pub async fn bind_with_id(addr: &str, id: Id, config: KademliaConfig) -> Result<Self> {
        Self::create(addr, id, config).await
    }

    async fn create(addr: &str, id: Id, config: KademliaConfig) -> Result<Self> {
        config.validate().context("invalid configuration")?;
        let addr: SocketAddr = addr.parse().context("invalid socket address")?;

        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        let local_addr = listener.local_addr()?;
        let advertised = config.advertise_addr.unwrap_or(local_addr);
        let node_ref = NodeRef::new(id, advertised.to_string());

        let network = Arc::new(RpcNode::new(node_ref.clone(), config.rpc_timeout));
        let contacts = ContactTable::spawn(id, network.clone(), &config);
        let data = DataTable::spawn(&config);
        let responder = Responder::new(contacts.clone(), data.clone());
        let broker = Broker::new(network.clone(), contacts.clone(), config);

        let listener = tokio::spawn(rpc::serve(listener, responder.clone()));

        info!(id = %id, addr = %local_addr, advertised = %advertised, "node listening");

        Ok(Self {
            id,
            node_ref,
            local_addr,
            network,
            contacts,
            data,
            responder,
            broker,
            listener,
        })
    }

    pub fn id(&self) -> Id {
        self.id
    }

    /// Reference other nodes use to reach this one.
    pub fn node_ref(&self) -> &NodeRef {
        &self.node_ref
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    // =========================================================================
    // Bootstrap
    // =========================================================================

    /// Ping a well-known address and record whoever answers as a confirmed contact.
    pub async fn add_initial_contact(&self, addr: &str) -> Result<Id> {
        let id = self
            .network
            .ping_addr(addr)
            .await
            .with_context(|| format!("initial contact {addr} unreachable"))?;
        self.contacts.insert(NodeRef::new(id, addr), true).await;
        debug!(peer = %id, addr = %addr, "added initial contact");
        Ok(id)
    }

    /// Populate the routing table with one lookup on this node's own id.
    ///
    /// Fails when the lookup finds nobody, which means the node is isolated.
    pub async fn initialize(&self) -> Result<Vec<NodeRef>> {
        let nodes = self.broker.find_nodes(self.id).await;
        if nodes.is_empty() {
            error!(id = %self.id, "bootstrap lookup found no nodes");
            bail!("bootstrap failed: no reachable nodes");
        }
        for node in &nodes {
            self.contacts.insert(node.clone(), false).await;
        }
        info!(found = nodes.len(), "bootstrap complete");
        Ok(nodes)
    }

    /// Contact every well-known address, then [`initialize`](Self::initialize).
    pub async fn bootstrap(&self, addrs: &[String]) -> Result<Vec<NodeRef>> {
        for addr in addrs {
            if let Err(e) = self.add_initial_contact(addr).await {
                warn!(addr = %addr, error = %e, "initial contact failed");
            }
        }
        self.initialize().await
    }

    // =========================================================================
    // Network operations
    // =========================================================================

    pub async fn find_nodes(&self, target: Id) -> Vec<NodeRef> {
        self.broker.find_nodes(target).await
    }

    /// Store `value` under `index` on the closest nodes.
    /// Returns the number of nodes that acknowledged.
    pub async fn store(&self, index: Id, value: Vec<u8>, lifetime: Duration) -> usize {
        self.broker.store(index, value, lifetime).await
    }

    pub async fn erase(&self, index: Id, value: Vec<u8>) -> usize {
        self.broker.erase(index, value).await
    }

    pub async fn retrieve(&self, index: Id) -> Vec<Vec<u8>> {
        self.broker.retrieve(index).await
    }

    // =========================================================================
    // Diagnostics
    // =========================================================================

    pub async fn contacts(&self) -> Vec<NodeRef> {
        self.responder.contacts().await
    }

    pub async fn data(&self) -> Vec<StoredEntry<Vec<u8>>> {
        self.responder.data().await
    }

    pub fn age(&self) -> Duration {
        self.responder.age()
    }

    /// Physical entry count of the local data table, expired entries included.
    pub async fn stored_len(&self) -> usize {
        self.data.len().await
    }

    pub async fn shutdown(&self) {
        self.listener.abort();
        self.contacts.shutdown().await;
        self.data.shutdown().await;
        info!(id = %self.id, "node stopped");
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.listener.abort();
    }
}
