//! Peer capability trait for the Kademlia layer.
//!
//! The routing table, the broker and the node facade only ever talk to
//! remote peers through [`KademliaRpc`]. The TCP transport in `rpc`
//! implements it for real sockets; unit tests implement it over an
//! in-process registry.
//!
//! ## Operations
//!
//! | Operation | Returns | Effect on the remote peer |
//! |-----------|---------|---------------------------|
//! | `ping` | remote id | records the caller |
//! | `store` | `()` | stores the value, records the caller |
//! | `retrieve` | live values | records the caller |
//! | `find_nodes` | closest contacts | records the caller |
//!
//! Implementations attach the local node's [`NodeRef`] to every request so
//! the remote side can learn about the caller. Any `Err` is a transport
//! failure: callers treat it as evidence that the peer is unreachable.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::identity::{Id, NodeRef};

/// A value together with its remaining lifetime.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredValue<V> {
    pub value: V,
    pub lifetime: Duration,
}

impl<V> StoredValue<V> {
    pub fn new(value: V, lifetime: Duration) -> Self {
        Self { value, lifetime }
    }
}

/// A stored value and the index it lives under.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEntry<V> {
    pub index: Id,
    pub value: StoredValue<V>,
}

/// Remote operations offered by every Kademlia peer.
#[async_trait]
pub trait KademliaRpc: Send + Sync + 'static {
    /// Payload type carried by `store` and `retrieve`.
    type Value: Clone + PartialEq + Send + Sync + 'static;

    /// Liveness probe. Returns the id the remote peer currently reports.
    async fn ping(&self, to: &NodeRef) -> Result<Id>;

    /// Store `value` under `index` on the remote peer.
    async fn store(&self, to: &NodeRef, index: Id, value: StoredValue<Self::Value>) -> Result<()>;

    /// Fetch every live value the remote peer holds under `index`.
    async fn retrieve(&self, to: &NodeRef, index: Id) -> Result<Vec<StoredValue<Self::Value>>>;

    /// Ask the remote peer for the contacts it knows closest to `target`.
    async fn find_nodes(&self, to: &NodeRef, target: Id) -> Result<Vec<NodeRef>>;
}
