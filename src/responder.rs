//! Inbound side of the protocol.
//!
//! A [`Responder`] serves the four peer operations from the local tables.
//! Every call first records the caller as a confirmed contact, which is how
//! a node learns about the peers that talk to it. It also exposes the
//! diagnostic views `contacts`, `data` and `age`.

use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

use crate::identity::{Id, NodeRef};
use crate::protocols::{StoredEntry, StoredValue};
use crate::routing::ContactTable;
use crate::storage::DataTable;

pub struct Responder<V> {
    id: Id,
    contacts: ContactTable,
    data: DataTable<V>,
    started: Instant,
}

impl<V> Clone for Responder<V> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            contacts: self.contacts.clone(),
            data: self.data.clone(),
            started: self.started,
        }
    }
}

impl<V: Clone + PartialEq + Send + 'static> Responder<V> {
    pub fn new(contacts: ContactTable, data: DataTable<V>) -> Self {
        Self {
            id: contacts.origin(),
            contacts,
            data,
            started: Instant::now(),
        }
    }

    pub fn id(&self) -> Id {
        self.id
    }

    async fn record_caller(&self, caller: &NodeRef) {
        self.contacts.insert(caller.clone(), true).await;
    }

    pub async fn ping(&self, caller: &NodeRef) -> Id {
        trace!(from = %caller, "handling PING");
        self.record_caller(caller).await;
        self.id
    }

    pub async fn store(&self, caller: &NodeRef, index: Id, value: StoredValue<V>) {
        trace!(from = %caller, index = %index, lifetime_ms = value.lifetime.as_millis() as u64, "handling STORE");
        self.record_caller(caller).await;
        self.data.store(index, value.value, value.lifetime).await;
    }

    pub async fn retrieve(&self, caller: &NodeRef, index: Id) -> Vec<StoredValue<V>> {
        trace!(from = %caller, index = %index, "handling RETRIEVE");
        self.record_caller(caller).await;
        self.data.retrieve(index).await
    }

    pub async fn find_nodes(&self, caller: &NodeRef, target: Id) -> Vec<NodeRef> {
        trace!(from = %caller, target = %target, "handling FIND_NODES");
        self.record_caller(caller).await;
        self.contacts.retrieve(target).await
    }

    pub async fn contacts(&self) -> Vec<NodeRef> {
        self.contacts.contents().await
    }

    pub async fn data(&self) -> Vec<StoredEntry<V>> {
        self.data.contents().await
    }

    /// Time since this responder was created.
    pub fn age(&self) -> Duration {
        self.started.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::testing::{NetworkRegistry, TestNode};

    #[tokio::test]
    async fn every_operation_records_the_caller() {
        let registry = Arc::new(NetworkRegistry::default());
        let node = TestNode::new(registry).await;
        let callers: Vec<NodeRef> = (0..4)
            .map(|i| NodeRef::new(Id::random(), format!("mem://caller-{i}")))
            .collect();
        let index = Id::hash(b"index");

        assert_eq!(node.responder.ping(&callers[0]).await, node.id);
        node.responder
            .store(&callers[1], index, StoredValue::new(b"v".to_vec(), Duration::from_secs(60)))
            .await;
        node.responder.retrieve(&callers[2], index).await;
        node.responder.find_nodes(&callers[3], Id::random()).await;

        for caller in &callers {
            let contact = node.contacts.lookup(caller.id).await.expect("caller recorded");
            assert!(contact.last_seen.is_some());
        }
    }

    #[tokio::test]
    async fn store_and_retrieve_go_through_data_table() {
        let registry = Arc::new(NetworkRegistry::default());
        let node = TestNode::new(registry).await;
        let caller = NodeRef::new(Id::random(), "mem://caller");
        let index = Id::hash(b"index");

        node.responder
            .store(&caller, index, StoredValue::new(b"v".to_vec(), Duration::from_secs(60)))
            .await;
        let values = node.responder.retrieve(&caller, index).await;
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].value, b"v".to_vec());

        let data = node.responder.data().await;
        assert_eq!(data.len(), 1);
        assert_eq!(data[0].index, index);
    }

    #[tokio::test]
    async fn find_nodes_includes_the_caller_itself() {
        let registry = Arc::new(NetworkRegistry::default());
        let node = TestNode::new(registry).await;
        let caller = NodeRef::new(Id::random(), "mem://caller");

        let nodes = node.responder.find_nodes(&caller, caller.id).await;
        assert_eq!(nodes.first().map(|n| n.id), Some(caller.id));
        assert_eq!(node.responder.contacts().await, vec![caller]);
    }

    #[tokio::test(start_paused = true)]
    async fn age_tracks_elapsed_time() {
        let registry = Arc::new(NetworkRegistry::default());
        let node = TestNode::new(registry).await;
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(node.responder.age() >= Duration::from_secs(30));
    }
}
