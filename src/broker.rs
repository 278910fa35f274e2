//! # Broker
//!
//! Outbound side of the protocol: the iterative node lookup and the
//! store/erase/retrieve fan-out built on top of it.
//!
//! ## Lookup
//!
//! `find_nodes(target)` keeps a shortlist of at most `k` candidates sorted by
//! XOR distance to the target, seeded from the local [`ContactTable`]. Each
//! round queries up to `alpha` of the closest candidates not yet asked, then
//! folds the answers back in candidate order:
//!
//! | Probe result | Effect |
//! |--------------|--------|
//! | answer | peer refreshed in the table, reported contacts merged |
//! | failure | peer erased from the table and barred from this lookup |
//!
//! Merging skips contacts already present at the same distance, inserts at
//! the sorted position while below `k`, and otherwise only admits contacts
//! closer than the current farthest member. Every peer is asked at most once;
//! the lookup ends when no unasked candidate remains. The local node can be
//! part of the result (peers report it back) but is never probed.
//!
//! ## Fan-out
//!
//! - `store`: lookup on the index, then store on every result
//! - `erase`: `store` with a zero lifetime
//! - `retrieve`: lookup on the index, then query the closest `max(1, k / 5)`
//!
//! Per-peer failures evict the peer and are otherwise ignored; none of these
//! operations report an error.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use tokio::task::JoinSet;
use tokio::time;
use tracing::{debug, warn};

use crate::config::KademliaConfig;
use crate::identity::{Id, NodeRef};
use crate::protocols::{KademliaRpc, StoredValue};
use crate::routing::ContactTable;

#[derive(Debug, Clone)]
struct Candidate {
    node: NodeRef,
    distance: Id,
    queried: bool,
}

/// Bounded, distance-sorted candidate list for one lookup.
#[derive(Debug)]
struct Shortlist {
    target: Id,
    k: usize,
    candidates: Vec<Candidate>,
    queried: HashSet<Id>,
    failed: HashSet<Id>,
}

impl Shortlist {
    /// `origin` may appear in the result but is never probed.
    fn new(target: Id, k: usize, origin: Id) -> Self {
        Self {
            target,
            k,
            candidates: Vec::with_capacity(k + 1),
            queried: HashSet::from([origin]),
            failed: HashSet::new(),
        }
    }

    /// Merge one reported contact. Returns whether it was admitted.
    fn merge(&mut self, node: NodeRef) -> bool {
        if self.failed.contains(&node.id) {
            return false;
        }
        let distance = node.id ^ self.target;
        let pos = match self.candidates.binary_search_by(|c| c.distance.cmp(&distance)) {
            Ok(_) => return false,
            Err(pos) => pos,
        };
        if self.candidates.len() >= self.k && pos >= self.candidates.len() {
            return false;
        }
        let queried = self.queried.contains(&node.id);
        self.candidates.insert(pos, Candidate { node, distance, queried });
        self.candidates.truncate(self.k);
        true
    }

    /// Mark and return up to `alpha` of the closest unqueried candidates.
    fn next_batch(&mut self, alpha: usize) -> Vec<NodeRef> {
        let mut batch = Vec::with_capacity(alpha);
        for candidate in self.candidates.iter_mut().filter(|c| !c.queried).take(alpha) {
            candidate.queried = true;
            self.queried.insert(candidate.node.id);
            batch.push(candidate.node.clone());
        }
        batch
    }

    fn reject(&mut self, id: &Id) {
        self.failed.insert(*id);
        self.candidates.retain(|c| &c.node.id != id);
    }

    fn into_nodes(self) -> Vec<NodeRef> {
        self.candidates.into_iter().map(|c| c.node).collect()
    }
}

/// Outbound operations against the network.
pub struct Broker<N: KademliaRpc> {
    network: Arc<N>,
    contacts: ContactTable,
    config: KademliaConfig,
}

impl<N: KademliaRpc> Clone for Broker<N> {
    fn clone(&self) -> Self {
        Self {
            network: self.network.clone(),
            contacts: self.contacts.clone(),
            config: self.config.clone(),
        }
    }
}

impl<N: KademliaRpc> Broker<N> {
    pub fn new(network: Arc<N>, contacts: ContactTable, config: KademliaConfig) -> Self {
        Self {
            network,
            contacts,
            config,
        }
    }

    /// Iteratively locate the `k` nodes closest to `target`.
    pub async fn find_nodes(&self, target: Id) -> Vec<NodeRef> {
        let k = self.config.replication_factor;
        let mut shortlist = Shortlist::new(target, k, self.contacts.origin());
        for node in self.contacts.retrieve(target).await {
            shortlist.merge(node);
        }

        let mut rounds = 0usize;
        loop {
            let batch = shortlist.next_batch(self.config.alpha);
            if batch.is_empty() {
                break;
            }
            rounds += 1;

            let mut probes = JoinSet::new();
            let batch_len = batch.len();
            for (idx, node) in batch.into_iter().enumerate() {
                let net = self.network.clone();
                let rpc_timeout = self.config.rpc_timeout;
                probes.spawn(async move {
                    let result = match time::timeout(rpc_timeout, net.find_nodes(&node, target)).await {
                        Ok(r) => r,
                        Err(_) => Err(anyhow!("query timeout")),
                    };
                    (idx, node, result)
                });
            }

            let mut results = Vec::with_capacity(batch_len);
            results.resize_with(batch_len, || None);
            while let Some(joined) = probes.join_next().await {
                if let Ok((idx, node, result)) = joined {
                    results[idx] = Some((node, result));
                }
            }

            for (node, result) in results.into_iter().flatten() {
                match result {
                    Ok(reported) => {
                        self.contacts.insert(node, true).await;
                        for candidate in reported {
                            shortlist.merge(candidate);
                        }
                    }
                    Err(e) => {
                        debug!(peer = %node, error = %e, "find_nodes probe failed, evicting");
                        self.contacts.erase(node.id).await;
                        shortlist.reject(&node.id);
                    }
                }
            }
        }

        let found = shortlist.into_nodes();
        if found.len() < k {
            warn!(
                target = %target,
                found = found.len(),
                k,
                "lookup returned fewer than k nodes"
            );
        }
        debug!(target = %target, found = found.len(), rounds, "lookup completed");
        found
    }

    /// Replicate `value` under `index` on the closest nodes.
    /// Returns how many peers acknowledged the store.
    pub async fn store(&self, index: Id, value: N::Value, lifetime: Duration) -> usize {
        let nodes = self.find_nodes(index).await;

        let mut stores = JoinSet::new();
        for node in nodes {
            let net = self.network.clone();
            let stored = StoredValue::new(value.clone(), lifetime);
            let rpc_timeout = self.config.rpc_timeout;
            stores.spawn(async move {
                let result = match time::timeout(rpc_timeout, net.store(&node, index, stored)).await {
                    Ok(r) => r,
                    Err(_) => Err(anyhow!("store timeout")),
                };
                (node, result)
            });
        }

        let mut acknowledged = 0;
        while let Some(joined) = stores.join_next().await {
            let Ok((node, result)) = joined else {
                continue;
            };
            match result {
                Ok(()) => {
                    acknowledged += 1;
                    self.contacts.insert(node, true).await;
                }
                Err(e) => {
                    debug!(peer = %node, error = %e, "store failed, evicting");
                    self.contacts.erase(node.id).await;
                }
            }
        }

        debug!(index = %index, acknowledged, lifetime_ms = lifetime.as_millis() as u64, "store completed");
        acknowledged
    }

    /// Hide `value` under `index` by storing it with a zero lifetime.
    pub async fn erase(&self, index: Id, value: N::Value) -> usize {
        self.store(index, value, Duration::ZERO).await
    }

    /// Collect the distinct live values stored under `index`.
    pub async fn retrieve(&self, index: Id) -> Vec<N::Value> {
        let nodes = self.find_nodes(index).await;
        let fanout = self.config.retrieve_fanout();

        let mut queries = JoinSet::new();
        let queried: Vec<NodeRef> = nodes.into_iter().take(fanout).collect();
        let queried_len = queried.len();
        for (idx, node) in queried.into_iter().enumerate() {
            let net = self.network.clone();
            let rpc_timeout = self.config.rpc_timeout;
            queries.spawn(async move {
                let result = match time::timeout(rpc_timeout, net.retrieve(&node, index)).await {
                    Ok(r) => r,
                    Err(_) => Err(anyhow!("retrieve timeout")),
                };
                (idx, node, result)
            });
        }

        let mut results = Vec::with_capacity(queried_len);
        results.resize_with(queried_len, || None);
        while let Some(joined) = queries.join_next().await {
            if let Ok((idx, node, result)) = joined {
                results[idx] = Some((node, result));
            }
        }

        let mut values: Vec<N::Value> = Vec::new();
        for (node, result) in results.into_iter().flatten() {
            match result {
                Ok(found) => {
                    self.contacts.insert(node, true).await;
                    for stored in found {
                        if !values.contains(&stored.value) {
                            values.push(stored.value);
                        }
                    }
                }
                Err(e) => {
                    debug!(peer = %node, error = %e, "retrieve failed, evicting");
                    self.contacts.erase(node.id).await;
                }
            }
        }

        debug!(index = %index, values = values.len(), "retrieve completed");
        values
    }
}
