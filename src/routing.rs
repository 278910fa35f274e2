//! # Contact Table
//!
//! XOR-metric routing table with background liveness checking.
//!
//! ## Layout
//!
//! 161 buckets indexed by `(id ^ origin).bitscan()`: bucket 0 can only hold
//! the origin itself, bucket 160 holds the half of the id space farthest from
//! it. Each bucket is an ordered map of at most `k + 2` contacts.
//!
//! ## Architecture
//!
//! - [`ContactTable`]: cloneable handle
//! - `ContactTableActor`: owns the [`RoutingTable`] and runs the health pass
//!
//! ## Health Pass
//!
//! Every `health_check_interval` the actor collects contacts that were never
//! confirmed alive or whose last confirmation is older than `ping_interval`,
//! and pings them from a separate task so table operations are never blocked
//! on the network. Outcomes come back through the command channel:
//!
//! | Ping outcome | Effect |
//! |--------------|--------|
//! | same id | `last_seen` refreshed |
//! | different id | stale entry removed, reported id inserted at the same address |
//! | failure | contact evicted |
//!
//! A pass is skipped while the previous one still has pings in flight.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, trace};

use crate::config::KademliaConfig;
use crate::identity::{Id, NodeRef};
use crate::protocols::KademliaRpc;

const CONTACT_COMMAND_CHANNEL_SIZE: usize = 256;

/// Number of buckets: one per possible `bitscan` result.
pub const BUCKET_COUNT: usize = Id::BITS + 1;

/// A routing table entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Contact {
    pub node: NodeRef,
    /// First time the contact was confirmed alive.
    pub first_seen: Option<Instant>,
    /// Most recent confirmation. `None` means never confirmed.
    pub last_seen: Option<Instant>,
}

impl Contact {
    fn new(node: NodeRef) -> Self {
        Self {
            node,
            first_seen: None,
            last_seen: None,
        }
    }

    fn stamp(&mut self, now: Instant) {
        self.last_seen = Some(now);
        if self.first_seen.is_none() {
            self.first_seen = Some(now);
        }
    }

    fn needs_ping(&self, now: Instant, ping_interval: Duration) -> bool {
        match self.last_seen {
            None => true,
            Some(seen) => now.saturating_duration_since(seen) >= ping_interval,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InsertOutcome {
    Inserted,
    Refreshed,
    Known,
    BucketFull,
}

/// Bucketed contact storage. Synchronous core of [`ContactTable`].
#[derive(Debug)]
pub(crate) struct RoutingTable {
    origin: Id,
    k: usize,
    buckets: Vec<BTreeMap<Id, Contact>>,
}

impl RoutingTable {
    pub fn new(origin: Id, k: usize) -> Self {
        Self {
            origin,
            k,
            buckets: vec![BTreeMap::new(); BUCKET_COUNT],
        }
    }

    fn bucket_index(&self, id: &Id) -> usize {
        (*id ^ self.origin).bitscan()
    }

    fn capacity(&self) -> usize {
        self.k + 2
    }

    pub fn insert(&mut self, node: NodeRef, seen: bool, now: Instant) -> InsertOutcome {
        let capacity = self.capacity();
        let idx = self.bucket_index(&node.id);
        let bucket = &mut self.buckets[idx];

        if let Some(existing) = bucket.get_mut(&node.id) {
            if !seen {
                return InsertOutcome::Known;
            }
            existing.node.addr = node.addr;
            existing.stamp(now);
            return InsertOutcome::Refreshed;
        }

        if bucket.len() >= capacity {
            return InsertOutcome::BucketFull;
        }

        let mut contact = Contact::new(node);
        if seen {
            contact.stamp(now);
        }
        bucket.insert(contact.node.id, contact);
        InsertOutcome::Inserted
    }

    pub fn erase(&mut self, id: &Id) -> bool {
        let idx = self.bucket_index(id);
        self.buckets[idx].remove(id).is_some()
    }

    pub fn get(&self, id: &Id) -> Option<&Contact> {
        self.buckets[self.bucket_index(id)].get(id)
    }

    /// Up to `k` contacts closest to `target`, nearest first.
    pub fn closest(&self, target: &Id) -> Vec<NodeRef> {
        #[derive(PartialEq, Eq)]
        struct ByDistance {
            dist: Id,
            node: NodeRef,
        }

        impl Ord for ByDistance {
            fn cmp(&self, other: &Self) -> Ordering {
                self.dist.cmp(&other.dist)
            }
        }

        impl PartialOrd for ByDistance {
            fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
                Some(self.cmp(other))
            }
        }

        let mut heap: BinaryHeap<ByDistance> = BinaryHeap::with_capacity(self.k + 1);
        for contact in self.buckets.iter().flat_map(|bucket| bucket.values()) {
            let dist = contact.node.id ^ *target;
            if heap.len() < self.k {
                heap.push(ByDistance { dist, node: contact.node.clone() });
            } else if let Some(farthest) = heap.peek()
                && dist < farthest.dist
            {
                heap.pop();
                heap.push(ByDistance { dist, node: contact.node.clone() });
            }
        }

        heap.into_sorted_vec().into_iter().map(|entry| entry.node).collect()
    }

    pub fn contents(&self) -> Vec<NodeRef> {
        self.buckets
            .iter()
            .flat_map(|bucket| bucket.values().map(|c| c.node.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(BTreeMap::len).sum()
    }

    #[cfg(test)]
    pub fn bucket_len(&self, idx: usize) -> usize {
        self.buckets.get(idx).map(BTreeMap::len).unwrap_or(0)
    }

    fn due_for_ping(&self, now: Instant, ping_interval: Duration) -> Vec<NodeRef> {
        self.buckets
            .iter()
            .flat_map(|bucket| bucket.values())
            .filter(|c| c.needs_ping(now, ping_interval))
            .map(|c| c.node.clone())
            .collect()
    }

    /// Apply one ping outcome from a pass dispatched at `dispatched`.
    ///
    /// A contact confirmed alive after the dispatch is not evicted.
    fn apply_health(&mut self, outcome: HealthOutcome, dispatched: Instant, now: Instant) {
        match outcome {
            HealthOutcome::Alive(node) => {
                let idx = self.bucket_index(&node.id);
                if let Some(contact) = self.buckets[idx].get_mut(&node.id) {
                    contact.stamp(now);
                }
            }
            HealthOutcome::Moved { stale, reported } => {
                debug!(stale = %stale.id, reported = %reported, addr = %stale.addr, "contact changed identity");
                self.erase(&stale.id);
                self.insert(NodeRef::new(reported, stale.addr), true, now);
            }
            HealthOutcome::Unreachable(node) => {
                if let Some(contact) = self.get(&node.id)
                    && contact.last_seen.is_some_and(|seen| seen >= dispatched)
                {
                    trace!(peer = %node, "contact confirmed during health pass, keeping");
                    return;
                }
                debug!(peer = %node, "evicting unresponsive contact");
                self.erase(&node.id);
            }
        }
    }
}

#[derive(Debug)]
enum HealthOutcome {
    Alive(NodeRef),
    Moved { stale: NodeRef, reported: Id },
    Unreachable(NodeRef),
}

enum Command {
    Insert(NodeRef, bool),
    Erase(Id),
    Retrieve(Id, oneshot::Sender<Vec<NodeRef>>),
    Lookup(Id, oneshot::Sender<Option<Contact>>),
    Contents(oneshot::Sender<Vec<NodeRef>>),
    Len(oneshot::Sender<usize>),
    HealthResults(Vec<HealthOutcome>, Instant),
    Quit(oneshot::Sender<()>),
}

/// Handle to a node's routing table.
#[derive(Clone)]
pub struct ContactTable {
    cmd_tx: mpsc::Sender<Command>,
    origin: Id,
}

impl ContactTable {
    /// Spawn the table for `origin`; `network` is used for health pings.
    pub fn spawn<N: KademliaRpc>(origin: Id, network: Arc<N>, config: &KademliaConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(CONTACT_COMMAND_CHANNEL_SIZE);
        let actor = ContactTableActor {
            table: RoutingTable::new(origin, config.replication_factor),
            network,
            ping_interval: config.ping_interval,
            health_check_interval: config.health_check_interval,
            rpc_timeout: config.rpc_timeout,
            health_in_flight: false,
            cmd_tx: cmd_tx.downgrade(),
            cmd_rx,
        };
        tokio::spawn(actor.run());
        Self { cmd_tx, origin }
    }

    pub fn origin(&self) -> Id {
        self.origin
    }

    /// Record `node`. With `seen` set the contact is stamped as alive.
    /// New contacts landing in a full bucket are dropped.
    pub async fn insert(&self, node: NodeRef, seen: bool) {
        let _ = self.cmd_tx.send(Command::Insert(node, seen)).await;
    }

    pub async fn erase(&self, id: Id) {
        let _ = self.cmd_tx.send(Command::Erase(id)).await;
    }

    /// Up to `k` known contacts closest to `target`, nearest first.
    pub async fn retrieve(&self, target: Id) -> Vec<NodeRef> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Retrieve(target, tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn lookup(&self, id: Id) -> Option<Contact> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Lookup(id, tx)).await.is_err() {
            return None;
        }
        rx.await.ok().flatten()
    }

    pub async fn contents(&self) -> Vec<NodeRef> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Contents(tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn len(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Len(tx)).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Stop the health task and wait for it to exit.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Quit(tx)).await.is_err() {
            return;
        }
        let _ = rx.await;
    }
}

struct ContactTableActor<N: KademliaRpc> {
    table: RoutingTable,
    network: Arc<N>,
    ping_interval: Duration,
    health_check_interval: Duration,
    rpc_timeout: Duration,
    health_in_flight: bool,
    cmd_tx: mpsc::WeakSender<Command>,
    cmd_rx: mpsc::Receiver<Command>,
}

impl<N: KademliaRpc> ContactTableActor<N> {
    async fn run(mut self) {
        let mut health_tick = time::interval_at(
            Instant::now() + self.health_check_interval,
            self.health_check_interval,
        );
        health_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut quit_ack = None;

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Quit(ack)) => {
                            quit_ack = Some(ack);
                            break;
                        }
                        Some(cmd) => self.handle_command(cmd),
                        None => break,
                    }
                }
                _ = health_tick.tick() => {
                    self.start_health_pass();
                }
            }
        }

        debug!(contacts = self.table.len(), "contact table stopped");
        if let Some(ack) = quit_ack {
            let _ = ack.send(());
        }
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Insert(node, seen) => {
                let outcome = self.table.insert(node.clone(), seen, Instant::now());
                trace!(peer = %node, seen, outcome = ?outcome, "contact insert");
            }
            Command::Erase(id) => {
                if self.table.erase(&id) {
                    trace!(peer = %id, "contact erased");
                }
            }
            Command::Retrieve(target, reply) => {
                let _ = reply.send(self.table.closest(&target));
            }
            Command::Lookup(id, reply) => {
                let _ = reply.send(self.table.get(&id).cloned());
            }
            Command::Contents(reply) => {
                let _ = reply.send(self.table.contents());
            }
            Command::Len(reply) => {
                let _ = reply.send(self.table.len());
            }
            Command::HealthResults(outcomes, dispatched) => {
                let now = Instant::now();
                for outcome in outcomes {
                    self.table.apply_health(outcome, dispatched, now);
                }
                self.health_in_flight = false;
            }
            Command::Quit(_) => {}
        }
    }

    fn start_health_pass(&mut self) {
        if self.health_in_flight {
            trace!("previous health pass still running");
            return;
        }
        let dispatched = Instant::now();
        let due = self.table.due_for_ping(dispatched, self.ping_interval);
        if due.is_empty() {
            return;
        }
        let Some(reply_tx) = self.cmd_tx.upgrade() else {
            return;
        };

        debug!(count = due.len(), "pinging stale contacts");
        self.health_in_flight = true;

        let network = self.network.clone();
        let rpc_timeout = self.rpc_timeout;
        tokio::spawn(async move {
            let mut pings = JoinSet::new();
            for node in due {
                let net = network.clone();
                pings.spawn(async move {
                    let result = time::timeout(rpc_timeout, net.ping(&node)).await;
                    match result {
                        Ok(Ok(reported)) if reported == node.id => HealthOutcome::Alive(node),
                        Ok(Ok(reported)) => HealthOutcome::Moved { stale: node, reported },
                        Ok(Err(e)) => {
                            trace!(peer = %node, error = %e, "health ping failed");
                            HealthOutcome::Unreachable(node)
                        }
                        Err(_) => HealthOutcome::Unreachable(node),
                    }
                });
            }

            let mut outcomes = Vec::new();
            while let Some(joined) = pings.join_next().await {
                if let Ok(outcome) = joined {
                    outcomes.push(outcome);
                }
            }
            let _ = reply_tx.send(Command::HealthResults(outcomes, dispatched)).await;
        });
    }
}
