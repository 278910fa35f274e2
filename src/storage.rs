//! # Data Table
//!
//! Local, expiring, multi-valued storage for the values this node replicates.
//!
//! ## Architecture
//!
//! - [`DataTable`]: cloneable handle
//! - `DataTableActor`: owns the map and processes commands one at a time
//!
//! The actor also drives a periodic purge from the same `select!` loop, so a
//! purge pass never interleaves with a store or a retrieve.
//!
//! ## Semantics
//!
//! | Operation | Behaviour |
//! |-----------|-----------|
//! | `store` | equal value under the same index is refreshed in place, otherwise appended |
//! | `retrieve` | live values only (`expires_at > now`) with their remaining lifetime |
//! | `purge` | removes every entry with `expires_at <= now` |
//! | `contents` | snapshot of every live entry |
//!
//! Each entry also carries a republish time (`now + republish_interval +
//! jitter`, jitter up to a tenth of the interval). Entries past that time are
//! counted during maintenance but not republished.

use std::collections::BTreeMap;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, trace};

use crate::config::KademliaConfig;
use crate::identity::Id;
use crate::protocols::{StoredEntry, StoredValue};

const DATA_COMMAND_CHANNEL_SIZE: usize = 256;

/// Lifetimes too large to represent as an `Instant` are clamped to this.
const MAX_LIFETIME: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

#[derive(Clone, Debug)]
struct DataEntry<V> {
    value: V,
    expires_at: Instant,
    republish_at: Instant,
}

enum Command<V> {
    Store(Id, V, Duration, oneshot::Sender<()>),
    Retrieve(Id, oneshot::Sender<Vec<StoredValue<V>>>),
    Purge(oneshot::Sender<usize>),
    Contents(oneshot::Sender<Vec<StoredEntry<V>>>),
    Len(oneshot::Sender<usize>),
    Quit(oneshot::Sender<()>),
}

/// Handle to a node's local value store.
pub struct DataTable<V> {
    cmd_tx: mpsc::Sender<Command<V>>,
}

impl<V> Clone for DataTable<V> {
    fn clone(&self) -> Self {
        Self {
            cmd_tx: self.cmd_tx.clone(),
        }
    }
}

impl<V: Clone + PartialEq + Send + 'static> DataTable<V> {
    /// Spawn the table and its purge task.
    pub fn spawn(config: &KademliaConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(DATA_COMMAND_CHANNEL_SIZE);
        let actor = DataTableActor {
            entries: BTreeMap::new(),
            republish_interval: config.republish_interval,
            purge_interval: config.purge_interval,
            cmd_rx,
        };
        tokio::spawn(actor.run());
        Self { cmd_tx }
    }

    /// Store `value` under `index` for `lifetime`.
    ///
    /// A zero lifetime leaves an already expired entry behind, which hides
    /// any equal value until the next purge.
    pub async fn store(&self, index: Id, value: V, lifetime: Duration) {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Store(index, value, lifetime, tx)).await.is_err() {
            return;
        }
        let _ = rx.await;
    }

    pub async fn retrieve(&self, index: Id) -> Vec<StoredValue<V>> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Retrieve(index, tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Drop expired entries now. Returns how many were removed.
    pub async fn purge(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Purge(tx)).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    pub async fn contents(&self) -> Vec<StoredEntry<V>> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Contents(tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Number of physically present entries, expired ones included.
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

    /// Stop the purge task and wait for it to exit.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Quit(tx)).await.is_err() {
            return;
        }
        let _ = rx.await;
    }
}

struct DataTableActor<V> {
    entries: BTreeMap<Id, Vec<DataEntry<V>>>,
    republish_interval: Duration,
    purge_interval: Duration,
    cmd_rx: mpsc::Receiver<Command<V>>,
}

impl<V: Clone + PartialEq + Send + 'static> DataTableActor<V> {
    async fn run(mut self) {
        let mut purge_tick = time::interval_at(Instant::now() + self.purge_interval, self.purge_interval);
        purge_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
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
                _ = purge_tick.tick() => {
                    self.maintenance();
                }
            }
        }

        debug!("data table stopped");
        if let Some(ack) = quit_ack {
            let _ = ack.send(());
        }
    }

    fn handle_command(&mut self, cmd: Command<V>) {
        match cmd {
            Command::Store(index, value, lifetime, reply) => {
                self.store(index, value, lifetime);
                let _ = reply.send(());
            }
            Command::Retrieve(index, reply) => {
                let _ = reply.send(self.retrieve(&index));
            }
            Command::Purge(reply) => {
                let _ = reply.send(self.purge());
            }
            Command::Contents(reply) => {
                let _ = reply.send(self.contents());
            }
            Command::Len(reply) => {
                let _ = reply.send(self.entries.values().map(Vec::len).sum());
            }
            Command::Quit(_) => {}
        }
    }

    fn store(&mut self, index: Id, value: V, lifetime: Duration) {
        let now = Instant::now();
        let expires_at = now
            .checked_add(lifetime.min(MAX_LIFETIME))
            .unwrap_or(now);
        let republish_at = now + self.republish_interval + self.republish_jitter();

        let slot = self.entries.entry(index).or_default();
        match slot.iter_mut().find(|entry| entry.value == value) {
            Some(existing) => {
                existing.expires_at = expires_at;
                existing.republish_at = republish_at;
                trace!(index = %index, lifetime_ms = lifetime.as_millis() as u64, "refreshed stored value");
            }
            None => {
                slot.push(DataEntry {
                    value,
                    expires_at,
                    republish_at,
                });
                trace!(index = %index, lifetime_ms = lifetime.as_millis() as u64, "stored new value");
            }
        }
    }

    fn republish_jitter(&self) -> Duration {
        let max_ms = (self.republish_interval / 10).as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
    }

    fn retrieve(&self, index: &Id) -> Vec<StoredValue<V>> {
        let now = Instant::now();
        self.entries
            .get(index)
            .map(|slot| {
                slot.iter()
                    .filter(|entry| entry.expires_at > now)
                    .map(|entry| StoredValue::new(entry.value.clone(), entry.expires_at - now))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn purge(&mut self) -> usize {
        let now = Instant::now();
        let mut purged = 0;
        self.entries.retain(|_, slot| {
            let before = slot.len();
            slot.retain(|entry| entry.expires_at > now);
            purged += before - slot.len();
            !slot.is_empty()
        });
        purged
    }

    fn contents(&self) -> Vec<StoredEntry<V>> {
        let now = Instant::now();
        self.entries
            .iter()
            .flat_map(|(index, slot)| {
                slot.iter()
                    .filter(move |entry| entry.expires_at > now)
                    .map(move |entry| StoredEntry {
                        index: *index,
                        value: StoredValue::new(entry.value.clone(), entry.expires_at - now),
                    })
            })
            .collect()
    }

    fn maintenance(&mut self) {
        let purged = self.purge();
        let now = Instant::now();
        let republish_due = self
            .entries
            .values()
            .flatten()
            .filter(|entry| entry.republish_at <= now)
            .count();
        if purged > 0 || republish_due > 0 {
            debug!(purged, republish_due, remaining = self.entries.len(), "data table maintenance");
        }
    }
}
