//! Protocol parameters shared by the routing table, the data table and the
//! broker.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Result, bail};

/// Default replication factor (k): bucket sizing, lookup width and
/// the number of peers a value is stored on.
pub const DEFAULT_K: usize = 20;

/// Default number of concurrent probes per lookup round.
pub const DEFAULT_ALPHA: usize = 3;

/// Tunables for a Kademlia node.
#[derive(Clone, Debug)]
pub struct KademliaConfig {
    /// Replication factor (k). Buckets hold up to `k + 2` contacts.
    pub replication_factor: usize,
    /// Probes issued concurrently per lookup round. `1` is strictly sequential.
    pub alpha: usize,
    /// Base delay before a stored entry becomes due for republishing.
    pub republish_interval: Duration,
    /// Contacts not confirmed alive within this window are pinged.
    pub ping_interval: Duration,
    /// Period of the routing table health pass.
    pub health_check_interval: Duration,
    /// Period of the data table expiry purge.
    pub purge_interval: Duration,
    /// Upper bound for a single remote call.
    pub rpc_timeout: Duration,
    /// Address announced to peers. Defaults to the bound address.
    pub advertise_addr: Option<SocketAddr>,
}

impl Default for KademliaConfig {
    fn default() -> Self {
        Self {
            replication_factor: DEFAULT_K,
            alpha: DEFAULT_ALPHA,
            republish_interval: Duration::from_secs(60 * 60),
            ping_interval: Duration::from_secs(10 * 60),
            health_check_interval: Duration::from_secs(10),
            purge_interval: Duration::from_secs(10),
            rpc_timeout: Duration::from_secs(10),
            advertise_addr: None,
        }
    }
}

impl KademliaConfig {
    /// Number of closest peers queried by a retrieve: `k / 5`, at least one.
    pub fn retrieve_fanout(&self) -> usize {
        (self.replication_factor / 5).max(1)
    }

    /// Capacity of a single routing bucket.
    pub fn bucket_capacity(&self) -> usize {
        self.replication_factor + 2
    }

    pub fn validate(&self) -> Result<()> {
        if self.replication_factor == 0 {
            bail!("replication factor must be at least 1");
        }
        if self.alpha == 0 {
            bail!("alpha must be at least 1");
        }
        if self.health_check_interval.is_zero() || self.purge_interval.is_zero() {
            bail!("maintenance intervals must be non-zero");
        }
        if self.rpc_timeout.is_zero() {
            bail!("rpc timeout must be non-zero");
        }
        Ok(())
    }
}
