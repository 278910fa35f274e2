//! # Kademlia - Distributed Hash Table Node
//!
//! A Kademlia-style DHT peer:
//!
//! - **Identifiers**: 160-bit ids, XOR metric, `bitscan` bucket selection
//! - **Routing**: 161 buckets of `k + 2` contacts with background liveness checks
//! - **Storage**: expiring, deduplicated multi-value store with periodic purge
//! - **Lookup**: iterative `FIND_NODES` converging on the `k` closest peers
//! - **Replication**: store, erase and retrieve fanned out to the closest peers
//!
//! ## Architecture
//!
//! Stateful components use the **Actor Pattern**:
//! - Each table has a public Handle and a private Actor
//! - Handles are cheap to clone and communicate via async channels
//! - Actors own all mutable state, process commands sequentially and drive
//!   their own maintenance timer
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `node` | High-level API combining all components |
//! | `identity` | `Id` and `NodeRef` |
//! | `config` | Protocol parameters |
//! | `routing` | Contact table and health checking |
//! | `storage` | Data table and expiry |
//! | `broker` | Iterative lookup and replication fan-out |
//! | `responder` | Inbound request handling and diagnostics |
//! | `protocols` | `KademliaRpc` peer capability trait |
//! | `rpc` | TCP transport implementing `KademliaRpc` |
//! | `messages` | Wire types and bounded decoding |

mod broker;
mod config;
mod identity;
mod messages;
mod node;
mod protocols;
mod responder;
mod routing;
mod rpc;
mod storage;

#[cfg(test)]
mod testing;

pub use broker::Broker;
pub use config::{DEFAULT_ALPHA, DEFAULT_K, KademliaConfig};
pub use identity::{Id, NodeRef};
pub use messages::MAX_VALUE_SIZE;
pub use node::Node;
pub use protocols::{KademliaRpc, StoredEntry, StoredValue};
pub use responder::Responder;
pub use routing::{Contact, ContactTable};
pub use rpc::{RpcNode, remote_age, remote_contacts, remote_data};
pub use storage::DataTable;
