//! # Wire Protocol Messages
//!
//! Serializable request and response types exchanged between nodes.
//! Messages are encoded with bincode (fixed-width integers) behind a 4-byte
//! big-endian length prefix.
//!
//! ## Requests
//!
//! | Request | Response |
//! |---------|----------|
//! | `Ping` | `Pong(id)` |
//! | `Store` | `Ack` |
//! | `Retrieve` | `Values` |
//! | `FindNodes` | `Nodes` |
//! | `Contacts` | `Nodes` |
//! | `Data` | `Entries` |
//! | `Age` | `Age` |
//!
//! Any request may be answered with `Error` instead.
//!
//! ## Limits
//!
//! | Limit | Value | Applies to |
//! |-------|-------|------------|
//! | `MAX_VALUE_SIZE` | 1 MiB | a single stored value |
//! | `MAX_REQUEST_SIZE` | one value + 4 KiB | encoded request bodies |
//! | `MAX_RESPONSE_SIZE` | `MAX_VALUES_PER_RESPONSE` values + 64 KiB | encoded response bodies |
//!
//! A server trims `Values` and `Entries` with [`trim_to_budget`] so that a
//! response always fits `MAX_RESPONSE_SIZE`. Decoding goes through
//! [`deserialize_bounded`], which refuses input larger than its limit.

use std::time::Duration;

use bincode::Options;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::identity::{Id, NodeRef};
use crate::protocols::{StoredEntry, StoredValue};

/// Maximum size of a single stored value (1 MiB).
pub const MAX_VALUE_SIZE: usize = 1024 * 1024;

/// Maximal-size values a single `Values` or `Entries` response is guaranteed to carry.
pub const MAX_VALUES_PER_RESPONSE: usize = 32;

/// Largest encoded request: one maximal value plus envelope.
pub const MAX_REQUEST_SIZE: usize = MAX_VALUE_SIZE + 4096;

/// Encoding overhead charged per value against the budget: length prefix,
/// lifetime and index.
pub const VALUE_OVERHEAD: usize = 64;

/// Bytes a server packs into one `Values` or `Entries` response.
pub const RESPONSE_VALUE_BUDGET: usize = (MAX_VALUE_SIZE + VALUE_OVERHEAD) * MAX_VALUES_PER_RESPONSE;

/// Largest encoded response: the value budget plus envelope.
pub const MAX_RESPONSE_SIZE: usize = RESPONSE_VALUE_BUDGET + 64 * 1024;

fn bincode_options(limit: usize) -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(limit as u64)
        .with_fixint_encoding()
}

/// Decode `bytes`, refusing anything larger than `limit`.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8], limit: usize) -> Result<T, bincode::Error> {
    if bytes.len() > limit {
        return Err(Box::new(bincode::ErrorKind::SizeLimit));
    }
    bincode_options(limit).deserialize(bytes)
}

/// Keep the leading `items` whose summed `cost` plus [`VALUE_OVERHEAD`]
/// each stays within `budget`. Order is preserved.
pub fn trim_to_budget<T>(items: Vec<T>, budget: usize, cost: impl Fn(&T) -> usize) -> Vec<T> {
    let mut used = 0usize;
    items
        .into_iter()
        .take_while(|item| {
            used += cost(item) + VALUE_OVERHEAD;
            used <= budget
        })
        .collect()
}

/// Encode with the same options used for decoding.
pub fn serialize<T: Serialize>(message: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .serialize(message)
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum KademliaRequest {
    Ping {
        from: NodeRef,
    },
    Store {
        from: NodeRef,
        index: Id,
        value: Vec<u8>,
        lifetime: Duration,
    },
    Retrieve {
        from: NodeRef,
        index: Id,
    },
    FindNodes {
        from: NodeRef,
        target: Id,
    },
    /// Diagnostic: every contact in the routing table.
    Contacts,
    /// Diagnostic: every live stored entry.
    Data,
    /// Diagnostic: seconds since the node started.
    Age,
}

impl KademliaRequest {
    pub fn sender(&self) -> Option<&NodeRef> {
        match self {
            KademliaRequest::Ping { from } => Some(from),
            KademliaRequest::Store { from, .. } => Some(from),
            KademliaRequest::Retrieve { from, .. } => Some(from),
            KademliaRequest::FindNodes { from, .. } => Some(from),
            KademliaRequest::Contacts | KademliaRequest::Data | KademliaRequest::Age => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            KademliaRequest::Ping { .. } => "PING",
            KademliaRequest::Store { .. } => "STORE",
            KademliaRequest::Retrieve { .. } => "RETRIEVE",
            KademliaRequest::FindNodes { .. } => "FIND_NODES",
            KademliaRequest::Contacts => "CONTACTS",
            KademliaRequest::Data => "DATA",
            KademliaRequest::Age => "AGE",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum KademliaResponse {
    Pong(Id),
    Ack,
    Values(Vec<StoredValue<Vec<u8>>>),
    Nodes(Vec<NodeRef>),
    Entries(Vec<StoredEntry<Vec<u8>>>),
    Age {
        secs: u64,
    },
    Error {
        message: String,
    },
}
