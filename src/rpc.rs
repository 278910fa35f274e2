//! # RPC Layer
//!
//! TCP transport for the Kademlia protocol.
//!
//! - [`RpcNode`]: client side, implements [`KademliaRpc`] by opening a
//!   connection per call and attaching the local [`NodeRef`] to every request
//! - [`serve`]: server side, accepts connections and dispatches requests to a
//!   [`Responder`]
//! - `remote_*`: diagnostic queries against any node by address
//!
//! ## Framing
//!
//! Each message is a 4-byte big-endian length followed by a bincode body
//! (see `messages`). A connection may carry several requests in sequence;
//! the server closes it on EOF or on the first malformed frame.
//!
//! ## Limits
//!
//! - request bodies are capped at `MAX_REQUEST_SIZE`, response bodies at
//!   `MAX_RESPONSE_SIZE`
//! - stored values are capped at `MAX_VALUE_SIZE` on both sides
//! - the server trims value and contact lists to `RESPONSE_VALUE_BUDGET`, so
//!   a response it sends always fits the client's cap
//! - contact lists longer than `MAX_CONTACTS_PER_RESPONSE` are truncated
//! - every client call is bounded by the configured RPC timeout

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tracing::{debug, trace, warn};

use crate::identity::{Id, NodeRef};
use crate::messages::{
    self, KademliaRequest, KademliaResponse, MAX_REQUEST_SIZE, MAX_RESPONSE_SIZE, MAX_VALUE_SIZE,
    RESPONSE_VALUE_BUDGET, trim_to_budget,
};
use crate::protocols::{KademliaRpc, StoredEntry, StoredValue};
use crate::responder::Responder;

// ============================================================================
// Limits
// ============================================================================

/// Contacts accepted from a single response.
const MAX_CONTACTS_PER_RESPONSE: usize = 100;

/// How long an accepted connection may sit idle before its next request.
const CONNECTION_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Budget for reading a request body once its header has arrived.
const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Framing
// ============================================================================

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, body: &[u8]) -> Result<()> {
    let len = u32::try_from(body.len()).context("frame too large to encode")?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_len<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<usize>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => Ok(Some(u32::from_be_bytes(len_buf) as usize)),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn read_body<R: AsyncRead + Unpin>(reader: &mut R, len: usize) -> Result<Vec<u8>> {
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

// ============================================================================
// Client
// ============================================================================

/// Send one request to `addr` and wait for its response.
///
/// An `Error` response is turned into `Err`.
pub async fn call(addr: &str, request: &KademliaRequest, timeout: Duration) -> Result<KademliaResponse> {
    let response = tokio::time::timeout(timeout, async {
        let mut stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("failed to connect to {addr}"))?;
        stream.set_nodelay(true).ok();

        let request_bytes = messages::serialize(request).context("failed to serialize request")?;
        write_frame(&mut stream, &request_bytes).await?;

        let len = read_len(&mut stream)
            .await?
            .context("connection closed before response")?;
        if len > MAX_RESPONSE_SIZE {
            warn!(peer = %addr, size = len, max = MAX_RESPONSE_SIZE, "peer sent oversized response");
            bail!("response too large: {} bytes (max {})", len, MAX_RESPONSE_SIZE);
        }
        let body = read_body(&mut stream, len).await?;
        let response: KademliaResponse = messages::deserialize_bounded(&body, MAX_RESPONSE_SIZE)
            .context("failed to deserialize response")?;
        Ok::<_, anyhow::Error>(response)
    })
    .await
    .context("RPC timed out")??;

    match response {
        KademliaResponse::Error { message } => bail!("RPC error: {}", message),
        other => Ok(other),
    }
}

fn cap_contacts(peer: &str, nodes: Vec<NodeRef>) -> Vec<NodeRef> {
    if nodes.len() > MAX_CONTACTS_PER_RESPONSE {
        warn!(
            peer = %peer,
            count = nodes.len(),
            max = MAX_CONTACTS_PER_RESPONSE,
            "peer returned too many contacts, truncating"
        );
        nodes.into_iter().take(MAX_CONTACTS_PER_RESPONSE).collect()
    } else {
        nodes
    }
}

/// Client half of the transport, bound to the local node's reference.
#[derive(Clone, Debug)]
pub struct RpcNode {
    self_ref: NodeRef,
    timeout: Duration,
}

impl RpcNode {
    pub fn new(self_ref: NodeRef, timeout: Duration) -> Self {
        Self { self_ref, timeout }
    }

    pub fn self_ref(&self) -> &NodeRef {
        &self.self_ref
    }

    async fn rpc(&self, addr: &str, request: KademliaRequest) -> Result<KademliaResponse> {
        call(addr, &request, self.timeout).await
    }

    /// Ping by address alone, learning the id of whoever answers.
    pub async fn ping_addr(&self, addr: &str) -> Result<Id> {
        let request = KademliaRequest::Ping {
            from: self.self_ref.clone(),
        };
        match self.rpc(addr, request).await? {
            KademliaResponse::Pong(id) => Ok(id),
            other => bail!("unexpected response to Ping: {:?}", other),
        }
    }
}

#[async_trait]
impl KademliaRpc for RpcNode {
    type Value = Vec<u8>;

    async fn ping(&self, to: &NodeRef) -> Result<Id> {
        self.ping_addr(&to.addr).await
    }

    async fn store(&self, to: &NodeRef, index: Id, value: StoredValue<Vec<u8>>) -> Result<()> {
        if value.value.len() > MAX_VALUE_SIZE {
            bail!("value too large: {} bytes (max {})", value.value.len(), MAX_VALUE_SIZE);
        }
        let request = KademliaRequest::Store {
            from: self.self_ref.clone(),
            index,
            value: value.value,
            lifetime: value.lifetime,
        };
        match self.rpc(&to.addr, request).await? {
            KademliaResponse::Ack => Ok(()),
            other => bail!("unexpected response to Store: {:?}", other),
        }
    }

    async fn retrieve(&self, to: &NodeRef, index: Id) -> Result<Vec<StoredValue<Vec<u8>>>> {
        let request = KademliaRequest::Retrieve {
            from: self.self_ref.clone(),
            index,
        };
        match self.rpc(&to.addr, request).await? {
            KademliaResponse::Values(values) => Ok(values),
            other => bail!("unexpected response to Retrieve: {:?}", other),
        }
    }

    async fn find_nodes(&self, to: &NodeRef, target: Id) -> Result<Vec<NodeRef>> {
        let request = KademliaRequest::FindNodes {
            from: self.self_ref.clone(),
            target,
        };
        match self.rpc(&to.addr, request).await? {
            KademliaResponse::Nodes(nodes) => Ok(cap_contacts(&to.addr, nodes)),
            other => bail!("unexpected response to FindNodes: {:?}", other),
        }
    }
}

/// Routing table contents of the node at `addr`.
pub async fn remote_contacts(addr: &str, timeout: Duration) -> Result<Vec<NodeRef>> {
    match call(addr, &KademliaRequest::Contacts, timeout).await? {
        KademliaResponse::Nodes(nodes) => Ok(nodes),
        other => bail!("unexpected response to Contacts: {:?}", other),
    }
}

/// Live stored entries of the node at `addr`.
pub async fn remote_data(addr: &str, timeout: Duration) -> Result<Vec<StoredEntry<Vec<u8>>>> {
    match call(addr, &KademliaRequest::Data, timeout).await? {
        KademliaResponse::Entries(entries) => Ok(entries),
        other => bail!("unexpected response to Data: {:?}", other),
    }
}

/// Uptime of the node at `addr`.
pub async fn remote_age(addr: &str, timeout: Duration) -> Result<Duration> {
    match call(addr, &KademliaRequest::Age, timeout).await? {
        KademliaResponse::Age { secs } => Ok(Duration::from_secs(secs)),
        other => bail!("unexpected response to Age: {:?}", other),
    }
}

// ============================================================================
// Server
// ============================================================================

/// Accept connections forever, serving each from `responder`.
///
/// Connection tasks are owned by this future; dropping or aborting it closes
/// them as well.
pub async fn serve(listener: TcpListener, responder: Responder<Vec<u8>>) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, remote_addr)) => {
                        let responder = responder.clone();
                        connections.spawn(async move {
                            if let Err(e) = handle_connection(stream, remote_addr, responder).await {
                                debug!(remote = %remote_addr, error = %e, "connection closed with error");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "failed to accept connection");
                    }
                }
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    remote_addr: SocketAddr,
    responder: Responder<Vec<u8>>,
) -> Result<()> {
    stream.set_nodelay(true).ok();
    loop {
        let len = match tokio::time::timeout(CONNECTION_IDLE_TIMEOUT, read_len(&mut stream)).await {
            Ok(Ok(Some(len))) => len,
            Ok(Ok(None)) => return Ok(()),
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                trace!(remote = %remote_addr, "idle connection timed out");
                return Ok(());
            }
        };

        if len > MAX_REQUEST_SIZE {
            warn!(
                remote = %remote_addr,
                size = len,
                max = MAX_REQUEST_SIZE,
                "rejecting oversized request"
            );
            let response = KademliaResponse::Error {
                message: format!("request too large: {} bytes (max {})", len, MAX_REQUEST_SIZE),
            };
            write_frame(&mut stream, &messages::serialize(&response)?).await?;
            return Ok(());
        }

        let body = tokio::time::timeout(REQUEST_READ_TIMEOUT, read_body(&mut stream, len))
            .await
            .map_err(|_| anyhow::anyhow!("request body read timed out"))??;

        let response = match messages::deserialize_bounded::<KademliaRequest>(&body, MAX_REQUEST_SIZE) {
            Ok(request) => handle_request(&responder, request, remote_addr).await,
            Err(e) => {
                debug!(remote = %remote_addr, error = %e, "malformed request");
                let response = KademliaResponse::Error {
                    message: "malformed request".to_string(),
                };
                write_frame(&mut stream, &messages::serialize(&response)?).await?;
                return Ok(());
            }
        };

        let response_bytes = messages::serialize(&response).context("failed to serialize response")?;
        write_frame(&mut stream, &response_bytes).await?;
    }
}

fn trim_nodes(nodes: Vec<NodeRef>) -> Vec<NodeRef> {
    trim_to_budget(nodes, RESPONSE_VALUE_BUDGET, |n| n.addr.len())
}

async fn handle_request(
    responder: &Responder<Vec<u8>>,
    request: KademliaRequest,
    remote_addr: SocketAddr,
) -> KademliaResponse {
    trace!(
        remote = %remote_addr,
        kind = request.kind(),
        from = ?request.sender().map(|n| n.id),
        "handling request"
    );
    match request {
        KademliaRequest::Ping { from } => KademliaResponse::Pong(responder.ping(&from).await),
        KademliaRequest::Store { from, index, value, lifetime } => {
            if value.len() > MAX_VALUE_SIZE {
                warn!(
                    remote = %remote_addr,
                    size = value.len(),
                    max = MAX_VALUE_SIZE,
                    "rejecting oversized value"
                );
                return KademliaResponse::Error {
                    message: format!("value too large: {} bytes (max {})", value.len(), MAX_VALUE_SIZE),
                };
            }
            responder.store(&from, index, StoredValue::new(value, lifetime)).await;
            KademliaResponse::Ack
        }
        KademliaRequest::Retrieve { from, index } => {
            let values = responder.retrieve(&from, index).await;
            let found = values.len();
            let values = trim_to_budget(values, RESPONSE_VALUE_BUDGET, |v| v.value.len());
            if values.len() < found {
                warn!(from = %from, index = %index, found, sent = values.len(), "RETRIEVE response trimmed");
            }
            debug!(from = %from, index = %index, found, "RETRIEVE response");
            KademliaResponse::Values(values)
        }
        KademliaRequest::FindNodes { from, target } => {
            let nodes = trim_nodes(responder.find_nodes(&from, target).await);
            debug!(from = %from, returned = nodes.len(), "FIND_NODES response");
            KademliaResponse::Nodes(nodes)
        }
        KademliaRequest::Contacts => KademliaResponse::Nodes(trim_nodes(responder.contacts().await)),
        KademliaRequest::Data => {
            let entries = responder.data().await;
            let total = entries.len();
            let entries = trim_to_budget(entries, RESPONSE_VALUE_BUDGET, |e| e.value.value.len());
            if entries.len() < total {
                warn!(remote = %remote_addr, total, sent = entries.len(), "DATA response trimmed");
            }
            KademliaResponse::Entries(entries)
        }
        KademliaRequest::Age => KademliaResponse::Age {
            secs: responder.age().as_secs(),
        },
    }
}
