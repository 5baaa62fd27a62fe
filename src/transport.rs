//! The RPC transport: a best-effort, timeout-bounded call abstraction.
//!
//! The consensus core (`crate::peer`) never knows or cares how a request
//! actually reaches a peer — it only calls through [`RpcTransport`] and
//! treats `None` as "the call failed, try again next heartbeat". Two
//! implementations ship with this crate: [`TcpTransport`], a real
//! length-prefixed-JSON-over-TCP transport for running an actual cluster,
//! and [`ChannelTransport`], an in-memory transport the test suite uses to
//! simulate partitions deterministically.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::debug;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::message::{
    AppendEntriesArgs, AppendEntriesReply, RaftRpc, RequestVoteArgs, RequestVoteReply,
};
use crate::PeerId;

/// How long a single RPC is allowed to take before it counts as a
/// transport failure. The core relies on this bound and adds no timer of
/// its own around a call.
const RPC_TIMEOUT: Duration = Duration::from_millis(1000);

#[async_trait]
pub trait RpcTransport: Send + Sync {
    async fn request_vote(
        &self,
        peer: PeerId,
        args: RequestVoteArgs,
    ) -> Option<RequestVoteReply>;

    async fn append_entries(
        &self,
        peer: PeerId,
        args: AppendEntriesArgs,
    ) -> Option<AppendEntriesReply>;
}

/// Dispatches [`RaftRpc`] requests arriving on a peer's listening socket to
/// a handler, and replies with whatever the handler returns.
///
/// This is the receiving half of [`TcpTransport`]; a peer binary spawns one
/// task that accepts connections and calls [`serve_connection`] per
/// connection.
#[async_trait]
pub trait RaftRpcHandler: Send + Sync {
    async fn handle_request_vote(&self, args: RequestVoteArgs) -> RequestVoteReply;
    async fn handle_append_entries(&self, args: AppendEntriesArgs) -> AppendEntriesReply;
}

async fn read_frame(stream: &mut TcpStream) -> Result<Vec<u8>> {
    let len = stream.read_u32().await.context("reading frame length")?;
    let mut buf = vec![0u8; len as usize];
    stream.read_exact(&mut buf).await.context("reading frame body")?;
    Ok(buf)
}

async fn write_frame(stream: &mut TcpStream, bytes: &[u8]) -> Result<()> {
    stream.write_u32(bytes.len() as u32).await?;
    stream.write_all(bytes).await?;
    stream.flush().await?;
    Ok(())
}

/// Accepts and serves one connection's worth of RPC requests. A peer
/// binary normally loops calling `listener.accept()` and spawns this per
/// connection.
pub async fn serve_connection(
    mut stream: TcpStream,
    handler: std::sync::Arc<dyn RaftRpcHandler>,
) -> Result<()> {
    loop {
        let bytes = match read_frame(&mut stream).await {
            Ok(b) => b,
            Err(_) => return Ok(()), // peer closed the connection
        };
        let request: RaftRpc = serde_json::from_slice(&bytes).context("decoding RaftRpc frame")?;
        let reply = match request {
            RaftRpc::RequestVote(args) => {
                RaftRpc::RequestVoteReply(handler.handle_request_vote(args).await)
            }
            RaftRpc::AppendEntries(args) => {
                RaftRpc::AppendEntriesReply(handler.handle_append_entries(args).await)
            }
            RaftRpc::RequestVoteReply(_) | RaftRpc::AppendEntriesReply(_) => {
                debug!("received a reply frame on the server side of the connection, ignoring");
                continue;
            }
        };
        let reply_bytes = serde_json::to_vec(&reply).context("encoding RaftRpc reply")?;
        write_frame(&mut stream, &reply_bytes).await?;
    }
}

/// Binds a `TcpListener` with `SO_REUSEADDR` set: without it, restarting a
/// peer right after it exits fails with "Address already in use" while the
/// old socket lingers in `TIME_WAIT`.
pub fn bind_with_reuse_addr(addr: std::net::SocketAddr) -> Result<std::net::TcpListener> {
    use socket2::{Domain, Socket, Type};

    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, None).context("creating listener socket")?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into()).with_context(|| format!("binding {addr}"))?;
    socket.listen(128)?;
    Ok(socket.into())
}

/// An [`RpcTransport`] that sends length-prefixed JSON frames over TCP.
pub struct TcpTransport {
    addresses: HashMap<PeerId, std::net::SocketAddr>,
}

impl TcpTransport {
    pub fn new(addresses: HashMap<PeerId, std::net::SocketAddr>) -> Self {
        TcpTransport { addresses }
    }

    async fn call(&self, peer: PeerId, request: RaftRpc) -> Option<RaftRpc> {
        let addr = *self.addresses.get(&peer)?;
        let attempt = async {
            let mut stream = TcpStream::connect(addr).await?;
            let bytes = serde_json::to_vec(&request)?;
            write_frame(&mut stream, &bytes).await?;
            let reply_bytes = read_frame(&mut stream).await?;
            let reply: RaftRpc = serde_json::from_slice(&reply_bytes)?;
            Ok::<RaftRpc, anyhow::Error>(reply)
        };
        match tokio::time::timeout(RPC_TIMEOUT, attempt).await {
            Ok(Ok(reply)) => Some(reply),
            Ok(Err(e)) => {
                debug!("rpc to peer {peer} at {addr} failed: {e}");
                None
            }
            Err(_) => {
                debug!("rpc to peer {peer} at {addr} timed out");
                None
            }
        }
    }
}

#[async_trait]
impl RpcTransport for TcpTransport {
    async fn request_vote(&self, peer: PeerId, args: RequestVoteArgs) -> Option<RequestVoteReply> {
        match self.call(peer, RaftRpc::RequestVote(args)).await {
            Some(RaftRpc::RequestVoteReply(reply)) => Some(reply),
            _ => None,
        }
    }

    async fn append_entries(
        &self,
        peer: PeerId,
        args: AppendEntriesArgs,
    ) -> Option<AppendEntriesReply> {
        match self.call(peer, RaftRpc::AppendEntries(args)).await {
            Some(RaftRpc::AppendEntriesReply(reply)) => Some(reply),
            _ => None,
        }
    }
}

/// An in-memory [`RpcTransport`] used by the integration test suite.
///
/// Every peer in a test cluster is registered with [`ChannelTransport::register`]
/// and holds a clone that can reach every other registered peer's handler
/// directly through an `mpsc` channel — no sockets, no serialization. Links
/// can be selectively cut with [`ChannelTransport::partition`] to simulate a
/// network split, and restored with [`ChannelTransport::heal`].
pub struct ChannelTransport {
    self_id: PeerId,
    peers: std::sync::Arc<StdMutex<HashMap<PeerId, mpsc::Sender<Envelope>>>>,
    cut: std::sync::Arc<StdMutex<std::collections::HashSet<(PeerId, PeerId)>>>,
}

struct Envelope {
    request: RaftRpc,
    reply_tx: tokio::sync::oneshot::Sender<RaftRpc>,
}

/// The shared registry backing a cluster of [`ChannelTransport`] handles.
#[derive(Clone)]
pub struct ChannelNetwork {
    peers: std::sync::Arc<StdMutex<HashMap<PeerId, mpsc::Sender<Envelope>>>>,
    cut: std::sync::Arc<StdMutex<std::collections::HashSet<(PeerId, PeerId)>>>,
}

impl ChannelNetwork {
    pub fn new() -> Self {
        ChannelNetwork {
            peers: std::sync::Arc::new(StdMutex::new(HashMap::new())),
            cut: std::sync::Arc::new(StdMutex::new(std::collections::HashSet::new())),
        }
    }

    /// Creates a transport handle for `id` and spawns the task that serves
    /// incoming requests by dispatching them to `handler`.
    ///
    /// Convenience wrapper for the common case where the handler already
    /// exists before the transport is needed. When the handler is itself
    /// built from the transport (the usual case for a [`crate::peer::RaftPeer`],
    /// which needs its own transport at construction time), use
    /// [`Self::transport`] to get a send-only handle first and [`Self::serve`]
    /// to attach the receiving half once the handler exists.
    pub fn register(
        &self,
        id: PeerId,
        handler: std::sync::Arc<dyn RaftRpcHandler>,
    ) -> ChannelTransport {
        let transport = self.transport(id);
        self.serve(id, handler);
        transport
    }

    /// Returns a transport handle for `id` that can send to any peer
    /// already or later registered on this network, without registering a
    /// receiving half for `id` itself. Pair with [`Self::serve`].
    pub fn transport(&self, id: PeerId) -> ChannelTransport {
        ChannelTransport {
            self_id: id,
            peers: self.peers.clone(),
            cut: self.cut.clone(),
        }
    }

    /// Registers `handler` as the receiving half for `id`: incoming calls
    /// routed to `id` by any [`ChannelTransport`] on this network are
    /// dispatched to it from here on.
    pub fn serve(&self, id: PeerId, handler: std::sync::Arc<dyn RaftRpcHandler>) {
        let (tx, mut rx) = mpsc::channel::<Envelope>(64);
        self.peers.lock().unwrap().insert(id, tx);

        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                let reply = match envelope.request {
                    RaftRpc::RequestVote(args) => {
                        RaftRpc::RequestVoteReply(handler.handle_request_vote(args).await)
                    }
                    RaftRpc::AppendEntries(args) => {
                        RaftRpc::AppendEntriesReply(handler.handle_append_entries(args).await)
                    }
                    _ => continue,
                };
                let _ = envelope.reply_tx.send(reply);
            }
        });
    }

    /// Drops messages in both directions between `a` and `b` until healed.
    pub fn partition(&self, a: PeerId, b: PeerId) {
        let mut cut = self.cut.lock().unwrap();
        cut.insert((a, b));
        cut.insert((b, a));
    }

    /// Restores a link previously cut with [`Self::partition`].
    pub fn heal(&self, a: PeerId, b: PeerId) {
        let mut cut = self.cut.lock().unwrap();
        cut.remove(&(a, b));
        cut.remove(&(b, a));
    }
}

impl Default for ChannelNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelTransport {
    async fn call(&self, peer: PeerId, request: RaftRpc) -> Option<RaftRpc> {
        if self.cut.lock().unwrap().contains(&(self.self_id, peer)) {
            return None;
        }
        let tx = self.peers.lock().unwrap().get(&peer).cloned()?;
        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        let envelope = Envelope { request, reply_tx };
        if tx.send(envelope).await.is_err() {
            return None;
        }
        tokio::time::timeout(RPC_TIMEOUT, reply_rx).await.ok()?.ok()
    }
}

#[async_trait]
impl RpcTransport for ChannelTransport {
    async fn request_vote(&self, peer: PeerId, args: RequestVoteArgs) -> Option<RequestVoteReply> {
        match self.call(peer, RaftRpc::RequestVote(args)).await {
            Some(RaftRpc::RequestVoteReply(reply)) => Some(reply),
            _ => None,
        }
    }

    async fn append_entries(
        &self,
        peer: PeerId,
        args: AppendEntriesArgs,
    ) -> Option<AppendEntriesReply> {
        match self.call(peer, RaftRpc::AppendEntries(args)).await {
            Some(RaftRpc::AppendEntriesReply(reply)) => Some(reply),
            _ => None,
        }
    }
}
