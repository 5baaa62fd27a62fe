//! Binary that wires a [`little_raft::RaftPeer`] to a real TCP cluster.
//!
//! Parses arguments, initializes logging, binds a listener with
//! `SO_REUSEADDR`, spawns the consensus core, and accepts connections in a
//! loop. The upstream service consuming committed entries is out of scope
//! for this crate, so this binary just logs what it receives on the apply
//! channel.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{error, info};
use tokio::sync::mpsc;

use little_raft::transport::{bind_with_reuse_addr, serve_connection, RaftRpcHandler, TcpTransport};
use little_raft::{FileSystemPersister, PeerId, RaftConfig, RaftPeer};

#[derive(Parser)]
#[command(version, about = "Run one peer of a Raft consensus cluster")]
struct Cli {
    /// This peer's id within the cluster, in [0, N).
    #[arg(long)]
    id: PeerId,

    /// Address this peer listens for RPCs on.
    #[arg(long)]
    listen: SocketAddr,

    /// One other peer's `id=host:port`. Repeat once per peer.
    #[arg(long = "peer", value_parser = parse_peer)]
    peers: Vec<(PeerId, SocketAddr)>,

    /// Where to durably persist (currentTerm, votedFor, log).
    #[arg(long, default_value = "raft-state.bin")]
    state_file: PathBuf,
}

fn parse_peer(raw: &str) -> Result<(PeerId, SocketAddr), String> {
    let (id, addr) = raw.split_once('=').ok_or_else(|| {
        format!("expected `id=host:port`, got `{raw}`")
    })?;
    let id: PeerId = id.parse().map_err(|e| format!("invalid peer id `{id}`: {e}"))?;
    let addr: SocketAddr = addr.parse().map_err(|e| format!("invalid peer address `{addr}`: {e}"))?;
    Ok((id, addr))
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    if cli.peers.iter().any(|(id, _)| *id == cli.id) {
        bail!("peer list must not include this peer's own id ({})", cli.id);
    }

    let peer_ids: Vec<PeerId> = cli.peers.iter().map(|(id, _)| *id).collect();
    let addresses: HashMap<PeerId, SocketAddr> = cli.peers.into_iter().collect();

    let persister = Arc::new(FileSystemPersister::new(&cli.state_file));
    let transport = Arc::new(TcpTransport::new(addresses));
    let (apply_tx, mut apply_rx) = mpsc::channel(64);

    let peer = RaftPeer::spawn(
        peer_ids,
        cli.id,
        persister,
        apply_tx,
        transport,
        RaftConfig::default(),
    );

    tokio::spawn(async move {
        while let Some(msg) = apply_rx.recv().await {
            info!("applied index {}: {} byte command", msg.index, msg.command.len());
        }
    });

    let listener = bind_with_reuse_addr(cli.listen).context("binding peer listener")?;
    listener.set_nonblocking(true)?;
    let listener = tokio::net::TcpListener::from_std(listener)?;
    info!("peer {}: listening on {}", cli.id, cli.listen);

    loop {
        let (stream, addr) = listener.accept().await.context("accepting connection")?;
        let handler: Arc<dyn RaftRpcHandler> = Arc::clone(&peer) as Arc<dyn RaftRpcHandler>;
        tokio::spawn(async move {
            if let Err(e) = serve_connection(stream, handler).await {
                error!("connection from {addr} ended with error: {e}");
            }
        });
    }
}
