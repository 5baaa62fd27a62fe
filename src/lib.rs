//! A Raft consensus peer: the replicated-log state machine, the election
//! protocol, the log-replication protocol, and the durable-state contract.
//!
//! The transport, the persistent-storage driver, and the upstream service
//! consuming committed entries are external collaborators — see
//! [`transport::RpcTransport`] and [`persist::Persister`] for the seams
//! this crate expects them to fill.

pub mod config;
pub mod message;
pub mod peer;
pub mod persist;
pub mod state;
pub mod transport;

/// Identifies one peer within a fixed, known-size cluster.
///
/// The core never looks inside this beyond equality and ordering for map
/// keys; a binary wiring up a real cluster is free to map it to a listen
/// address however it likes (see [`transport::TcpTransport`]).
pub type PeerId = u64;

pub use config::RaftConfig;
pub use message::{
    AppendEntriesArgs, AppendEntriesReply, ApplyMsg, LogEntry, RequestVoteArgs, RequestVoteReply,
};
pub use peer::RaftPeer;
pub use persist::{FileSystemPersister, MemoryPersister, Persister};
pub use transport::{ChannelNetwork, ChannelTransport, RpcTransport, TcpTransport};
