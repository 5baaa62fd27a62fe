//! Wire types shared between the consensus core and the RPC transport.
//!
//! These are intentionally plain data: the core never serializes anything
//! itself, it only builds and inspects these structs. Whatever transport is
//! plugged in (see [`crate::transport`]) is responsible for turning them into
//! bytes and back.

use serde::{Deserialize, Serialize};

use crate::PeerId;

/// A single entry in the replicated log.
///
/// Index 0 of a peer's log is always the sentinel `LogEntry { term: 0, command:
/// vec![] }` and is never sent over the wire as part of `entries` — only real
/// entries (index >= 1) are ever replicated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: u64,
    pub command: Vec<u8>,
}

impl LogEntry {
    pub(crate) fn sentinel() -> Self {
        LogEntry { term: 0, command: Vec::new() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteArgs {
    pub term: u64,
    pub candidate_id: PeerId,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RequestVoteReply {
    pub term: u64,
    pub vote_granted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesArgs {
    pub term: u64,
    pub leader_id: PeerId,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AppendEntriesReply {
    pub term: u64,
    pub success: bool,
}

/// The message envelope actually carried over the wire by a concrete
/// [`crate::transport::RpcTransport`] implementation. The consensus core
/// never constructs this type directly — transports do, to frame a request
/// or reply for serialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RaftRpc {
    RequestVote(RequestVoteArgs),
    RequestVoteReply(RequestVoteReply),
    AppendEntries(AppendEntriesArgs),
    AppendEntriesReply(AppendEntriesReply),
}

/// Delivered to the upstream service once an entry is committed.
///
/// `valid` mirrors the Raft paper's `ApplyMsg.CommandValid`: the core only
/// ever sends `valid: true` messages carrying committed commands, but the
/// field is kept so a future snapshot-delivery message could reuse the same
/// channel with `valid: false`.
#[derive(Debug, Clone)]
pub struct ApplyMsg {
    pub valid: bool,
    pub index: u64,
    pub command: Vec<u8>,
}
