//! The mutable state a peer holds behind its single mutex, plus the
//! leader-only volatile bookkeeping reset on every election win.

use std::collections::HashMap;
use std::time::Instant;

use crate::message::LogEntry;
use crate::persist::PersistentState;
use crate::PeerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

/// Replication progress the leader tracks for one other peer.
#[derive(Debug, Clone, Copy)]
pub struct ServerProgress {
    /// Next log index leader will send to this peer.
    pub next_index: u64,
    /// Highest index known to be replicated on this peer.
    pub match_index: u64,
    /// Adaptive backoff step, doubled on each consecutive rejection and
    /// reset to 1 on the next success.
    pub decrement_step: u64,
}

impl ServerProgress {
    fn new(last_log_index: u64) -> Self {
        ServerProgress {
            next_index: last_log_index + 1,
            match_index: 0,
            decrement_step: 1,
        }
    }
}

/// All mutable state owned by a peer, guarded by the single mutex in
/// [`crate::peer::RaftPeer`]. Fields are grouped by how they're governed:
/// the persistent triple, then volatile fields, then leader-only volatile
/// fields.
pub struct RaftState {
    // --- Persistent state (currentTerm, votedFor, log) ---
    pub current_term: u64,
    pub voted_for: Option<PeerId>,
    pub log: Vec<LogEntry>,

    // --- Volatile state ---
    pub commit_index: u64,
    pub last_applied: u64,
    pub role: Role,
    pub leader: Option<PeerId>,
    pub last_leader_contact: Instant,
    pub terminated: bool,

    // --- Leader-only volatile state, reinitialized on each election win ---
    pub progress: HashMap<PeerId, ServerProgress>,
}

impl RaftState {
    pub fn from_persistent(persisted: PersistentState, now: Instant) -> Self {
        RaftState {
            current_term: persisted.current_term,
            voted_for: persisted.voted_for,
            log: persisted.log,
            commit_index: 0,
            last_applied: 0,
            role: Role::Follower,
            leader: None,
            last_leader_contact: now,
            terminated: false,
            progress: HashMap::new(),
        }
    }

    pub fn persistent_snapshot(&self) -> PersistentState {
        PersistentState {
            current_term: self.current_term,
            voted_for: self.voted_for,
            log: self.log.clone(),
        }
    }

    pub fn last_log_index(&self) -> u64 {
        self.log.len() as u64 - 1
    }

    pub fn last_log_term(&self) -> u64 {
        self.log.last().expect("log always has at least the sentinel").term
    }

    pub fn term_at(&self, index: u64) -> Option<u64> {
        self.log.get(index as usize).map(|e| e.term)
    }

    /// Resets leader-only volatile state for a fresh term of leadership:
    /// every other peer's `next_index` starts at one past our last entry,
    /// `match_index` starts at zero.
    pub fn reinitialize_leader_state(&mut self, peers: &[PeerId]) {
        let last_log_index = self.last_log_index();
        self.progress.clear();
        for &peer in peers {
            self.progress.insert(peer, ServerProgress::new(last_log_index));
        }
    }

    /// The commit index implied by a strict majority (including self,
    /// whose position is always `len(log) - 1`) having replicated it.
    /// Returns `None` if no index qualifies.
    pub fn majority_match_index(&self, cluster_size: usize) -> Option<u64> {
        let mut indices: Vec<u64> = self.progress.values().map(|p| p.match_index).collect();
        indices.push(self.last_log_index()); // leader's own position
        if indices.len() != cluster_size {
            // Defensive: progress map should always mirror peers minus self.
            return None;
        }
        indices.sort_unstable();
        // A strict majority is `cluster_size / 2 + 1` peers. Sorted
        // ascending, the smallest index held by at least that many peers
        // sits `majority` slots from the end, i.e. at
        // `cluster_size - majority`.
        let majority = cluster_size / 2 + 1;
        let majority_pos = cluster_size - majority;
        Some(indices[majority_pos])
    }
}
