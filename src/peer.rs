//! The consensus core: role management, the two RPC handlers, the
//! election and replication procedures, and the apply loop.
//!
//! A [`RaftPeer`] owns exactly one [`tokio::sync::Mutex<RaftState>`] and
//! every public operation takes it, mutates, and releases it before doing
//! anything that suspends (an outbound RPC, a sleep, or the apply send).

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;

use crate::config::RaftConfig;
use crate::message::{
    AppendEntriesArgs, AppendEntriesReply, ApplyMsg, LogEntry, RequestVoteArgs, RequestVoteReply,
};
use crate::persist::{Persisted, Persister, PersistentState};
use crate::state::{RaftState, Role};
use crate::transport::{RaftRpcHandler, RpcTransport};
use crate::PeerId;

/// A single Raft consensus peer.
///
/// Construct one with [`RaftPeer::spawn`]; the returned handle is cheap to
/// clone (it's an `Arc`) and safe to share across tasks. The upstream
/// control surface is [`RaftPeer::get_state`], [`RaftPeer::start`], and
/// [`RaftPeer::kill`].
pub struct RaftPeer {
    self_id: PeerId,
    peer_ids: Vec<PeerId>,
    config: RaftConfig,
    state: Mutex<RaftState>,
    persister: Arc<dyn Persister>,
    transport: Arc<dyn RpcTransport>,
    apply_tx: mpsc::Sender<ApplyMsg>,
    replicate_signal: HashMap<PeerId, Arc<Notify>>,
    handles: StdMutex<Vec<JoinHandle<()>>>,
}

impl RaftPeer {
    /// Builds a peer, seeding its state from `persister` (or defaults if
    /// it holds nothing), and spawns the leader-contact monitor and apply
    /// task. Returns promptly; all long-running work happens in spawned
    /// tasks.
    pub fn spawn(
        peer_ids: Vec<PeerId>,
        self_id: PeerId,
        persister: Arc<dyn Persister>,
        apply_tx: mpsc::Sender<ApplyMsg>,
        transport: Arc<dyn RpcTransport>,
        config: RaftConfig,
    ) -> Arc<Self> {
        let bytes = persister.load().unwrap_or_else(|e| {
            warn!("peer {self_id}: failed to read persisted state ({e}); starting fresh");
            Vec::new()
        });
        let persisted = PersistentState::decode(&bytes).unwrap_or_else(|e| {
            warn!("peer {self_id}: failed to decode persisted state ({e}); starting fresh");
            PersistentState::default()
        });
        let state = RaftState::from_persistent(persisted, Instant::now());

        let replicate_signal = peer_ids
            .iter()
            .map(|&peer| (peer, Arc::new(Notify::new())))
            .collect();

        let this = Arc::new(RaftPeer {
            self_id,
            peer_ids,
            config,
            state: Mutex::new(state),
            persister,
            transport,
            apply_tx,
            replicate_signal,
            handles: StdMutex::new(Vec::new()),
        });

        let monitor = Arc::clone(&this);
        let monitor_handle = tokio::spawn(async move { monitor.run_leader_contact_monitor().await });
        let applier = Arc::clone(&this);
        let applier_handle = tokio::spawn(async move { applier.run_apply_task().await });
        this.handles.lock().unwrap().extend([monitor_handle, applier_handle]);

        this
    }

    fn cluster_size(&self) -> usize {
        self.peer_ids.len() + 1
    }

    /// Writes the encoded persistent triple through the configured
    /// [`Persister`]. A write failure here is treated as a fatal bug: the
    /// caller is about to act (reply to an RPC, start an election) as if
    /// the mutation survived a crash, and a storage driver that can't
    /// durably record it invalidates that assumption.
    fn persist_state(&self, state: &RaftState) -> Persisted {
        let snapshot = state.persistent_snapshot();
        let bytes = snapshot
            .encode()
            .expect("encoding persistent raft state never fails");
        if let Err(e) = self.persister.save(&bytes) {
            panic!("peer {}: failed to persist raft state: {e}", self.self_id);
        }
        Persisted::new()
    }

    fn signal_all_replication(&self) {
        for notify in self.replicate_signal.values() {
            notify.notify_one();
        }
    }

    // ---------------------------------------------------------------
    // Upstream control surface
    // ---------------------------------------------------------------

    /// Returns `(currentTerm, isLeader)`.
    pub async fn get_state(&self) -> (u64, bool) {
        let state = self.state.lock().await;
        (state.current_term, state.role == Role::Leader)
    }

    /// If this peer believes itself leader, appends `command` to the log
    /// and returns `(index, term, true)`; otherwise returns
    /// `(-1, -1, false)` without touching the log.
    pub async fn start(&self, command: Vec<u8>) -> (i64, i64, bool) {
        let (index, term) = {
            let mut state = self.state.lock().await;
            if state.role != Role::Leader {
                return (-1, -1, false);
            }
            let term = state.current_term;
            state.log.push(LogEntry { term, command });
            let index = state.last_log_index();
            // Leader's own match position tracks its log directly; there
            // is no progress entry for self in `state.progress`.
            self.persist_state(&state);
            (index, term)
        };
        debug!("peer {}: appended entry {} in term {}", self.self_id, index, term);
        self.signal_all_replication();
        (index as i64, term as i64, true)
    }

    /// Idempotently stops every loop this peer owns. Safe to call more
    /// than once.
    pub async fn kill(&self) {
        {
            let mut state = self.state.lock().await;
            if state.terminated {
                return;
            }
            state.terminated = true;
        }
        let handles = std::mem::take(&mut *self.handles.lock().unwrap());
        for handle in handles {
            handle.abort();
        }
    }

    // ---------------------------------------------------------------
    // RPC handlers
    // ---------------------------------------------------------------

    pub async fn handle_request_vote(&self, args: RequestVoteArgs) -> RequestVoteReply {
        let mut state = self.state.lock().await;

        if args.term < state.current_term {
            return RequestVoteReply { term: state.current_term, vote_granted: false };
        }

        if args.term > state.current_term {
            state.current_term = args.term;
            state.role = Role::Follower;
            state.leader = None;
            state.voted_for = None;
            self.persist_state(&state);
        }

        let candidate_up_to_date = args.last_log_term > state.last_log_term()
            || (args.last_log_term == state.last_log_term()
                && args.last_log_index >= state.last_log_index());

        let already_promised_elsewhere =
            matches!(state.voted_for, Some(id) if id != args.candidate_id);

        let grant = !already_promised_elsewhere
            && state.role == Role::Follower
            && candidate_up_to_date;

        if grant {
            state.voted_for = Some(args.candidate_id);
            let proof = self.persist_state(&state);
            state.last_leader_contact = Instant::now();
            info!("peer {}: granted vote to {} for term {}", self.self_id, args.candidate_id, args.term);
            Self::granted_vote_reply(state.current_term, proof)
        } else {
            RequestVoteReply { term: state.current_term, vote_granted: false }
        }
    }

    /// Takes a [`Persisted`] proof so this reply can only be built after the
    /// grant it reports has actually been written through the persister.
    fn granted_vote_reply(term: u64, _proof: Persisted) -> RequestVoteReply {
        RequestVoteReply { term, vote_granted: true }
    }

    pub async fn handle_append_entries(&self, args: AppendEntriesArgs) -> AppendEntriesReply {
        let mut state = self.state.lock().await;

        if args.term < state.current_term {
            return AppendEntriesReply { term: state.current_term, success: false };
        }

        state.last_leader_contact = Instant::now();

        if args.term > state.current_term {
            state.current_term = args.term;
            state.voted_for = None;
            state.role = Role::Follower;
            state.leader = Some(args.leader_id);
            self.persist_state(&state);
        } else {
            if let Some(existing_leader) = state.leader {
                if existing_leader != args.leader_id {
                    panic!(
                        "peer {}: observed two different leaders ({} and {}) in term {}",
                        self.self_id, existing_leader, args.leader_id, args.term
                    );
                }
            }
            state.role = Role::Follower;
            state.leader = Some(args.leader_id);
        }

        if args.prev_log_index >= state.log.len() as u64
            || state.term_at(args.prev_log_index) != Some(args.prev_log_term)
        {
            return AppendEntriesReply { term: args.term, success: false };
        }

        let mut log_modified = false;
        let mut insert_index = args.prev_log_index + 1;
        for entry in args.entries {
            if (insert_index as usize) < state.log.len() {
                if state.log[insert_index as usize].term != entry.term {
                    if state.commit_index >= insert_index {
                        panic!(
                            "peer {}: refusing to truncate already-committed index {}",
                            self.self_id, insert_index
                        );
                    }
                    state.log.truncate(insert_index as usize);
                    state.log.push(entry);
                    log_modified = true;
                }
                // else: entry already present and matches, nothing to do.
            } else {
                state.log.push(entry);
                log_modified = true;
            }
            insert_index += 1;
        }

        if args.leader_commit > state.commit_index {
            state.commit_index = std::cmp::min(args.leader_commit, state.last_log_index());
        }

        if log_modified {
            let proof = self.persist_state(&state);
            return Self::append_success_reply(args.term, proof);
        }

        AppendEntriesReply { term: args.term, success: true }
    }

    /// Takes a [`Persisted`] proof so this reply can only be built after the
    /// log mutation it reports has actually been written through the
    /// persister.
    fn append_success_reply(term: u64, _proof: Persisted) -> AppendEntriesReply {
        AppendEntriesReply { term, success: true }
    }

    // ---------------------------------------------------------------
    // Leader-contact monitor
    // ---------------------------------------------------------------

    async fn run_leader_contact_monitor(self: Arc<Self>) {
        loop {
            tokio::time::sleep(self.config.leader_check_interval).await;

            let should_start_election = {
                let mut state = self.state.lock().await;
                if state.terminated {
                    return;
                }
                let timed_out = state.role == Role::Follower
                    && state.last_leader_contact.elapsed() >= self.config.step_down_threshold;
                if timed_out {
                    state.role = Role::Candidate;
                }
                timed_out
            };

            if should_start_election {
                info!("peer {}: leader contact timed out, becoming candidate", self.self_id);
                let elector = Arc::clone(&self);
                let handle = tokio::spawn(async move { elector.run_election().await });
                self.handles.lock().unwrap().push(handle);
            }
        }
    }

    // ---------------------------------------------------------------
    // Election procedure
    // ---------------------------------------------------------------

    async fn run_election(self: Arc<Self>) {
        loop {
            {
                let state = self.state.lock().await;
                if state.terminated || state.role != Role::Candidate {
                    return;
                }
            }

            let (this_term, last_log_index, last_log_term) = {
                let mut state = self.state.lock().await;
                state.current_term += 1;
                state.voted_for = Some(self.self_id);
                self.persist_state(&state);
                (state.current_term, state.last_log_index(), state.last_log_term())
            };

            info!("peer {}: starting election for term {}", self.self_id, this_term);

            let majority = self.cluster_size() / 2 + 1;
            let (vote_tx, mut vote_rx) = mpsc::channel::<RequestVoteReply>(self.peer_ids.len().max(1));

            for &peer in &self.peer_ids {
                let this = Arc::clone(&self);
                let vote_tx = vote_tx.clone();
                let args = RequestVoteArgs {
                    term: this_term,
                    candidate_id: self.self_id,
                    last_log_index,
                    last_log_term,
                };
                tokio::spawn(async move {
                    if let Some(reply) = this.transport.request_vote(peer, args).await {
                        let _ = vote_tx.send(reply).await;
                    }
                });
            }
            drop(vote_tx);

            let deadline = tokio::time::sleep(self.config.random_election_timeout());
            tokio::pin!(deadline);

            // A self-vote alone already reaches majority in a one-peer
            // cluster; nothing will ever arrive on vote_rx to trigger the
            // check below, so try right away.
            let mut votes_granted = 1usize; // self-vote
            let mut won = votes_granted >= majority && self.try_become_leader(this_term).await;
            let mut channel_open = true;
            if !won {
                won = 'collect: loop {
                    tokio::select! {
                        _ = &mut deadline => break 'collect false,
                        maybe_reply = vote_rx.recv(), if channel_open => {
                            let reply = match maybe_reply {
                                None => { channel_open = false; continue 'collect; }
                                Some(reply) => reply,
                            };

                            let mut state = self.state.lock().await;
                            if reply.term > state.current_term {
                                state.current_term = reply.term;
                                state.role = Role::Follower;
                                state.voted_for = None;
                                state.leader = None;
                                self.persist_state(&state);
                                break 'collect false;
                            }
                            if !reply.vote_granted {
                                continue 'collect;
                            }
                            drop(state);

                            votes_granted += 1;
                            if votes_granted < majority {
                                continue 'collect;
                            }

                            if self.try_become_leader(this_term).await {
                                break 'collect true;
                            }
                            break 'collect false;
                        }
                    }
                };
            }

            if won {
                return;
            }
            // Loop back to the top: re-check role before starting the next term's
            // election, in case an RPC handler already demoted us to Follower.
        }
    }

    /// If `thisTerm` is still current, transitions to Leader and spawns the
    /// leader tasks; returns whether the transition happened. Used both
    /// right after a self-vote that already reaches majority and after
    /// collecting enough granted votes from others.
    async fn try_become_leader(self: &Arc<Self>, this_term: u64) -> bool {
        let mut state = self.state.lock().await;
        if state.current_term != this_term {
            // We've already moved on (observed a higher term elsewhere).
            return false;
        }
        state.role = Role::Leader;
        state.leader = Some(self.self_id);
        state.reinitialize_leader_state(&self.peer_ids);
        info!("peer {}: won election for term {}, becoming leader", self.self_id, this_term);
        drop(state);

        self.spawn_leader_tasks();
        true
    }

    fn spawn_leader_tasks(self: &Arc<Self>) {
        for &peer in &self.peer_ids {
            let this = Arc::clone(self);
            let handle = tokio::spawn(async move { this.run_replication_task(peer).await });
            self.handles.lock().unwrap().push(handle);
        }
        let heartbeat = Arc::clone(self);
        let handle = tokio::spawn(async move { heartbeat.run_heartbeat_ticker().await });
        self.handles.lock().unwrap().push(handle);
        // New entries should go out immediately rather than waiting for the
        // first heartbeat tick.
        self.signal_all_replication();
    }

    async fn run_heartbeat_ticker(self: Arc<Self>) {
        loop {
            tokio::time::sleep(self.config.heartbeat_interval).await;
            let still_leader = {
                let state = self.state.lock().await;
                !state.terminated && state.role == Role::Leader
            };
            if !still_leader {
                return;
            }
            self.signal_all_replication();
        }
    }

    // ---------------------------------------------------------------
    // Per-follower replication task
    // ---------------------------------------------------------------

    async fn run_replication_task(self: Arc<Self>, peer: PeerId) {
        let notify = self
            .replicate_signal
            .get(&peer)
            .expect("a signal is registered for every configured peer")
            .clone();

        loop {
            notify.notified().await;

            let args = {
                let state = self.state.lock().await;
                if state.terminated || state.role != Role::Leader {
                    return;
                }
                let next_index = state
                    .progress
                    .get(&peer)
                    .map(|p| p.next_index)
                    .unwrap_or_else(|| state.last_log_index() + 1);
                let prev_index = next_index - 1;
                let prev_term = state
                    .term_at(prev_index)
                    .expect("prev_index is always within the log");
                let tail_end = std::cmp::min(
                    state.log.len() as u64,
                    next_index + self.config.max_append_entries as u64,
                );
                let entries = state.log[(next_index as usize)..(tail_end as usize)].to_vec();

                AppendEntriesArgs {
                    term: state.current_term,
                    leader_id: self.self_id,
                    prev_log_index: prev_index,
                    prev_log_term: prev_term,
                    entries,
                    leader_commit: state.commit_index,
                }
            };

            let Some(reply) = self.transport.append_entries(peer, args.clone()).await else {
                // Transport failure; the next heartbeat or signal retries.
                continue;
            };

            let mut state = self.state.lock().await;

            if reply.term > state.current_term {
                state.current_term = reply.term;
                state.role = Role::Follower;
                state.voted_for = None;
                state.leader = None;
                self.persist_state(&state);
                return;
            }

            if state.current_term != args.term {
                // We've moved on to a different term since sending this request.
                continue;
            }

            if reply.success {
                if let Some(progress) = state.progress.get_mut(&peer) {
                    progress.decrement_step = 1;
                    if args.prev_log_index == progress.next_index - 1 {
                        progress.next_index += args.entries.len() as u64;
                        progress.match_index = progress.match_index.max(progress.next_index - 1);
                    }
                }
                self.advance_commit_index(&mut state);
            } else if let Some(progress) = state.progress.get_mut(&peer) {
                if args.prev_log_index == progress.next_index - 1 {
                    let step = progress.decrement_step;
                    progress.next_index = progress.next_index.saturating_sub(step).max(1);
                    progress.decrement_step = step.saturating_mul(2);
                }
            }
        }
    }

    /// Figure-8 safe commit advancement: only ever commits by quorum count
    /// when the candidate index was written in the leader's current term.
    fn advance_commit_index(&self, state: &mut RaftState) {
        if let Some(candidate) = state.majority_match_index(self.cluster_size()) {
            if candidate > state.commit_index && state.term_at(candidate) == Some(state.current_term) {
                state.commit_index = candidate;
            }
        }
    }

    // ---------------------------------------------------------------
    // Apply task
    // ---------------------------------------------------------------

    async fn run_apply_task(self: Arc<Self>) {
        loop {
            let next = {
                let mut state = self.state.lock().await;
                if state.terminated {
                    return;
                }
                if state.commit_index > state.last_applied {
                    state.last_applied += 1;
                    let index = state.last_applied;
                    let command = state.log[index as usize].command.clone();
                    Some((index, command))
                } else {
                    None
                }
            };

            match next {
                Some((index, command)) => {
                    let msg = ApplyMsg { valid: true, index, command };
                    if self.apply_tx.send(msg).await.is_err() {
                        debug!("peer {}: apply sink closed, service has gone away", self.self_id);
                        return;
                    }
                }
                None => {
                    tokio::time::sleep(self.config.apply_check_interval).await;
                }
            }
        }
    }
}

#[async_trait]
impl RaftRpcHandler for RaftPeer {
    async fn handle_request_vote(&self, args: RequestVoteArgs) -> RequestVoteReply {
        RaftPeer::handle_request_vote(self, args).await
    }

    async fn handle_append_entries(&self, args: AppendEntriesArgs) -> AppendEntriesReply {
        RaftPeer::handle_append_entries(self, args).await
    }
}
