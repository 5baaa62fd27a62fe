//! End-to-end cluster scenarios, run against the in-memory
//! [`ChannelTransport`] so elections and replication are exercised without
//! real sockets: quiescent election, single-entry commit, leader failure
//! and re-election, a minority partition healing, and a full restart from
//! persisted state.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use little_raft::transport::{ChannelNetwork, RaftRpcHandler};
use little_raft::{ApplyMsg, MemoryPersister, PeerId, Persister, RaftConfig, RaftPeer};
use tokio::sync::mpsc;

struct Cluster {
    peers: Vec<Arc<RaftPeer>>,
    applied: Vec<Arc<StdMutex<Vec<ApplyMsg>>>>,
    network: ChannelNetwork,
}

impl Cluster {
    async fn start(n: usize, config: RaftConfig) -> Self {
        let network = ChannelNetwork::new();
        let ids: Vec<PeerId> = (0..n as u64).collect();
        let mut cluster = Cluster { peers: Vec::new(), applied: Vec::new(), network };
        for &id in &ids {
            let persister: Arc<dyn Persister> = Arc::new(MemoryPersister::new());
            cluster.spawn_peer(id, &ids, persister, config.clone()).await;
        }
        cluster
    }

    async fn spawn_peer(
        &mut self,
        id: PeerId,
        ids: &[PeerId],
        persister: Arc<dyn Persister>,
        config: RaftConfig,
    ) {
        let others: Vec<PeerId> = ids.iter().copied().filter(|&p| p != id).collect();
        let (apply_tx, mut apply_rx) = mpsc::channel::<ApplyMsg>(64);
        let sink = Arc::new(StdMutex::new(Vec::new()));
        let sink_clone = Arc::clone(&sink);
        tokio::spawn(async move {
            while let Some(msg) = apply_rx.recv().await {
                sink_clone.lock().unwrap().push(msg);
            }
        });

        // The transport needs no receiving half to place outbound calls, so
        // it can be built before the peer (which will become its own
        // receiving half) exists.
        let transport = self.network.transport(id);
        let peer = RaftPeer::spawn(others, id, persister, apply_tx, Arc::new(transport), config);
        let handler: Arc<dyn RaftRpcHandler> = Arc::clone(&peer) as Arc<dyn RaftRpcHandler>;
        self.network.serve(id, handler);

        self.peers.push(peer);
        self.applied.push(sink);
    }

    /// Polls `candidates` until one of them reports itself leader, or the
    /// timeout elapses.
    async fn wait_for_leader_among(&self, candidates: &[usize], timeout: Duration) -> Option<usize> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            for &i in candidates {
                let (_, is_leader) = self.peers[i].get_state().await;
                if is_leader {
                    return Some(i);
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    async fn wait_for_leader(&self, timeout: Duration) -> Option<usize> {
        let all: Vec<usize> = (0..self.peers.len()).collect();
        self.wait_for_leader_among(&all, timeout).await
    }

    async fn wait_until(&self, mut pred: impl FnMut() -> bool, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while !pred() {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        true
    }
}

fn fast_config() -> RaftConfig {
    RaftConfig {
        leader_check_interval: Duration::from_millis(20),
        step_down_threshold: Duration::from_millis(60),
        heartbeat_interval: Duration::from_millis(20),
        election_timeout_min: Duration::from_millis(40),
        election_timeout_max: Duration::from_millis(160),
        apply_check_interval: Duration::from_millis(5),
        max_append_entries: 100,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn quiescent_election_elects_exactly_one_leader() {
    let cluster = Cluster::start(3, fast_config()).await;
    let leader = cluster
        .wait_for_leader(Duration::from_secs(1))
        .await
        .expect("a leader should emerge within 1s");

    let (leader_term, _) = cluster.peers[leader].get_state().await;
    for (i, peer) in cluster.peers.iter().enumerate() {
        let (term, is_leader) = peer.get_state().await;
        if i == leader {
            assert!(is_leader);
        } else {
            assert!(!is_leader, "peer {i} should not also believe itself leader");
        }
        assert_eq!(term, leader_term, "all peers should agree on the elected term");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_entry_commits_and_applies_everywhere() {
    let cluster = Cluster::start(3, fast_config()).await;
    let leader = cluster
        .wait_for_leader(Duration::from_secs(1))
        .await
        .expect("a leader should emerge");

    let (index, _term, ok) = cluster.peers[leader].start(b"x".to_vec()).await;
    assert!(ok);
    assert_eq!(index, 1);

    let delivered = cluster
        .wait_until(
            || {
                cluster
                    .applied
                    .iter()
                    .all(|sink| sink.lock().unwrap().iter().any(|m| m.index == 1))
            },
            Duration::from_secs(1),
        )
        .await;
    assert!(delivered, "all three peers should apply index 1 within 1s");

    for sink in &cluster.applied {
        let applied = sink.lock().unwrap();
        let entry = applied.iter().find(|m| m.index == 1).unwrap();
        assert!(entry.valid);
        assert_eq!(entry.command, b"x");
    }

    // Start on a follower is rejected.
    let follower = (leader + 1) % 3;
    let (idx, term, ok) = cluster.peers[follower].start(b"y".to_vec()).await;
    assert_eq!((idx, term, ok), (-1, -1, false));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn leader_failure_triggers_reelection_with_higher_term() {
    let cluster = Cluster::start(3, fast_config()).await;
    let leader = cluster
        .wait_for_leader(Duration::from_secs(1))
        .await
        .expect("a leader should emerge");
    let (original_term, _) = cluster.peers[leader].get_state().await;

    for i in 0..5u32 {
        let (_, _, ok) = cluster.peers[leader].start(format!("entry-{i}").into_bytes()).await;
        assert!(ok);
    }

    cluster.peers[leader].kill().await;

    let remaining: Vec<usize> = (0..3).filter(|&i| i != leader).collect();
    let new_leader = cluster
        .wait_for_leader_among(&remaining, Duration::from_secs(2))
        .await
        .expect("one of the remaining peers should become leader");

    let (new_term, _) = cluster.peers[new_leader].get_state().await;
    assert!(new_term > original_term);

    let (_, _, ok) = cluster.peers[new_leader].start(b"after-failure".to_vec()).await;
    assert!(ok);

    for &i in &remaining {
        let sink = &cluster.applied[i];
        let delivered = cluster
            .wait_until(
                || sink.lock().unwrap().iter().any(|m| m.command == b"after-failure"),
                Duration::from_secs(1),
            )
            .await;
        assert!(delivered, "live peer {i} should eventually apply the post-failure entry");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn minority_partition_stalls_isolated_peer_then_catches_up() {
    let cluster = Cluster::start(3, fast_config()).await;
    let leader = cluster
        .wait_for_leader(Duration::from_secs(1))
        .await
        .expect("a leader should emerge");

    let isolated = (leader + 1) % 3;
    let majority_peer = (0..3).find(|&i| i != leader && i != isolated).unwrap();

    cluster.network.partition(isolated as u64, leader as u64);
    cluster.network.partition(isolated as u64, majority_peer as u64);

    let (_, _, ok) = cluster.peers[leader].start(b"during-partition".to_vec()).await;
    assert!(ok);

    let majority_delivered = cluster
        .wait_until(
            || cluster.applied[majority_peer].lock().unwrap().iter().any(|m| m.command == b"during-partition"),
            Duration::from_secs(1),
        )
        .await;
    assert!(majority_delivered, "the surviving majority should still commit");

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(
        cluster.applied[isolated].lock().unwrap().is_empty(),
        "the isolated peer must not apply an entry it never received"
    );

    cluster.network.heal(isolated as u64, leader as u64);
    cluster.network.heal(isolated as u64, majority_peer as u64);

    let caught_up = cluster
        .wait_until(
            || cluster.applied[isolated].lock().unwrap().iter().any(|m| m.command == b"during-partition"),
            Duration::from_secs(2),
        )
        .await;
    assert!(caught_up, "the healed peer should catch up via AppendEntries backoff");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn restart_with_persisted_state_keeps_log_and_preserves_term() {
    let network = ChannelNetwork::new();
    let ids: Vec<PeerId> = vec![0, 1, 2];
    let persisters: Vec<Arc<dyn Persister>> =
        (0..3).map(|_| Arc::new(MemoryPersister::new()) as Arc<dyn Persister>).collect();

    async fn spawn_all(
        network: &ChannelNetwork,
        ids: &[PeerId],
        persisters: &[Arc<dyn Persister>],
        config: RaftConfig,
    ) -> (Vec<Arc<RaftPeer>>, Vec<Arc<StdMutex<Vec<ApplyMsg>>>>) {
        let mut peers = Vec::new();
        let mut sinks = Vec::new();
        for &id in ids {
            let others: Vec<PeerId> = ids.iter().copied().filter(|&p| p != id).collect();
            let (apply_tx, mut apply_rx) = mpsc::channel::<ApplyMsg>(64);
            let sink = Arc::new(StdMutex::new(Vec::new()));
            let sink_clone = Arc::clone(&sink);
            tokio::spawn(async move {
                while let Some(msg) = apply_rx.recv().await {
                    sink_clone.lock().unwrap().push(msg);
                }
            });
            let transport = network.transport(id);
            let peer = RaftPeer::spawn(
                others,
                id,
                Arc::clone(&persisters[id as usize]),
                apply_tx,
                Arc::new(transport),
                config.clone(),
            );
            let handler: Arc<dyn RaftRpcHandler> = Arc::clone(&peer) as Arc<dyn RaftRpcHandler>;
            network.serve(id, handler);
            peers.push(peer);
            sinks.push(sink);
        }
        (peers, sinks)
    }

    let (peers, sinks) = spawn_all(&network, &ids, &persisters, fast_config()).await;
    let cluster = Cluster { peers, applied: sinks, network: network.clone() };

    let leader = cluster
        .wait_for_leader(Duration::from_secs(1))
        .await
        .expect("a leader should emerge");

    for i in 0..10u32 {
        let (_, _, ok) = cluster.peers[leader].start(format!("entry-{i}").into_bytes()).await;
        assert!(ok);
    }

    let all_committed = cluster
        .wait_until(
            || cluster.applied.iter().all(|s| s.lock().unwrap().len() == 10),
            Duration::from_secs(2),
        )
        .await;
    assert!(all_committed, "all 10 entries should be applied everywhere before restart");

    for peer in &cluster.peers {
        peer.kill().await;
    }
    drop(cluster);

    // "Restart": fresh peer handles seeded from the same persisters, on a
    // fresh in-memory network (a new process would also get a fresh
    // transport).
    let network2 = ChannelNetwork::new();
    let (peers2, sinks2) = spawn_all(&network2, &ids, &persisters, fast_config()).await;
    let cluster2 = Cluster { peers: peers2, applied: sinks2, network: network2 };

    let new_leader = cluster2
        .wait_for_leader(Duration::from_secs(1))
        .await
        .expect("the restarted cluster should still elect a leader");

    let (_, is_leader) = cluster2.peers[new_leader].get_state().await;
    assert!(is_leader, "the elected peer should report itself leader");

    let (index, _, ok) = cluster2.peers[new_leader].start(b"entry-10".to_vec()).await;
    assert!(ok);
    assert_eq!(index, 11, "the new entry should be appended after all 10 restored entries");
}
