//! Tunable timing parameters, collected in one place so a peer can be built
//! with `RaftConfig { peers, self_id, ..Default::default() }`.

use std::time::Duration;

/// Timing knobs for a [`crate::peer::RaftPeer`]. All fields have sensible
/// defaults for a local or same-datacenter cluster.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// How often the leader-contact monitor wakes up to check for a timed
    /// out follower.
    pub leader_check_interval: Duration,
    /// How long a follower will wait without hearing from a legitimate
    /// leader before it starts an election. Must stay below the shortest
    /// possible election timeout.
    pub step_down_threshold: Duration,
    /// How often a leader heartbeats a follower it has nothing new to send.
    pub heartbeat_interval: Duration,
    /// Lower bound of the randomized candidate election timeout.
    pub election_timeout_min: Duration,
    /// Upper bound of the randomized candidate election timeout.
    pub election_timeout_max: Duration,
    /// How often the apply task polls for newly committed entries when
    /// there is nothing to do.
    pub apply_check_interval: Duration,
    /// Maximum number of entries packed into a single AppendEntries RPC.
    pub max_append_entries: usize,
}

impl Default for RaftConfig {
    fn default() -> Self {
        RaftConfig {
            leader_check_interval: Duration::from_millis(100),
            step_down_threshold: Duration::from_millis(300),
            heartbeat_interval: Duration::from_millis(100),
            election_timeout_min: Duration::from_millis(200),
            election_timeout_max: Duration::from_millis(800),
            apply_check_interval: Duration::from_millis(20),
            max_append_entries: 100,
        }
    }
}

impl RaftConfig {
    pub(crate) fn random_election_timeout(&self) -> Duration {
        use rand::Rng;
        let min = self.election_timeout_min.as_millis() as u64;
        let max = self.election_timeout_max.as_millis() as u64;
        let ms = rand::thread_rng().gen_range(min..=max);
        Duration::from_millis(ms)
    }
}
