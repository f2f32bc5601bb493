use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// How a node enters the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartMode {
    /// Bootstrap a new cluster owning every slot
    Seed,
    /// Join an existing cluster through `join_target`
    Join,
}

/// Cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Enable cluster mode
    pub enabled: bool,

    /// Advertised client address; doubles as the node ID
    pub self_addr: String,

    /// Address the consensus HTTP server binds to
    pub raft_listen_addr: String,

    /// Consensus address advertised to other voters
    pub raft_advertise_addr: String,

    /// Directory for consensus state
    pub data_dir: PathBuf,

    pub start_mode: StartMode,

    /// Any cluster member, used when joining
    pub join_target: Option<String>,

    /// Master to replicate from when joining as a slave
    pub master: Option<String>,

    /// Raft election timeout lower bound (milliseconds)
    pub raft_election_timeout_ms: u64,

    /// Raft heartbeat interval (milliseconds)
    pub raft_heartbeat_interval_ms: u64,

    /// Log entries kept before compacting into a snapshot
    pub raft_snapshot_threshold: u64,

    /// A master silent for longer than this is failed over (milliseconds)
    pub node_timeout_ms: u64,

    /// Follower heartbeat period (milliseconds)
    pub heartbeat_interval_ms: u64,

    /// Leader cron period for rebalance and failover checks (milliseconds)
    pub cron_interval_ms: u64,

    /// Wait budget for a migration task to become visible: attempts
    pub migration_wait_attempts: u32,

    /// Wait budget for a migration task to become visible: step (milliseconds)
    pub migration_wait_step_ms: u64,

    /// Longest a prepared transaction may hold its locks (milliseconds)
    pub tcc_lock_timeout_ms: u64,

    /// Retention of finished transactions before GC (milliseconds)
    pub tcc_gc_grace_ms: u64,

    /// Timeout for one peer round trip (milliseconds)
    pub peer_timeout_ms: u64,

    /// Delay between replica reconnect attempts (milliseconds)
    pub replica_retry_ms: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            self_addr: "127.0.0.1:6399".to_string(),
            raft_listen_addr: "127.0.0.1:16399".to_string(),
            raft_advertise_addr: "127.0.0.1:16399".to_string(),
            data_dir: PathBuf::from("./data/cluster"),
            start_mode: StartMode::Seed,
            join_target: None,
            master: None,
            raft_election_timeout_ms: 1000,
            raft_heartbeat_interval_ms: 100,
            raft_snapshot_threshold: 1000,
            node_timeout_ms: 5000,
            heartbeat_interval_ms: 500,
            cron_interval_ms: 1000,
            migration_wait_attempts: 50,
            migration_wait_step_ms: 100,
            tcc_lock_timeout_ms: 3000,
            tcc_gc_grace_ms: 10_000,
            peer_timeout_ms: 5000,
            replica_retry_ms: 1000,
        }
    }
}

impl ClusterConfig {
    /// Get node timeout as Duration
    pub fn node_timeout(&self) -> Duration {
        Duration::from_millis(self.node_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn cron_interval(&self) -> Duration {
        Duration::from_millis(self.cron_interval_ms)
    }

    /// Overall budget for waiting on a just-proposed migration task
    pub fn migration_wait(&self) -> Duration {
        Duration::from_millis(self.migration_wait_step_ms * u64::from(self.migration_wait_attempts))
    }

    /// Get raft election timeout as Duration
    pub fn raft_election_timeout(&self) -> Duration {
        Duration::from_millis(self.raft_election_timeout_ms)
    }

    /// Get raft heartbeat interval as Duration
    pub fn raft_heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.raft_heartbeat_interval_ms)
    }

    pub fn tcc_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.tcc_lock_timeout_ms)
    }

    pub fn tcc_gc_grace(&self) -> Duration {
        Duration::from_millis(self.tcc_gc_grace_ms)
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_timeout_ms)
    }

    pub fn replica_retry(&self) -> Duration {
        Duration::from_millis(self.replica_retry_ms)
    }

    /// Directory holding the persisted raft state
    pub fn raft_dir(&self) -> PathBuf {
        self.data_dir.join("raft")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClusterConfig::default();
        assert_eq!(config.migration_wait(), Duration::from_secs(5));
        assert_eq!(config.tcc_lock_timeout(), Duration::from_secs(3));
        assert_eq!(config.tcc_gc_grace(), Duration::from_secs(10));
        assert_eq!(config.start_mode, StartMode::Seed);
    }

    #[test]
    fn test_partial_yaml() {
        let config: ClusterConfig = serde_yaml::from_str(
            "enabled: true\nstart_mode: join\njoin_target: 10.0.0.1:6399\nnode_timeout_ms: 2000\n",
        )
        .unwrap();
        assert!(config.enabled);
        assert_eq!(config.start_mode, StartMode::Join);
        assert_eq!(config.join_target.as_deref(), Some("10.0.0.1:6399"));
        assert_eq!(config.node_timeout(), Duration::from_secs(2));
        assert_eq!(config.cron_interval_ms, 1000);
    }
}
