//! Raft Consensus
//!
//! Cluster metadata is replicated with openraft. Committed [`Event`]s are
//! applied to the [`Fsm`] by [`RaftStore`]; RPCs travel over a pluggable
//! [`RaftTransport`] (HTTP in production, in-process in tests).
//!
//! Cluster node ids are addresses, openraft wants integers: every node gets
//! a stable numeric id derived from its address, and the membership carries
//! the address back in [`RaftMember`].

mod network;
mod storage;

pub use network::{HttpRaftTransport, RaftConnection, RaftNetworkClient, RaftRequest, RaftResponse, RaftTransport};
pub use storage::RaftStore;

use super::config::ClusterConfig;
use super::fsm::{Event, Fsm};
use super::types::{ClusterError, ClusterResult, NodeId};
use openraft::error::{ClientWriteError, InitializeError, RaftError};
use openraft::{Membership, Raft, RaftMetrics, ServerState, SnapshotPolicy};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Numeric id openraft knows a node by
pub type RaftId = u64;

/// Membership entry: which cluster node a raft id belongs to and where its
/// raft endpoint listens
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftMember {
    pub node: NodeId,
    pub addr: String,
}

impl fmt::Display for RaftMember {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.node, self.addr)
    }
}

openraft::declare_raft_types!(
    pub TypeConfig:
        D = Event,
        R = (),
        NodeId = RaftId,
        Node = RaftMember,
        SnapshotData = Cursor<Vec<u8>>,
);

/// Stable raft id of a cluster node
pub fn raft_id(node: &str) -> RaftId {
    Uuid::new_v5(&Uuid::NAMESPACE_URL, node.as_bytes())
        .as_u64_pair()
        .0
}

/// Raft node state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RaftRole {
    Learner,
    Follower,
    Candidate,
    Leader,
    Shutdown,
}

impl From<ServerState> for RaftRole {
    fn from(state: ServerState) -> Self {
        match state {
            ServerState::Learner => RaftRole::Learner,
            ServerState::Follower => RaftRole::Follower,
            ServerState::Candidate => RaftRole::Candidate,
            ServerState::Leader => RaftRole::Leader,
            ServerState::Shutdown => RaftRole::Shutdown,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// Node ID
    pub id: NodeId,
    /// Raft address advertised to other voters
    pub addr: String,
    pub election_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// Applied entries between snapshots
    pub snapshot_threshold: u64,
    /// How long a proposal or membership change may take
    pub propose_timeout: Duration,
}

impl RaftConfig {
    pub fn from_cluster(config: &ClusterConfig) -> Self {
        Self {
            id: config.self_addr.clone(),
            addr: config.raft_advertise_addr.clone(),
            election_timeout: config.raft_election_timeout(),
            heartbeat_interval: config.raft_heartbeat_interval(),
            snapshot_threshold: config.raft_snapshot_threshold,
            propose_timeout: config.raft_election_timeout() * 10,
        }
    }

    fn to_openraft(&self) -> ClusterResult<openraft::Config> {
        let election = self.election_timeout.as_millis() as u64;
        openraft::Config {
            cluster_name: "shardis".to_string(),
            heartbeat_interval: self.heartbeat_interval.as_millis() as u64,
            election_timeout_min: election,
            election_timeout_max: election * 2,
            snapshot_policy: SnapshotPolicy::LogsSinceLast(self.snapshot_threshold),
            max_in_snapshot_log_to_keep: 0,
            ..Default::default()
        }
        .validate()
        .map_err(|e| ClusterError::ConfigError(e.to_string()))
    }
}

/// Point-in-time view of a raft node
#[derive(Debug, Clone, Serialize)]
pub struct RaftStatus {
    pub id: NodeId,
    pub raft_id: RaftId,
    pub role: RaftRole,
    pub term: u64,
    pub leader: Option<NodeId>,
    pub last_log_index: Option<u64>,
    pub applied_index: u64,
    pub snapshot_index: Option<u64>,
    pub voters: BTreeMap<NodeId, String>,
}

/// Raft node
pub struct RaftNode {
    config: RaftConfig,
    raft_id: RaftId,
    raft: Raft<TypeConfig>,
    fsm: Arc<Fsm>,
}

impl RaftNode {
    /// Start a node, reloading raft state from `dir` when it holds any
    pub async fn new(
        config: RaftConfig,
        fsm: Arc<Fsm>,
        transport: Arc<dyn RaftTransport>,
        dir: Option<PathBuf>,
    ) -> ClusterResult<Arc<Self>> {
        let id = raft_id(&config.id);
        let store = RaftStore::open(fsm.clone(), dir).await?;
        let (log_store, state_machine) = openraft::storage::Adaptor::new(store);
        let raft = Raft::new(
            id,
            Arc::new(config.to_openraft()?),
            RaftNetworkClient::new(transport),
            log_store,
            state_machine,
        )
        .await
        .map_err(|e| ClusterError::RaftError(e.to_string()))?;

        info!(
            "Raft node {} started (raft id {}, applied {})",
            config.id,
            id,
            fsm.applied_index()
        );
        Ok(Arc::new(Self {
            config,
            raft_id: id,
            raft,
            fsm,
        }))
    }

    pub fn id(&self) -> &NodeId {
        &self.config.id
    }

    fn member(&self) -> RaftMember {
        RaftMember {
            node: self.config.id.clone(),
            addr: self.config.addr.clone(),
        }
    }

    fn with_metrics<R>(&self, f: impl FnOnce(&RaftMetrics<RaftId, RaftMember>) -> R) -> R {
        let rx = self.raft.metrics();
        let metrics = rx.borrow();
        f(&metrics)
    }

    /// Make this node the sole voter of a brand-new cluster.
    ///
    /// Returns `false` when the node already belongs to a cluster.
    pub async fn bootstrap(&self) -> ClusterResult<bool> {
        let initialized =
            self.with_metrics(|m| m.membership_config.membership().voter_ids().next().is_some());
        if initialized {
            info!("Raft state already initialized, skipping bootstrap");
            return Ok(false);
        }

        let mut members = BTreeMap::new();
        members.insert(self.raft_id, self.member());
        match self.raft.initialize(members).await {
            Ok(()) => {
                info!("Bootstrapped raft cluster with {} as sole voter", self.config.id);
                Ok(true)
            }
            Err(RaftError::APIError(InitializeError::NotAllowed(e))) => {
                debug!("Bootstrap not allowed: {}", e);
                Ok(false)
            }
            Err(e) => Err(ClusterError::RaftError(e.to_string())),
        }
    }

    pub fn status(&self) -> RaftStatus {
        self.with_metrics(|m| {
            let membership = m.membership_config.membership();
            RaftStatus {
                id: self.config.id.clone(),
                raft_id: self.raft_id,
                role: m.state.into(),
                term: m.current_term,
                leader: m.current_leader.and_then(|l| node_of(membership, l)),
                last_log_index: m.last_log_index,
                applied_index: self.fsm.applied_index(),
                snapshot_index: m.snapshot.map(|s| s.index),
                voters: voters_of(membership),
            }
        })
    }

    pub fn role(&self) -> RaftRole {
        self.with_metrics(|m| m.state.into())
    }

    pub fn is_leader(&self) -> bool {
        self.role() == RaftRole::Leader
    }

    pub fn leader(&self) -> Option<NodeId> {
        self.with_metrics(|m| {
            m.current_leader
                .and_then(|l| node_of(m.membership_config.membership(), l))
        })
    }

    pub fn term(&self) -> u64 {
        self.with_metrics(|m| m.current_term)
    }

    /// Last log index applied to the FSM
    pub fn applied_index(&self) -> u64 {
        self.fsm.applied_index()
    }

    /// Voters and their raft addresses
    pub fn voters(&self) -> BTreeMap<NodeId, String> {
        self.with_metrics(|m| voters_of(m.membership_config.membership()))
    }

    /// Replicate `event` and wait until it is applied locally.
    ///
    /// Returns the entry's index; followers answer `NotLeader`.
    pub async fn propose(&self, event: Event) -> ClusterResult<u64> {
        let write = self.raft.client_write(event);
        match tokio::time::timeout(self.config.propose_timeout, write).await {
            Ok(Ok(resp)) => Ok(resp.log_id.index),
            Ok(Err(e)) => Err(write_error(e)),
            Err(_) => Err(ClusterError::Timeout("entry not committed in time".to_string())),
        }
    }

    /// Add a voter: it joins as a learner, catches up, then is promoted
    pub async fn add_voter(&self, id: NodeId, addr: String) -> ClusterResult<u64> {
        if !self.is_leader() {
            return Err(ClusterError::NotLeader(self.leader()));
        }
        let target = raft_id(&id);
        let (mut voters, known) = self.with_metrics(|m| {
            let membership = m.membership_config.membership();
            (
                membership.voter_ids().collect::<BTreeSet<_>>(),
                membership.get_node(&target).cloned(),
            )
        });
        if voters.contains(&target) && known.is_some_and(|m| m.addr == addr) {
            return Ok(self.fsm.applied_index());
        }

        info!("Adding voter {} at {}", id, addr);
        let change = async {
            let member = RaftMember { node: id.clone(), addr };
            self.raft
                .add_learner(target, member, true)
                .await
                .map_err(write_error)?;
            voters.insert(target);
            self.raft
                .change_membership(voters, false)
                .await
                .map_err(write_error)
        };
        match tokio::time::timeout(self.config.propose_timeout, change).await {
            Ok(resp) => Ok(resp?.log_id.index),
            Err(_) => Err(ClusterError::Timeout(format!("adding voter {}", id))),
        }
    }

    /// Serve an RPC from another voter
    pub async fn handle(&self, request: RaftRequest) -> RaftResponse {
        let result = match request {
            RaftRequest::AppendEntries(req) => self
                .raft
                .append_entries(req)
                .await
                .map(RaftResponse::AppendEntries)
                .map_err(|e| e.to_string()),
            RaftRequest::Vote(req) => self
                .raft
                .vote(req)
                .await
                .map(RaftResponse::Vote)
                .map_err(|e| e.to_string()),
            RaftRequest::InstallSnapshot(req) => self
                .raft
                .install_snapshot(req)
                .await
                .map(RaftResponse::InstallSnapshot)
                .map_err(|e| e.to_string()),
        };
        result.unwrap_or_else(|e| {
            debug!("Raft RPC failed on {}: {}", self.config.id, e);
            RaftResponse::Error(e)
        })
    }

    /// Stop the raft core in the background
    pub fn shutdown(&self) {
        let raft = self.raft.clone();
        let id = self.config.id.clone();
        tokio::spawn(async move {
            if let Err(e) = raft.shutdown().await {
                warn!("Raft node {} did not shut down cleanly: {}", id, e);
            }
        });
    }
}

fn node_of(membership: &Membership<RaftId, RaftMember>, id: RaftId) -> Option<NodeId> {
    membership.get_node(&id).map(|m| m.node.clone())
}

fn voters_of(membership: &Membership<RaftId, RaftMember>) -> BTreeMap<NodeId, String> {
    membership
        .voter_ids()
        .filter_map(|id| membership.get_node(&id))
        .map(|m| (m.node.clone(), m.addr.clone()))
        .collect()
}

fn write_error(e: RaftError<RaftId, ClientWriteError<RaftId, RaftMember>>) -> ClusterError {
    match e {
        RaftError::APIError(ClientWriteError::ForwardToLeader(forward)) => {
            ClusterError::NotLeader(forward.leader_node.map(|m| m.node))
        }
        other => ClusterError::RaftError(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;
    use futures_util::future::BoxFuture;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::Weak;

    /// Routes requests between nodes of one test, keyed by raft address
    #[derive(Default)]
    struct Mesh {
        nodes: Mutex<HashMap<String, Weak<RaftNode>>>,
    }

    impl RaftTransport for Mesh {
        fn send(
            &self,
            target: &str,
            request: RaftRequest,
        ) -> BoxFuture<'static, ClusterResult<RaftResponse>> {
            let node = self.nodes.lock().get(target).and_then(Weak::upgrade);
            async move {
                match node {
                    Some(node) => Ok(node.handle(request).await),
                    None => Err(ClusterError::NetworkError("unreachable".into())),
                }
            }
            .boxed()
        }
    }

    fn config(id: &str) -> RaftConfig {
        RaftConfig {
            id: id.to_string(),
            addr: format!("raft-{}", id),
            election_timeout: Duration::from_millis(100),
            heartbeat_interval: Duration::from_millis(20),
            snapshot_threshold: 1000,
            propose_timeout: Duration::from_secs(3),
        }
    }

    async fn spawn_node(
        mesh: &Arc<Mesh>,
        cfg: RaftConfig,
        dir: Option<PathBuf>,
    ) -> (Arc<RaftNode>, Arc<Fsm>) {
        let fsm = Arc::new(Fsm::new());
        let node = RaftNode::new(cfg.clone(), fsm.clone(), mesh.clone(), dir)
            .await
            .unwrap();
        mesh.nodes
            .lock()
            .insert(cfg.addr.clone(), Arc::downgrade(&node));
        (node, fsm)
    }

    async fn eventually(what: &str, f: impl Fn() -> bool) {
        for _ in 0..300 {
            if f() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {}", what);
    }

    fn join(node: &str) -> Event {
        Event::Join {
            node: node.to_string(),
            master: None,
        }
    }

    #[test]
    fn test_raft_id_is_stable() {
        assert_eq!(raft_id("10.0.0.1:6399"), raft_id("10.0.0.1:6399"));
        assert_ne!(raft_id("10.0.0.1:6399"), raft_id("10.0.0.2:6399"));
    }

    #[tokio::test]
    async fn test_single_node_propose() {
        let mesh = Arc::new(Mesh::default());
        let (node, fsm) = spawn_node(&mesh, config("a"), None).await;
        assert!(node.bootstrap().await.unwrap());
        eventually("leadership", || node.is_leader()).await;

        let index = node.propose(Event::SeedStart { node: "a".into() }).await.unwrap();
        assert_eq!(fsm.applied_index(), index);
        assert_eq!(fsm.pick_node(0).as_deref(), Some("a"));
        assert_eq!(node.leader().as_deref(), Some("a"));
        assert!(!node.bootstrap().await.unwrap());
        node.shutdown();
    }

    #[tokio::test]
    async fn test_uninitialized_node_rejects_propose() {
        let mesh = Arc::new(Mesh::default());
        let (node, _) = spawn_node(&mesh, config("a"), None).await;
        let err = node.propose(join("x")).await.unwrap_err();
        assert!(matches!(err, ClusterError::NotLeader(None)));
        node.shutdown();
    }

    #[tokio::test]
    async fn test_add_voter_replicates_log() {
        let mesh = Arc::new(Mesh::default());
        let (a, _) = spawn_node(&mesh, config("a"), None).await;
        let (b, fsm_b) = spawn_node(&mesh, config("b"), None).await;
        a.bootstrap().await.unwrap();
        eventually("leadership", || a.is_leader()).await;

        a.propose(join("one")).await.unwrap();
        a.add_voter("b".into(), "raft-b".into()).await.unwrap();
        let index = a.propose(join("two")).await.unwrap();

        eventually("replication", || fsm_b.applied_index() >= index).await;
        fsm_b.with_state(|s| {
            assert!(s.nodes.contains("one"));
            assert!(s.nodes.contains("two"));
        });
        assert_eq!(b.leader().as_deref(), Some("a"));
        assert_eq!(b.voters().len(), 2);
        assert_eq!(a.voters().get("b").map(String::as_str), Some("raft-b"));

        let err = b.propose(join("x")).await.unwrap_err();
        assert!(matches!(err, ClusterError::NotLeader(Some(ref l)) if l == "a"));
        a.shutdown();
        b.shutdown();
    }

    #[tokio::test]
    async fn test_snapshot_and_restart() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config("a");
        cfg.snapshot_threshold = 5;

        let mesh = Arc::new(Mesh::default());
        let (node, _) = spawn_node(&mesh, cfg.clone(), Some(dir.path().to_path_buf())).await;
        node.bootstrap().await.unwrap();
        eventually("leadership", || node.is_leader()).await;
        for i in 0..12 {
            node.propose(join(&format!("n{}", i))).await.unwrap();
        }
        eventually("snapshot", || node.status().snapshot_index.is_some()).await;
        node.raft.shutdown().await.unwrap();
        drop(node);

        let mesh = Arc::new(Mesh::default());
        let (restarted, fsm) = spawn_node(&mesh, cfg, Some(dir.path().to_path_buf())).await;
        assert!(!restarted.bootstrap().await.unwrap());
        eventually("leadership", || restarted.is_leader()).await;
        let index = restarted.propose(join("after")).await.unwrap();

        fsm.with_state(|s| {
            assert_eq!(s.nodes.len(), 13);
            assert!(s.nodes.contains("n0"));
            assert!(s.nodes.contains("after"));
        });
        assert_eq!(restarted.applied_index(), index);
        restarted.shutdown();
    }
}
