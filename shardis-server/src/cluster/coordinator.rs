//! Cluster node: the entry point for every command in cluster mode
//!
//! A `Cluster` owns the local store, the replicated FSM and its raft node,
//! slot bookkeeping and the transaction manager. Commands are authenticated,
//! then either executed locally (`<name>_` penetrating form), handed to a
//! registered handler, or routed to the node owning their keys.

use super::config::{ClusterConfig, StartMode};
use super::fsm::{Event, Fsm, FsmChange};
use super::hash_slot::hash_slot;
use super::peer::PeerTransport;
use super::raft::{RaftConfig, RaftNode, RaftRole, RaftTransport};
use super::router;
use super::slot_manager::SlotManager;
use super::tcc::TxManager;
use super::types::{ClusterError, ClusterNode, ClusterResult, NodeId, NodeRole, SlotRange};
use super::{failover, migration, rebalance};
use crate::core::KVStore;
use crate::core::commands::command_name;
use crate::protocol::{CmdLine, Reply, to_cmdline};
use crate::replication::ReplicaLink;
use crate::server::{Connection, Database, authenticate};
use bytes::Bytes;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Join requests sent before giving up
const JOIN_ATTEMPTS: usize = 30;

/// Times a leader-bound request follows a redirect or retries a timeout
const LEADER_ATTEMPTS: usize = 3;

pub struct Cluster {
    pub(super) config: ClusterConfig,
    pub(super) self_id: NodeId,
    pub(super) db: KVStore,
    pub(super) fsm: Arc<Fsm>,
    pub(super) raft: Arc<RaftNode>,
    pub(super) slots: Arc<SlotManager>,
    pub(super) peers: Arc<dyn PeerTransport>,
    pub(super) tcc: TxManager,
    pub(super) replication: ReplicaLink,
    /// Leader only: when each node was last heard from
    pub(super) heartbeats: Mutex<HashMap<NodeId, Instant>>,
    /// Leader only: when each pending migration was last handed to its target
    pub(super) migration_kicks: Mutex<HashMap<String, Instant>>,
    /// Migration tasks this node is currently importing
    pub(super) imports: Mutex<HashSet<String>>,
    requirepass: Option<String>,
    fsm_events: Mutex<Option<mpsc::UnboundedReceiver<FsmChange>>>,
    pub(super) shutdown: watch::Sender<bool>,
}

impl Cluster {
    /// Build a node and its raft core. Seeding or joining waits for
    /// [`Cluster::start`].
    ///
    /// Raft state is kept in memory when `config.data_dir` is empty.
    pub async fn new(
        config: ClusterConfig,
        db: KVStore,
        peers: Arc<dyn PeerTransport>,
        raft_transport: Arc<dyn RaftTransport>,
        requirepass: Option<String>,
    ) -> ClusterResult<Arc<Self>> {
        let self_id = config.self_addr.clone();
        let fsm = Arc::new(Fsm::new());

        let raft_dir = if config.data_dir.as_os_str().is_empty() {
            None
        } else {
            Some(config.raft_dir())
        };
        let raft = RaftNode::new(
            RaftConfig::from_cluster(&config),
            fsm.clone(),
            raft_transport,
            raft_dir,
        )
        .await?;

        let slots = Arc::new(SlotManager::new());
        db.add_observer(slots.clone());

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        fsm.add_observer(move |_, change| {
            let _ = events_tx.send(change.clone());
        });

        let tcc = TxManager::new(
            db.clone(),
            config.tcc_lock_timeout(),
            config.tcc_gc_grace(),
        );
        let replication = ReplicaLink::new(db.clone(), peers.clone(), config.replica_retry());
        let (shutdown, _) = watch::channel(false);

        info!(
            "Cluster node {} created (raft at {}, mode {:?})",
            self_id, config.raft_advertise_addr, config.start_mode
        );

        Ok(Arc::new(Self {
            config,
            self_id,
            db,
            fsm,
            raft,
            slots,
            peers,
            tcc,
            replication,
            heartbeats: Mutex::new(HashMap::new()),
            migration_kicks: Mutex::new(HashMap::new()),
            imports: Mutex::new(HashSet::new()),
            requirepass,
            fsm_events: Mutex::new(Some(events_rx)),
            shutdown,
        }))
    }

    pub fn id(&self) -> &NodeId {
        &self.self_id
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn raft(&self) -> &Arc<RaftNode> {
        &self.raft
    }

    pub fn fsm(&self) -> &Arc<Fsm> {
        &self.fsm
    }

    pub fn store(&self) -> &KVStore {
        &self.db
    }

    pub fn slot_manager(&self) -> &Arc<SlotManager> {
        &self.slots
    }

    pub fn tx_manager(&self) -> &TxManager {
        &self.tcc
    }

    /// Current replication upstream
    pub fn replicating_from(&self) -> Option<NodeId> {
        self.replication.master()
    }

    /// Start background tasks, then seed a new cluster or join an existing one
    pub async fn start(self: &Arc<Self>) -> ClusterResult<()> {
        if let Some(events) = self.fsm_events.lock().take() {
            tokio::spawn(Arc::clone(self).watch_fsm(events));
        }
        self.tcc.start_gc(self.shutdown.subscribe());
        tokio::spawn(Arc::clone(self).leader_cron());
        tokio::spawn(Arc::clone(self).heartbeat_loop());

        match self.config.start_mode {
            StartMode::Seed => self.seed().await,
            StartMode::Join => self.join().await,
        }
    }

    async fn seed(self: &Arc<Self>) -> ClusterResult<()> {
        if self.raft.bootstrap().await? {
            info!("Seeding new cluster from {}", self.self_id);
        }
        if self.fsm.with_state(|s| s.nodes.contains(&self.self_id)) {
            return Ok(());
        }
        self.wait_for_leadership(self.config.raft_election_timeout() * 10)
            .await?;
        if !self.fsm.with_state(|s| s.slot2node.is_empty()) {
            return Ok(());
        }
        self.propose(Event::SeedStart {
            node: self.self_id.clone(),
        })
        .await?;
        info!("Node {} owns all slots", self.self_id);
        Ok(())
    }

    async fn wait_for_leadership(&self, timeout: Duration) -> ClusterResult<()> {
        let deadline = Instant::now() + timeout;
        while !self.raft.is_leader() {
            if Instant::now() >= deadline {
                return Err(ClusterError::Timeout("waiting for leadership".to_string()));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Ok(())
    }

    async fn join(self: &Arc<Self>) -> ClusterResult<()> {
        let mut target = self
            .config
            .join_target
            .clone()
            .ok_or_else(|| ClusterError::ConfigError("join mode needs join_target".to_string()))?;

        let mut cmd = to_cmdline([
            "cluster.join",
            self.self_id.as_str(),
            self.config.raft_advertise_addr.as_str(),
        ]);
        if let Some(master) = &self.config.master {
            cmd.push(Bytes::from(master.clone()));
        }

        for attempt in 1..=JOIN_ATTEMPTS {
            match self.peers.call(&target, cmd.clone()).await {
                Ok(reply) if !reply.is_error() => {
                    info!("Node {} joined the cluster through {}", self.self_id, target);
                    return Ok(());
                }
                Ok(reply) => match ClusterError::from_reply(&reply) {
                    Some(ClusterError::NotLeader(Some(leader))) => {
                        debug!("Join redirected from {} to {}", target, leader);
                        target = leader;
                        continue;
                    }
                    _ => warn!("Join attempt {} via {} rejected: {}", attempt, target, reply),
                },
                Err(e) => warn!("Join attempt {} via {} failed: {}", attempt, target, e),
            }
            tokio::time::sleep(self.config.replica_retry()).await;
        }
        Err(ClusterError::Timeout(format!(
            "joining through {} after {} attempts",
            target, JOIN_ATTEMPTS
        )))
    }

    /// Stop background tasks and the raft core
    pub fn shutdown(&self) {
        info!("Shutting down cluster node {}", self.self_id);
        self.shutdown.send_replace(true);
        self.raft.shutdown();
        self.replication.point_to(None);
    }

    /// Replicate an FSM event; returns its log index once applied locally
    pub async fn propose(&self, event: Event) -> ClusterResult<u64> {
        self.raft.propose(event).await
    }

    /// Owner of the slot `key` hashes to
    pub fn owner_of(&self, key: impl AsRef<[u8]>) -> ClusterResult<NodeId> {
        let slot = hash_slot(key);
        if self.fsm.with_state(|s| s.slot2node.is_empty()) {
            return Err(ClusterError::ClusterNotInitialized);
        }
        self.fsm
            .pick_node(slot)
            .ok_or(ClusterError::SlotNotAssigned(slot))
    }

    /// Send a command to `node`, short-circuiting when it is this node
    pub async fn call_node(self: &Arc<Self>, node: &str, cmdline: CmdLine) -> ClusterResult<Reply> {
        if node == self.self_id {
            return Ok(Arc::clone(self)
                .exec(Arc::new(Connection::internal()), cmdline)
                .await);
        }
        self.peers.call(node, cmdline).await
    }

    /// Run a data command on its owner: locally, or relayed in penetrating form
    pub async fn forward(self: &Arc<Self>, node: &str, cmdline: CmdLine) -> ClusterResult<Reply> {
        if node == self.self_id {
            return Ok(self.db.exec(&cmdline).await);
        }
        let result = self.peers.call(node, penetrating(cmdline)).await;
        crate::metrics::record_relay(result.is_ok());
        result
    }

    /// Send a command to the raft leader, following `NOTLEADER` redirects
    pub async fn call_leader(self: &Arc<Self>, cmdline: CmdLine) -> ClusterResult<Reply> {
        let mut target = self.raft.leader().ok_or(ClusterError::NotLeader(None))?;
        let mut last_err = ClusterError::NotLeader(None);

        for _ in 0..LEADER_ATTEMPTS {
            match self.call_node(&target, cmdline.clone()).await {
                Ok(reply) => match ClusterError::from_reply(&reply) {
                    Some(ClusterError::NotLeader(Some(leader))) => {
                        debug!("Redirected from {} to leader {}", target, leader);
                        target = leader;
                        last_err = ClusterError::NotLeader(Some(target.clone()));
                    }
                    _ => return Ok(reply),
                },
                Err(e @ (ClusterError::Timeout(_) | ClusterError::NetworkError(_))) => {
                    warn!("Leader call to {} failed: {}", target, e);
                    last_err = e;
                    if let Some(leader) = self.raft.leader() {
                        target = leader;
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err)
    }

    /// Error out unless this node currently leads
    pub fn ensure_leader(&self) -> ClusterResult<()> {
        if self.raft.is_leader() {
            Ok(())
        } else {
            Err(ClusterError::NotLeader(self.raft.leader()))
        }
    }

    /// Every node with its role and slots
    pub fn nodes(&self) -> Vec<ClusterNode> {
        let voters = self.raft.voters();
        self.fsm.with_state(|s| {
            s.nodes
                .iter()
                .map(|id| {
                    let slots = s.slots_of(id);
                    let master_id = s.master_of(id).cloned();
                    ClusterNode {
                        id: id.clone(),
                        raft_addr: voters.get(id).cloned(),
                        role: if master_id.is_some() {
                            NodeRole::Slave
                        } else {
                            NodeRole::Master
                        },
                        master_id,
                        slot_count: slots.len(),
                        slots: SlotRange::collapse(slots),
                    }
                })
                .collect()
        })
    }

    async fn dispatch(self: Arc<Self>, conn: Arc<Connection>, mut cmdline: CmdLine) -> Reply {
        if let Some(reply) = authenticate(&conn, &cmdline, self.requirepass.as_deref()) {
            return reply;
        }
        let name = command_name(&cmdline);

        if let Some(local) = name.strip_suffix('_') {
            cmdline[0] = Bytes::from(local.to_string());
            return self.db.exec(&cmdline).await;
        }

        let result = match router::handler(&name) {
            Some(handler) => handler(self, conn, cmdline).await,
            None => router::route(self, cmdline).await,
        };
        result.unwrap_or_else(Reply::from)
    }

    async fn watch_fsm(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<FsmChange>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut master: Option<NodeId> = None;
        self.follow_master(&mut master);

        loop {
            tokio::select! {
                change = events.recv() => {
                    let Some(change) = change else { break };
                    debug!("Node {} observed {:?}", self.self_id, change);
                    match &change {
                        FsmChange::MigrationFinished(task) => migration::on_finished(&self, task),
                        FsmChange::Restored => migration::drop_foreign_slots(&self),
                        _ => {}
                    }
                    self.follow_master(&mut master);
                }
                _ = shutdown.changed() => break,
            }
        }
    }

    /// Re-point replication when the configured master changed
    fn follow_master(&self, previous: &mut Option<NodeId>) {
        let current = self.fsm.master_of(&self.self_id);
        if current != *previous {
            info!(
                "Node {} master changed: {:?} -> {:?}",
                self.self_id, previous, current
            );
            self.replication.point_to(current.clone());
            *previous = current;
        }
    }

    async fn leader_cron(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut interval = tokio::time::interval(self.config.cron_interval());
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => break,
            }
            self.update_metrics();
            if !self.raft.is_leader() {
                self.heartbeats.lock().clear();
                continue;
            }
            if let Err(e) = failover::check(&self).await {
                error!("Failover check failed: {}", e);
            }
            if let Err(e) = rebalance::run(&self).await {
                error!("Rebalance failed: {}", e);
            }
        }
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut interval = tokio::time::interval(self.config.heartbeat_interval());
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => break,
            }
            if self.raft.is_leader() {
                continue;
            }
            let Some(leader) = self.raft.leader() else { continue };
            let cmd = to_cmdline(["cluster.heartbeat", self.self_id.as_str()]);
            if let Err(e) = self.peers.call(&leader, cmd).await {
                debug!("Heartbeat to {} failed: {}", leader, e);
            }
        }
    }

    pub(crate) fn update_metrics(&self) {
        let status = self.raft.status();
        let role = match status.role {
            RaftRole::Leader => 2,
            RaftRole::Candidate => 1,
            _ => 0,
        };
        let owned = self.fsm.with_state(|s| s.slots_of(&self.self_id).len());
        crate::metrics::update_raft(role, status.term, owned);
    }

    /// Nodes grouped by role, for `cluster.nodes`
    pub(super) fn describe(&self) -> String {
        let leader = self.raft.leader();
        let mut out = String::new();
        for node in self.nodes() {
            let mut flags = match node.role {
                NodeRole::Master => "master".to_string(),
                NodeRole::Slave => "slave".to_string(),
            };
            if node.id == self.self_id {
                flags.push_str(",myself");
            }
            if leader.as_ref() == Some(&node.id) {
                flags.push_str(",leader");
            }
            let slots: Vec<String> = node.slots.iter().map(ToString::to_string).collect();
            out.push_str(&format!(
                "{} {} {} {} {}\n",
                node.id,
                node.raft_addr.as_deref().unwrap_or("-"),
                flags,
                node.master_id.as_deref().unwrap_or("-"),
                slots.join(" ")
            ));
        }
        out
    }
}

impl Database for Cluster {
    fn exec(self: Arc<Self>, conn: Arc<Connection>, cmdline: CmdLine) -> BoxFuture<'static, Reply> {
        self.dispatch(conn, cmdline).boxed()
    }

    fn close(&self) {
        self.shutdown();
        if let Err(e) = self.db.save() {
            debug!("No snapshot written on close: {}", e);
        }
    }
}

/// `<name>_` form executed by the receiver without routing
pub fn penetrating(mut cmdline: CmdLine) -> CmdLine {
    if let Some(name) = cmdline.first() {
        let mut local = name.to_vec();
        local.push(b'_');
        cmdline[0] = Bytes::from(local);
    }
    cmdline
}

/// Group argument positions by the node owning each key
pub fn group_by_owner<'a>(
    cluster: &Cluster,
    keys: impl IntoIterator<Item = (usize, &'a Bytes)>,
) -> ClusterResult<BTreeMap<NodeId, Vec<usize>>> {
    let mut groups: BTreeMap<NodeId, Vec<usize>> = BTreeMap::new();
    for (pos, key) in keys {
        groups.entry(cluster.owner_of(key)?).or_default().push(pos);
    }
    Ok(groups)
}
