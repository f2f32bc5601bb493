//! Try-commit-cancel transactions across nodes
//!
//! Participants lock the keys of their sub-command on prepare and keep the
//! locks until commit or rollback. A transaction left prepared longer than
//! the lock timeout is rolled back by a timer. Finished transactions stay
//! around for a grace period so late commits and rollbacks get a definite
//! answer, then a sweeper drops them.
//!
//! Prepare replies `+OK` to vote yes, `:0` to veto on a precondition
//! (`MSETNX` or `RENAMENX` target already present) and an error otherwise.

use super::coordinator::Cluster;
use super::router::{arg, check_arity};
use super::types::{ClusterError, ClusterResult, NodeId};
use crate::core::commands::command_name;
use crate::core::{KVStore, KeyLockGuard, ShardisError};
use crate::protocol::{CmdLine, Reply, to_cmdline};
use crate::server::Connection;
use bytes::Bytes;
use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TxStatus {
    Created,
    Prepared,
    Committed,
    RolledBack,
}

impl TxStatus {
    fn is_terminal(self) -> bool {
        matches!(self, TxStatus::Committed | TxStatus::RolledBack)
    }
}

pub struct Transaction {
    pub id: String,
    pub cmdline: CmdLine,
    pub write_keys: Vec<String>,
    pub read_keys: Vec<String>,
    pub undo_log: Vec<CmdLine>,
    pub status: TxStatus,
    guard: Option<KeyLockGuard>,
    finished_at: Option<Instant>,
}

impl Transaction {
    fn new(id: &str, cmdline: CmdLine) -> Self {
        Self {
            id: id.to_string(),
            cmdline,
            write_keys: Vec::new(),
            read_keys: Vec::new(),
            undo_log: Vec::new(),
            status: TxStatus::Created,
            guard: None,
            finished_at: None,
        }
    }

    fn finish(&mut self, status: TxStatus) {
        self.status = status;
        self.guard = None;
        self.finished_at = Some(Instant::now());
    }
}

/// Participant-side transaction table
#[derive(Clone)]
pub struct TxManager {
    db: KVStore,
    txs: Arc<Mutex<HashMap<String, Transaction>>>,
    lock_timeout: Duration,
    gc_grace: Duration,
}

impl TxManager {
    pub fn new(db: KVStore, lock_timeout: Duration, gc_grace: Duration) -> Self {
        Self {
            db,
            txs: Arc::new(Mutex::new(HashMap::new())),
            lock_timeout,
            gc_grace,
        }
    }

    pub fn status(&self, id: &str) -> Option<TxStatus> {
        self.txs.lock().get(id).map(|tx| tx.status)
    }

    pub fn len(&self) -> usize {
        self.txs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.txs.lock().is_empty()
    }

    /// Lock the keys of `cmdline` and record its undo log.
    ///
    /// With `require_absent`, every key the command writes must not exist;
    /// otherwise the transaction is dropped and `Ok(false)` returned.
    pub async fn prepare(&self, id: &str, cmdline: CmdLine, require_absent: bool) -> ClusterResult<bool> {
        let (write_keys, read_keys) = self.db.related_keys(&cmdline)?;
        {
            let mut txs = self.txs.lock();
            if txs.contains_key(id) {
                return Err(ClusterError::TxError(format!("transaction {} already exists", id)));
            }
            txs.insert(id.to_string(), Transaction::new(id, cmdline.clone()));
        }

        let guard = match tokio::time::timeout(
            self.lock_timeout,
            self.db.rw_locks(&write_keys, &read_keys),
        )
        .await
        {
            Ok(guard) => guard,
            Err(_) => {
                self.finish(id, TxStatus::RolledBack);
                return Err(ClusterError::TxError(format!(
                    "transaction {}: timed out waiting for key locks",
                    id
                )));
            }
        };

        if require_absent && write_keys.iter().any(|k| self.db.get_entity(k).is_some()) {
            debug!("Transaction {} vetoed: key exists", id);
            self.finish(id, TxStatus::RolledBack);
            return Ok(false);
        }
        let undo_log = self.db.undo_logs_for(&write_keys);

        {
            let mut txs = self.txs.lock();
            let Some(tx) = txs.get_mut(id) else {
                return Err(ClusterError::TxError(format!("transaction {} vanished", id)));
            };
            if tx.status != TxStatus::Created {
                return Err(ClusterError::TxError(format!(
                    "transaction {} rolled back while preparing",
                    id
                )));
            }
            tx.write_keys = write_keys;
            tx.read_keys = read_keys;
            tx.undo_log = undo_log;
            tx.guard = Some(guard);
            tx.status = TxStatus::Prepared;
        }

        let manager = self.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(manager.lock_timeout).await;
            if manager.abort_prepared(&id) {
                warn!("Transaction {} timed out while prepared", id);
                crate::metrics::record_tx("timed_out");
            }
        });
        Ok(true)
    }

    /// Execute a prepared transaction under its locks, undoing on error
    pub fn commit(&self, id: &str) -> ClusterResult<Reply> {
        let mut txs = self.txs.lock();
        let tx = txs
            .get_mut(id)
            .ok_or_else(|| ClusterError::TxError(format!("unknown transaction {}", id)))?;
        match tx.status {
            TxStatus::Prepared => {}
            TxStatus::Committed => return Ok(Reply::ok()),
            status => {
                return Err(ClusterError::TxError(format!(
                    "transaction {} is {:?}",
                    id, status
                )));
            }
        }

        let reply = self.db.exec_with_lock(&tx.cmdline);
        if let Some(msg) = reply.error_message() {
            warn!("Transaction {} failed on commit: {}", id, msg);
            for cmd in &tx.undo_log {
                self.db.exec_with_lock(cmd);
            }
            let msg = msg.to_string();
            tx.finish(TxStatus::RolledBack);
            return Err(ClusterError::TxError(format!("transaction {}: {}", id, msg)));
        }
        tx.finish(TxStatus::Committed);
        debug!("Transaction {} committed", id);
        Ok(reply)
    }

    /// Abort a transaction. Unknown ids are accepted since the prepare may
    /// never have reached this node.
    pub fn rollback(&self, id: &str) {
        match self.status(id) {
            Some(TxStatus::Prepared) => {
                self.abort_prepared(id);
            }
            Some(TxStatus::Created) => self.finish(id, TxStatus::RolledBack),
            _ => {}
        }
    }

    /// Replay the undo log of a prepared transaction and release its locks
    fn abort_prepared(&self, id: &str) -> bool {
        let mut txs = self.txs.lock();
        let Some(tx) = txs.get_mut(id) else {
            return false;
        };
        if tx.status != TxStatus::Prepared {
            return false;
        }
        for cmd in &tx.undo_log {
            self.db.exec_with_lock(cmd);
        }
        tx.finish(TxStatus::RolledBack);
        true
    }

    fn finish(&self, id: &str, status: TxStatus) {
        if let Some(tx) = self.txs.lock().get_mut(id) {
            tx.finish(status);
        }
    }

    /// Drop finished transactions older than the grace period
    pub fn gc(&self) -> usize {
        let grace = self.gc_grace;
        let mut txs = self.txs.lock();
        let before = txs.len();
        txs.retain(|_, tx| {
            !(tx.status.is_terminal() && tx.finished_at.is_some_and(|at| at.elapsed() >= grace))
        });
        before - txs.len()
    }

    pub fn start_gc(&self, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        let period = (self.gc_grace / 2).max(Duration::from_millis(10));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let removed = manager.gc();
                        if removed > 0 {
                            debug!("Collected {} finished transactions", removed);
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }
}

// ============================================================================
// Participant handlers
// ============================================================================

/// `cluster.prepare <txid> <command...>`
pub async fn prepare(cluster: Arc<Cluster>, _conn: Arc<Connection>, cmdline: CmdLine) -> ClusterResult<Reply> {
    check_arity(&cmdline, 3)?;
    let id = arg(&cmdline, 1);
    let sub: CmdLine = cmdline[2..].to_vec();
    let require_absent = command_name(&sub) == "msetnx";
    vote(cluster.tx_manager().prepare(&id, sub, require_absent).await?)
}

/// `cluster.commit <txid>`
pub async fn commit(cluster: Arc<Cluster>, _conn: Arc<Connection>, cmdline: CmdLine) -> ClusterResult<Reply> {
    check_arity(&cmdline, 2)?;
    cluster.tx_manager().commit(&arg(&cmdline, 1))
}

/// `cluster.rollback <txid>`
pub async fn rollback(cluster: Arc<Cluster>, _conn: Arc<Connection>, cmdline: CmdLine) -> ClusterResult<Reply> {
    check_arity(&cmdline, 2)?;
    cluster.tx_manager().rollback(&arg(&cmdline, 1));
    Ok(Reply::ok())
}

/// `cluster.preparerenamefrom <txid> <rename|renamenx|copy> <src>`
///
/// Replies `[value, expire_at_ms or -1]`, or nil when `src` does not exist.
pub async fn prepare_rename_from(
    cluster: Arc<Cluster>,
    _conn: Arc<Connection>,
    cmdline: CmdLine,
) -> ClusterResult<Reply> {
    check_arity(&cmdline, 4)?;
    let id = arg(&cmdline, 1);
    let src = cmdline[3].clone();
    let sub = if arg(&cmdline, 2).eq_ignore_ascii_case("copy") {
        vec![Bytes::from_static(b"EXISTS"), src.clone()]
    } else {
        vec![Bytes::from_static(b"DEL"), src.clone()]
    };

    let manager = cluster.tx_manager();
    manager.prepare(&id, sub, false).await?;

    let key = String::from_utf8_lossy(&src);
    match cluster.store().get_entity(&key) {
        Some(value) => Ok(Reply::Array(vec![
            Reply::bulk(value.data),
            Reply::Integer(value.expires_at.map_or(-1, |at| at as i64)),
        ])),
        None => {
            manager.rollback(&id);
            Ok(Reply::Null)
        }
    }
}

/// `cluster.preparerenameto <txid> <dst> <nx 0|1> <value> <expire_at_ms or -1>`
pub async fn prepare_rename_to(
    cluster: Arc<Cluster>,
    _conn: Arc<Connection>,
    cmdline: CmdLine,
) -> ClusterResult<Reply> {
    check_arity(&cmdline, 6)?;
    let id = arg(&cmdline, 1);
    let nx = cmdline[3].as_ref() == b"1";
    let expire_at: i64 = arg(&cmdline, 5)
        .parse()
        .map_err(|_| ShardisError::NotAnInteger)?;

    let mut sub = vec![
        Bytes::from_static(b"SET"),
        cmdline[2].clone(),
        cmdline[4].clone(),
    ];
    if expire_at >= 0 {
        sub.push(Bytes::from_static(b"PXAT"));
        sub.push(Bytes::from(expire_at.to_string()));
    }
    vote(cluster.tx_manager().prepare(&id, sub, nx).await?)
}

fn vote(prepared: bool) -> ClusterResult<Reply> {
    Ok(if prepared {
        Reply::ok()
    } else {
        Reply::Integer(0)
    })
}

// ============================================================================
// Coordinator side
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxOutcome {
    /// Every participant committed; their commit replies
    Committed(Vec<(NodeId, Reply)>),
    /// A participant refused on a precondition; nothing changed
    Vetoed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenameKind {
    Rename,
    RenameNx,
    Copy { replace: bool },
}

impl RenameKind {
    fn name(self) -> &'static str {
        match self {
            RenameKind::Rename => "rename",
            RenameKind::RenameNx => "renamenx",
            RenameKind::Copy { .. } => "copy",
        }
    }

    /// Whether the destination must not exist
    fn nx(self) -> bool {
        matches!(self, RenameKind::RenameNx | RenameKind::Copy { replace: false })
    }
}

enum Vote {
    Yes,
    Veto,
    Failed(String),
}

fn tally(node: &str, result: ClusterResult<Reply>) -> Vote {
    match result {
        Ok(reply) if reply.is_ok() => Vote::Yes,
        Ok(Reply::Integer(0)) => Vote::Veto,
        Ok(reply) => Vote::Failed(format!("{}: {}", node, reply)),
        Err(e) => Vote::Failed(format!("{}: {}", node, e)),
    }
}

fn new_tx_id() -> String {
    Uuid::new_v4().to_string()
}

/// Run `parts` (node, sub-command) as one transaction
pub async fn run(cluster: &Arc<Cluster>, parts: Vec<(NodeId, CmdLine)>) -> ClusterResult<TxOutcome> {
    let id = new_tx_id();
    let nodes: Vec<NodeId> = parts.iter().map(|(node, _)| node.clone()).collect();
    debug!("Transaction {} over {:?}", id, nodes);

    let prepares = parts.into_iter().map(|(node, sub)| {
        let mut cmd = to_cmdline(["cluster.prepare", id.as_str()]);
        cmd.extend(sub);
        async move {
            let result = cluster.call_node(&node, cmd).await;
            tally(&node, result)
        }
    });
    let votes = join_all(prepares).await;

    let mut vetoed = false;
    let mut failures = Vec::new();
    for vote in votes {
        match vote {
            Vote::Yes => {}
            Vote::Veto => vetoed = true,
            Vote::Failed(msg) => failures.push(msg),
        }
    }
    if vetoed || !failures.is_empty() {
        rollback_all(cluster, &id, &nodes).await;
        crate::metrics::record_tx("rolled_back");
        if failures.is_empty() {
            return Ok(TxOutcome::Vetoed);
        }
        return Err(ClusterError::TxError(format!(
            "prepare failed: {}",
            failures.join("; ")
        )));
    }

    commit_all(cluster, &id, &nodes).await.map(TxOutcome::Committed)
}

/// Move or copy `src` to `dst` when they live on different nodes
pub async fn run_rename(
    cluster: &Arc<Cluster>,
    kind: RenameKind,
    (src_node, src): (NodeId, Bytes),
    (dst_node, dst): (NodeId, Bytes),
) -> ClusterResult<Reply> {
    let id = new_tx_id();
    let nodes = vec![src_node.clone(), dst_node.clone()];
    let missing_src = || match kind {
        RenameKind::Copy { .. } => Ok(Reply::Integer(0)),
        _ => Err(ClusterError::from(ShardisError::KeyNotFound(
            String::from_utf8_lossy(&src).into_owned(),
        ))),
    };

    let mut cmd = to_cmdline(["cluster.preparerenamefrom", id.as_str(), kind.name()]);
    cmd.push(src.clone());
    let (value, expire_at) = match cluster.call_node(&src_node, cmd).await {
        Ok(Reply::Array(items)) => match items.as_slice() {
            [Reply::Bulk(value), Reply::Integer(at)] => (value.clone(), *at),
            _ => {
                rollback_all(cluster, &id, &nodes).await;
                return Err(ClusterError::TxError(format!(
                    "{}: malformed source value",
                    src_node
                )));
            }
        },
        Ok(Reply::Null) => return missing_src(),
        Ok(reply) => {
            rollback_all(cluster, &id, &nodes).await;
            return Err(ClusterError::TxError(format!("{}: {}", src_node, reply)));
        }
        Err(e) => {
            rollback_all(cluster, &id, &nodes).await;
            return Err(ClusterError::TxError(format!("{}: {}", src_node, e)));
        }
    };

    let mut cmd = to_cmdline(["cluster.preparerenameto", id.as_str()]);
    cmd.push(dst);
    cmd.push(Bytes::from_static(if kind.nx() { b"1" } else { b"0" }));
    cmd.push(value);
    cmd.push(Bytes::from(expire_at.to_string()));
    let result = cluster.call_node(&dst_node, cmd).await;
    match tally(&dst_node, result) {
        Vote::Yes => {}
        Vote::Veto => {
            rollback_all(cluster, &id, &nodes).await;
            crate::metrics::record_tx("rolled_back");
            return Ok(Reply::Integer(0));
        }
        Vote::Failed(msg) => {
            rollback_all(cluster, &id, &nodes).await;
            crate::metrics::record_tx("rolled_back");
            return Err(ClusterError::TxError(format!("prepare failed: {}", msg)));
        }
    }

    commit_all(cluster, &id, &nodes).await?;
    Ok(match kind {
        RenameKind::Rename => Reply::ok(),
        _ => Reply::Integer(1),
    })
}

async fn rollback_all(cluster: &Arc<Cluster>, id: &str, nodes: &[NodeId]) {
    let calls = nodes.iter().map(|node| {
        let cmd = to_cmdline(["cluster.rollback", id]);
        async move {
            if let Err(e) = cluster.call_node(node, cmd).await {
                warn!("Rollback of {} on {} failed: {}", id, node, e);
            }
        }
    });
    join_all(calls).await;
    info!("Transaction {} rolled back", id);
}

async fn commit_all(cluster: &Arc<Cluster>, id: &str, nodes: &[NodeId]) -> ClusterResult<Vec<(NodeId, Reply)>> {
    let calls = nodes.iter().map(|node| {
        let cmd = to_cmdline(["cluster.commit", id]);
        async move { (node.clone(), cluster.call_node(node, cmd).await) }
    });

    let mut replies = Vec::new();
    let mut failures = Vec::new();
    for (node, result) in join_all(calls).await {
        match result {
            Ok(reply) if reply.is_error() => failures.push(format!("{}: {}", node, reply)),
            Ok(reply) => replies.push((node, reply)),
            Err(e) => failures.push(format!("{}: {}", node, e)),
        }
    }

    if failures.is_empty() {
        crate::metrics::record_tx("committed");
        Ok(replies)
    } else {
        crate::metrics::record_tx("partial");
        Err(ClusterError::TxError(format!(
            "commit failed: {}",
            failures.join("; ")
        )))
    }
}
