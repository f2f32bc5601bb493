//! In-process network for multi-node tests and simulation
//!
//! Nodes register their command handler and raft node under their ids. Each
//! node talks through its own [`LocalTransport`] so that isolating a node cuts
//! traffic in both directions.

use super::coordinator::Cluster;
use super::peer::PeerTransport;
use super::raft::{RaftNode, RaftRequest, RaftResponse, RaftTransport};
use super::types::{ClusterError, ClusterResult, NodeId};
use crate::protocol::{CmdLine, Reply};
use crate::core::commands::command_name;
use crate::server::{Connection, Database};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;

struct LocalNode {
    db: Weak<dyn Database>,
    raft: Option<Weak<RaftNode>>,
}

#[derive(Default)]
struct NetState {
    nodes: HashMap<NodeId, LocalNode>,
    /// raft address -> node id
    raft_addrs: HashMap<String, NodeId>,
    isolated: HashSet<NodeId>,
    /// (node, command name) pairs that fail when sent to that node
    faults: HashSet<(NodeId, String)>,
}

/// Shared in-process network
#[derive(Clone, Default)]
pub struct LocalNetwork {
    state: Arc<RwLock<NetState>>,
    timeout: Option<Duration>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail calls that take longer than `timeout`
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Transport used by node `id` for both peer commands and raft
    pub fn transport(&self, id: &str) -> Arc<LocalTransport> {
        Arc::new(LocalTransport {
            net: self.clone(),
            from: id.to_string(),
        })
    }

    pub fn register(&self, id: &str, raft_addr: &str, db: Weak<dyn Database>, raft: Option<Weak<RaftNode>>) {
        let mut state = self.state.write();
        state.nodes.insert(id.to_string(), LocalNode { db, raft });
        state.raft_addrs.insert(raft_addr.to_string(), id.to_string());
    }

    /// Register a cluster node under its id and raft address
    pub fn register_cluster(&self, cluster: &Arc<Cluster>) {
        let db: Weak<dyn Database> = Arc::downgrade(cluster) as Weak<dyn Database>;
        self.register(
            cluster.id(),
            &cluster.config().raft_advertise_addr,
            db,
            Some(Arc::downgrade(cluster.raft())),
        );
    }

    /// Cut every message to and from `id`
    pub fn isolate(&self, id: &str) {
        self.state.write().isolated.insert(id.to_string());
    }

    pub fn heal(&self, id: &str) {
        self.state.write().isolated.remove(id);
    }

    /// Make every `command` sent to `id` fail with a network error
    pub fn fail_on(&self, id: &str, command: &str) {
        self.state
            .write()
            .faults
            .insert((id.to_string(), command.to_lowercase()));
    }

    pub fn clear_faults(&self) {
        self.state.write().faults.clear();
    }

    fn reachable(&self, from: &str, to: &str) -> ClusterResult<()> {
        let state = self.state.read();
        if state.isolated.contains(from) || state.isolated.contains(to) {
            return Err(ClusterError::NetworkError(format!(
                "{} unreachable from {}",
                to, from
            )));
        }
        Ok(())
    }

    fn database(&self, from: &str, to: &str, cmdline: &CmdLine) -> ClusterResult<Arc<dyn Database>> {
        self.reachable(from, to)?;
        let state = self.state.read();
        let name = command_name(cmdline);
        if state.faults.contains(&(to.to_string(), name.clone())) {
            return Err(ClusterError::NetworkError(format!(
                "injected failure: {} on {}",
                name, to
            )));
        }
        state
            .nodes
            .get(to)
            .and_then(|n| n.db.upgrade())
            .ok_or_else(|| ClusterError::NetworkError(format!("unknown peer {}", to)))
    }

    fn raft_node(&self, from: &str, raft_addr: &str) -> ClusterResult<Arc<RaftNode>> {
        let to = self
            .state
            .read()
            .raft_addrs
            .get(raft_addr)
            .cloned()
            .ok_or_else(|| ClusterError::NetworkError(format!("unknown raft peer {}", raft_addr)))?;
        self.reachable(from, &to)?;
        self.state
            .read()
            .nodes
            .get(&to)
            .and_then(|n| n.raft.as_ref())
            .and_then(Weak::upgrade)
            .ok_or_else(|| ClusterError::NetworkError(format!("raft peer {} is down", raft_addr)))
    }
}

/// One node's view of a [`LocalNetwork`]
pub struct LocalTransport {
    net: LocalNetwork,
    from: NodeId,
}

impl PeerTransport for LocalTransport {
    fn call(&self, peer: &str, cmdline: CmdLine) -> BoxFuture<'static, ClusterResult<Reply>> {
        let db = self.net.database(&self.from, peer, &cmdline);
        let timeout = self.net.timeout;
        let peer = peer.to_string();
        async move {
            let db = db?;
            let fut = db.exec(Arc::new(Connection::internal()), cmdline);
            match timeout {
                Some(t) => tokio::time::timeout(t, fut)
                    .await
                    .map_err(|_| ClusterError::Timeout(format!("call to {}", peer))),
                None => Ok(fut.await),
            }
        }
        .boxed()
    }

    fn stream(
        &self,
        peer: &str,
        cmdline: CmdLine,
    ) -> BoxFuture<'static, ClusterResult<mpsc::UnboundedReceiver<Reply>>> {
        let db = self.net.database(&self.from, peer, &cmdline);
        async move {
            let db = db?;
            let (tx, rx) = mpsc::unbounded_channel();
            let conn = Arc::new(Connection::internal_streaming(tx.clone()));
            tokio::spawn(async move {
                let reply = db.exec(conn, cmdline).await;
                let _ = tx.send(reply);
            });
            Ok(rx)
        }
        .boxed()
    }
}

impl RaftTransport for LocalTransport {
    fn send(&self, target: &str, request: RaftRequest) -> BoxFuture<'static, ClusterResult<RaftResponse>> {
        let node = self.net.raft_node(&self.from, target);
        async move { Ok(node?.handle(request).await) }.boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{KVConfig, KVStore};
    use crate::protocol::to_cmdline;

    #[tokio::test]
    async fn test_call_isolation_and_faults() {
        let net = LocalNetwork::new();
        let store: Arc<dyn Database> = Arc::new(KVStore::new(KVConfig::default()));
        net.register("b", "raft-b", Arc::downgrade(&store), None);
        let a = net.transport("a");

        let reply = a.call("b", to_cmdline(["SET", "k", "v"])).await.unwrap();
        assert!(reply.is_ok());

        net.fail_on("b", "GET");
        assert!(a.call("b", to_cmdline(["GET", "k"])).await.is_err());
        net.clear_faults();
        assert_eq!(
            a.call("b", to_cmdline(["GET", "k"])).await.unwrap(),
            Reply::bulk("v")
        );

        net.isolate("a");
        assert!(a.call("b", to_cmdline(["GET", "k"])).await.is_err());
        net.heal("a");
        assert!(a.call("b", to_cmdline(["GET", "k"])).await.is_ok());
        assert!(a.call("c", to_cmdline(["GET", "k"])).await.is_err());
    }

    #[tokio::test]
    async fn test_stream_ends_with_final_reply() {
        let net = LocalNetwork::new();
        let store: Arc<dyn Database> = Arc::new(KVStore::new(KVConfig::default()));
        net.register("b", "raft-b", Arc::downgrade(&store), None);

        let mut rx = net
            .transport("a")
            .stream("b", to_cmdline(["PING"]))
            .await
            .unwrap();
        assert_eq!(rx.recv().await, Some(Reply::Status("PONG".into())));
    }
}
