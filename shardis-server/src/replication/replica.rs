use crate::cluster::{ClusterError, ClusterResult, NodeId, PeerTransport};
use crate::core::{KVStore, ShardisError};
use crate::protocol::{CmdLine, Reply, to_cmdline};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Replica side of replication: at most one upstream at a time
pub struct ReplicaLink {
    db: KVStore,
    peers: Arc<dyn PeerTransport>,
    retry: Duration,
    current: Mutex<Option<(NodeId, JoinHandle<()>)>>,
}

impl ReplicaLink {
    pub fn new(db: KVStore, peers: Arc<dyn PeerTransport>, retry: Duration) -> Self {
        Self {
            db,
            peers,
            retry,
            current: Mutex::new(None),
        }
    }

    /// Master currently replicated from
    pub fn master(&self) -> Option<NodeId> {
        self.current.lock().as_ref().map(|(master, _)| master.clone())
    }

    /// Start replicating from `master`, or stop with `None`
    pub fn point_to(&self, master: Option<NodeId>) {
        let mut current = self.current.lock();
        if current.as_ref().map(|(m, _)| m) == master.as_ref() {
            return;
        }
        if let Some((old, handle)) = current.take() {
            handle.abort();
            info!("Stopped replicating from {}", old);
        }
        if let Some(master) = master {
            info!("Replicating from {}", master);
            let handle = tokio::spawn(sync_loop(
                self.db.clone(),
                Arc::clone(&self.peers),
                master.clone(),
                self.retry,
            ));
            *current = Some((master, handle));
        }
    }
}

impl Drop for ReplicaLink {
    fn drop(&mut self) {
        if let Some((_, handle)) = self.current.get_mut().take() {
            handle.abort();
        }
    }
}

async fn sync_loop(db: KVStore, peers: Arc<dyn PeerTransport>, master: NodeId, retry: Duration) {
    loop {
        match sync_once(&db, peers.as_ref(), &master).await {
            Ok(applied) => debug!(
                "Replication stream from {} ended after {} commands",
                master, applied
            ),
            Err(e) => warn!("Replication from {} failed: {}", master, e),
        }
        tokio::time::sleep(retry).await;
    }
}

async fn sync_once(db: &KVStore, peers: &dyn PeerTransport, master: &str) -> ClusterResult<u64> {
    let mut rx = peers.stream(master, to_cmdline(["cluster.sync"])).await?;
    let mut applied = 0;

    while let Some(reply) = rx.recv().await {
        match reply {
            Reply::Array(_) => {
                let Some(cmd) = reply.into_cmdline() else {
                    continue;
                };
                let result = db.exec(&cmd).await;
                if let Some(msg) = result.error_message() {
                    warn!("Replicated command from {} failed: {}", master, msg);
                }
                applied += 1;
                crate::metrics::record_replication("applied", 1);
            }
            Reply::Error(msg) => return Err(ClusterError::Remote(msg)),
            _ => break,
        }
    }
    Ok(applied)
}

/// Parse `SLAVEOF host port`, `SLAVEOF host:port` or `SLAVEOF NO ONE`
pub fn parse_slaveof(cmdline: &CmdLine) -> Result<Option<NodeId>, ShardisError> {
    let arg = |i: usize| String::from_utf8_lossy(&cmdline[i]).into_owned();
    match cmdline.len() {
        2 => Ok(Some(arg(1))),
        3 if arg(1).eq_ignore_ascii_case("no") && arg(2).eq_ignore_ascii_case("one") => Ok(None),
        3 => Ok(Some(format!("{}:{}", arg(1), arg(2)))),
        _ => Err(ShardisError::WrongArity("slaveof".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::LocalNetwork;
    use crate::core::KVConfig;
    use crate::replication::ReplicatedStore;
    use crate::server::Database;

    #[test]
    fn test_parse_slaveof() {
        assert_eq!(
            parse_slaveof(&to_cmdline(["SLAVEOF", "10.0.0.1", "6399"])).unwrap(),
            Some("10.0.0.1:6399".to_string())
        );
        assert_eq!(
            parse_slaveof(&to_cmdline(["slaveof", "10.0.0.1:6399"])).unwrap(),
            Some("10.0.0.1:6399".to_string())
        );
        assert_eq!(parse_slaveof(&to_cmdline(["SLAVEOF", "no", "ONE"])).unwrap(), None);
        assert!(parse_slaveof(&to_cmdline(["SLAVEOF"])).is_err());
    }

    async fn eventually(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_replica_follows_master() {
        let net = LocalNetwork::new();
        let master_db = KVStore::new(KVConfig::default());
        master_db.exec(&to_cmdline(["SET", "a", "1"])).await;
        let master: Arc<dyn Database> = Arc::new(ReplicatedStore::new(
            master_db.clone(),
            net.transport("m"),
            Duration::from_millis(50),
        ));
        net.register("m", "raft-m", Arc::downgrade(&master), None);

        let replica_db = KVStore::new(KVConfig::default());
        replica_db.exec(&to_cmdline(["SET", "stale", "x"])).await;
        let link = ReplicaLink::new(replica_db.clone(), net.transport("r"), Duration::from_millis(50));
        link.point_to(Some("m".to_string()));
        assert_eq!(link.master(), Some("m".to_string()));

        assert!(eventually(|| replica_db.get_entity("a").is_some()).await);
        assert!(replica_db.get_entity("stale").is_none());

        master_db.exec(&to_cmdline(["SET", "b", "2"])).await;
        assert!(eventually(|| replica_db.get_entity("b").is_some()).await);

        link.point_to(None);
        assert_eq!(link.master(), None);
        master_db.exec(&to_cmdline(["SET", "c", "3"])).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(replica_db.get_entity("c").is_none());
    }
}
