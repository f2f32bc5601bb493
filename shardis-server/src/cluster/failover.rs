//! Master failure detection and slave promotion
//!
//! Followers heartbeat the leader, which promotes the first live slave of any
//! master silent for longer than the node timeout. Nodes re-point their own
//! replication when they see the committed topology change.

use super::coordinator::Cluster;
use super::fsm::{Event, FailoverTask};
use super::router::{arg, check_arity};
use super::types::{ClusterError, ClusterResult, NodeId};
use crate::protocol::{CmdLine, Reply, to_cmdline};
use crate::server::Connection;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// `cluster.heartbeat <id>`, served by the leader
pub async fn heartbeat(cluster: Arc<Cluster>, _conn: Arc<Connection>, cmdline: CmdLine) -> ClusterResult<Reply> {
    check_arity(&cmdline, 2)?;
    cluster.ensure_leader()?;
    cluster
        .heartbeats
        .lock()
        .insert(arg(&cmdline, 1), Instant::now());
    Ok(Reply::ok())
}

/// Finish interrupted failovers, then promote slaves of silent masters.
///
/// A failover that cannot finish is logged and left pending; the others
/// still run.
pub async fn check(cluster: &Arc<Cluster>) -> ClusterResult<()> {
    let (masters, pending) = cluster.fsm.with_state(|s| {
        let masters: Vec<(NodeId, Vec<NodeId>)> = s
            .masters()
            .into_iter()
            .map(|m| {
                let slaves = s.slaves_of(&m);
                (m, slaves)
            })
            .collect();
        (masters, s.failovers.values().cloned().collect::<Vec<_>>())
    });

    if !pending.is_empty() {
        for task in pending {
            info!("Resuming failover {} of {}", task.id, task.old_master_id);
            if let Err(e) = complete(cluster, &task).await {
                error!("Failover {} of {} stalled: {}", task.id, task.old_master_id, e);
                crate::metrics::record_failover("failed");
            }
        }
        return Ok(());
    }

    let timeout = cluster.config.node_timeout();
    let now = Instant::now();
    let mut promotions = Vec::new();
    {
        let mut heartbeats = cluster.heartbeats.lock();
        for (master, slaves) in &masters {
            if *master == cluster.self_id {
                continue;
            }
            // a master never heard from gets a full timeout from now
            let last = *heartbeats.entry(master.clone()).or_insert(now);
            if now.duration_since(last) <= timeout {
                continue;
            }
            let live = slaves.iter().find(|slave| {
                **slave == cluster.self_id
                    || heartbeats
                        .get(*slave)
                        .is_some_and(|at| now.duration_since(*at) <= timeout)
            });
            match live {
                Some(slave) => promotions.push(FailoverTask {
                    id: Uuid::new_v4().to_string(),
                    old_master_id: master.clone(),
                    new_master_id: slave.clone(),
                }),
                None => debug!("Master {} is silent and has no live slave", master),
            }
        }
    }

    for task in promotions {
        warn!(
            "Master {} silent for over {:?}, promoting {}",
            task.old_master_id, timeout, task.new_master_id
        );
        let result = match cluster
            .propose(Event::StartFailover { task: task.clone() })
            .await
        {
            Ok(_) => complete(cluster, &task).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            error!("Promotion of {} failed: {}", task.new_master_id, e);
            crate::metrics::record_failover("failed");
        }
    }
    Ok(())
}

async fn complete(cluster: &Arc<Cluster>, task: &FailoverTask) -> ClusterResult<()> {
    if !cluster.fsm.with_state(|s| s.nodes.contains(&task.new_master_id)) {
        return Err(ClusterError::NodeNotFound(task.new_master_id.clone()));
    }
    let cmd = to_cmdline(["SLAVEOF", "NO", "ONE"]);
    match cluster.call_node(&task.new_master_id, cmd).await {
        Ok(reply) if reply.is_error() => {
            warn!("{} refused SLAVEOF NO ONE: {}", task.new_master_id, reply)
        }
        Ok(_) => {}
        // the node also stops replicating once it sees the committed topology
        Err(e) => warn!("SLAVEOF NO ONE to {} failed: {}", task.new_master_id, e),
    }

    cluster
        .propose(Event::FinishFailover {
            task_id: task.id.clone(),
        })
        .await?;
    cluster
        .heartbeats
        .lock()
        .insert(task.new_master_id.clone(), Instant::now());
    crate::metrics::record_failover("completed");
    info!(
        "Failover {} done: {} replaces {}",
        task.id, task.new_master_id, task.old_master_id
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ClusterConfig, LocalNetwork};
    use crate::core::{KVConfig, KVStore};
    use std::time::Duration;

    fn config() -> ClusterConfig {
        ClusterConfig {
            enabled: true,
            self_addr: "n1".to_string(),
            raft_listen_addr: "raft-n1".to_string(),
            raft_advertise_addr: "raft-n1".to_string(),
            data_dir: Default::default(),
            raft_election_timeout_ms: 150,
            raft_heartbeat_interval_ms: 30,
            cron_interval_ms: 60_000,
            node_timeout_ms: 200,
            ..Default::default()
        }
    }

    async fn node(net: &LocalNetwork) -> Arc<Cluster> {
        let transport = net.transport("n1");
        let node = Cluster::new(
            config(),
            KVStore::new(KVConfig::default()),
            transport.clone(),
            transport,
            None,
        )
        .await
        .unwrap();
        net.register_cluster(&node);
        node
    }

    /// n1 seeds, n2 is a master and n3 its slave
    async fn with_slave(net: &LocalNetwork) -> Arc<Cluster> {
        let node = node(net).await;
        node.start().await.unwrap();
        for (id, master) in [("n2", None), ("n3", Some("n2".to_string()))] {
            node.propose(Event::Join {
                node: id.to_string(),
                master,
            })
            .await
            .unwrap();
        }
        node
    }

    fn ago(ms: u64) -> Instant {
        Instant::now().checked_sub(Duration::from_millis(ms)).unwrap()
    }

    #[tokio::test]
    async fn test_heartbeat_needs_leader() {
        let net = LocalNetwork::new();
        let node = node(&net).await;
        let err = heartbeat(
            node.clone(),
            Arc::new(Connection::internal()),
            to_cmdline(["cluster.heartbeat", "n2"]),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ClusterError::NotLeader(_)));
    }

    #[tokio::test]
    async fn test_silent_master_promotes_live_slave() {
        let net = LocalNetwork::new();
        let node = with_slave(&net).await;

        // First sighting starts the clock
        check(&node).await.unwrap();
        assert_eq!(node.fsm().master_of("n3").as_deref(), Some("n2"));

        node.heartbeats.lock().insert("n2".to_string(), ago(1000));
        node.heartbeats.lock().insert("n3".to_string(), Instant::now());
        check(&node).await.unwrap();

        node.fsm().with_state(|s| {
            assert!(s.failovers.is_empty());
            assert_eq!(s.masters(), vec!["n1".to_string(), "n3".to_string()]);
            assert_eq!(s.master_of("n2").map(String::as_str), Some("n3"));
            assert_eq!(s.slaves_of("n3"), vec!["n2".to_string()]);
        });
        node.shutdown();
    }

    #[tokio::test]
    async fn test_no_promotion_without_live_slave() {
        let net = LocalNetwork::new();
        let node = with_slave(&net).await;

        node.heartbeats.lock().insert("n2".to_string(), ago(1000));
        node.heartbeats.lock().insert("n3".to_string(), ago(1000));
        check(&node).await.unwrap();

        assert_eq!(node.fsm().master_of("n3").as_deref(), Some("n2"));
        assert!(node.fsm().with_state(|s| s.failovers.is_empty()));
        node.shutdown();
    }

    #[tokio::test]
    async fn test_pending_failover_is_resumed() {
        let net = LocalNetwork::new();
        let node = with_slave(&net).await;

        let task = FailoverTask {
            id: "f1".to_string(),
            old_master_id: "n2".to_string(),
            new_master_id: "n3".to_string(),
        };
        node.propose(Event::StartFailover { task }).await.unwrap();
        check(&node).await.unwrap();

        assert!(node.fsm().with_state(|s| s.failovers.is_empty()));
        assert_eq!(node.fsm().master_of("n2").as_deref(), Some("n3"));
        node.shutdown();
    }

    #[tokio::test]
    async fn test_stalled_failover_does_not_block_others() {
        let net = LocalNetwork::new();
        let node = with_slave(&net).await;

        for (id, old, new) in [("f0", "n1", "ghost"), ("f1", "n2", "n3")] {
            let task = FailoverTask {
                id: id.to_string(),
                old_master_id: old.to_string(),
                new_master_id: new.to_string(),
            };
            node.propose(Event::StartFailover { task }).await.unwrap();
        }
        check(&node).await.unwrap();

        node.fsm().with_state(|s| {
            assert!(s.failovers.contains_key("f0"));
            assert!(!s.failovers.contains_key("f1"));
            assert_eq!(s.master_of("n2").map(String::as_str), Some("n3"));
        });
        node.shutdown();
    }
}
