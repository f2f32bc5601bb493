//! Command registry and key-based routing
//!
//! Multi-key commands whose keys may live on different nodes get dedicated
//! handlers (scatter/gather for reads and deletes, transactions for writes).
//! Everything else is routed whole to the single node owning its keys.

use super::coordinator::{Cluster, group_by_owner};
use super::tcc::{self, RenameKind, TxOutcome};
use super::types::{ClusterError, ClusterResult, NodeId};
use super::{failover, migration};
use crate::core::ShardisError;
use crate::core::commands::command_name;
use crate::protocol::{CmdLine, Reply};
use crate::replication;
use crate::server::Connection;
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, join_all};
use lazy_static::lazy_static;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info};

pub type Handler = Box<
    dyn Fn(Arc<Cluster>, Arc<Connection>, CmdLine) -> BoxFuture<'static, ClusterResult<Reply>>
        + Send
        + Sync,
>;

fn handler_fn<F, Fut>(f: F) -> Handler
where
    F: Fn(Arc<Cluster>, Arc<Connection>, CmdLine) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ClusterResult<Reply>> + Send + 'static,
{
    Box::new(move |cluster, conn, cmdline| f(cluster, conn, cmdline).boxed())
}

lazy_static! {
    static ref HANDLERS: HashMap<&'static str, Handler> = {
        let mut m: HashMap<&'static str, Handler> = HashMap::new();
        m.insert("del", handler_fn(sum_counts));
        m.insert("exists", handler_fn(sum_counts));
        m.insert("mget", handler_fn(mget));
        m.insert("mset", handler_fn(mset));
        m.insert("msetnx", handler_fn(mset));
        m.insert("rename", handler_fn(rename));
        m.insert("renamenx", handler_fn(rename));
        m.insert("copy", handler_fn(rename));
        m.insert("flushdb", handler_fn(flush));
        m.insert("flushall", handler_fn(flush));
        m.insert("save", handler_fn(save));
        m.insert("slaveof", handler_fn(slaveof));
        m.insert("cluster.join", handler_fn(join));
        m.insert("cluster.nodes", handler_fn(nodes));
        m.insert("cluster.committedindex", handler_fn(committed_index));
        m.insert("cluster.heartbeat", handler_fn(failover::heartbeat));
        m.insert("cluster.startmigrate", handler_fn(migration::start_migrate));
        m.insert("cluster.export", handler_fn(migration::export));
        m.insert("cluster.migrationdone", handler_fn(migration::migration_done));
        m.insert("cluster.changeroute", handler_fn(migration::change_route));
        m.insert("cluster.prepare", handler_fn(tcc::prepare));
        m.insert("cluster.commit", handler_fn(tcc::commit));
        m.insert("cluster.rollback", handler_fn(tcc::rollback));
        m.insert("cluster.preparerenamefrom", handler_fn(tcc::prepare_rename_from));
        m.insert("cluster.preparerenameto", handler_fn(tcc::prepare_rename_to));
        m.insert("cluster.sync", handler_fn(sync));
        m
    };
}

pub fn handler(name: &str) -> Option<&'static Handler> {
    HANDLERS.get(name)
}

pub(super) fn check_arity(cmdline: &CmdLine, min: usize) -> ClusterResult<()> {
    if cmdline.len() < min {
        return Err(ShardisError::WrongArity(command_name(cmdline)).into());
    }
    Ok(())
}

pub(super) fn arg(cmdline: &CmdLine, pos: usize) -> String {
    String::from_utf8_lossy(&cmdline[pos]).into_owned()
}

/// Route a command to the one node owning all of its keys
pub async fn route(cluster: Arc<Cluster>, cmdline: CmdLine) -> ClusterResult<Reply> {
    let (write_keys, read_keys) = cluster.store().related_keys(&cmdline)?;
    let owners: BTreeSet<NodeId> = write_keys
        .iter()
        .chain(read_keys.iter())
        .map(|k| cluster.owner_of(k))
        .collect::<ClusterResult<_>>()?;

    let mut owners = owners.into_iter();
    match (owners.next(), owners.next()) {
        (None, _) => Ok(cluster.store().exec(&cmdline).await),
        (Some(owner), None) => cluster.forward(&owner, cmdline).await,
        (Some(_), Some(_)) => Err(ClusterError::CrossSlot),
    }
}

/// Sub-command carrying only the arguments at `positions` (plus, for
/// key/value commands, each key's value)
fn sub_command(cmdline: &CmdLine, positions: &[usize], with_values: bool) -> CmdLine {
    let mut cmd = vec![cmdline[0].clone()];
    for &pos in positions {
        cmd.push(cmdline[pos].clone());
        if with_values {
            cmd.push(cmdline[pos + 1].clone());
        }
    }
    cmd
}

/// DEL / EXISTS: run per owner, add up the counts
async fn sum_counts(cluster: Arc<Cluster>, _conn: Arc<Connection>, cmdline: CmdLine) -> ClusterResult<Reply> {
    check_arity(&cmdline, 2)?;
    let groups = group_by_owner(&cluster, cmdline.iter().enumerate().skip(1))?;
    if groups.len() == 1 {
        if let Some(owner) = groups.keys().next() {
            return cluster.forward(owner, cmdline.clone()).await;
        }
    }

    let calls = groups.iter().map(|(node, positions)| {
        cluster.forward(node, sub_command(&cmdline, positions, false))
    });
    let mut total = 0;
    for reply in join_all(calls).await {
        let reply = reply?;
        if reply.is_error() {
            return Ok(reply);
        }
        total += reply.as_integer().unwrap_or(0);
    }
    Ok(Reply::Integer(total))
}

/// MGET: gather per owner and reassemble in request order
async fn mget(cluster: Arc<Cluster>, _conn: Arc<Connection>, cmdline: CmdLine) -> ClusterResult<Reply> {
    check_arity(&cmdline, 2)?;
    let groups = group_by_owner(&cluster, cmdline.iter().enumerate().skip(1))?;

    let calls = groups.iter().map(|(node, positions)| {
        let cluster = &cluster;
        let cmd = sub_command(&cmdline, positions, false);
        async move { (positions, cluster.forward(node, cmd).await) }
    });

    let mut values = vec![Reply::Null; cmdline.len() - 1];
    for (positions, reply) in join_all(calls).await {
        match reply? {
            Reply::Array(items) => {
                for (&pos, item) in positions.iter().zip(items) {
                    values[pos - 1] = item;
                }
            }
            err @ Reply::Error(_) => return Ok(err),
            other => {
                return Err(ClusterError::Remote(format!(
                    "ERR unexpected MGET reply: {}",
                    other
                )));
            }
        }
    }
    Ok(Reply::Array(values))
}

/// MSET / MSETNX: direct when one node owns every key, transactional otherwise
async fn mset(cluster: Arc<Cluster>, _conn: Arc<Connection>, cmdline: CmdLine) -> ClusterResult<Reply> {
    if cmdline.len() < 3 || cmdline.len() % 2 == 0 {
        return Err(ShardisError::WrongArity(command_name(&cmdline)).into());
    }
    let nx = command_name(&cmdline) == "msetnx";
    let groups = group_by_owner(&cluster, cmdline.iter().enumerate().skip(1).step_by(2))?;

    if groups.len() == 1 {
        if let Some(owner) = groups.keys().next() {
            return cluster.forward(owner, cmdline.clone()).await;
        }
    }

    let parts: Vec<(NodeId, CmdLine)> = groups
        .iter()
        .map(|(node, positions)| (node.clone(), sub_command(&cmdline, positions, true)))
        .collect();
    debug!("{} spans {} nodes", command_name(&cmdline), parts.len());

    match tcc::run(&cluster, parts).await? {
        TxOutcome::Committed(_) if nx => Ok(Reply::Integer(1)),
        TxOutcome::Committed(_) => Ok(Reply::ok()),
        TxOutcome::Vetoed => Ok(Reply::Integer(0)),
    }
}

/// RENAME / RENAMENX / COPY across two owners
async fn rename(cluster: Arc<Cluster>, _conn: Arc<Connection>, cmdline: CmdLine) -> ClusterResult<Reply> {
    cluster.store().related_keys(&cmdline)?;
    let name = command_name(&cmdline);
    let kind = match name.as_str() {
        "rename" => RenameKind::Rename,
        "renamenx" => RenameKind::RenameNx,
        _ => {
            let mut replace = false;
            for opt in &cmdline[3..] {
                if opt.eq_ignore_ascii_case(b"replace") {
                    replace = true;
                } else {
                    return Err(ShardisError::Syntax.into());
                }
            }
            RenameKind::Copy { replace }
        }
    };

    let src_owner = cluster.owner_of(&cmdline[1])?;
    let dst_owner = cluster.owner_of(&cmdline[2])?;
    if src_owner == dst_owner {
        return cluster.forward(&src_owner, cmdline).await;
    }
    tcc::run_rename(
        &cluster,
        kind,
        (src_owner, cmdline[1].clone()),
        (dst_owner, cmdline[2].clone()),
    )
    .await
}

/// FLUSHDB / FLUSHALL on every master
async fn flush(cluster: Arc<Cluster>, _conn: Arc<Connection>, cmdline: CmdLine) -> ClusterResult<Reply> {
    let masters = cluster.fsm().with_state(|s| s.masters());
    let calls = masters
        .iter()
        .map(|node| cluster.forward(node, cmdline.clone()));
    for reply in join_all(calls).await {
        let reply = reply?;
        if reply.is_error() {
            return Ok(reply);
        }
    }
    Ok(Reply::ok())
}

async fn save(cluster: Arc<Cluster>, _conn: Arc<Connection>, cmdline: CmdLine) -> ClusterResult<Reply> {
    Ok(cluster.store().exec_with_lock(&cmdline))
}

/// `SLAVEOF host:port`, `SLAVEOF host port` or `SLAVEOF NO ONE`
async fn slaveof(cluster: Arc<Cluster>, _conn: Arc<Connection>, cmdline: CmdLine) -> ClusterResult<Reply> {
    let master = replication::parse_slaveof(&cmdline)?;
    info!("SLAVEOF {:?} on {}", master, cluster.id());
    cluster.replication.point_to(master);
    Ok(Reply::ok())
}

/// `cluster.join <id> <raft_addr> [master]`, served by the leader
async fn join(cluster: Arc<Cluster>, _conn: Arc<Connection>, cmdline: CmdLine) -> ClusterResult<Reply> {
    check_arity(&cmdline, 3)?;
    cluster.ensure_leader()?;
    let node = arg(&cmdline, 1);
    let raft_addr = arg(&cmdline, 2);
    let master = (cmdline.len() > 3).then(|| arg(&cmdline, 3));

    info!("Node {} ({}) joining, master: {:?}", node, raft_addr, master);
    cluster.raft().add_voter(node.clone(), raft_addr).await?;

    if !cluster.fsm().with_state(|s| s.nodes.contains(&node)) {
        cluster
            .propose(super::fsm::Event::Join { node, master })
            .await?;
    }
    Ok(Reply::ok())
}

async fn nodes(cluster: Arc<Cluster>, _conn: Arc<Connection>, _cmdline: CmdLine) -> ClusterResult<Reply> {
    Ok(Reply::bulk(cluster.describe()))
}

async fn committed_index(cluster: Arc<Cluster>, _conn: Arc<Connection>, _cmdline: CmdLine) -> ClusterResult<Reply> {
    Ok(Reply::Integer(cluster.raft().applied_index() as i64))
}

/// `cluster.sync`: full dump followed by the live write feed
async fn sync(cluster: Arc<Cluster>, conn: Arc<Connection>, _cmdline: CmdLine) -> ClusterResult<Reply> {
    Ok(replication::serve_sync(cluster.store(), &conn, cluster.shutdown.subscribe()).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::to_cmdline;

    #[test]
    fn test_registry_covers_cluster_commands() {
        for name in [
            "cluster.join",
            "cluster.startmigrate",
            "cluster.export",
            "cluster.migrationdone",
            "cluster.changeroute",
            "cluster.heartbeat",
            "cluster.committedindex",
            "cluster.prepare",
            "cluster.commit",
            "cluster.rollback",
            "cluster.preparerenamefrom",
            "cluster.preparerenameto",
            "cluster.sync",
            "cluster.nodes",
            "slaveof",
        ] {
            assert!(handler(name).is_some(), "missing handler for {}", name);
        }
        assert!(handler("get").is_none());
    }

    #[test]
    fn test_sub_command() {
        let cmd = to_cmdline(["MSET", "a", "1", "b", "2", "c", "3"]);
        assert_eq!(sub_command(&cmd, &[1, 5], true), to_cmdline(["MSET", "a", "1", "c", "3"]));

        let cmd = to_cmdline(["DEL", "a", "b", "c"]);
        assert_eq!(sub_command(&cmd, &[2], false), to_cmdline(["DEL", "b"]));
    }
}
