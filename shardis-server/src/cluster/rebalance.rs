//! Slot rebalancing, run by the leader
//!
//! Every master should own `TOTAL_SLOTS / masters` slots, with the remainder
//! going to the masters that currently hold the most. Masters above their
//! target give slots from the tail of their list to masters below it.

use super::coordinator::Cluster;
use super::fsm::{Event, FsmState, MigratingTask};
use super::types::{ClusterResult, NodeId, TOTAL_SLOTS};
use crate::protocol::to_cmdline;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Migration tasks that bring every master to within one slot of average
pub fn plan(state: &FsmState) -> Vec<MigratingTask> {
    let masters = state.masters();
    if masters.is_empty() || state.slot2node.is_empty() {
        return Vec::new();
    }

    let mut holders: Vec<(NodeId, usize)> = masters
        .into_iter()
        .map(|m| {
            let count = state.slots_of(&m).len();
            (m, count)
        })
        .collect();
    holders.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    let base = usize::from(TOTAL_SLOTS) / holders.len();
    let extra = usize::from(TOTAL_SLOTS) % holders.len();

    let mut exporters: Vec<(NodeId, Vec<u16>)> = Vec::new();
    let mut importers: Vec<(NodeId, usize)> = Vec::new();
    for (i, (node, count)) in holders.iter().enumerate() {
        let target = base + usize::from(i < extra);
        if *count > target {
            exporters.push((node.clone(), state.slots_of(node)[target..].to_vec()));
        } else if *count < target {
            importers.push((node.clone(), target - count));
        }
    }

    let mut moves: BTreeMap<(NodeId, NodeId), Vec<u16>> = BTreeMap::new();
    let mut exporters = exporters.into_iter();
    let mut current = exporters.next();
    for (dst, mut need) in importers {
        while need > 0 {
            let Some((src, surplus)) = current.as_mut() else {
                break;
            };
            let take = need.min(surplus.len());
            let moved = surplus.split_off(surplus.len() - take);
            moves
                .entry((src.clone(), dst.clone()))
                .or_default()
                .extend(moved);
            need -= take;
            if surplus.is_empty() {
                current = exporters.next();
            }
        }
    }

    moves
        .into_iter()
        .map(|((src_node, target_node), mut slots)| {
            slots.sort_unstable();
            MigratingTask {
                id: Uuid::new_v4().to_string(),
                src_node,
                target_node,
                slots,
            }
        })
        .collect()
}

/// One rebalance round: re-kick stalled tasks, or plan and start new ones
pub async fn run(cluster: &Arc<Cluster>) -> ClusterResult<()> {
    let (seeded, failing_over, pending) = cluster.fsm.with_state(|s| {
        (
            !s.slot2node.is_empty(),
            !s.failovers.is_empty(),
            s.migratings.values().cloned().collect::<Vec<_>>(),
        )
    });
    if !seeded || failing_over {
        return Ok(());
    }

    if !pending.is_empty() {
        cluster
            .migration_kicks
            .lock()
            .retain(|id, _| pending.iter().any(|t| &t.id == id));
        let stale_after = cluster.config.node_timeout() * 2;
        for task in pending {
            let stale = cluster
                .migration_kicks
                .lock()
                .get(&task.id)
                .is_none_or(|at| at.elapsed() >= stale_after);
            if stale {
                debug!("Re-starting migration task {}", task.id);
                kick(cluster, &task).await;
            }
        }
        return Ok(());
    }

    let state = cluster.fsm.state();
    if let Some(silent) = state.masters().into_iter().find(|m| !is_alive(cluster, m)) {
        debug!("Not rebalancing while {} is silent", silent);
        return Ok(());
    }

    for task in plan(&state) {
        info!(
            "Migrating {} slots from {} to {} as task {}",
            task.slots.len(),
            task.src_node,
            task.target_node,
            task.id
        );
        cluster
            .propose(Event::StartMigrate { task: task.clone() })
            .await?;
        kick(cluster, &task).await;
    }
    Ok(())
}

fn is_alive(cluster: &Cluster, node: &str) -> bool {
    if node == cluster.self_id {
        return true;
    }
    let timeout = cluster.config.node_timeout();
    cluster
        .heartbeats
        .lock()
        .get(node)
        .is_some_and(|at| at.elapsed() <= timeout)
}

/// Ask the target to start importing
async fn kick(cluster: &Arc<Cluster>, task: &MigratingTask) {
    cluster
        .migration_kicks
        .lock()
        .insert(task.id.clone(), Instant::now());
    let cmd = to_cmdline([
        "cluster.startmigrate",
        task.id.as_str(),
        task.src_node.as_str(),
    ]);
    match cluster.call_node(&task.target_node, cmd).await {
        Ok(reply) if reply.is_error() => {
            warn!("{} refused task {}: {}", task.target_node, task.id, reply)
        }
        Ok(_) => {}
        Err(e) => warn!("Starting task {} on {} failed: {}", task.id, task.target_node, e),
    }
}
