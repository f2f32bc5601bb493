//! Live slot migration
//!
//! A migration task is committed through raft before any data moves. The
//! target drives the transfer: it pulls a snapshot of the task's slots from
//! the source with `cluster.export`, then the keys written meanwhile with
//! `cluster.migrationdone`, and finally asks the leader to flip routing with
//! `cluster.changeroute`. Ownership stays with the source until that flip
//! commits; a failed import is abandoned without rollback.

use super::coordinator::Cluster;
use super::fsm::{Event, MigratingTask};
use super::hash_slot::hash_slot;
use super::router::{arg, check_arity};
use super::slot_manager::SlotState;
use super::types::{ClusterError, ClusterResult, NodeId};
use crate::protocol::{CmdLine, Reply, to_cmdline};
use crate::server::Connection;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// `cluster.startmigrate <task> <source>`, sent by the leader to the target
pub async fn start_migrate(cluster: Arc<Cluster>, _conn: Arc<Connection>, cmdline: CmdLine) -> ClusterResult<Reply> {
    check_arity(&cmdline, 3)?;
    let task_id = arg(&cmdline, 1);
    let source = arg(&cmdline, 2);

    if !cluster.imports.lock().insert(task_id.clone()) {
        debug!("Import of {} already running", task_id);
        return Ok(Reply::ok());
    }
    tokio::spawn(import_worker(cluster, task_id, source));
    Ok(Reply::ok())
}

async fn import_worker(cluster: Arc<Cluster>, task_id: String, source: NodeId) {
    info!("Importing task {} from {}", task_id, source);
    let result = import(&cluster, &task_id, &source).await;
    cluster.imports.lock().remove(&task_id);
    match result {
        Ok(keys) => {
            info!("Task {} imported {} commands from {}", task_id, keys, source);
            crate::metrics::record_migration("completed");
        }
        Err(e) => {
            error!("Import of task {} from {} aborted: {}", task_id, source, e);
            crate::metrics::record_migration("failed");
        }
    }
}

async fn import(cluster: &Arc<Cluster>, task_id: &str, source: &str) -> ClusterResult<usize> {
    let task = wait_for_task(cluster, task_id).await?;
    if task.target_node != cluster.self_id {
        return Err(ClusterError::MigrationError(format!(
            "task {} targets {}, not {}",
            task_id, task.target_node, cluster.self_id
        )));
    }
    for &slot in &task.slots {
        cluster.slots.set_importing(slot);
    }
    // Leftovers of an earlier attempt may include keys deleted since
    let slots: HashSet<u16> = task.slots.iter().copied().collect();
    let stale = cluster
        .db
        .remove_keys_where(|key| slots.contains(&hash_slot(key)));
    if stale > 0 {
        debug!("Cleared {} stale keys before importing {}", stale, task_id);
    }

    let mut applied = apply_stream(cluster, source, to_cmdline(["cluster.export", task_id])).await?;
    applied += apply_stream(cluster, source, to_cmdline(["cluster.migrationdone", task_id])).await?;

    let reply = cluster
        .call_leader(to_cmdline(["cluster.changeroute", task_id]))
        .await?;
    if let Some(msg) = reply.error_message() {
        return Err(ClusterError::MigrationError(format!(
            "route change for {}: {}",
            task_id, msg
        )));
    }
    for &slot in &task.slots {
        cluster.slots.set_hosting(slot);
    }
    Ok(applied)
}

/// Apply every command the source streams back until its closing `+OK`
async fn apply_stream(cluster: &Arc<Cluster>, source: &str, cmdline: CmdLine) -> ClusterResult<usize> {
    let name = String::from_utf8_lossy(&cmdline[0]).into_owned();
    let mut rx = cluster.peers.stream(source, cmdline).await?;
    let idle = cluster.config.peer_timeout();
    let mut applied = 0;

    loop {
        let reply = match tokio::time::timeout(idle, rx.recv()).await {
            Ok(Some(reply)) => reply,
            Ok(None) => {
                return Err(ClusterError::MigrationError(format!(
                    "{} stream from {} closed early",
                    name, source
                )));
            }
            Err(_) => return Err(ClusterError::Timeout(format!("{} from {}", name, source))),
        };

        if reply.is_ok() {
            return Ok(applied);
        }
        let cmd = match reply {
            Reply::Array(_) => reply.into_cmdline(),
            other => {
                return Err(ClusterError::MigrationError(format!(
                    "{} from {}: {}",
                    name, source, other
                )));
            }
        };
        let Some(cmd) = cmd else {
            return Err(ClusterError::MigrationError(format!(
                "{} from {}: malformed command",
                name, source
            )));
        };
        let result = cluster.db.exec(&cmd).await;
        if let Some(msg) = result.error_message() {
            return Err(ClusterError::MigrationError(format!(
                "applying {} from {}: {}",
                name, source, msg
            )));
        }
        applied += 1;
    }
}

/// `cluster.export <task>`, streamed by the source
pub async fn export(cluster: Arc<Cluster>, conn: Arc<Connection>, cmdline: CmdLine) -> ClusterResult<Reply> {
    check_arity(&cmdline, 2)?;
    let task = wait_for_task(&cluster, &arg(&cmdline, 1)).await?;
    ensure_source(&cluster, &task)?;

    let mut started = Vec::with_capacity(task.slots.len());
    for &slot in &task.slots {
        // a retried export restarts from a fresh snapshot
        if cluster.slots.state(slot) == Some(SlotState::Exporting) {
            cluster.slots.set_hosting(slot);
        }
        let keys = match cluster.slots.start_exporting(slot) {
            Ok(keys) => keys,
            Err(e) => {
                reset_slots(&cluster, &started);
                return Err(e);
            }
        };
        started.push(slot);

        for key in keys {
            for cmd in cluster.db.dump_key(&key) {
                if !conn.push(Reply::from_cmdline(&cmd)) {
                    reset_slots(&cluster, &started);
                    return Err(ClusterError::MigrationError(format!(
                        "importer of {} went away",
                        task.id
                    )));
                }
            }
        }
    }
    debug!("Exported snapshot of {} slots for {}", started.len(), task.id);
    Ok(Reply::ok())
}

/// `cluster.migrationdone <task>`: stream keys touched since the snapshot
pub async fn migration_done(cluster: Arc<Cluster>, conn: Arc<Connection>, cmdline: CmdLine) -> ClusterResult<Reply> {
    check_arity(&cmdline, 2)?;
    let task = wait_for_task(&cluster, &arg(&cmdline, 1)).await?;
    ensure_source(&cluster, &task)?;

    let mut drained = 0;
    for &slot in &task.slots {
        let cmds: Vec<CmdLine> = cluster.slots.finish_exporting(slot, |dirty| {
            dirty.iter().flat_map(|key| cluster.db.dump_key(key)).collect()
        });
        drained += cmds.len();
        for cmd in cmds {
            if !conn.push(Reply::from_cmdline(&cmd)) {
                return Err(ClusterError::MigrationError(format!(
                    "importer of {} went away while draining",
                    task.id
                )));
            }
        }
    }
    debug!("Drained {} commands for {}", drained, task.id);
    Ok(Reply::ok())
}

/// `cluster.changeroute <task>`, handled by the leader
///
/// Replies once both ends of the migration have applied the route change.
pub async fn change_route(cluster: Arc<Cluster>, _conn: Arc<Connection>, cmdline: CmdLine) -> ClusterResult<Reply> {
    check_arity(&cmdline, 2)?;
    cluster.ensure_leader()?;
    let task_id = arg(&cmdline, 1);
    let Some(task) = cluster.fsm.get_migrating_task(&task_id) else {
        debug!("Task {} already finished", task_id);
        return Ok(Reply::ok());
    };

    let index = cluster
        .propose(Event::FinishMigrate {
            task_id: task_id.clone(),
        })
        .await?;
    let deadline = Instant::now() + cluster.config.migration_wait();
    for node in [&task.src_node, &task.target_node] {
        wait_node_applied(&cluster, node, index, deadline).await?;
    }
    info!(
        "Routing for task {} moved {} slots from {} to {}",
        task_id,
        task.slots.len(),
        task.src_node,
        task.target_node
    );
    Ok(Reply::ok())
}

async fn wait_node_applied(cluster: &Arc<Cluster>, node: &str, index: u64, deadline: Instant) -> ClusterResult<()> {
    let step = Duration::from_millis(cluster.config.migration_wait_step_ms);
    loop {
        match cluster
            .call_node(node, to_cmdline(["cluster.committedindex"]))
            .await
        {
            Ok(Reply::Integer(applied)) if applied >= index as i64 => return Ok(()),
            Ok(_) => {}
            Err(e) => debug!("Polling applied index of {}: {}", node, e),
        }
        if Instant::now() >= deadline {
            return Err(ClusterError::Timeout(format!(
                "{} applying index {}",
                node, index
            )));
        }
        tokio::time::sleep(step).await;
    }
}

/// React to a committed `FinishMigrate`
pub fn on_finished(cluster: &Arc<Cluster>, task: &MigratingTask) {
    if task.src_node == cluster.self_id {
        let cluster = Arc::clone(cluster);
        let task = task.clone();
        tokio::spawn(async move {
            let foreign: HashSet<u16> = cluster.fsm.with_state(|s| {
                task.slots
                    .iter()
                    .copied()
                    .filter(|slot| s.pick_node(*slot) != Some(&cluster.self_id))
                    .collect()
            });
            let removed = cluster
                .db
                .remove_keys_where(|key| foreign.contains(&hash_slot(key)));
            for slot in &foreign {
                cluster.slots.drop_slot(*slot);
            }
            info!(
                "Removed {} keys of {} migrated slots from {}",
                removed,
                foreign.len(),
                cluster.self_id
            );
        });
    } else if task.target_node == cluster.self_id {
        for &slot in &task.slots {
            cluster.slots.set_hosting(slot);
        }
    }
}

/// Forget slots a restored routing table assigns elsewhere.
///
/// Slaves keep everything (their data mirrors the master) and importing
/// slots are left to their import worker.
pub fn drop_foreign_slots(cluster: &Arc<Cluster>) {
    let foreign: HashSet<u16> = cluster.fsm.with_state(|s| {
        if s.slot2node.is_empty() || s.master_of(&cluster.self_id).is_some() {
            return HashSet::new();
        }
        cluster
            .slots
            .tracked_slots()
            .into_iter()
            .filter(|slot| s.pick_node(*slot) != Some(&cluster.self_id))
            .filter(|slot| cluster.slots.state(*slot) != Some(SlotState::Importing))
            .collect()
    });
    if foreign.is_empty() {
        return;
    }
    let removed = cluster
        .db
        .remove_keys_where(|key| foreign.contains(&hash_slot(key)));
    for slot in &foreign {
        cluster.slots.drop_slot(*slot);
    }
    info!(
        "Dropped {} keys of {} slots owned elsewhere after restore on {}",
        removed,
        foreign.len(),
        cluster.self_id
    );
}

async fn wait_for_task(cluster: &Cluster, task_id: &str) -> ClusterResult<MigratingTask> {
    cluster
        .fsm
        .wait_for(cluster.config.migration_wait(), |s| {
            s.migratings.contains_key(task_id)
        })
        .await
        .map_err(|_| ClusterError::MigrationError(format!("unknown migration task {}", task_id)))?;
    cluster
        .fsm
        .get_migrating_task(task_id)
        .ok_or_else(|| ClusterError::MigrationError(format!("migration task {} finished", task_id)))
}

fn ensure_source(cluster: &Cluster, task: &MigratingTask) -> ClusterResult<()> {
    if task.src_node != cluster.self_id {
        return Err(ClusterError::MigrationError(format!(
            "task {} exports from {}, not {}",
            task.id, task.src_node, cluster.self_id
        )));
    }
    Ok(())
}

fn reset_slots(cluster: &Cluster, slots: &[u16]) {
    warn!("Resetting {} exporting slots", slots.len());
    for &slot in slots {
        cluster.slots.set_hosting(slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ClusterConfig, LocalNetwork, StartMode};
    use crate::core::{KVConfig, KVStore};
    use std::collections::HashSet;
    use tokio::sync::mpsc;

    async fn seeded(net: &LocalNetwork) -> Arc<Cluster> {
        let config = ClusterConfig {
            enabled: true,
            self_addr: "n1".to_string(),
            raft_listen_addr: "raft-n1".to_string(),
            raft_advertise_addr: "raft-n1".to_string(),
            data_dir: Default::default(),
            raft_election_timeout_ms: 150,
            raft_heartbeat_interval_ms: 30,
            migration_wait_attempts: 5,
            migration_wait_step_ms: 20,
            cron_interval_ms: 60_000,
            ..Default::default()
        };
        let transport = net.transport("n1");
        let node = Cluster::new(
            config,
            KVStore::new(KVConfig::default()),
            transport.clone(),
            transport,
            None,
        )
        .await
        .unwrap();
        net.register_cluster(&node);
        node.start().await.unwrap();
        node
    }

    async fn joined(net: &LocalNetwork, id: &str) -> Arc<Cluster> {
        let config = ClusterConfig {
            enabled: true,
            self_addr: id.to_string(),
            raft_listen_addr: format!("raft-{}", id),
            raft_advertise_addr: format!("raft-{}", id),
            start_mode: StartMode::Join,
            join_target: Some("n1".to_string()),
            data_dir: Default::default(),
            raft_election_timeout_ms: 150,
            raft_heartbeat_interval_ms: 30,
            migration_wait_attempts: 5,
            migration_wait_step_ms: 20,
            cron_interval_ms: 60_000,
            ..Default::default()
        };
        let transport = net.transport(id);
        let node = Cluster::new(
            config,
            KVStore::new(KVConfig::default()),
            transport.clone(),
            transport,
            None,
        )
        .await
        .unwrap();
        net.register_cluster(&node);
        node.start().await.unwrap();
        node
    }

    fn task(slot: u16) -> MigratingTask {
        MigratingTask {
            id: "t1".to_string(),
            src_node: "n1".to_string(),
            target_node: "n2".to_string(),
            slots: vec![slot],
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Reply>) -> HashSet<CmdLine> {
        let mut cmds = HashSet::new();
        while let Ok(reply) = rx.try_recv() {
            cmds.insert(reply.into_cmdline().unwrap());
        }
        cmds
    }

    #[tokio::test]
    async fn test_export_snapshot_then_dirty_keys() {
        let net = LocalNetwork::new();
        let node = seeded(&net).await;
        let db = node.store().clone();
        let slot = hash_slot("foo");

        db.exec(&to_cmdline(["SET", "foo", "v1", "PX", "60000"])).await;
        db.exec(&to_cmdline(["SET", "{foo}gone", "x"])).await;
        db.exec(&to_cmdline(["SET", "{foo}stays", "s"])).await;
        db.exec(&to_cmdline(["SET", "other", "o"])).await;
        let expires_at = db.get_expiration("foo").unwrap();
        node.propose(Event::StartMigrate { task: task(slot) }).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = Arc::new(Connection::internal_streaming(tx));
        let reply = export(node.clone(), conn.clone(), to_cmdline(["cluster.export", "t1"]))
            .await
            .unwrap();
        assert!(reply.is_ok());

        let at = expires_at.to_string();
        let snapshot = drain(&mut rx);
        assert_eq!(snapshot.len(), 4);
        assert!(snapshot.contains(&to_cmdline(["SET", "foo", "v1"])));
        assert!(snapshot.contains(&to_cmdline(["PEXPIREAT", "foo", at.as_str()])));
        assert!(!snapshot.iter().any(|c| c[1].as_ref() == b"other"));
        assert_eq!(node.slot_manager().state(slot), Some(SlotState::Exporting));

        // Writes while the snapshot is in flight
        db.exec(&to_cmdline(["PEXPIRE", "foo", "120000"])).await;
        db.exec(&to_cmdline(["DEL", "{foo}gone"])).await;
        db.exec(&to_cmdline(["SET", "{foo}new", "n"])).await;
        let renewed = db.get_expiration("foo").unwrap().to_string();

        let reply = migration_done(node.clone(), conn, to_cmdline(["cluster.migrationdone", "t1"]))
            .await
            .unwrap();
        assert!(reply.is_ok());

        let dirty = drain(&mut rx);
        let expected: HashSet<CmdLine> = [
            to_cmdline(["SET", "foo", "v1"]),
            to_cmdline(["PEXPIREAT", "foo", renewed.as_str()]),
            to_cmdline(["DEL", "{foo}gone"]),
            to_cmdline(["SET", "{foo}new", "n"]),
        ]
        .into_iter()
        .collect();
        assert_eq!(dirty, expected);
        assert_eq!(node.slot_manager().state(slot), Some(SlotState::Hosting));
        node.shutdown();
    }

    #[tokio::test]
    async fn test_export_rejects_foreign_and_unknown_tasks() {
        let net = LocalNetwork::new();
        let node = seeded(&net).await;
        let conn = Arc::new(Connection::internal());

        let err = export(node.clone(), conn.clone(), to_cmdline(["cluster.export", "nope"]))
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::MigrationError(_)));

        let mut foreign = task(1);
        foreign.src_node = "n3".to_string();
        node.propose(Event::StartMigrate { task: foreign }).await.unwrap();
        let err = export(node.clone(), conn, to_cmdline(["cluster.export", "t1"]))
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::MigrationError(_)));
        assert_eq!(node.slot_manager().state(1), None);
        node.shutdown();
    }

    #[tokio::test]
    async fn test_change_route_moves_slots() {
        let net = LocalNetwork::new();
        let node = seeded(&net).await;
        let slot = hash_slot("foo");
        node.store().exec(&to_cmdline(["SET", "foo", "v"])).await;

        // Only the source is polled: the target never joined this network
        let mut local = task(slot);
        local.target_node = "n1".to_string();
        node.propose(Event::StartMigrate { task: local }).await.unwrap();

        let conn = Arc::new(Connection::internal());
        let reply = change_route(node.clone(), conn.clone(), to_cmdline(["cluster.changeroute", "t1"]))
            .await
            .unwrap();
        assert!(reply.is_ok());
        assert!(node.fsm().with_state(|s| s.migratings.is_empty()));

        // Finished tasks are acknowledged again
        let reply = change_route(node.clone(), conn, to_cmdline(["cluster.changeroute", "t1"]))
            .await
            .unwrap();
        assert!(reply.is_ok());
        assert_eq!(node.owner_of("foo").unwrap(), "n1");
        node.shutdown();
    }

    #[tokio::test]
    async fn test_retried_import_drops_keys_deleted_at_source() {
        let net = LocalNetwork::new();
        let source = seeded(&net).await;
        let target = joined(&net, "n2").await;
        let slot = hash_slot("foo");

        source.store().exec(&to_cmdline(["SET", "{foo}kept", "k"])).await;
        // Left on the target by an attempt that died after copying foo,
        // which the source has deleted since
        target.store().exec(&to_cmdline(["SET", "foo", "stale"])).await;

        source.propose(Event::StartMigrate { task: task(slot) }).await.unwrap();
        let applied = import(&target, "t1", "n1").await.unwrap();
        assert_eq!(applied, 1);

        assert_eq!(target.store().exec(&to_cmdline(["GET", "foo"])).await, Reply::Null);
        assert_eq!(
            target.store().exec(&to_cmdline(["GET", "{foo}kept"])).await,
            Reply::bulk("k")
        );
        assert_eq!(target.owner_of("foo").unwrap(), "n2");
        assert_eq!(target.slot_manager().state(slot), Some(SlotState::Hosting));
        source.shutdown();
        target.shutdown();
    }
}
