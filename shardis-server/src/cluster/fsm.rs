//! Replicated cluster state machine
//!
//! Holds slot routing, in-flight migration and failover tasks and the
//! master/slave topology. Only committed raft entries advance it, through
//! [`Fsm::apply`] and [`Fsm::mark_applied`]; everything else reads.

use super::hash_slot::hash_slot;
use super::types::{ClusterError, ClusterResult, NodeId, TOTAL_SLOTS};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Slots moving from one master to another
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigratingTask {
    pub id: String,
    pub src_node: NodeId,
    pub target_node: NodeId,
    pub slots: Vec<u16>,
}

/// A slave taking over from its master
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailoverTask {
    pub id: String,
    pub old_master_id: NodeId,
    pub new_master_id: NodeId,
}

/// Log entry payload understood by the FSM
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    SeedStart { node: NodeId },
    Join { node: NodeId, master: Option<NodeId> },
    StartMigrate { task: MigratingTask },
    FinishMigrate { task_id: String },
    StartFailover { task: FailoverTask },
    FinishFailover { task_id: String },
}

/// What an applied entry changed, handed to observers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsmChange {
    Seeded(NodeId),
    Joined { node: NodeId, master: Option<NodeId> },
    MigrationStarted(MigratingTask),
    MigrationFinished(MigratingTask),
    FailoverStarted(FailoverTask),
    FailoverFinished(FailoverTask),
    /// Whole state replaced from a snapshot
    Restored,
}

type Observer = Box<dyn Fn(&FsmState, &FsmChange) + Send + Sync>;

/// Serializable cluster state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsmState {
    /// Owned slots per master, ascending
    pub node2slot: BTreeMap<NodeId, Vec<u16>>,
    pub slot2node: BTreeMap<u16, NodeId>,
    pub migratings: BTreeMap<String, MigratingTask>,
    pub failovers: BTreeMap<String, FailoverTask>,
    pub master_slaves: BTreeMap<NodeId, BTreeSet<NodeId>>,
    pub slave_master: BTreeMap<NodeId, NodeId>,
    pub nodes: BTreeSet<NodeId>,
    pub applied_index: u64,
}

impl FsmState {
    /// Owner of a slot
    pub fn pick_node(&self, slot: u16) -> Option<&NodeId> {
        self.slot2node.get(&slot)
    }

    /// Nodes that are not replicating from anyone
    pub fn masters(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|n| !self.slave_master.contains_key(*n))
            .cloned()
            .collect()
    }

    pub fn master_of(&self, node: &str) -> Option<&NodeId> {
        self.slave_master.get(node)
    }

    pub fn slaves_of(&self, node: &str) -> Vec<NodeId> {
        self.master_slaves
            .get(node)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn slots_of(&self, node: &str) -> &[u16] {
        self.node2slot.get(node).map(Vec::as_slice).unwrap_or(&[])
    }

    /// `slot2node` and `node2slot` describe the same assignment
    pub fn routing_consistent(&self) -> bool {
        let forward = self
            .slot2node
            .iter()
            .all(|(slot, node)| self.slots_of(node).binary_search(slot).is_ok());
        let backward = self.node2slot.iter().all(|(node, slots)| {
            slots
                .iter()
                .all(|slot| self.slot2node.get(slot) == Some(node))
        });
        forward && backward
    }

    fn apply(&mut self, event: Event) -> Option<FsmChange> {
        match event {
            Event::SeedStart { node } => {
                if !self.slot2node.is_empty() {
                    warn!("Ignoring seed of {}: slots already assigned", node);
                    return None;
                }
                self.nodes.insert(node.clone());
                let all: Vec<u16> = (0..TOTAL_SLOTS).collect();
                for &slot in &all {
                    self.slot2node.insert(slot, node.clone());
                }
                self.node2slot.insert(node.clone(), all);
                Some(FsmChange::Seeded(node))
            }
            Event::Join { node, master } => {
                self.nodes.insert(node.clone());
                match &master {
                    Some(m) => {
                        self.slave_master.insert(node.clone(), m.clone());
                        self.master_slaves
                            .entry(m.clone())
                            .or_default()
                            .insert(node.clone());
                    }
                    None => {
                        self.node2slot.entry(node.clone()).or_default();
                    }
                }
                Some(FsmChange::Joined { node, master })
            }
            Event::StartMigrate { task } => {
                if self.migratings.contains_key(&task.id) {
                    return None;
                }
                self.migratings.insert(task.id.clone(), task.clone());
                Some(FsmChange::MigrationStarted(task))
            }
            Event::FinishMigrate { task_id } => {
                let task = self.migratings.remove(&task_id)?;
                self.move_slots(&task);
                Some(FsmChange::MigrationFinished(task))
            }
            Event::StartFailover { task } => {
                if self.failovers.contains_key(&task.id) {
                    return None;
                }
                self.failovers.insert(task.id.clone(), task.clone());
                Some(FsmChange::FailoverStarted(task))
            }
            Event::FinishFailover { task_id } => {
                let task = self.failovers.remove(&task_id)?;
                self.swap_master(&task);
                Some(FsmChange::FailoverFinished(task))
            }
        }
    }

    fn move_slots(&mut self, task: &MigratingTask) {
        let moving: BTreeSet<u16> = task
            .slots
            .iter()
            .copied()
            .filter(|slot| self.slot2node.get(slot) == Some(&task.src_node))
            .collect();

        if let Some(src) = self.node2slot.get_mut(&task.src_node) {
            src.retain(|slot| !moving.contains(slot));
        }
        let target = self.node2slot.entry(task.target_node.clone()).or_default();
        target.extend(moving.iter().copied());
        target.sort_unstable();
        target.dedup();

        for slot in moving {
            self.slot2node.insert(slot, task.target_node.clone());
        }
    }

    fn swap_master(&mut self, task: &FailoverTask) {
        let old = &task.old_master_id;
        let new = &task.new_master_id;

        let slots = self.node2slot.remove(old).unwrap_or_default();
        for &slot in &slots {
            self.slot2node.insert(slot, new.clone());
        }
        let merged = self.node2slot.entry(new.clone()).or_default();
        merged.extend(slots);
        merged.sort_unstable();
        merged.dedup();

        let mut slaves = self.master_slaves.remove(old).unwrap_or_default();
        slaves.remove(new);
        self.slave_master.remove(new);
        for slave in &slaves {
            self.slave_master.insert(slave.clone(), new.clone());
        }
        slaves.insert(old.clone());
        self.slave_master.insert(old.clone(), new.clone());
        self.master_slaves.insert(new.clone(), slaves);
    }
}

/// Cluster state machine shared by all cluster components
pub struct Fsm {
    state: RwLock<FsmState>,
    observers: RwLock<Vec<Observer>>,
    applied_tx: watch::Sender<u64>,
}

impl Default for Fsm {
    fn default() -> Self {
        Self::new()
    }
}

impl Fsm {
    pub fn new() -> Self {
        let (applied_tx, _) = watch::channel(0);
        Self {
            state: RwLock::new(FsmState::default()),
            observers: RwLock::new(Vec::new()),
            applied_tx,
        }
    }

    /// Register a callback run after every change while the state lock is
    /// still held. Callbacks must not block.
    pub fn add_observer(&self, observer: impl Fn(&FsmState, &FsmChange) + Send + Sync + 'static) {
        self.observers.write().push(Box::new(observer));
    }

    /// Read the state under the lock
    pub fn with_state<R>(&self, f: impl FnOnce(&FsmState) -> R) -> R {
        f(&self.state.read())
    }

    pub fn state(&self) -> FsmState {
        self.state.read().clone()
    }

    pub fn applied_index(&self) -> u64 {
        self.state.read().applied_index
    }

    pub fn pick_node(&self, slot: u16) -> Option<NodeId> {
        self.state.read().pick_node(slot).cloned()
    }

    pub fn owner_of_key(&self, key: &str) -> Option<NodeId> {
        self.pick_node(hash_slot(key))
    }

    pub fn get_migrating_task(&self, id: &str) -> Option<MigratingTask> {
        self.state.read().migratings.get(id).cloned()
    }

    pub fn get_failover_task(&self, id: &str) -> Option<FailoverTask> {
        self.state.read().failovers.get(id).cloned()
    }

    pub fn master_of(&self, node: &str) -> Option<NodeId> {
        self.state.read().master_of(node).cloned()
    }

    /// Wait until `pred` holds, re-checking after every applied entry
    pub async fn wait_for(
        &self,
        timeout: Duration,
        pred: impl Fn(&FsmState) -> bool,
    ) -> ClusterResult<()> {
        let mut rx = self.applied_tx.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if pred(&self.state.read()) {
                return Ok(());
            }
            match tokio::time::timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return Err(ClusterError::ClusterNotInitialized),
                Err(_) => {
                    return Err(ClusterError::Timeout(
                        "waiting for cluster state".to_string(),
                    ));
                }
            }
        }
    }

    /// Wait until the entry at `index` has been applied locally
    pub async fn wait_applied(&self, index: u64, timeout: Duration) -> ClusterResult<()> {
        self.wait_for(timeout, |s| s.applied_index >= index).await
    }

    fn notify(&self, state: &FsmState, change: &FsmChange) {
        for observer in self.observers.read().iter() {
            observer(state, change);
        }
    }
}

impl Fsm {
    /// Apply the event committed at `index`. Indexes at or below the
    /// applied index are skipped, so redelivery after a restart is harmless.
    pub fn apply(&self, index: u64, event: Event) {
        {
            let mut state = self.state.write();
            if index <= state.applied_index {
                debug!("Skipping already applied entry {}", index);
                return;
            }
            state.applied_index = index;
            debug!("Applying {:?} at {}", event, index);
            if let Some(change) = state.apply(event) {
                self.notify(&state, &change);
            }
        }
        self.applied_tx.send_replace(index);
    }

    /// Advance past a log entry carrying no event (leader blanks, membership)
    pub fn mark_applied(&self, index: u64) {
        {
            let mut state = self.state.write();
            if index <= state.applied_index {
                return;
            }
            state.applied_index = index;
        }
        self.applied_tx.send_replace(index);
    }

    pub fn snapshot(&self) -> ClusterResult<Vec<u8>> {
        Ok(serde_json::to_vec(&*self.state.read())?)
    }

    /// Replace the whole state, e.g. from a snapshot sent by the leader
    pub fn restore(&self, data: &[u8]) -> ClusterResult<()> {
        let restored: FsmState = serde_json::from_slice(data)?;
        let index = restored.applied_index;
        {
            let mut state = self.state.write();
            *state = restored;
            info!("Restored cluster state at index {}", index);
            self.notify(&state, &FsmChange::Restored);
        }
        self.applied_tx.send_replace(index);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn apply(fsm: &Fsm, index: u64, event: Event) {
        fsm.apply(index, event);
    }

    fn seeded() -> Fsm {
        let fsm = Fsm::new();
        apply(&fsm, 1, Event::SeedStart { node: "a".into() });
        apply(
            &fsm,
            2,
            Event::Join {
                node: "b".into(),
                master: None,
            },
        );
        fsm
    }

    fn migrate(id: &str, slots: Vec<u16>) -> MigratingTask {
        MigratingTask {
            id: id.into(),
            src_node: "a".into(),
            target_node: "b".into(),
            slots,
        }
    }

    #[test]
    fn test_seed_assigns_every_slot() {
        let fsm = seeded();
        fsm.with_state(|s| {
            assert_eq!(s.slot2node.len(), TOTAL_SLOTS as usize);
            assert_eq!(s.slots_of("a").len(), TOTAL_SLOTS as usize);
            assert!(s.slots_of("b").is_empty());
            assert!(s.routing_consistent());
            assert_eq!(s.masters(), vec!["a".to_string(), "b".to_string()]);
        });
    }

    #[test]
    fn test_finish_migrate_moves_slots() {
        let fsm = seeded();
        apply(
            &fsm,
            3,
            Event::StartMigrate {
                task: migrate("t1", vec![10, 11, 12]),
            },
        );
        assert!(fsm.get_migrating_task("t1").is_some());
        assert_eq!(fsm.pick_node(10).as_deref(), Some("a"));

        apply(
            &fsm,
            4,
            Event::FinishMigrate {
                task_id: "t1".into(),
            },
        );
        assert!(fsm.get_migrating_task("t1").is_none());
        fsm.with_state(|s| {
            assert_eq!(s.slots_of("b"), &[10, 11, 12]);
            assert_eq!(s.slots_of("a").len(), TOTAL_SLOTS as usize - 3);
            assert!(s.routing_consistent());
        });
    }

    #[test]
    fn test_unknown_finish_is_noop() {
        let fsm = seeded();
        let before = fsm.state();
        apply(
            &fsm,
            3,
            Event::FinishMigrate {
                task_id: "nope".into(),
            },
        );
        let mut after = fsm.state();
        assert_eq!(after.applied_index, 3);
        after.applied_index = before.applied_index;
        assert_eq!(after, before);
    }

    #[test]
    fn test_reapply_is_noop() {
        let fsm = seeded();
        apply(
            &fsm,
            3,
            Event::StartMigrate {
                task: migrate("t1", vec![1]),
            },
        );
        apply(
            &fsm,
            4,
            Event::FinishMigrate {
                task_id: "t1".into(),
            },
        );
        let before = fsm.state();

        // Same entries delivered again, e.g. after a restart
        apply(
            &fsm,
            3,
            Event::StartMigrate {
                task: migrate("t1", vec![1]),
            },
        );
        apply(
            &fsm,
            4,
            Event::FinishMigrate {
                task_id: "t1".into(),
            },
        );
        assert_eq!(fsm.state(), before);
        assert!(fsm.get_migrating_task("t1").is_none());
    }

    #[test]
    fn test_failover_swaps_identity() {
        let fsm = seeded();
        for (i, slave) in ["c", "d"].iter().enumerate() {
            apply(
                &fsm,
                3 + i as u64,
                Event::Join {
                    node: slave.to_string(),
                    master: Some("a".into()),
                },
            );
        }
        let task = FailoverTask {
            id: "f1".into(),
            old_master_id: "a".into(),
            new_master_id: "c".into(),
        };
        apply(&fsm, 5, Event::StartFailover { task });
        apply(
            &fsm,
            6,
            Event::FinishFailover {
                task_id: "f1".into(),
            },
        );

        fsm.with_state(|s| {
            assert_eq!(s.slots_of("c").len(), TOTAL_SLOTS as usize);
            assert!(!s.node2slot.contains_key("a"));
            assert_eq!(s.master_of("a").map(String::as_str), Some("c"));
            assert_eq!(s.master_of("d").map(String::as_str), Some("c"));
            assert!(s.master_of("c").is_none());
            assert_eq!(s.slaves_of("c"), vec!["a".to_string(), "d".to_string()]);
            assert!(s.failovers.is_empty());
            assert!(s.routing_consistent());
        });
    }

    #[test]
    fn test_snapshot_restore() {
        let fsm = seeded();
        apply(
            &fsm,
            3,
            Event::StartMigrate {
                task: migrate("t1", vec![5]),
            },
        );
        let snapshot = fsm.snapshot().unwrap();

        let restored = Fsm::new();
        let changes = Arc::new(AtomicUsize::new(0));
        let counter = changes.clone();
        restored.add_observer(move |_, change| {
            assert_eq!(change, &FsmChange::Restored);
            counter.fetch_add(1, Ordering::SeqCst);
        });
        restored.restore(&snapshot).unwrap();

        assert_eq!(restored.state(), fsm.state());
        assert_eq!(restored.applied_index(), 3);
        assert_eq!(changes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_wait_for_applied_index() {
        let fsm = Arc::new(seeded());
        let waiter = {
            let fsm = fsm.clone();
            tokio::spawn(async move { fsm.wait_applied(3, Duration::from_secs(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        apply(
            &fsm,
            3,
            Event::Join {
                node: "c".into(),
                master: None,
            },
        );
        assert!(waiter.await.unwrap().is_ok());

        let err = fsm.wait_applied(10, Duration::from_millis(50)).await;
        assert!(matches!(err, Err(ClusterError::Timeout(_))));
    }
}
