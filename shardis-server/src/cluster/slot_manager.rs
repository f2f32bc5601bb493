//! Per-node slot bookkeeping
//!
//! Tracks, for every slot this node holds data for, which keys live in it and
//! whether the slot is being exported or imported. Export snapshots and dirty
//! key buffers exist only while an export is in flight.

use super::hash_slot::hash_slot;
use super::types::{ClusterError, ClusterResult};
use crate::core::KeyEventObserver;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotState {
    Hosting,
    Importing,
    Exporting,
}

#[derive(Debug)]
pub struct SlotStatus {
    pub state: SlotState,
    pub keys: HashSet<String>,
    /// Keys present when the export started
    pub export_snapshot: Option<Vec<String>>,
    /// Keys written or deleted since the export started
    pub dirty_keys: Option<HashSet<String>>,
}

impl SlotStatus {
    fn new() -> Self {
        Self {
            state: SlotState::Hosting,
            keys: HashSet::new(),
            export_snapshot: None,
            dirty_keys: None,
        }
    }
}

#[derive(Default)]
pub struct SlotManager {
    slots: RwLock<HashMap<u16, Arc<Mutex<SlotStatus>>>>,
}

impl SlotManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Slot status, created on first use
    pub fn get_slot(&self, slot: u16) -> Arc<Mutex<SlotStatus>> {
        if let Some(status) = self.slots.read().get(&slot) {
            return Arc::clone(status);
        }
        let mut slots = self.slots.write();
        Arc::clone(
            slots
                .entry(slot)
                .or_insert_with(|| Arc::new(Mutex::new(SlotStatus::new()))),
        )
    }

    pub fn state(&self, slot: u16) -> Option<SlotState> {
        let status = self.slots.read().get(&slot).cloned()?;
        let state = status.lock().state;
        Some(state)
    }

    pub fn keys_of(&self, slot: u16) -> Vec<String> {
        match self.slots.read().get(&slot).cloned() {
            Some(status) => status.lock().keys.iter().cloned().collect(),
            None => Vec::new(),
        }
    }

    /// Slots with local bookkeeping
    pub fn tracked_slots(&self) -> Vec<u16> {
        let mut slots: Vec<u16> = self.slots.read().keys().copied().collect();
        slots.sort_unstable();
        slots
    }

    /// Flip a hosted slot to exporting and return its key snapshot
    pub fn start_exporting(&self, slot: u16) -> ClusterResult<Vec<String>> {
        let status = self.get_slot(slot);
        let mut status = status.lock();
        if status.state != SlotState::Hosting {
            return Err(ClusterError::MigrationError(format!(
                "slot {} is {:?}, not hosting",
                slot, status.state
            )));
        }
        let snapshot: Vec<String> = status.keys.iter().cloned().collect();
        status.state = SlotState::Exporting;
        status.export_snapshot = Some(snapshot.clone());
        status.dirty_keys = Some(HashSet::new());
        debug!("Slot {} exporting with {} keys", slot, snapshot.len());
        Ok(snapshot)
    }

    /// Run `f` over the dirty keys while holding the slot lock, then return
    /// the slot to hosting.
    pub fn finish_exporting<R>(&self, slot: u16, f: impl FnOnce(&HashSet<String>) -> R) -> R {
        let status = self.get_slot(slot);
        let mut status = status.lock();
        let dirty = status.dirty_keys.take().unwrap_or_default();
        let result = f(&dirty);
        status.state = SlotState::Hosting;
        status.export_snapshot = None;
        debug!("Slot {} export drained {} dirty keys", slot, dirty.len());
        result
    }

    pub fn set_importing(&self, slot: u16) {
        self.get_slot(slot).lock().state = SlotState::Importing;
    }

    pub fn set_hosting(&self, slot: u16) {
        let status = self.get_slot(slot);
        let mut status = status.lock();
        status.state = SlotState::Hosting;
        status.export_snapshot = None;
        status.dirty_keys = None;
    }

    pub fn drop_slot(&self, slot: u16) {
        self.slots.write().remove(&slot);
    }
}

impl KeyEventObserver for SlotManager {
    fn on_key_inserted(&self, key: &str) {
        let status = self.get_slot(hash_slot(key));
        let mut status = status.lock();
        status.keys.insert(key.to_string());
        if let Some(dirty) = status.dirty_keys.as_mut() {
            dirty.insert(key.to_string());
        }
    }

    fn on_key_deleted(&self, key: &str) {
        let status = self.get_slot(hash_slot(key));
        let mut status = status.lock();
        status.keys.remove(key);
        if let Some(dirty) = status.dirty_keys.as_mut() {
            dirty.insert(key.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_tracked_per_slot() {
        let sm = SlotManager::new();
        sm.on_key_inserted("{t}a");
        sm.on_key_inserted("{t}b");
        sm.on_key_deleted("{t}a");

        let slot = hash_slot("{t}b");
        assert_eq!(sm.keys_of(slot), vec!["{t}b".to_string()]);
        assert_eq!(sm.state(slot), Some(SlotState::Hosting));
        assert_eq!(sm.state(slot + 1), None);
    }

    #[test]
    fn test_export_lifecycle() {
        let sm = SlotManager::new();
        sm.on_key_inserted("{t}a");
        let slot = hash_slot("{t}a");

        let snapshot = sm.start_exporting(slot).unwrap();
        assert_eq!(snapshot, vec!["{t}a".to_string()]);
        assert!(sm.start_exporting(slot).is_err());

        sm.on_key_inserted("{t}b");
        sm.on_key_deleted("{t}a");

        let mut dirty = sm.finish_exporting(slot, |d| d.iter().cloned().collect::<Vec<_>>());
        dirty.sort();
        assert_eq!(dirty, vec!["{t}a".to_string(), "{t}b".to_string()]);
        assert_eq!(sm.state(slot), Some(SlotState::Hosting));

        // writes after the drain are no longer buffered
        sm.on_key_inserted("{t}c");
        let status = sm.get_slot(slot);
        assert!(status.lock().dirty_keys.is_none());
    }

    #[test]
    fn test_importing_slot_cannot_export() {
        let sm = SlotManager::new();
        sm.set_importing(7);
        assert!(sm.start_exporting(7).is_err());
        sm.set_hosting(7);
        assert!(sm.start_exporting(7).is_ok());
        sm.drop_slot(7);
        assert_eq!(sm.state(7), None);
    }
}
