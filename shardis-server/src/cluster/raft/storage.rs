//! Raft log, vote and snapshot storage
//!
//! State lives in memory. With a data directory it is also written to disk
//! and reloaded by [`RaftStore::open`]:
//!
//! - `hard_state.json`: vote and last purged log id, replaced atomically
//! - `log.jsonl`: one entry per line, appended and synced per batch; only
//!   rewritten when a conflicting suffix is dropped or a prefix is purged
//! - `snapshot.json`: the latest snapshot, replaced atomically
//!
//! A write that fails is returned to openraft, which stops the node rather
//! than acknowledge state it does not have.

use super::{RaftId, RaftMember, TypeConfig};
use crate::cluster::fsm::Fsm;
use crate::cluster::types::{ClusterError, ClusterResult};
use openraft::storage::{LogState, RaftLogReader, RaftSnapshotBuilder, Snapshot};
use openraft::{
    Entry, EntryPayload, LogId, OptionalSend, RaftStorage, SnapshotMeta, StorageError,
    StorageIOError, StoredMembership, Vote,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::io::Cursor;
use std::ops::RangeBounds;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const HARD_STATE_FILE: &str = "hard_state.json";
const LOG_FILE: &str = "log.jsonl";
const SNAPSHOT_FILE: &str = "snapshot.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct HardState {
    vote: Option<Vote<RaftId>>,
    last_purged: Option<LogId<RaftId>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredSnapshot {
    meta: SnapshotMeta<RaftId, RaftMember>,
    data: Vec<u8>,
}

/// Raft storage backed by the cluster [`Fsm`]
#[derive(Clone)]
pub struct RaftStore {
    dir: Option<PathBuf>,
    fsm: Arc<Fsm>,
    hard: Arc<RwLock<HardState>>,
    log: Arc<RwLock<BTreeMap<u64, Entry<TypeConfig>>>>,
    last_applied: Arc<RwLock<Option<LogId<RaftId>>>>,
    last_membership: Arc<RwLock<StoredMembership<RaftId, RaftMember>>>,
    snapshot: Arc<RwLock<Option<StoredSnapshot>>>,
}

impl RaftStore {
    /// Open the store, reloading whatever `dir` holds into memory and the FSM
    pub async fn open(fsm: Arc<Fsm>, dir: Option<PathBuf>) -> ClusterResult<Self> {
        let mut hard = HardState::default();
        let mut log = BTreeMap::new();
        let mut snapshot: Option<StoredSnapshot> = None;

        if let Some(dir) = &dir {
            tokio::fs::create_dir_all(dir).await?;
            if let Some(bytes) = read_optional(&dir.join(HARD_STATE_FILE)).await? {
                hard = serde_json::from_slice(&bytes)?;
            }
            if let Some(bytes) = read_optional(&dir.join(SNAPSHOT_FILE)).await? {
                snapshot = Some(serde_json::from_slice(&bytes)?);
            }
            if let Some(bytes) = read_optional(&dir.join(LOG_FILE)).await? {
                let (parsed, torn) = parse_log(&bytes)?;
                if torn {
                    write_atomic(&dir.join(LOG_FILE), &encode_log(parsed.values())?).await?;
                }
                log = parsed;
            }
        }
        if let Some(purged) = hard.last_purged {
            log.retain(|index, _| *index > purged.index);
        }

        let mut last_applied = None;
        let mut last_membership = StoredMembership::default();
        if let Some(snap) = &snapshot {
            fsm.restore(&snap.data)?;
            last_applied = snap.meta.last_log_id;
            last_membership = snap.meta.last_membership.clone();
        }
        info!(
            "Raft store opened: {} log entries, snapshot at {:?}",
            log.len(),
            last_applied.map(|l| l.index)
        );

        Ok(Self {
            dir,
            fsm,
            hard: Arc::new(RwLock::new(hard)),
            log: Arc::new(RwLock::new(log)),
            last_applied: Arc::new(RwLock::new(last_applied)),
            last_membership: Arc::new(RwLock::new(last_membership)),
            snapshot: Arc::new(RwLock::new(snapshot)),
        })
    }

    async fn persist_hard(&self, hard: &HardState) -> std::io::Result<()> {
        let Some(dir) = &self.dir else { return Ok(()) };
        write_atomic(&dir.join(HARD_STATE_FILE), &serde_json::to_vec(hard)?).await
    }

    async fn append_log_file(&self, entries: &[Entry<TypeConfig>]) -> std::io::Result<()> {
        let Some(dir) = &self.dir else { return Ok(()) };
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(LOG_FILE))
            .await?;
        file.write_all(&encode_log(entries.iter())?).await?;
        file.sync_data().await
    }

    async fn rewrite_log_file(&self, log: &BTreeMap<u64, Entry<TypeConfig>>) -> std::io::Result<()> {
        let Some(dir) = &self.dir else { return Ok(()) };
        write_atomic(&dir.join(LOG_FILE), &encode_log(log.values())?).await
    }

    async fn save_snapshot(&self, stored: StoredSnapshot) -> Result<(), StorageError<RaftId>> {
        if let Some(dir) = &self.dir {
            let bytes = serde_json::to_vec(&stored)
                .map_err(|e| StorageIOError::write_snapshot(Some(stored.meta.signature()), &e))?;
            write_atomic(&dir.join(SNAPSHOT_FILE), &bytes)
                .await
                .map_err(|e| StorageIOError::write_snapshot(Some(stored.meta.signature()), &e))?;
        }
        *self.snapshot.write().await = Some(stored);
        Ok(())
    }
}

async fn read_optional(path: &Path) -> std::io::Result<Option<Vec<u8>>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Write to a temporary file, sync, then rename over `path`
async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(&tmp, path).await
}

fn encode_log<'a>(entries: impl Iterator<Item = &'a Entry<TypeConfig>>) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    for entry in entries {
        serde_json::to_writer(&mut buf, entry)?;
        buf.push(b'\n');
    }
    Ok(buf)
}

/// Later lines win. A torn final line from a crash mid-append is dropped,
/// reported through the returned flag.
fn parse_log(bytes: &[u8]) -> ClusterResult<(BTreeMap<u64, Entry<TypeConfig>>, bool)> {
    let lines: Vec<&[u8]> = bytes
        .split(|b| *b == b'\n')
        .filter(|l| !l.is_empty())
        .collect();
    let mut log = BTreeMap::new();
    for (i, line) in lines.iter().enumerate() {
        match serde_json::from_slice::<Entry<TypeConfig>>(line) {
            Ok(entry) => {
                log.insert(entry.log_id.index, entry);
            }
            Err(e) if i + 1 == lines.len() => {
                warn!("Dropping torn raft log tail: {}", e);
                return Ok((log, true));
            }
            Err(e) => return Err(ClusterError::SerializationError(e.to_string())),
        }
    }
    Ok((log, false))
}

impl RaftLogReader<TypeConfig> for RaftStore {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + OptionalSend>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<TypeConfig>>, StorageError<RaftId>> {
        let log = self.log.read().await;
        Ok(log.range(range).map(|(_, e)| e.clone()).collect())
    }
}

impl RaftSnapshotBuilder<TypeConfig> for RaftStore {
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, StorageError<RaftId>> {
        // Held so no entry is applied between reading the FSM and the log id
        let last_applied = self.last_applied.read().await;
        let data = self
            .fsm
            .snapshot()
            .map_err(|e| StorageIOError::write_snapshot(None, &e))?;
        let meta = SnapshotMeta {
            last_log_id: *last_applied,
            last_membership: self.last_membership.read().await.clone(),
            snapshot_id: format!("snapshot-{}", last_applied.map_or(0, |l| l.index)),
        };
        drop(last_applied);

        debug!("Built raft snapshot {}", meta.snapshot_id);
        self.save_snapshot(StoredSnapshot {
            meta: meta.clone(),
            data: data.clone(),
        })
        .await?;
        Ok(Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(data)),
        })
    }
}

impl RaftStorage<TypeConfig> for RaftStore {
    type LogReader = Self;
    type SnapshotBuilder = Self;

    async fn get_log_state(&mut self) -> Result<LogState<TypeConfig>, StorageError<RaftId>> {
        let last_purged = self.hard.read().await.last_purged;
        let last = self
            .log
            .read()
            .await
            .values()
            .next_back()
            .map(|e| e.log_id)
            .or(last_purged);
        Ok(LogState {
            last_purged_log_id: last_purged,
            last_log_id: last,
        })
    }

    async fn save_vote(&mut self, vote: &Vote<RaftId>) -> Result<(), StorageError<RaftId>> {
        let mut hard = self.hard.write().await;
        let next = HardState {
            vote: Some(*vote),
            ..hard.clone()
        };
        self.persist_hard(&next)
            .await
            .map_err(|e| StorageIOError::write_vote(&e))?;
        *hard = next;
        Ok(())
    }

    async fn read_vote(&mut self) -> Result<Option<Vote<RaftId>>, StorageError<RaftId>> {
        Ok(self.hard.read().await.vote)
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        self.clone()
    }

    async fn append_to_log<I>(&mut self, entries: I) -> Result<(), StorageError<RaftId>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + OptionalSend,
    {
        let entries: Vec<Entry<TypeConfig>> = entries.into_iter().collect();
        let mut log = self.log.write().await;
        self.append_log_file(&entries)
            .await
            .map_err(|e| StorageIOError::write_logs(&e))?;
        for entry in entries {
            log.insert(entry.log_id.index, entry);
        }
        Ok(())
    }

    async fn delete_conflict_logs_since(
        &mut self,
        log_id: LogId<RaftId>,
    ) -> Result<(), StorageError<RaftId>> {
        let mut log = self.log.write().await;
        let mut kept = log.clone();
        kept.retain(|index, _| *index < log_id.index);
        self.rewrite_log_file(&kept)
            .await
            .map_err(|e| StorageIOError::write_logs(&e))?;
        debug!("Dropped raft log entries from {}", log_id.index);
        *log = kept;
        Ok(())
    }

    async fn purge_logs_upto(&mut self, log_id: LogId<RaftId>) -> Result<(), StorageError<RaftId>> {
        {
            let mut hard = self.hard.write().await;
            let next = HardState {
                last_purged: Some(log_id),
                ..hard.clone()
            };
            self.persist_hard(&next)
                .await
                .map_err(|e| StorageIOError::write_logs(&e))?;
            *hard = next;
        }

        let mut log = self.log.write().await;
        let kept = log.split_off(&(log_id.index + 1));
        *log = kept;
        self.rewrite_log_file(&log)
            .await
            .map_err(|e| StorageIOError::write_logs(&e))?;
        debug!("Purged raft log up to {}", log_id.index);
        Ok(())
    }

    async fn last_applied_state(
        &mut self,
    ) -> Result<(Option<LogId<RaftId>>, StoredMembership<RaftId, RaftMember>), StorageError<RaftId>>
    {
        Ok((
            *self.last_applied.read().await,
            self.last_membership.read().await.clone(),
        ))
    }

    async fn apply_to_state_machine(
        &mut self,
        entries: &[Entry<TypeConfig>],
    ) -> Result<Vec<()>, StorageError<RaftId>> {
        let mut last_applied = self.last_applied.write().await;
        let mut responses = Vec::with_capacity(entries.len());
        for entry in entries {
            *last_applied = Some(entry.log_id);
            match &entry.payload {
                EntryPayload::Blank => self.fsm.mark_applied(entry.log_id.index),
                EntryPayload::Normal(event) => self.fsm.apply(entry.log_id.index, event.clone()),
                EntryPayload::Membership(membership) => {
                    *self.last_membership.write().await =
                        StoredMembership::new(Some(entry.log_id), membership.clone());
                    self.fsm.mark_applied(entry.log_id.index);
                }
            }
            responses.push(());
        }
        Ok(responses)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        self.clone()
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<Box<Cursor<Vec<u8>>>, StorageError<RaftId>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<RaftId, RaftMember>,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> Result<(), StorageError<RaftId>> {
        let data = snapshot.into_inner();
        let mut last_applied = self.last_applied.write().await;
        self.fsm
            .restore(&data)
            .map_err(|e| StorageIOError::read_snapshot(Some(meta.signature()), &e))?;
        *last_applied = meta.last_log_id;
        *self.last_membership.write().await = meta.last_membership.clone();
        drop(last_applied);

        info!("Installed raft snapshot {}", meta.snapshot_id);
        self.save_snapshot(StoredSnapshot {
            meta: meta.clone(),
            data,
        })
        .await
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<Snapshot<TypeConfig>>, StorageError<RaftId>> {
        Ok(self.snapshot.read().await.as_ref().map(|s| Snapshot {
            meta: s.meta.clone(),
            snapshot: Box::new(Cursor::new(s.data.clone())),
        }))
    }
}
