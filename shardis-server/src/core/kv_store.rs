use super::commands::{self, KeyEvent, Keyspace, command_name};
use super::error::{Result, ShardisError};
use super::locks::{KeyLockGuard, KeyLocks};
use super::types::{KVConfig, KVStats, StoredValue, now_millis};
use crate::protocol::{CmdLine, Reply, to_cmdline};
use crate::server::{Connection, Database, authenticate};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use parking_lot::RwLock;
use radix_trie::{Trie, TrieCommon};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Callbacks fired after a command inserted or deleted keys.
///
/// Called after the data lock is released, in mutation order.
pub trait KeyEventObserver: Send + Sync {
    fn on_key_inserted(&self, key: &str);
    fn on_key_deleted(&self, key: &str);
}

/// Key-Value store using radix trie for memory-efficient storage
#[derive(Clone)]
pub struct KVStore {
    data: Arc<RwLock<Trie<String, StoredValue>>>,
    stats: Arc<RwLock<KVStats>>,
    locks: KeyLocks,
    observers: Arc<RwLock<Vec<Arc<dyn KeyEventObserver>>>>,
    write_feed: broadcast::Sender<CmdLine>,
    snapshot_path: Option<PathBuf>,
    requirepass: Option<String>,
    config: KVConfig,
}

impl KVStore {
    /// Create a new KV store with the given configuration
    pub fn new(config: KVConfig) -> Self {
        info!(
            "Initializing KV store with lock_shards={}, ttl_cleanup={}ms",
            config.lock_shards, config.ttl_cleanup_interval_ms
        );

        let (write_feed, _) = broadcast::channel(config.write_feed_capacity.max(1));
        Self {
            data: Arc::new(RwLock::new(Trie::new())),
            stats: Arc::new(RwLock::new(KVStats::default())),
            locks: KeyLocks::new(config.lock_shards),
            observers: Arc::new(RwLock::new(Vec::new())),
            write_feed,
            snapshot_path: None,
            requirepass: None,
            config,
        }
    }

    /// File written by `SAVE`
    pub fn with_snapshot_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.snapshot_path = Some(path.into());
        self
    }

    /// Password required from clients when serving standalone
    pub fn with_password(mut self, password: Option<String>) -> Self {
        self.requirepass = password;
        self
    }

    /// Start background TTL cleanup task
    pub fn start_ttl_cleanup(&self) -> tokio::task::JoinHandle<()> {
        let interval_ms = self.config.ttl_cleanup_interval_ms.max(1);
        info!("Starting TTL cleanup task (interval={}ms)", interval_ms);

        let store = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));

            loop {
                interval.tick().await;
                store.cleanup_expired();
            }
        })
    }

    pub fn add_observer(&self, observer: Arc<dyn KeyEventObserver>) {
        self.observers.write().push(observer);
    }

    pub fn command_exists(name: &str) -> bool {
        commands::lookup(name).is_some()
    }

    pub fn is_write_command(name: &str) -> bool {
        commands::lookup(name).is_some_and(|c| c.write)
    }

    /// Keys touched by `cmdline` as (write_keys, read_keys)
    pub fn related_keys(&self, cmdline: &CmdLine) -> Result<(Vec<String>, Vec<String>)> {
        let name = command_name(cmdline);
        let def =
            commands::lookup(&name).ok_or_else(|| ShardisError::UnknownCommand(name.clone()))?;
        if !def.check_arity(cmdline.len()) {
            return Err(ShardisError::WrongArity(name));
        }
        Ok(def.related_keys(cmdline))
    }

    /// Lock keys for a command; see [`KeyLocks::lock`]
    pub async fn rw_locks(&self, write_keys: &[String], read_keys: &[String]) -> KeyLockGuard {
        self.locks.lock(write_keys, read_keys).await
    }

    /// Commands restoring the current state of every key `cmdline` writes.
    ///
    /// Must be called while the command's keys are locked.
    pub fn undo_logs(&self, cmdline: &CmdLine) -> Result<Vec<CmdLine>> {
        let (write_keys, _) = self.related_keys(cmdline)?;
        Ok(self.undo_logs_for(&write_keys))
    }

    /// Undo log for keys whose locks the caller holds
    pub fn undo_logs_for(&self, write_keys: &[String]) -> Vec<CmdLine> {
        let data = self.data.read();
        write_keys
            .iter()
            .flat_map(|key| dump_entry(key, lookup_live(&data, key)))
            .collect()
    }

    /// Execute a command, taking its key locks for the duration
    pub async fn exec(&self, cmdline: &CmdLine) -> Reply {
        let (write_keys, read_keys) = match self.related_keys(cmdline) {
            Ok(keys) => keys,
            Err(e) => return e.into(),
        };
        let _guard = self.rw_locks(&write_keys, &read_keys).await;
        self.exec_with_lock(cmdline)
    }

    /// Execute a command whose keys the caller already holds locks for
    pub fn exec_with_lock(&self, cmdline: &CmdLine) -> Reply {
        let name = command_name(cmdline);
        debug!("EXEC {} argc={}", name, cmdline.len());

        if name == "save" {
            return match self.save() {
                Ok(_) => Reply::ok(),
                Err(e) => e.into(),
            };
        }

        let Some(def) = commands::lookup(&name) else {
            return ShardisError::UnknownCommand(name).into();
        };
        if !def.check_arity(cmdline.len()) {
            return ShardisError::WrongArity(name).into();
        }

        let (reply, events) = {
            let mut data = self.data.write();
            let mut ks = Keyspace::new(&mut data);
            let reply = def.execute(&mut ks, cmdline).unwrap_or_else(Reply::from);
            let events = ks.into_events();

            if def.write && !reply.is_error() && self.write_feed.receiver_count() > 0 {
                let (write_keys, _) = def.related_keys(cmdline);
                let feed: Vec<CmdLine> = if write_keys.is_empty() {
                    vec![cmdline.clone()]
                } else {
                    write_keys
                        .iter()
                        .flat_map(|key| dump_entry(key, lookup_live(&data, key)))
                        .collect()
                };
                for cmd in feed {
                    let _ = self.write_feed.send(cmd);
                }
            }
            (reply, events)
        };

        {
            let mut stats = self.stats.write();
            if def.write {
                stats.writes += 1;
            } else {
                stats.reads += 1;
            }
        }
        self.notify(&events);
        reply
    }

    fn notify(&self, events: &[KeyEvent]) {
        if events.is_empty() {
            return;
        }
        let observers = self.observers.read().clone();
        for event in events {
            for observer in &observers {
                match event {
                    KeyEvent::Inserted(key) => observer.on_key_inserted(key),
                    KeyEvent::Deleted(key) => observer.on_key_deleted(key),
                }
            }
        }
    }

    /// Live (non-expired) value of a key
    pub fn get_entity(&self, key: &str) -> Option<StoredValue> {
        lookup_live(&self.data.read(), key).cloned()
    }

    /// Absolute expiration (unix ms) of a live key
    pub fn get_expiration(&self, key: &str) -> Option<u64> {
        self.get_entity(key).and_then(|v| v.expires_at)
    }

    /// Commands that recreate `key` elsewhere: `SET` plus `PEXPIREAT` when it
    /// carries a TTL, or `DEL` when it does not exist.
    pub fn dump_key(&self, key: &str) -> Vec<CmdLine> {
        dump_entry(key, lookup_live(&self.data.read(), key))
    }

    /// All live keys, unordered
    pub fn keys(&self) -> Vec<String> {
        let now = now_millis();
        self.data
            .read()
            .iter()
            .filter(|(_, v)| !v.is_expired_at(now))
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Snapshot of every key as commands, together with a feed of all writes
    /// that happen after the snapshot was taken.
    pub fn dump_and_subscribe(&self) -> (Vec<CmdLine>, broadcast::Receiver<CmdLine>) {
        let data = self.data.read();
        let rx = self.write_feed.subscribe();
        let now = now_millis();
        let dump = data
            .iter()
            .filter(|(_, v)| !v.is_expired_at(now))
            .flat_map(|(k, v)| dump_entry(k, Some(v)))
            .collect();
        (dump, rx)
    }

    /// Remove keys for which `pred` holds, firing delete callbacks and
    /// feeding `DEL` to replicas
    pub fn remove_keys_where(&self, pred: impl Fn(&str) -> bool) -> usize {
        let events: Vec<KeyEvent> = {
            let mut data = self.data.write();
            let doomed: Vec<String> = data.keys().filter(|k| pred(k)).cloned().collect();
            for key in &doomed {
                data.remove(key);
                if self.write_feed.receiver_count() > 0 {
                    let _ = self.write_feed.send(to_cmdline(["DEL", key.as_str()]));
                }
            }
            doomed.into_iter().map(KeyEvent::Deleted).collect()
        };
        self.notify(&events);
        events.len()
    }

    /// Get statistics
    pub fn stats(&self) -> KVStats {
        let mut stats = self.stats.read().clone();
        stats.total_keys = self.data.read().len();
        stats
    }

    /// Write every live entry to the configured snapshot file
    pub fn save(&self) -> Result<usize> {
        let path = self
            .snapshot_path
            .clone()
            .ok_or_else(|| ShardisError::InvalidRequest("no snapshot path configured".into()))?;
        self.save_rdb(&path)
    }

    pub fn save_rdb(&self, path: &Path) -> Result<usize> {
        let now = now_millis();
        let entries: BTreeMap<String, StoredValue> = self
            .data
            .read()
            .iter()
            .filter(|(_, v)| !v.is_expired_at(now))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_vec(&entries)?)?;
        std::fs::rename(&tmp, path)?;

        info!("Saved {} keys to {}", entries.len(), path.display());
        Ok(entries.len())
    }

    /// Load a snapshot written by [`KVStore::save_rdb`], firing insert callbacks
    pub fn load_rdb(&self, path: &Path) -> Result<usize> {
        if !path.exists() {
            debug!("No snapshot at {}", path.display());
            return Ok(0);
        }
        let raw = std::fs::read(path)?;
        let entries: BTreeMap<String, StoredValue> = serde_json::from_slice(&raw)?;
        let now = now_millis();

        let events: Vec<KeyEvent> = {
            let mut data = self.data.write();
            entries
                .into_iter()
                .filter(|(_, v)| !v.is_expired_at(now))
                .map(|(k, v)| {
                    data.insert(k.clone(), v);
                    KeyEvent::Inserted(k)
                })
                .collect()
        };
        self.notify(&events);

        info!("Loaded {} keys from {}", events.len(), path.display());
        Ok(events.len())
    }

    /// Clean up expired keys
    fn cleanup_expired(&self) {
        let now = now_millis();
        let events: Vec<KeyEvent> = {
            let mut data = self.data.write();
            let expired_keys: Vec<String> = data
                .iter()
                .filter(|(_, v)| v.is_expired_at(now))
                .map(|(k, _)| k.clone())
                .collect();
            for key in &expired_keys {
                data.remove(key);
            }
            expired_keys.into_iter().map(KeyEvent::Deleted).collect()
        };

        if !events.is_empty() {
            debug!("Cleaned up {} expired keys", events.len());
            self.stats.write().expired += events.len() as u64;
            self.notify(&events);
        }
    }
}

fn lookup_live<'a>(data: &'a Trie<String, StoredValue>, key: &str) -> Option<&'a StoredValue> {
    data.get(key).filter(|v| !v.is_expired())
}

fn dump_entry(key: &str, value: Option<&StoredValue>) -> Vec<CmdLine> {
    match value {
        None => vec![to_cmdline(["DEL", key])],
        Some(v) => {
            let mut cmds = vec![to_cmdline([b"SET".as_slice(), key.as_bytes(), v.data.as_slice()])];
            if let Some(at) = v.expires_at {
                cmds.push(to_cmdline(["PEXPIREAT", key, at.to_string().as_str()]));
            }
            cmds
        }
    }
}

impl Database for KVStore {
    fn exec(self: Arc<Self>, conn: Arc<Connection>, cmdline: CmdLine) -> BoxFuture<'static, Reply> {
        async move {
            if let Some(reply) = authenticate(&conn, &cmdline, self.requirepass.as_deref()) {
                return reply;
            }
            KVStore::exec(&self, &cmdline).await
        }
        .boxed()
    }

    fn close(&self) {
        if self.snapshot_path.is_some() {
            if let Err(e) = self.save() {
                warn!("Failed to save snapshot on close: {}", e);
            }
        }
    }
}
