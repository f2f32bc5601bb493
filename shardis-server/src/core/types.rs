use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in unix milliseconds
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Stored value in the KV store with metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredValue {
    /// Raw byte data
    pub data: Vec<u8>,
    /// Absolute expiration time (unix ms)
    pub expires_at: Option<u64>,
}

impl StoredValue {
    /// Create a new stored value
    pub fn new(data: Vec<u8>, expires_at: Option<u64>) -> Self {
        Self { data, expires_at }
    }

    /// Check if the value has expired
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now_millis())
    }

    pub fn is_expired_at(&self, now: u64) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }

    /// Get remaining TTL in milliseconds
    pub fn remaining_ttl_ms(&self) -> Option<u64> {
        let now = now_millis();
        self.expires_at.map(|at| at.saturating_sub(now))
    }
}

/// Configuration for KV store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KVConfig {
    /// TTL cleanup interval in milliseconds
    pub ttl_cleanup_interval_ms: u64,
    /// Number of key lock stripes
    pub lock_shards: usize,
    /// Capacity of the write feed used by replication
    pub write_feed_capacity: usize,
}

impl Default for KVConfig {
    fn default() -> Self {
        Self {
            ttl_cleanup_interval_ms: 100,
            lock_shards: 1024,
            write_feed_capacity: 65536,
        }
    }
}

/// Statistics for KV store
#[derive(Debug, Default, Clone, Serialize)]
pub struct KVStats {
    /// Total number of keys
    pub total_keys: usize,
    /// Number of read commands
    pub reads: u64,
    /// Number of write commands
    pub writes: u64,
    /// Number of keys removed by expiry
    pub expired: u64,
}
