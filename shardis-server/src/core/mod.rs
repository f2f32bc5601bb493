pub mod commands;
pub mod error;
pub mod kv_store;
pub mod locks;
pub mod types;

pub use error::{Result, ShardisError};
pub use kv_store::{KVStore, KeyEventObserver};
pub use locks::{KeyLockGuard, KeyLocks};
pub use types::{KVConfig, KVStats, StoredValue, now_millis};
