//! Striped key locks
//!
//! Keys hash onto a fixed number of stripes. Multi-key callers lock the union
//! of stripes in ascending order, so two callers can never wait on each other
//! in a cycle. Guards are owned, which lets the cluster layer hold them across
//! the prepare → commit window of a distributed transaction.

use std::collections::BTreeMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

enum StripeGuard {
    Read(#[allow(dead_code)] OwnedRwLockReadGuard<()>),
    Write(#[allow(dead_code)] OwnedRwLockWriteGuard<()>),
}

/// Locks acquired by [`KeyLocks::lock`]; released on drop
pub struct KeyLockGuard {
    _guards: Vec<StripeGuard>,
}

impl std::fmt::Debug for KeyLockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyLockGuard")
            .field("stripes", &self._guards.len())
            .finish()
    }
}

#[derive(Clone)]
pub struct KeyLocks {
    stripes: Arc<Vec<Arc<RwLock<()>>>>,
}

impl KeyLocks {
    pub fn new(shards: usize) -> Self {
        let shards = shards.max(1);
        Self {
            stripes: Arc::new((0..shards).map(|_| Arc::new(RwLock::new(()))).collect()),
        }
    }

    fn stripe_of(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.stripes.len() as u64) as usize
    }

    /// Lock `write_keys` exclusively and `read_keys` shared.
    ///
    /// A key present in both sets is locked exclusively.
    pub async fn lock(&self, write_keys: &[String], read_keys: &[String]) -> KeyLockGuard {
        let mut plan: BTreeMap<usize, bool> = BTreeMap::new();
        for key in read_keys {
            plan.entry(self.stripe_of(key)).or_insert(false);
        }
        for key in write_keys {
            plan.insert(self.stripe_of(key), true);
        }

        let mut guards = Vec::with_capacity(plan.len());
        for (stripe, exclusive) in plan {
            let lock = Arc::clone(&self.stripes[stripe]);
            if exclusive {
                guards.push(StripeGuard::Write(lock.write_owned().await));
            } else {
                guards.push(StripeGuard::Read(lock.read_owned().await));
            }
        }
        KeyLockGuard { _guards: guards }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_write_lock_excludes_writer() {
        let locks = KeyLocks::new(16);
        let guard = locks.lock(&["a".to_string()], &[]).await;

        let locks2 = locks.clone();
        let waiter =
            tokio::spawn(async move { locks2.lock(&["a".to_string()], &[]).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_readers_share() {
        let locks = KeyLocks::new(16);
        let _g1 = locks.lock(&[], &["a".to_string()]).await;
        let g2 = tokio::time::timeout(
            Duration::from_millis(200),
            locks.lock(&[], &["a".to_string()]),
        )
        .await;
        assert!(g2.is_ok());
    }

    #[tokio::test]
    async fn test_overlapping_sets_do_not_deadlock() {
        let locks = KeyLocks::new(4);
        let keys_a: Vec<String> = (0..20).map(|i| format!("k{}", i)).collect();
        let keys_b: Vec<String> = keys_a.iter().rev().cloned().collect();

        let mut handles = Vec::new();
        for i in 0..8 {
            let locks = locks.clone();
            let keys = if i % 2 == 0 { keys_a.clone() } else { keys_b.clone() };
            handles.push(tokio::spawn(async move {
                let _g = locks.lock(&keys, &[]).await;
                tokio::time::sleep(Duration::from_millis(2)).await;
            }));
        }
        for h in handles {
            tokio::time::timeout(Duration::from_secs(5), h)
                .await
                .unwrap()
                .unwrap();
        }
    }
}
