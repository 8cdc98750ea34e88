use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// A map of async mutexes keyed by entity identity.
///
/// Operations on different keys never wait on each other. The map only holds
/// weak handles, so a key's entry disappears once no guard or waiter refers
/// to it and the map does not grow with the size of the library.
pub struct KeyedLocks<K> {
    slots: Mutex<HashMap<K, Weak<AsyncMutex<()>>>>,
}

/// Exclusive access to one key, released on drop.
pub struct KeyGuard<K> {
    key: K,
    _guard: OwnedMutexGuard<()>,
}

impl<K> KeyGuard<K> {
    pub fn key(&self) -> &K {
        &self.key
    }
}

impl<K> std::fmt::Debug for KeyGuard<K>
where
    K: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyGuard").field("key", &self.key).finish()
    }
}

impl<K> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }
}

impl<K> KeyedLocks<K>
where
    K: Eq + Hash + Ord + Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(&self, key: &K) -> Arc<AsyncMutex<()>> {
        // The map is only touched under short critical sections that cannot
        // panic halfway, so a poisoned lock still holds a consistent map.
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = slots.get(key).and_then(Weak::upgrade) {
            return existing;
        }
        slots.retain(|_, weak| weak.strong_count() > 0);
        let fresh = Arc::new(AsyncMutex::new(()));
        slots.insert(key.clone(), Arc::downgrade(&fresh));
        fresh
    }

    /// Wait for exclusive access to `key`.
    pub async fn lock(&self, key: &K) -> KeyGuard<K> {
        let guard = self.handle(key).lock_owned().await;
        KeyGuard {
            key: key.clone(),
            _guard: guard,
        }
    }

    /// Take `key` if nobody holds it.
    pub fn try_lock(&self, key: &K) -> Option<KeyGuard<K>> {
        let guard = self.handle(key).try_lock_owned().ok()?;
        Some(KeyGuard {
            key: key.clone(),
            _guard: guard,
        })
    }

    /// Lock several keys at once.
    ///
    /// Keys are deduplicated and acquired in ascending order, so two callers
    /// locking overlapping sets cannot deadlock.
    pub async fn lock_many<I>(&self, keys: I) -> Vec<KeyGuard<K>>
    where
        I: IntoIterator<Item = K>,
    {
        let mut keys: Vec<K> = keys.into_iter().collect();
        keys.sort();
        keys.dedup();

        let mut guards = Vec::with_capacity(keys.len());
        for key in keys {
            guards.push(self.lock(&key).await);
        }
        guards
    }

    /// Number of keys with a live guard or waiter.
    pub fn active_keys(&self) -> usize {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.values().filter(|weak| weak.strong_count() > 0).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_different_keys_are_independent() {
        let locks = KeyedLocks::new();
        let _a = locks.lock(&"a").await;
        assert!(locks.try_lock(&"b").is_some());
    }

    #[tokio::test]
    async fn test_same_key_is_exclusive() {
        let locks = KeyedLocks::new();
        let guard = locks.lock(&"a").await;
        assert!(locks.try_lock(&"a").is_none());
        drop(guard);
        assert!(locks.try_lock(&"a").is_some());
    }

    #[tokio::test]
    async fn test_waiter_proceeds_after_release() {
        let locks = Arc::new(KeyedLocks::new());
        let guard = locks.lock(&1u32).await;

        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let _g = locks.lock(&1u32).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should acquire after release")
            .unwrap();
    }

    #[tokio::test]
    async fn test_lock_many_opposite_orders_do_not_deadlock() {
        let locks = Arc::new(KeyedLocks::new());
        let mut tasks = Vec::new();
        for i in 0..8 {
            let locks = Arc::clone(&locks);
            let keys = if i % 2 == 0 { vec!["x", "y"] } else { vec!["y", "x", "x"] };
            tasks.push(tokio::spawn(async move {
                let guards = locks.lock_many(keys).await;
                assert_eq!(guards.len(), 2);
                tokio::task::yield_now().await;
            }));
        }
        tokio::time::timeout(Duration::from_secs(2), futures::future::join_all(tasks))
            .await
            .expect("lock_many deadlocked");
    }

    #[tokio::test]
    async fn test_entries_released_when_unused() {
        let locks = KeyedLocks::new();
        {
            let _a = locks.lock(&"a").await;
            let _b = locks.lock(&"b").await;
            assert_eq!(locks.active_keys(), 2);
        }
        assert_eq!(locks.active_keys(), 0);
    }
}
