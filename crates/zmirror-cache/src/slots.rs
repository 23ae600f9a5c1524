//! Per-key download slots: at most one holder per filename at a time.
//!
//! A slot is an async mutex created on first contention for a key and
//! dropped from the map as soon as nobody holds or waits on it, so the map
//! only ever contains keys that are currently being fetched.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

type Slot = Arc<Mutex<()>>;

/// Concurrent map of filename → slot.
#[derive(Default)]
pub struct SlotMap {
    slots: DashMap<String, Slot>,
}

impl SlotMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive ownership of `key`. Suspends the calling task only.
    ///
    /// Dropping the returned guard (or the pending future) releases the slot.
    pub async fn acquire(&self, key: &str) -> SlotGuard<'_> {
        // The map shard lock is released at the end of this statement; it
        // must never be held across an await.
        let slot = Arc::clone(self.slots.entry(key.to_string()).or_default().value());

        let mut guard = SlotGuard {
            map: self,
            key: key.to_string(),
            held: None,
        };
        guard.held = Some(slot.lock_owned().await);
        guard
    }

    /// Number of keys with a holder or waiter.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn release(&self, key: &str) {
        // Holders and waiters each own a clone of the Arc; a count of one
        // means only the map references the slot. Cloning out of the map
        // needs the shard lock that remove_if holds, so the check is atomic.
        self.slots
            .remove_if(key, |_, slot| Arc::strong_count(slot) == 1);
    }
}

/// Exclusive hold on one key's slot.
pub struct SlotGuard<'a> {
    map: &'a SlotMap,
    key: String,
    held: Option<OwnedMutexGuard<()>>,
}

impl SlotGuard<'_> {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        drop(self.held.take());
        self.map.release(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn acquire_and_release_clears_entry() {
        let map = SlotMap::new();
        {
            let guard = map.acquire("a").await;
            assert_eq!(guard.key(), "a");
            assert_eq!(map.len(), 1);
        }
        assert!(map.is_empty());
    }

    #[tokio::test]
    async fn distinct_keys_do_not_block() {
        let map = SlotMap::new();
        let _a = map.acquire("a").await;
        let b = tokio::time::timeout(Duration::from_millis(200), map.acquire("b")).await;
        assert!(b.is_ok(), "unrelated key must not wait");
        assert_eq!(map.len(), 2);
    }

    #[tokio::test]
    async fn same_key_is_exclusive() {
        let map = Arc::new(SlotMap::new());
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let map = map.clone();
            let active = active.clone();
            let peak = peak.clone();
            tasks.push(tokio::spawn(async move {
                let _guard = map.acquire("k").await;
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert!(map.is_empty());
    }

    #[tokio::test]
    async fn entry_survives_while_waiters_remain() {
        let map = Arc::new(SlotMap::new());
        let first = map.acquire("k").await;

        let waiter = {
            let map = map.clone();
            tokio::spawn(async move {
                let _guard = map.acquire("k").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        drop(first);
        // The waiter still references the slot, so the entry stays until it
        // finishes.
        waiter.await.unwrap();
        assert!(map.is_empty());
    }

    #[tokio::test]
    async fn cancelled_waiter_does_not_leak_entry() {
        let map = Arc::new(SlotMap::new());
        let holder = map.acquire("k").await;

        let waiter = {
            let map = map.clone();
            tokio::spawn(async move {
                let _guard = map.acquire("k").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        waiter.abort();
        let _ = waiter.await;

        drop(holder);
        assert!(map.is_empty());

        // Slot is usable again.
        let again = tokio::time::timeout(Duration::from_millis(200), map.acquire("k")).await;
        assert!(again.is_ok());
    }
}
