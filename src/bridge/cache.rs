//! Single-flight memoization with a freshness window.
//!
//! `Cached` wraps an async computation keyed by its argument. Callers with the
//! same key while a computation is running wait for that computation instead
//! of starting their own; its result then serves every caller until it is
//! `ttl` old. Entries leave on expiry or explicit invalidation, and a failed
//! computation leaves none.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;

use crate::storage::lock;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// A `Cached` over a boxed computation, for storing in structs.
pub type BoxedCached<K, V, E> =
    Cached<K, V, Box<dyn Fn(K) -> BoxFuture<Result<V, E>> + Send + Sync>>;

type Slot<V> = Arc<OnceCell<(V, Instant)>>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub requests: u64,
    pub computations: u64,
    pub entries: usize,
}

pub struct Cached<K, V, F> {
    ttl: Duration,
    compute: F,
    slots: Mutex<HashMap<K, Slot<V>>>,
    requests: AtomicU64,
    computations: AtomicU64,
}

/// An empty cell nobody holds is left over from a failed attempt.
fn is_abandoned<V>(slot: &Slot<V>) -> bool {
    !slot.initialized() && Arc::strong_count(slot) == 1
}

fn is_stale<V>(slot: &OnceCell<(V, Instant)>, now: Instant, ttl: Duration) -> bool {
    // an uninitialized cell is in flight and is shared
    matches!(slot.get(), Some((_, at)) if now.saturating_duration_since(*at) >= ttl)
}

impl<K, V, F, Fut, E> Cached<K, V, F>
where
    K: Eq + Hash + Clone,
    V: Clone,
    F: Fn(K) -> Fut,
    Fut: Future<Output = Result<V, E>>,
{
    pub fn new(ttl: Duration, compute: F) -> Self {
        Self {
            ttl,
            compute,
            slots: Mutex::new(HashMap::new()),
            requests: AtomicU64::new(0),
            computations: AtomicU64::new(0),
        }
    }

    /// Cached value for `key`, computing it if missing or stale. An error goes
    /// only to the caller whose attempt failed; callers waiting on the same
    /// key then make their own attempt. Failures are never cached and leave
    /// no entry behind.
    pub async fn get(&self, key: K) -> Result<V, E> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        let slot = {
            let mut slots = lock(&self.slots);
            let now = Instant::now();
            match slots.get(&key) {
                Some(slot) if !is_stale(slot, now, self.ttl) => Arc::clone(slot),
                _ => {
                    let fresh: Slot<V> = Arc::new(OnceCell::new());
                    slots.insert(key.clone(), Arc::clone(&fresh));
                    fresh
                }
            }
        };

        let attempt = key.clone();
        let result = slot
            .get_or_try_init(|| async {
                self.computations.fetch_add(1, Ordering::Relaxed);
                let value = (self.compute)(attempt).await?;
                Ok::<_, E>((value, Instant::now()))
            })
            .await;
        match result {
            Ok((value, _)) => Ok(value.clone()),
            Err(e) => {
                self.forget_failed(&key, &slot);
                Err(e)
            }
        }
    }

    fn forget_failed(&self, key: &K, slot: &Slot<V>) {
        let mut slots = lock(&self.slots);
        let ours = matches!(slots.get(key), Some(current) if Arc::ptr_eq(current, slot));
        if ours && !slot.initialized() {
            slots.remove(key);
        }
    }

    pub fn invalidate(&self, key: &K) {
        lock(&self.slots).remove(key);
    }

    pub fn clear(&self) {
        lock(&self.slots).clear();
    }

    /// Drop stale entries and leftovers of failed attempts. Returns how many
    /// were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut slots = lock(&self.slots);
        let before = slots.len();
        slots.retain(|_, slot| !is_stale(slot, now, self.ttl) && !is_abandoned(slot));
        before - slots.len()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            requests: self.requests.load(Ordering::Relaxed),
            computations: self.computations.load(Ordering::Relaxed),
            entries: lock(&self.slots).len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn concurrent_callers_share_one_computation() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let cache = Arc::new(Cached::new(Duration::from_secs(60), move |k: u32| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok::<_, ()>(k * 2)
            }
        }));

        let (a, b) = tokio::join!(cache.get(21), cache.get(21));
        assert_eq!(a, Ok(42));
        assert_eq!(b, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // fresh hit, no recompute
        assert_eq!(cache.get(21).await, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().requests, 3);
        assert_eq!(cache.stats().computations, 1);

        // different key computes separately
        assert_eq!(cache.get(1).await, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn stale_entries_recompute() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let cache = Cached::new(Duration::from_millis(30), move |_: ()| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move { Ok::<_, ()>(n) }
        });
        assert_eq!(cache.get(()).await, Ok(0));
        assert_eq!(cache.get(()).await, Ok(0));
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.get(()).await, Ok(1));
        cache.invalidate(&());
        assert_eq!(cache.get(()).await, Ok(2));
    }

    #[tokio::test]
    async fn errors_are_not_cached() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let cache = Cached::new(Duration::from_secs(60), move |_: ()| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err("boom")
                } else {
                    Ok(n)
                }
            }
        });
        assert_eq!(cache.get(()).await, Err("boom"));
        assert_eq!(cache.stats().entries, 0);
        assert_eq!(cache.get(()).await, Ok(1));
        assert_eq!(cache.stats().entries, 1);
    }

    #[tokio::test]
    async fn failed_keys_leave_no_entries() {
        let cache = Cached::new(Duration::from_secs(60), |k: u32| async move {
            if k % 2 == 0 {
                Err(k)
            } else {
                Ok(k)
            }
        });
        for k in 0..200 {
            let _ = cache.get(k).await;
        }
        assert_eq!(cache.stats().entries, 100);
        assert_eq!(cache.purge_expired(), 0);
        assert_eq!(cache.stats().entries, 100);
    }

    #[tokio::test]
    async fn purge_drops_unheld_empty_slots() {
        let cache = Cached::new(Duration::from_secs(60), |k: u32| async move { Ok::<_, ()>(k) });
        let orphan: Slot<u32> = Arc::new(OnceCell::new());
        lock(&cache.slots).insert(7, Arc::clone(&orphan));
        // still held by a caller
        assert_eq!(cache.purge_expired(), 0);
        drop(orphan);
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.get(7).await, Ok(7));
        assert_eq!(cache.stats().entries, 1);
    }
}
