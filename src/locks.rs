use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use ulid::Ulid;

/// Held while a property's timeline is being checked and written.
pub type PropertyGuard = OwnedMutexGuard<()>;

/// Process-local mutual exclusion per property.
///
/// Locks are created on first use and reclaimed by [`LockRegistry::sweep`].
/// Holders and waiters each own a clone of the lock's `Arc`, so an entry whose
/// strong count is 1 is neither held nor awaited. The sweep evaluates that
/// under the map shard's write lock, which is also what `acquire` needs to
/// clone the `Arc`; the two can therefore never interleave.
///
/// This only cuts contention inside one process. Cross-process correctness
/// comes from the store's serializable commit.
#[derive(Default)]
pub struct LockRegistry {
    locks: DashMap<Ulid, Arc<Mutex<()>>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, property_id: Ulid) -> PropertyGuard {
        let lock = self.locks.entry(property_id).or_default().value().clone();
        let wait_start = std::time::Instant::now();
        let guard = lock.lock_owned().await;
        metrics::histogram!(crate::observability::LOCK_WAIT_SECONDS)
            .record(wait_start.elapsed().as_secs_f64());
        guard
    }

    /// Run `f` while holding the property's lock. The lock is released when the
    /// future completes, errors, panics, or is dropped.
    pub async fn with_property_lock<F, Fut, T>(&self, property_id: Ulid, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _guard = self.acquire(property_id).await;
        f().await
    }

    /// Drop every lock that is unheld and has no waiters. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        let after = self.locks.len();
        metrics::gauge!(crate::observability::PROPERTY_LOCKS_ACTIVE).set(after as f64);
        before.saturating_sub(after)
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn lock_created_lazily_and_swept_when_idle() {
        let registry = LockRegistry::new();
        assert!(registry.is_empty());

        let pid = Ulid::new();
        let out = registry.with_property_lock(pid, || async { 7 }).await;
        assert_eq!(out, 7);
        assert_eq!(registry.len(), 1);

        assert_eq!(registry.sweep(), 1);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn sweep_keeps_held_locks() {
        let registry = LockRegistry::new();
        let pid = Ulid::new();
        let guard = registry.acquire(pid).await;

        assert_eq!(registry.sweep(), 0);
        assert_eq!(registry.len(), 1);

        drop(guard);
        assert_eq!(registry.sweep(), 1);
    }

    #[tokio::test]
    async fn same_property_is_serialized() {
        let registry = Arc::new(LockRegistry::new());
        let pid = Ulid::new();
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            let inside = inside.clone();
            let max_inside = max_inside.clone();
            handles.push(tokio::spawn(async move {
                registry
                    .with_property_lock(pid, || async {
                        let n = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_inside.fetch_max(n, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(2)).await;
                        inside.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn different_properties_do_not_block() {
        let registry = LockRegistry::new();
        let _a = registry.acquire(Ulid::new()).await;
        let b = tokio::time::timeout(Duration::from_millis(100), registry.acquire(Ulid::new())).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn lock_released_after_panic() {
        let registry = Arc::new(LockRegistry::new());
        let pid = Ulid::new();

        let r = registry.clone();
        let result = tokio::spawn(async move {
            r.with_property_lock(pid, || async { panic!("boom"); }).await
        })
        .await;
        assert!(result.is_err());

        let relock = tokio::time::timeout(Duration::from_millis(100), registry.acquire(pid)).await;
        assert!(relock.is_ok());
    }
}
