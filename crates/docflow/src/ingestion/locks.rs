//! Per-content-hash locks shared by upload and delete
//!
//! Blobs are content-addressed, so an upload and a delete of identical bytes
//! touch the same object key. Holding the hash lock around the row/blob pair
//! keeps a delete from removing bytes a fresh upload just stored.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Clone, Default)]
pub struct ContentLocks {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl ContentLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive use of `hash`
    pub async fn lock(&self, hash: &str) -> ContentLock {
        let mutex = Arc::clone(
            self.locks
                .entry(hash.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        );
        ContentLock {
            locks: Arc::clone(&self.locks),
            hash: hash.to_string(),
            guard: Some(mutex.lock_owned().await),
        }
    }

    /// Hashes with a holder or a waiter
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Held while a hash is in use; the map entry goes away with the last user
pub struct ContentLock {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
    hash: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for ContentLock {
    fn drop(&mut self) {
        self.guard.take();
        // one reference in the map, none elsewhere
        self.locks
            .remove_if(&self.hash, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_hash_is_exclusive() {
        let locks = ContentLocks::new();
        let held = locks.lock("abc").await;

        let contender = locks.clone();
        let waiter = tokio::spawn(async move { contender.lock("abc").await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        // other hashes are independent
        drop(locks.lock("def").await);

        drop(held);
        let second = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        drop(second);
        assert!(locks.is_empty());
    }
}
