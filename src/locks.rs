//! Per-key advisory locking: a registry of named `tokio::sync::Mutex`es so
//! that message ordering within a session and the condensation/profile
//! cascade within a user both serialize without blocking unrelated keys
//! against each other. No teacher file implements this directly; the
//! registry-of-named-mutexes shape is the natural async idiom for "one lock
//! per logical key, created lazily."

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Default)]
pub struct LockRegistry {
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self {
            locks: StdMutex::new(HashMap::new()),
        }
    }

    /// Acquires the named lock, creating it if this is the first caller to
    /// ever reference this key. Returns an owned guard so callers can hold it
    /// across `.await` points without borrowing the registry.
    pub async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut locks = self.locks.lock().expect("lock registry mutex poisoned");
            locks.entry(key.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
        };
        mutex.lock_owned().await
    }

    pub fn session_key(session_id: &str) -> String {
        format!("session:{session_id}")
    }

    pub fn user_key(user_id: &str) -> String {
        format!("user:{user_id}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn concurrent_acquires_on_same_key_serialize() {
        let registry = Arc::new(LockRegistry::new());
        let counter = Arc::new(AtomicU32::new(0));
        let max_concurrent = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let registry = registry.clone();
            let counter = counter.clone();
            let max_concurrent = max_concurrent.clone();
            handles.push(tokio::spawn(async move {
                let _guard = registry.acquire("user:shared").await;
                let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
                max_concurrent.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                counter.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(max_concurrent.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn different_keys_do_not_block_each_other() {
        let registry = Arc::new(LockRegistry::new());
        let _g1 = registry.acquire("session:a").await;
        let g2_fut = registry.acquire("session:b");
        let result = tokio::time::timeout(Duration::from_millis(50), g2_fut).await;
        assert!(result.is_ok(), "distinct keys must not contend");
    }
}
