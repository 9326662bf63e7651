// Copyright 2023-, UPC Contributors
// SPDX-License-Identifier: Apache-2.0

//! String-keyed lock tables for serializing channel operations.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex},
};

use tokio::sync::{Mutex, OwnedMutexGuard};

/// A table of fair FIFO async mutexes keyed by string.
///
/// [`LockTable::acquire`] suspends until the lock for the key is free and
/// returns an owned guard that unlocks on drop, so every exit path releases.
/// Guards may be held across suspension points; waiters on one key are
/// queued in arrival order.
pub struct LockTable {
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self {
            locks: StdMutex::new(HashMap::new()),
        }
    }

    /// Acquires the lock for `key`, creating it on first use.
    pub async fn acquire(&self, key: impl Into<String>) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap();
            locks
                .entry(key.into())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

impl Default for LockTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::*;

    #[tokio::test]
    async fn same_key_excludes_different_keys_proceed() {
        let table = Arc::new(LockTable::new());

        let held = table.acquire("a").await;

        // a second acquire on the same key must not complete while held
        let contended = {
            let table = table.clone();
            tokio::spawn(async move { table.acquire("a").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contended.is_finished());

        // an unrelated key is not blocked
        let _other = table.acquire("b").await;

        drop(held);
        contended.await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_sections_serialize() {
        let table = Arc::new(LockTable::new());
        let counter = Arc::new(StdMutex::new((0u32, 0u32))); // (current, max observed)

        let mut handles = Vec::new();
        for _ in 0..8 {
            let table = table.clone();
            let counter = counter.clone();
            handles.push(tokio::spawn(async move {
                let _guard = table.acquire("channel").await;
                {
                    let mut c = counter.lock().unwrap();
                    c.0 += 1;
                    c.1 = c.1.max(c.0);
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
                counter.lock().unwrap().0 -= 1;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(counter.lock().unwrap().1, 1);
    }
}
