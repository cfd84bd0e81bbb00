// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use super::{CoordinationStore, LockKey};
use crate::{Result, raise};

/// In-process coordination store.
///
/// Clones share the same map and locks, so several ranks simulated as tasks
/// in one process see a single linearizable store.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    inner: Arc<MemoryStoreInner>,
}

#[derive(Debug, Default)]
struct MemoryStoreInner {
    kv: Mutex<BTreeMap<String, Vec<u8>>>,
    /// lock name -> ownership token of the current holder
    locks: Mutex<HashMap<String, Vec<u8>>>,
    released: Notify,
    next_token: AtomicU64,
    unavailable: AtomicBool,
    lock_failure: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail as if the store were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make `lock` fail while every other call keeps working.
    pub fn set_lock_failure(&self, fail: bool) {
        self.inner.lock_failure.store(fail, Ordering::SeqCst);
    }

    /// Snapshot of all keys currently stored.
    pub fn keys(&self) -> Vec<String> {
        self.inner.kv.lock().keys().cloned().collect()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.kv.lock().contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.kv.lock().is_empty()
    }

    pub fn is_locked(&self, name: &str) -> bool {
        self.inner.locks.lock().contains_key(name)
    }

    fn check_available(&self) -> Result<()> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            raise!("memory store unavailable");
        }
        Ok(())
    }

    fn try_acquire(&self, name: &str) -> Option<LockKey> {
        let mut locks = self.inner.locks.lock();
        if locks.contains_key(name) {
            return None;
        }
        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);
        let key = format!("{name}/{token:x}").into_bytes();
        locks.insert(name.to_string(), key.clone());
        Some(LockKey::new(name, key, None))
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.check_available()?;
        Ok(self.inner.kv.lock().get(key).cloned())
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.check_available()?;
        self.inner.kv.lock().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check_available()?;
        self.inner.kv.lock().remove(key);
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        self.check_available()?;
        self.inner.kv.lock().retain(|k, _| !k.starts_with(prefix));
        Ok(())
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        self.check_available()?;
        Ok(self
            .inner
            .kv
            .lock()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn lock(&self, name: &str) -> Result<LockKey> {
        loop {
            self.check_available()?;
            if self.inner.lock_failure.load(Ordering::SeqCst) {
                raise!("lock {name}: lease expired");
            }

            // register interest before checking so a release in between is not lost
            let notified = self.inner.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(key) = self.try_acquire(name) {
                return Ok(key);
            }
            notified.await;
        }
    }

    async fn unlock(&self, key: LockKey) -> Result<()> {
        self.check_available()?;
        {
            let mut locks = self.inner.locks.lock();
            match locks.get(key.name()) {
                Some(holder) if holder.as_slice() == key.key() => {
                    locks.remove(key.name());
                }
                _ => raise!("lock {} is not held by {}", key.name(), key),
            }
        }
        self.inner.released.notify_waiters();
        Ok(())
    }

    fn endpoint(&self) -> String {
        "memory://".to_string()
    }
}
