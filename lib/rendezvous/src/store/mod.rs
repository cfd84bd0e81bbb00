// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Coordination store seam.
//!
//! The runtime only needs a handful of primitives from the store:
//!
//! - **get / put / delete** on a single key
//! - **delete_prefix** to drop a whole subtree
//! - **list_keys** to enumerate a subtree (reduction collection)
//! - **lock / unlock** of a named, group-wide mutual-exclusion lock
//!
//! Each call completes before it returns; the runtime never subscribes to
//! changes, so any linearizable key-value store can back it.
//!
//! Backends:
//! - [`etcd::EtcdStore`]: etcd v3 (feature: `etcd`)
//! - [`memory::MemoryStore`]: in-process map for tests and single-host runs

use std::fmt;

use async_trait::async_trait;

use crate::Result;
use crate::error::{RendezvousResult, RuntimeError};

#[cfg(feature = "etcd")]
pub mod etcd;
pub mod memory;

/// Ownership token returned by [`CoordinationStore::lock`].
///
/// Pass it back to [`CoordinationStore::unlock`]; it is not reentrant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockKey {
    name: String,
    key: Vec<u8>,
    lease_id: Option<i64>,
}

impl LockKey {
    pub fn new(name: impl Into<String>, key: impl Into<Vec<u8>>, lease_id: Option<i64>) -> Self {
        Self {
            name: name.into(),
            key: key.into(),
            lease_id,
        }
    }

    /// The lock name that was requested.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Backend-specific ownership key.
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn lease_id(&self) -> Option<i64> {
        self.lease_id
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, String::from_utf8_lossy(&self.key))
    }
}

#[async_trait]
pub trait CoordinationStore: Send + Sync + fmt::Debug {
    /// Value at `key`, or `None` if it does not exist.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn put(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Remove `key`. Removing an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Remove every key starting with `prefix`.
    async fn delete_prefix(&self, prefix: &str) -> Result<()>;

    /// Keys starting with `prefix`, in lexical order.
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>>;

    /// Block until the named lock is held.
    async fn lock(&self, name: &str) -> Result<LockKey>;

    async fn unlock(&self, key: LockKey) -> Result<()>;

    /// Human readable location of the store, used in diagnostics.
    fn endpoint(&self) -> String;
}

/// Run `f` while holding the named lock, releasing it on every path.
///
/// Failing to take the lock is a [`RuntimeError::Lock`]; a failure to release
/// is logged and the result of `f` wins.
pub async fn with_lock<T, F, Fut>(
    store: &dyn CoordinationStore,
    name: &str,
    f: F,
) -> RendezvousResult<T>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = RendezvousResult<T>>,
{
    let key = store.lock(name).await.map_err(|source| RuntimeError::Lock {
        name: name.to_string(),
        source,
    })?;
    let result = f().await;
    if let Err(e) = store.unlock(key).await {
        tracing::warn!(lock = name, "Failed to release lock: {e:#}");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    #[tokio::test]
    async fn test_with_lock_releases_on_error() {
        let store = MemoryStore::new();

        let result: RendezvousResult<()> = with_lock(&store, "ns/lock", || async {
            Err(RuntimeError::store("test", "ns/key", anyhow::anyhow!("boom")))
        })
        .await;
        assert!(matches!(result, Err(RuntimeError::Store { .. })));

        // would block forever if the first holder leaked the lock
        let key = store.lock("ns/lock").await.unwrap();
        store.unlock(key).await.unwrap();
    }

    #[tokio::test]
    async fn test_with_lock_reports_lock_failure() {
        let store = MemoryStore::new();
        store.set_unavailable(true);

        let result = with_lock(&store, "ns/lock", || async { Ok(()) }).await;
        let err = result.unwrap_err();
        assert!(matches!(err, RuntimeError::Lock { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_lock_key_display() {
        let key = LockKey::new("xferbench/lock", b"xferbench/lock/694d".to_vec(), Some(7));
        assert_eq!(key.to_string(), "xferbench/lock (xferbench/lock/694d)");
        assert_eq!(key.lease_id(), Some(7));
    }
}
