// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! etcd v3 backend.
//!
//! The group lock is taken with a lease of `lock_ttl_secs` so a holder that
//! dies mid-registration cannot wedge every later registrant; the lease is
//! revoked on unlock. The lease is not kept alive: waiting in the lock queue
//! consumes its TTL.

use std::fmt;

use async_trait::async_trait;
use etcd_client::{
    ConnectOptions, DeleteOptions, GetOptions, LockOptions, SortOrder, SortTarget,
};
use parking_lot::RwLock;

use super::{CoordinationStore, LockKey};
use crate::{ErrorContext, Result};

/// Coarse classification of etcd failures for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EtcdErrorClass {
    /// Server down or unreachable
    Unavailable,
    /// Connection dropped mid-call
    ConnectionClosed,
    /// Request deadline exceeded
    Timeout,
    /// Lease backing a lock expired
    LeaseNotFound,
    /// Anything else (permissions, invalid request, ...)
    Fatal,
}

impl fmt::Display for EtcdErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable => write!(f, "service unavailable"),
            Self::ConnectionClosed => write!(f, "connection closed"),
            Self::Timeout => write!(f, "operation timed out"),
            Self::LeaseNotFound => write!(f, "lease not found"),
            Self::Fatal => write!(f, "request failed"),
        }
    }
}

/// etcd_client::Error does not expose structured kinds, so match on the message.
pub(crate) fn classify_error(message: &str) -> EtcdErrorClass {
    let msg = message.to_lowercase();

    if msg.contains("unavailable")
        || msg.contains("connection refused")
        || msg.contains("connection reset")
        || msg.contains("broken pipe")
        || msg.contains("not connected")
    {
        return EtcdErrorClass::Unavailable;
    }

    if msg.contains("connection closed")
        || msg.contains("connection error")
        || msg.contains("stream closed")
        || msg.contains("channel closed")
    {
        return EtcdErrorClass::ConnectionClosed;
    }

    if msg.contains("timeout") || msg.contains("deadline exceeded") {
        return EtcdErrorClass::Timeout;
    }

    if msg.contains("lease not found") {
        return EtcdErrorClass::LeaseNotFound;
    }

    EtcdErrorClass::Fatal
}

fn annotate(op: &str, key: &str, err: etcd_client::Error) -> anyhow::Error {
    let class = classify_error(&err.to_string());
    anyhow::Error::new(err).context(format!("etcd {op} on {key} failed ({class})"))
}

/// Best-effort revoke; an unrevoked lease still expires after its TTL.
async fn revoke_lease(client: &mut etcd_client::Client, lock: &str, lease_id: i64) -> bool {
    match client.lease_revoke(lease_id).await {
        Ok(_) => true,
        Err(e) => {
            tracing::debug!(lock, lease_id, "Failed to revoke lock lease: {e}");
            false
        }
    }
}

pub struct EtcdStore {
    /// WARNING: Do not hold the read guard across an await point
    client: RwLock<etcd_client::Client>,
    endpoints: Vec<String>,
    lock_ttl_secs: i64,
}

impl fmt::Debug for EtcdStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EtcdStore")
            .field("endpoints", &self.endpoints)
            .field("lock_ttl_secs", &self.lock_ttl_secs)
            .finish()
    }
}

impl EtcdStore {
    /// Connect to the etcd cluster at `endpoints`.
    pub async fn connect(
        endpoints: Vec<String>,
        connect_options: Option<ConnectOptions>,
        lock_ttl_secs: u64,
    ) -> Result<Self> {
        tracing::info!("Connecting to etcd at {}", endpoints.join(", "));

        let client = etcd_client::Client::connect(endpoints.clone(), connect_options)
            .await
            .with_context(|| {
                format!(
                    "Unable to connect to etcd server at {}. Check etcd server status",
                    endpoints.join(", ")
                )
            })?;

        Ok(Self {
            client: RwLock::new(client),
            endpoints,
            lock_ttl_secs: lock_ttl_secs as i64,
        })
    }

    /// Clone of the current client; etcd_client::Client is a cheap handle.
    fn client(&self) -> etcd_client::Client {
        self.client.read().clone()
    }

    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }
}

#[async_trait]
impl CoordinationStore for EtcdStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let resp = self
            .client()
            .get(key, None)
            .await
            .map_err(|e| annotate("get", key, e))?;
        Ok(resp.kvs().first().map(|kv| kv.value().to_vec()))
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.client()
            .put(key, value, None)
            .await
            .map_err(|e| annotate("put", key, e))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.client()
            .delete(key, None)
            .await
            .map_err(|e| annotate("delete", key, e))?;
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        let resp = self
            .client()
            .delete(prefix, Some(DeleteOptions::new().with_prefix()))
            .await
            .map_err(|e| annotate("delete_prefix", prefix, e))?;
        tracing::trace!(prefix, deleted = resp.deleted(), "Deleted subtree");
        Ok(())
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let options = GetOptions::new()
            .with_prefix()
            .with_keys_only()
            .with_sort(SortTarget::Key, SortOrder::Ascend);
        let resp = self
            .client()
            .get(prefix, Some(options))
            .await
            .map_err(|e| annotate("list", prefix, e))?;

        resp.kvs()
            .iter()
            .map(|kv| {
                kv.key_str()
                    .map(str::to_string)
                    .with_context(|| format!("non utf-8 key under {prefix}"))
            })
            .collect()
    }

    async fn lock(&self, name: &str) -> Result<LockKey> {
        let mut client = self.client();

        let lease = client
            .lease_grant(self.lock_ttl_secs, None)
            .await
            .map_err(|e| annotate("lease_grant", name, e))?;
        let lease_id = lease.id();

        let resp = match client
            .lock(name, Some(LockOptions::new().with_lease(lease_id)))
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                revoke_lease(&mut client, name, lease_id).await;
                return Err(annotate("lock", name, e));
            }
        };

        tracing::debug!(lock = name, lease_id, "Acquired lock");
        Ok(LockKey::new(name, resp.key().to_vec(), Some(lease_id)))
    }

    async fn unlock(&self, key: LockKey) -> Result<()> {
        let mut client = self.client();
        client
            .unlock(key.key().to_vec())
            .await
            .map_err(|e| annotate("unlock", key.name(), e))?;

        if let Some(lease_id) = key.lease_id() {
            revoke_lease(&mut client, key.name(), lease_id).await;
        }
        Ok(())
    }

    fn endpoint(&self) -> String {
        self.endpoints.join(",")
    }
}
