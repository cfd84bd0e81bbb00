// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Group-wide barrier keyed by a caller-chosen id.
//!
//! 1. Leave an arrival marker `proc-<rank>` and bump `count` under the group lock.
//! 2. Poll `count` until it reaches the group size; the rank that sees it equal
//!    to the size raises `ready`.
//! 3. Poll `ready`, then remove the arrival marker.
//! 4. Rank 0 waits out a grace period so slower ranks can still read `ready`,
//!    then deletes the barrier record.
//!
//! Reusing an id is only safe once rank 0 has torn the previous record down;
//! successive barriers should use fresh ids.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::config::BarrierConfig;
use crate::error::{RendezvousResult, RuntimeError, StoreResultExt, parse_value};
use crate::keys::KeySpace;
use crate::poll::poll_until;
use crate::registration::Membership;
use crate::store::{CoordinationStore, with_lock};

const ARRIVED: &[u8] = b"arrived";
const READY: &[u8] = b"true";

pub struct Barrier<'a> {
    store: &'a dyn CoordinationStore,
    keys: &'a KeySpace,
    me: Membership,
    config: &'a BarrierConfig,
}

/// Barrier ids become a single path segment.
pub(crate) fn check_id(op: &'static str, id: &str) -> RendezvousResult<()> {
    if id.is_empty() || id.contains('/') {
        return Err(RuntimeError::InvalidId {
            op,
            id: id.to_string(),
        });
    }
    Ok(())
}

impl<'a> Barrier<'a> {
    pub fn new(
        store: &'a dyn CoordinationStore,
        keys: &'a KeySpace,
        me: Membership,
        config: &'a BarrierConfig,
    ) -> Self {
        Self {
            store,
            keys,
            me,
            config,
        }
    }

    /// Block until every rank of the group has called `wait` with the same id.
    pub async fn wait(&self, id: &str) -> RendezvousResult<()> {
        const OP: &str = "barrier";
        check_id(OP, id)?;

        let size = self.me.size();
        let arrival_key = self.keys.barrier_arrival(id, self.me.rank());
        let count_key = self.keys.barrier_count(id);
        let ready_key = self.keys.barrier_ready(id);

        self.store
            .put(&arrival_key, ARRIVED)
            .await
            .store_context(OP, &arrival_key)?;

        let arrived = self.increment(OP, &count_key).await?;
        tracing::debug!(rank = self.me.rank(), barrier = id, arrived, size, "Arrived at barrier");

        let store = self.store;
        let observed = AtomicU32::new(arrived);
        let count = poll_until(self.config.arrival_policy(), |_| {
            let (count_key, observed) = (&count_key, &observed);
            async move {
                let Some(raw) = store.get(count_key).await.store_context(OP, count_key)? else {
                    return Ok(None);
                };
                let count = parse_value::<u32>(OP, count_key, &raw)?;
                observed.store(count, Ordering::Relaxed);
                Ok((count >= size).then_some(count))
            }
        })
        .await
        .map_err(|e| {
            let got = observed.load(Ordering::Relaxed);
            e.into_runtime(OP, format!("{got}/{size} ranks at {id}"), &count_key)
        })?;

        if count == size {
            store
                .put(&ready_key, READY)
                .await
                .store_context(OP, &ready_key)?;
        }

        poll_until(self.config.ready_policy(), |_| {
            let ready_key = &ready_key;
            async move {
                let ready = store.get(ready_key).await.store_context(OP, ready_key)?;
                Ok(ready.filter(|v| v.as_slice() == READY).map(|_| ()))
            }
        })
        .await
        .map_err(|e| e.into_runtime(OP, format!("ready signal of {id}"), &ready_key))?;

        store
            .delete(&arrival_key)
            .await
            .store_context(OP, &arrival_key)?;

        if self.me.is_janitor() {
            tokio::time::sleep(self.config.grace()).await;
            let record = self.keys.barrier(id);
            store
                .delete_prefix(&record)
                .await
                .store_context(OP, &record)?;
        }

        Ok(())
    }

    /// Read-increment-write of the arrival counter, serialized by the group lock.
    async fn increment(&self, op: &'static str, count_key: &str) -> RendezvousResult<u32> {
        let store = self.store;
        with_lock(store, &self.keys.lock(), || async move {
            let current = match store.get(count_key).await.store_context(op, count_key)? {
                Some(raw) => parse_value::<u32>(op, count_key, &raw)?,
                None => 0,
            };
            let next = current + 1;
            store
                .put(count_key, next.to_string().as_bytes())
                .await
                .store_context(op, count_key)?;
            Ok(next)
        })
        .await
        .map_err(|e| match e {
            // only registration treats a lost lock as fatal
            RuntimeError::Lock { name, source } => RuntimeError::store(op, name, source),
            other => other,
        })
    }
}
