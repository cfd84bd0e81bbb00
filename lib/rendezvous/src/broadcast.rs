// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Integer-array broadcast from a root rank.
//!
//! The root publishes its buffer as little-endian `i32`s under `bcast/int/<root>`.
//! Two barriers frame the exchange: `bcast_int_<root>_write` makes the record
//! visible before anyone reads it, `bcast_int_<root>_read` keeps the root from
//! deleting it before the last reader is done.

use crate::barrier::Barrier;
use crate::config::{BarrierConfig, BroadcastConfig};
use crate::error::{RendezvousResult, StoreResultExt};
use crate::keys::KeySpace;
use crate::poll::poll_until;
use crate::registration::Membership;
use crate::store::CoordinationStore;

const WIDTH: usize = std::mem::size_of::<i32>();

pub struct Broadcast<'a> {
    store: &'a dyn CoordinationStore,
    keys: &'a KeySpace,
    me: Membership,
    config: &'a BroadcastConfig,
    barrier: Barrier<'a>,
}

impl<'a> Broadcast<'a> {
    pub fn new(
        store: &'a dyn CoordinationStore,
        keys: &'a KeySpace,
        me: Membership,
        config: &'a BroadcastConfig,
        barrier_config: &'a BarrierConfig,
    ) -> Self {
        Self {
            store,
            keys,
            me,
            config,
            barrier: Barrier::new(store, keys, me, barrier_config),
        }
    }

    /// Replace `values` on every non-root rank with the root's `values`.
    ///
    /// Every rank must pass a buffer of the same length.
    pub async fn run(&self, values: &mut [i32], root: u32) -> RendezvousResult<()> {
        const OP: &str = "broadcast";
        self.me.check_peer(OP, root)?;

        let key = self.keys.broadcast(root);
        let is_root = self.me.rank() == root;

        if is_root {
            self.store
                .put(&key, &encode(values))
                .await
                .store_context(OP, &key)?;
        }

        self.barrier.wait(&format!("bcast_int_{root}_write")).await?;

        if !is_root {
            let blob = self.fetch(&key, values.len(), root).await?;
            decode(&blob, values);
        }

        self.barrier.wait(&format!("bcast_int_{root}_read")).await?;

        if is_root {
            self.store.delete(&key).await.store_context(OP, &key)?;
        }

        tracing::debug!(rank = self.me.rank(), root, count = values.len(), "Broadcast complete");
        Ok(())
    }

    /// Poll the root's record until it holds at least `count` values.
    async fn fetch(&self, key: &str, count: usize, root: u32) -> RendezvousResult<Vec<u8>> {
        const OP: &str = "broadcast";
        let store = self.store;
        let wanted = count * WIDTH;
        poll_until(self.config.policy(), |_| async move {
            let value = store.get(key).await.store_context(OP, key)?;
            Ok(value.filter(|v| v.len() >= wanted))
        })
        .await
        .map_err(|e| e.into_runtime(OP, format!("root rank {root}"), key))
    }
}

fn encode(values: &[i32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Fill `out` from the front of `blob`, which must hold at least `out.len()` values.
fn decode(blob: &[u8], out: &mut [i32]) {
    for (slot, chunk) in out.iter_mut().zip(blob.chunks_exact(WIDTH)) {
        let mut raw = [0u8; WIDTH];
        raw.copy_from_slice(chunk);
        *slot = i32::from_le_bytes(raw);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::error::RuntimeError;
    use crate::store::memory::MemoryStore;
    use std::sync::Arc;

    async fn run_group(
        store: &MemoryStore,
        size: u32,
        root: u32,
        init: impl Fn(u32) -> Vec<i32>,
    ) -> Vec<RendezvousResult<Vec<i32>>> {
        let config = Arc::new(RuntimeConfig::for_testing());
        let keys = KeySpace::default();
        let handles: Vec<_> = (0..size)
            .map(|rank| {
                let (store, keys, config) = (store.clone(), keys.clone(), config.clone());
                let mut values = init(rank);
                tokio::spawn(async move {
                    Broadcast::new(
                        &store,
                        &keys,
                        Membership::new(rank, size),
                        &config.broadcast,
                        &config.barrier,
                    )
                    .run(&mut values, root)
                    .await
                    .map(|_| values)
                })
            })
            .collect();

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }
        results
    }

    #[tokio::test(start_paused = true)]
    async fn test_values_reach_every_rank() {
        let store = MemoryStore::new();
        let results = run_group(&store, 3, 0, |rank| {
            if rank == 0 { vec![1, 2, 3] } else { vec![0; 3] }
        })
        .await;

        for result in results {
            assert_eq!(result.unwrap(), vec![1, 2, 3]);
        }
        assert!(store.is_empty(), "leftover keys: {:?}", store.keys());
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_zero_root_and_negative_values() {
        let store = MemoryStore::new();
        let results = run_group(&store, 4, 2, |rank| {
            if rank == 2 { vec![-7, i32::MAX, i32::MIN] } else { vec![9; 3] }
        })
        .await;

        for result in results {
            assert_eq!(result.unwrap(), vec![-7, i32::MAX, i32::MIN]);
        }
    }

    #[tokio::test]
    async fn test_root_outside_group_is_rejected() {
        let store = MemoryStore::new();
        let keys = KeySpace::default();
        let config = RuntimeConfig::for_testing();
        let mut values = vec![1];

        let err = Broadcast::new(
            &store,
            &keys,
            Membership::new(0, 2),
            &config.broadcast,
            &config.barrier,
        )
        .run(&mut values, 5)
        .await
        .unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidRank { rank: 5, .. }));
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_record_is_read_again_until_complete() {
        let store = MemoryStore::new();
        let keys = KeySpace::default();
        let key = keys.broadcast(0);
        store.put(&key, &encode(&[1])).await.unwrap();
        let config = RuntimeConfig::for_testing();
        let bcast = Broadcast::new(
            &store,
            &keys,
            Membership::new(1, 2),
            &config.broadcast,
            &config.barrier,
        );

        let (blob, _) = tokio::join!(bcast.fetch(&key, 3, 0), async {
            tokio::time::sleep(std::time::Duration::from_millis(350)).await;
            store.put(&key, &encode(&[1, 2, 3])).await.unwrap();
        });

        let mut out = [0; 3];
        decode(&blob.unwrap(), &mut out);
        assert_eq!(out, [1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_record_that_stays_short_times_out() {
        let store = MemoryStore::new();
        let keys = KeySpace::default();
        let key = keys.broadcast(0);
        store.put(&key, &encode(&[1, 2])).await.unwrap();
        let config = RuntimeConfig::for_testing();
        let bcast = Broadcast::new(
            &store,
            &keys,
            Membership::new(1, 2),
            &config.broadcast,
            &config.barrier,
        );
        let start = tokio::time::Instant::now();

        let err = bcast.fetch(&key, 3, 0).await.unwrap_err();
        match &err {
            RuntimeError::Timeout {
                op,
                waiting_on,
                attempts,
                ..
            } => {
                assert_eq!(*op, "broadcast");
                assert_eq!(waiting_on, "root rank 0");
                assert_eq!(*attempts, 10);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(start.elapsed(), std::time::Duration::from_secs(1));
        // the short record is left for the root to clean up
        assert!(store.contains(&key));
    }

    #[test]
    fn test_short_blob_only_fills_available_slots() {
        let mut out = [0; 3];
        decode(&encode(&[4, 5]), &mut out);
        assert_eq!(out, [4, 5, 0]);
        assert_eq!(encode(&[1]), vec![1, 0, 0, 0]);
    }
}
