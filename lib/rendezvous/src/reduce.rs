// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Sum-reduction of one `f64` per rank onto a destination rank.
//!
//! Every rank publishes `reduce/<op>/rank-<r>` with 16 fractional digits. The
//! destination seeds the sum with its own value and folds the contributions of
//! the other `size - 1` ranks as they show up, deleting each one it consumes.
//! Other ranks return as soon as their value is written, so an operation id
//! must not be reused until the destination is known to be done with it.

use parking_lot::Mutex;

use crate::barrier::check_id;
use crate::config::ReduceConfig;
use crate::error::{RendezvousResult, StoreResultExt, parse_value};
use crate::keys::KeySpace;
use crate::poll::poll_until;
use crate::registration::Membership;
use crate::store::CoordinationStore;

const OP: &str = "reduce_sum";

pub struct Reduction<'a> {
    store: &'a dyn CoordinationStore,
    keys: &'a KeySpace,
    me: Membership,
    config: &'a ReduceConfig,
}

#[derive(Debug, Default)]
struct Tally {
    sum: f64,
    consumed: u32,
}

impl<'a> Reduction<'a> {
    pub fn new(
        store: &'a dyn CoordinationStore,
        keys: &'a KeySpace,
        me: Membership,
        config: &'a ReduceConfig,
    ) -> Self {
        Self {
            store,
            keys,
            me,
            config,
        }
    }

    /// Contribute `local` to operation `op_id`; only `dest` gets the sum back.
    pub async fn sum(&self, local: f64, dest: u32, op_id: &str) -> RendezvousResult<Option<f64>> {
        self.me.check_peer(OP, dest)?;
        check_id(OP, op_id)?;

        let own_key = self.keys.contribution(op_id, self.me.rank());
        self.store
            .put(&own_key, format!("{local:.16}").as_bytes())
            .await
            .store_context(OP, &own_key)?;

        if self.me.rank() != dest {
            return Ok(None);
        }

        let subtree = self.keys.reduction(op_id);
        let result = self.collect(local, &own_key, &subtree).await;

        // the subtree goes whether or not every contribution arrived
        if let Err(e) = self.store.delete_prefix(&subtree).await {
            tracing::warn!(key = %subtree, "Failed to remove reduction record: {e:#}");
        }

        let total = result?;
        tracing::debug!(rank = self.me.rank(), op_id, total, "Reduction complete");
        Ok(Some(total))
    }

    async fn collect(&self, local: f64, own_key: &str, subtree: &str) -> RendezvousResult<f64> {
        let store = self.store;
        let expected = self.me.size() - 1;
        let tally = Mutex::new(Tally {
            sum: local,
            consumed: 0,
        });

        poll_until(self.config.policy(), |_| {
            let tally = &tally;
            async move {
                let keys = store.list_keys(subtree).await.store_context(OP, subtree)?;
                for key in keys.iter().filter(|k| k.as_str() != own_key) {
                    let Some(raw) = store.get(key).await.store_context(OP, key)? else {
                        continue;
                    };
                    let value = parse_value::<f64>(OP, key, &raw)?;
                    store.delete(key).await.store_context(OP, key)?;

                    let mut tally = tally.lock();
                    tally.sum += value;
                    tally.consumed += 1;
                }
                let tally = tally.lock();
                Ok((tally.consumed >= expected).then_some(tally.sum))
            }
        })
        .await
        .map_err(|e| {
            let consumed = tally.lock().consumed;
            e.into_runtime(
                OP,
                format!("{consumed}/{expected} contributions"),
                subtree,
            )
        })
    }
}
