// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Rank assignment and group teardown.
//!
//! Under the group lock each registrant reads the `size` counter (absent means
//! 0), takes that value as its rank, then writes `size = rank + 1` and a
//! `rank/<r>` marker. Ranks handed out across the group are therefore exactly
//! `0..size`, whatever the arrival order.
//!
//! Rank 0 is the janitor: on teardown it removes the counter, the barrier
//! subtree and finally the whole namespace. If rank 0 exits abnormally the keys
//! outlive the run; no other rank takes over.

use std::fmt;

use crate::error::{RendezvousResult, RuntimeError, StoreResultExt, parse_value};
use crate::keys::KeySpace;
use crate::store::{CoordinationStore, with_lock};

const ACTIVE: &[u8] = b"active";

/// This process's identity within the group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Membership {
    rank: u32,
    size: u32,
}

impl Membership {
    pub fn new(rank: u32, size: u32) -> Self {
        Self { rank, size }
    }

    pub fn rank(&self) -> u32 {
        self.rank
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn is_janitor(&self) -> bool {
        self.rank == 0
    }

    /// Reject ranks outside the group.
    pub fn check_peer(&self, op: &'static str, peer: u32) -> RendezvousResult<()> {
        if peer >= self.size {
            return Err(RuntimeError::InvalidRank {
                op,
                rank: peer,
                size: self.size,
            });
        }
        Ok(())
    }
}

/// Token shared by every rank of one group, minted by rank 0 at registration.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RunId(String);

impl RunId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Claim the next free rank in a group of `declared_size`.
pub async fn register(
    store: &dyn CoordinationStore,
    keys: &KeySpace,
    declared_size: u32,
) -> RendezvousResult<(Membership, RunId)> {
    const OP: &str = "register";

    let size_key = keys.size();
    let run_key = keys.run();

    let (rank, run_id) = with_lock(store, &keys.lock(), || async {
        let rank = match store.get(&size_key).await.store_context(OP, &size_key)? {
            Some(raw) => parse_value::<u32>(OP, &size_key, &raw)?,
            None => 0,
        };

        if rank >= declared_size {
            return Err(RuntimeError::GroupFull {
                declared: declared_size,
                registered: rank,
            });
        }

        let run_id = if rank == 0 {
            let run_id = RunId::generate();
            store
                .put(&run_key, run_id.as_str().as_bytes())
                .await
                .store_context(OP, &run_key)?;
            run_id
        } else {
            match store.get(&run_key).await.store_context(OP, &run_key)? {
                Some(raw) => RunId(String::from_utf8_lossy(&raw).into_owned()),
                None => {
                    return Err(RuntimeError::parse(
                        OP,
                        run_key.as_str(),
                        b"",
                        "run id missing although ranks are registered",
                    ));
                }
            }
        };

        store
            .put(&size_key, (rank + 1).to_string().as_bytes())
            .await
            .store_context(OP, &size_key)?;
        let rank_key = keys.rank(rank);
        store
            .put(&rank_key, ACTIVE)
            .await
            .store_context(OP, &rank_key)?;

        Ok((rank, run_id))
    })
    .await?;

    tracing::info!(
        "Registered as rank {} item {} of {} (run {})",
        rank,
        rank + 1,
        declared_size,
        run_id
    );

    Ok((Membership::new(rank, declared_size), run_id))
}

/// Remove this rank's marker; rank 0 also removes everything under the namespace.
///
/// Absent keys are not errors, so calling this again is harmless.
pub async fn deregister(
    store: &dyn CoordinationStore,
    keys: &KeySpace,
    membership: Membership,
) -> RendezvousResult<()> {
    const OP: &str = "deregister";

    let rank_key = keys.rank(membership.rank());
    store.delete(&rank_key).await.store_context(OP, &rank_key)?;

    if membership.is_janitor() {
        let size_key = keys.size();
        store.delete(&size_key).await.store_context(OP, &size_key)?;

        let run_key = keys.run();
        store.delete(&run_key).await.store_context(OP, &run_key)?;

        let barriers = keys.barriers();
        store
            .delete_prefix(&barriers)
            .await
            .store_context(OP, &barriers)?;

        store
            .delete_prefix(keys.prefix())
            .await
            .store_context(OP, keys.prefix())?;
    }

    tracing::debug!(rank = membership.rank(), "Deregistered");
    Ok(())
}
