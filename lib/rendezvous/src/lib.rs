// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Dynamo Rendezvous
//!
//! An out-of-band control channel for benchmark processes that share nothing
//! but a strongly-consistent key-value coordination service (etcd). Every
//! process registers to obtain a dense rank in `[0, size)` and can then
//!
//! - exchange a single `i32` or a byte buffer with a peer rank,
//! - synchronize the group at a named [barrier](RendezvousRuntime::barrier),
//! - [broadcast](RendezvousRuntime::broadcast) an `i32` array from a root,
//! - [sum-reduce](RendezvousRuntime::reduce_sum) an `f64` onto a destination rank.
//!
//! All of it is built from get / put / delete / delete-prefix / list-prefix and
//! a named lock on the store, using fixed-interval polling. Expect operations
//! to take seconds.
//!
//! ```rust,ignore
//! use dynamo_rendezvous::{RendezvousRuntime, RuntimeConfig};
//!
//! let rt = RendezvousRuntime::connect(RuntimeConfig::from_env()?, 2).await?;
//! if rt.rank() == 0 {
//!     rt.send_int(42, 1).await?;
//! } else {
//!     let value = rt.recv_int(0).await?;
//! }
//! rt.barrier("done").await?;
//! rt.shutdown().await?;
//! ```

pub use anyhow::{Context as ErrorContext, Error, Result, anyhow as error, bail as raise};

pub mod barrier;
pub mod broadcast;
pub mod channel;
pub mod config;
pub mod error;
pub mod keys;
pub mod logging;
pub mod poll;
pub mod reduce;
pub mod registration;
pub mod runtime;
pub mod store;
pub mod traits;

pub use config::{ConfigError, RuntimeConfig};
pub use error::RuntimeError;
pub use keys::{KeySpace, PayloadKind};
pub use poll::PollPolicy;
pub use registration::{Membership, RunId};
pub use runtime::{RendezvousOptions, RendezvousOptionsBuilder, RendezvousRuntime};
pub use store::{CoordinationStore, LockKey, memory::MemoryStore};
pub use traits::CollectiveRuntime;

#[cfg(feature = "etcd")]
pub use store::etcd::EtcdStore;
