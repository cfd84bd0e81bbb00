// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The per-process runtime context.
//!
//! [`RendezvousRuntime`] is created by registering with the group and owns
//! everything the operations need: the store handle, the key namespace, this
//! process's [`Membership`] and the group's [`RunId`]. Call
//! [`RendezvousRuntime::shutdown`] before exiting; rank 0 must do so last,
//! since its teardown removes the whole namespace.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use derive_builder::Builder;
use validator::Validate;

use crate::barrier::Barrier;
use crate::broadcast::Broadcast;
use crate::channel::Channel;
use crate::config::{ConfigError, RuntimeConfig};
use crate::error::RendezvousResult;
use crate::keys::KeySpace;
use crate::reduce::Reduction;
use crate::registration::{Membership, RunId, deregister, register};
use crate::store::CoordinationStore;
use crate::traits::CollectiveRuntime;

#[derive(Builder, Debug)]
#[builder(pattern = "owned", build_fn(private, name = "build_internal", error = "ConfigError"))]
pub struct RendezvousOptions {
    /// Number of processes expected in the group.
    declared_size: u32,

    #[builder(default)]
    config: RuntimeConfig,

    /// Store to coordinate through; etcd at the configured endpoints if unset.
    #[builder(default, setter(strip_option))]
    store: Option<Arc<dyn CoordinationStore>>,
}

impl RendezvousOptionsBuilder {
    /// Connect, register and return the runtime.
    pub async fn connect(self) -> RendezvousResult<RendezvousRuntime> {
        let options = self.build_internal()?;
        RendezvousRuntime::from_options(options).await
    }
}

pub struct RendezvousRuntime {
    store: Arc<dyn CoordinationStore>,
    keys: KeySpace,
    me: Membership,
    run_id: RunId,
    config: RuntimeConfig,
    reductions: AtomicU64,
    closed: AtomicBool,
}

impl std::fmt::Debug for RendezvousRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RendezvousRuntime")
            .field("endpoint", &self.store.endpoint())
            .field("namespace", &self.keys.prefix())
            .field("rank", &self.me.rank())
            .field("size", &self.me.size())
            .field("run_id", &self.run_id)
            .finish()
    }
}

impl RendezvousRuntime {
    pub fn builder() -> RendezvousOptionsBuilder {
        RendezvousOptionsBuilder::default()
    }

    /// Connect to etcd at `config.store.endpoints` and register in a group of `declared_size`.
    #[cfg(feature = "etcd")]
    pub async fn connect(config: RuntimeConfig, declared_size: u32) -> RendezvousResult<Self> {
        let store = connect_etcd(&config).await?;
        Self::with_store(store, config, declared_size).await
    }

    /// Like [`RendezvousRuntime::connect`], but a failure terminates the process with status 1.
    #[cfg(feature = "etcd")]
    pub async fn connect_or_exit(config: RuntimeConfig, declared_size: u32) -> Self {
        match Self::connect(config, declared_size).await {
            Ok(runtime) => runtime,
            Err(e) => {
                tracing::error!("Rendezvous startup failed: {e}");
                std::process::exit(1);
            }
        }
    }

    /// Register through an already connected store.
    pub async fn with_store(
        store: Arc<dyn CoordinationStore>,
        config: RuntimeConfig,
        declared_size: u32,
    ) -> RendezvousResult<Self> {
        config.validate().map_err(ConfigError::from)?;
        if declared_size == 0 {
            return Err(ConfigError::EmptyGroup.into());
        }

        let keys = KeySpace::new(config.store.namespace.clone());
        let (me, run_id) = register(store.as_ref(), &keys, declared_size).await?;

        Ok(Self {
            store,
            keys,
            me,
            run_id,
            config,
            reductions: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        })
    }

    async fn from_options(options: RendezvousOptions) -> RendezvousResult<Self> {
        let RendezvousOptions {
            declared_size,
            config,
            store,
        } = options;

        let store = match store {
            Some(store) => store,
            #[cfg(feature = "etcd")]
            None => connect_etcd(&config).await?,
            #[cfg(not(feature = "etcd"))]
            None => return Err(ConfigError::MissingOption("store").into()),
        };
        Self::with_store(store, config, declared_size).await
    }

    pub fn rank(&self) -> u32 {
        self.me.rank()
    }

    pub fn size(&self) -> u32 {
        self.me.size()
    }

    pub fn membership(&self) -> Membership {
        self.me
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub async fn send_int(&self, value: i32, dest: u32) -> RendezvousResult<()> {
        let result = self.channel().send_int(value, dest).await;
        self.report("send_int", result)
    }

    pub async fn recv_int(&self, src: u32) -> RendezvousResult<i32> {
        let result = self.channel().recv_int(src).await;
        self.report("recv_int", result)
    }

    pub async fn send_bytes(&self, data: &[u8], dest: u32) -> RendezvousResult<()> {
        let result = self.channel().send_bytes(data, dest).await;
        self.report("send_bytes", result)
    }

    pub async fn recv_bytes(&self, buffer: &mut [u8], src: u32) -> RendezvousResult<usize> {
        let result = self.channel().recv_bytes(buffer, src).await;
        self.report("recv_bytes", result)
    }

    pub async fn barrier(&self, id: &str) -> RendezvousResult<()> {
        let result = Barrier::new(self.store.as_ref(), &self.keys, self.me, &self.config.barrier)
            .wait(id)
            .await;
        self.report("barrier", result)
    }

    pub async fn broadcast(&self, values: &mut [i32], root: u32) -> RendezvousResult<()> {
        let result = Broadcast::new(
            self.store.as_ref(),
            &self.keys,
            self.me,
            &self.config.broadcast,
            &self.config.barrier,
        )
        .run(values, root)
        .await;
        self.report("broadcast", result)
    }

    /// Every rank must make the same sequence of `reduce_sum` calls so the
    /// operation ids line up.
    pub async fn reduce_sum(&self, local: f64, dest: u32) -> RendezvousResult<Option<f64>> {
        let seq = self.reductions.fetch_add(1, Ordering::Relaxed);
        let op_id = format!("{}-{}", self.run_id, seq);
        let result = Reduction::new(self.store.as_ref(), &self.keys, self.me, &self.config.reduce)
            .sum(local, dest, &op_id)
            .await;
        self.report("reduce_sum", result)
    }

    /// Leave the group. Rank 0 also removes every key under the namespace.
    ///
    /// Only the first call does any work.
    pub async fn shutdown(&self) -> RendezvousResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let result = deregister(self.store.as_ref(), &self.keys, self.me).await;
        self.report("shutdown", result)
    }

    fn channel(&self) -> Channel<'_> {
        Channel::new(self.store.as_ref(), &self.keys, self.me, &self.config.message)
    }

    fn report<T>(&self, op: &'static str, result: RendezvousResult<T>) -> RendezvousResult<T> {
        if let Err(e) = &result {
            tracing::error!(rank = self.me.rank(), op, "{e}");
        }
        result
    }
}

impl Drop for RendezvousRuntime {
    fn drop(&mut self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        tracing::warn!(
            rank = self.me.rank(),
            "RendezvousRuntime dropped without shutdown; scheduling teardown"
        );

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(rank = self.me.rank(), "No tokio runtime; group keys are left behind");
            return;
        };
        let (store, keys, me) = (self.store.clone(), self.keys.clone(), self.me);
        handle.spawn(async move {
            if let Err(e) = deregister(store.as_ref(), &keys, me).await {
                tracing::warn!(rank = me.rank(), "Teardown on drop failed: {e}");
            }
        });
    }
}

#[cfg(feature = "etcd")]
async fn connect_etcd(config: &RuntimeConfig) -> RendezvousResult<Arc<dyn CoordinationStore>> {
    let endpoints = config.store.endpoints.clone();
    let store = crate::store::etcd::EtcdStore::connect(
        endpoints.clone(),
        None,
        config.store.lock_ttl_secs,
    )
    .await
    .map_err(|source| crate::error::RuntimeError::Connect {
        endpoints: endpoints.join(", "),
        source,
    })?;
    Ok(Arc::new(store))
}

#[async_trait]
impl CollectiveRuntime for RendezvousRuntime {
    fn rank(&self) -> u32 {
        RendezvousRuntime::rank(self)
    }

    fn size(&self) -> u32 {
        RendezvousRuntime::size(self)
    }

    async fn send_int(&self, value: i32, dest: u32) -> RendezvousResult<()> {
        RendezvousRuntime::send_int(self, value, dest).await
    }

    async fn recv_int(&self, src: u32) -> RendezvousResult<i32> {
        RendezvousRuntime::recv_int(self, src).await
    }

    async fn send_bytes(&self, data: &[u8], dest: u32) -> RendezvousResult<()> {
        RendezvousRuntime::send_bytes(self, data, dest).await
    }

    async fn recv_bytes(&self, buffer: &mut [u8], src: u32) -> RendezvousResult<usize> {
        RendezvousRuntime::recv_bytes(self, buffer, src).await
    }

    async fn barrier(&self, id: &str) -> RendezvousResult<()> {
        RendezvousRuntime::barrier(self, id).await
    }

    async fn broadcast(&self, values: &mut [i32], root: u32) -> RendezvousResult<()> {
        RendezvousRuntime::broadcast(self, values, root).await
    }

    async fn reduce_sum(&self, local: f64, dest: u32) -> RendezvousResult<Option<f64>> {
        RendezvousRuntime::reduce_sum(self, local, dest).await
    }
}
