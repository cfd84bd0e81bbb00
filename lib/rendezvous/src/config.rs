// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Rendezvous runtime configuration.
//!
//! Sources in priority order (lowest to highest):
//! 1. Code defaults
//! 2. System config file at `/opt/dynamo/etc/rendezvous.toml`
//! 3. TOML file from the `RENDEZVOUS_CONFIG_PATH` environment variable
//! 4. Environment variables, one prefix per section:
//!    `RENDEZVOUS_STORE_*`, `RENDEZVOUS_MESSAGE_*`, `RENDEZVOUS_BARRIER_*`,
//!    `RENDEZVOUS_BROADCAST_*`, `RENDEZVOUS_REDUCE_*`
//!
//! The defaults reproduce the poll budgets every rank of a group must agree on,
//! so overriding them on only some ranks is a configuration error the runtime
//! cannot detect.

use std::time::Duration;

use figment::{
    Figment, Provider,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use validator::{Validate, ValidationErrors};

use crate::poll::PollPolicy;

pub const DEFAULT_ETCD_ENDPOINT: &str = "http://localhost:2379";
pub const DEFAULT_NAMESPACE: &str = "xferbench/";

const CONFIG_PATH_ENV: &str = "RENDEZVOUS_CONFIG_PATH";
const SYSTEM_CONFIG_PATH: &str = "/opt/dynamo/etc/rendezvous.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to extract configuration: {0}")]
    Extraction(#[from] Box<figment::Error>),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] ValidationErrors),

    #[error("Declared group size must be at least 1")]
    EmptyGroup,

    #[error("Missing required option: {0}")]
    MissingOption(&'static str),
}

impl From<derive_builder::UninitializedFieldError> for ConfigError {
    fn from(err: derive_builder::UninitializedFieldError) -> Self {
        ConfigError::MissingOption(err.field_name())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct RuntimeConfig {
    #[validate(nested)]
    #[serde(default)]
    pub store: StoreConfig,

    #[validate(nested)]
    #[serde(default)]
    pub message: MessageConfig,

    #[validate(nested)]
    #[serde(default)]
    pub barrier: BarrierConfig,

    #[validate(nested)]
    #[serde(default)]
    pub broadcast: BroadcastConfig,

    #[validate(nested)]
    #[serde(default)]
    pub reduce: ReduceConfig,
}

/// Where the coordination store lives and how keys are scoped.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct StoreConfig {
    /// Etcd endpoints (default: ["http://localhost:2379"]).
    #[serde(default = "default_endpoints")]
    #[validate(length(min = 1))]
    pub endpoints: Vec<String>,

    /// Prefix scoping every key of one benchmark run (default: "xferbench/").
    #[serde(default = "default_namespace")]
    #[validate(length(min = 1))]
    pub namespace: String,

    /// TTL of the lease backing the group lock, in seconds.
    /// The lease is granted before joining the lock queue and is not kept
    /// alive, so time spent queued behind other ranks counts against it.
    /// Raise it for large groups.
    #[serde(default = "default_lock_ttl")]
    #[validate(range(min = 5, max = 600))]
    pub lock_ttl_secs: u64,
}

/// Point-to-point channel budgets.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct MessageConfig {
    #[serde(default = "default_one_second")]
    #[validate(range(min = 1))]
    pub interval_ms: u64,

    #[serde(default = "default_message_attempts")]
    #[validate(range(min = 1))]
    pub max_attempts: u32,

    /// Pause between writing the ack and deleting the message.
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct BarrierConfig {
    #[serde(default = "default_one_second")]
    #[validate(range(min = 1))]
    pub interval_ms: u64,

    /// Polls of the arrival counter before giving up.
    #[serde(default = "default_arrival_attempts")]
    #[validate(range(min = 1))]
    pub arrival_attempts: u32,

    /// Polls of the ready flag before giving up.
    #[serde(default = "default_ready_attempts")]
    #[validate(range(min = 1))]
    pub ready_attempts: u32,

    /// How long rank 0 waits before tearing down a satisfied barrier.
    /// Must exceed `interval_ms` or ranks still polling the counter miss it.
    #[serde(default = "default_grace_ms")]
    pub grace_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct BroadcastConfig {
    #[serde(default = "default_broadcast_interval")]
    #[validate(range(min = 1))]
    pub interval_ms: u64,

    #[serde(default = "default_broadcast_attempts")]
    #[validate(range(min = 1))]
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ReduceConfig {
    #[serde(default = "default_one_second")]
    #[validate(range(min = 1))]
    pub interval_ms: u64,

    #[serde(default = "default_reduce_attempts")]
    #[validate(range(min = 1))]
    pub max_attempts: u32,
}

fn default_endpoints() -> Vec<String> {
    vec![DEFAULT_ETCD_ENDPOINT.to_string()]
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

fn default_lock_ttl() -> u64 {
    30
}

fn default_one_second() -> u64 {
    1000
}

fn default_message_attempts() -> u32 {
    60
}

fn default_settle_ms() -> u64 {
    100
}

fn default_arrival_attempts() -> u32 {
    30
}

fn default_ready_attempts() -> u32 {
    60
}

fn default_grace_ms() -> u64 {
    5000
}

fn default_broadcast_interval() -> u64 {
    100
}

fn default_broadcast_attempts() -> u32 {
    10
}

fn default_reduce_attempts() -> u32 {
    30
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            endpoints: default_endpoints(),
            namespace: default_namespace(),
            lock_ttl_secs: default_lock_ttl(),
        }
    }
}

impl Default for MessageConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_one_second(),
            max_attempts: default_message_attempts(),
            settle_ms: default_settle_ms(),
        }
    }
}

impl Default for BarrierConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_one_second(),
            arrival_attempts: default_arrival_attempts(),
            ready_attempts: default_ready_attempts(),
            grace_ms: default_grace_ms(),
        }
    }
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_broadcast_interval(),
            max_attempts: default_broadcast_attempts(),
        }
    }
}

impl Default for ReduceConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_one_second(),
            max_attempts: default_reduce_attempts(),
        }
    }
}

impl MessageConfig {
    pub fn policy(&self) -> PollPolicy {
        PollPolicy::new(Duration::from_millis(self.interval_ms), self.max_attempts)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

impl BarrierConfig {
    pub fn arrival_policy(&self) -> PollPolicy {
        PollPolicy::new(Duration::from_millis(self.interval_ms), self.arrival_attempts)
    }

    pub fn ready_policy(&self) -> PollPolicy {
        PollPolicy::new(Duration::from_millis(self.interval_ms), self.ready_attempts)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }
}

impl BroadcastConfig {
    pub fn policy(&self) -> PollPolicy {
        PollPolicy::new(Duration::from_millis(self.interval_ms), self.max_attempts)
    }
}

impl ReduceConfig {
    pub fn policy(&self) -> PollPolicy {
        PollPolicy::new(Duration::from_millis(self.interval_ms), self.max_attempts)
    }
}

impl RuntimeConfig {
    /// Create a Figment configuration with all sources merged.
    pub fn figment() -> Figment {
        let config_path = std::env::var(CONFIG_PATH_ENV).unwrap_or_default();

        Figment::new()
            .merge(Serialized::defaults(RuntimeConfig::default()))
            .merge(Toml::file(SYSTEM_CONFIG_PATH))
            .merge(Toml::file(&config_path))
            .merge(section_env("store"))
            .merge(section_env("message"))
            .merge(section_env("barrier"))
            .merge(section_env("broadcast"))
            .merge(section_env("reduce"))
    }

    /// Load configuration from default figment (env and files).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::extract_from(Self::figment())
    }

    /// Extract and validate configuration from any provider.
    ///
    /// ```rust,ignore
    /// let config = RuntimeConfig::extract_from(
    ///     RuntimeConfig::figment().merge(("store.namespace", "run-17/")),
    /// )?;
    /// ```
    pub fn extract_from<T: Provider>(provider: T) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(provider)
            .extract()
            .map_err(|e| ConfigError::Extraction(Box::new(e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Short budgets for in-process tests against [`crate::MemoryStore`].
    pub fn for_testing() -> Self {
        let mut config = Self::default();
        config.barrier.grace_ms = 2_000;
        config.message.settle_ms = 10;
        config
    }
}

// RENDEZVOUS_BARRIER_GRACE_MS -> barrier.grace_ms
fn section_env(section: &'static str) -> Env {
    let prefix = format!("RENDEZVOUS_{}_", section.to_uppercase());
    Env::prefixed(&prefix).map(move |k| format!("{}.{}", section, k.as_str().to_lowercase()).into())
}
