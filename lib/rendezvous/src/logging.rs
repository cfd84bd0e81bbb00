// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Logging setup for processes that drive a rendezvous group.
//!
//! The library itself only emits `tracing` events; binaries call [`init`] once.
//!
//! - Filters come from `DYN_LOG` (default `info`), on top of per-module levels
//!   read from `/opt/dynamo/etc/logging.toml` or the TOML file named by
//!   `DYN_LOGGING_CONFIG_PATH`.
//! - `DYN_LOGGING_JSONL=1` switches to one JSON object per line.
//! - `DYN_LOG_USE_LOCAL_TZ=1` stamps readable logs in local time.
//! - `DYN_SDK_DISABLE_ANSI_LOGGING=1` turns off colors.
//!
//! Example:
//! ```toml
//! log_level = "warn"
//!
//! [log_filters]
//! "dynamo_rendezvous::barrier" = "debug"
//! ```

use std::collections::HashMap;
use std::sync::Once;

use figment::{
    Figment,
    providers::{Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use tracing_subscriber::filter::Directive;
use tracing_subscriber::fmt::time::LocalTime;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

/// ENV used to set the log level
const FILTER_ENV: &str = "DYN_LOG";

const DEFAULT_FILTER_LEVEL: &str = "info";

const CONFIG_PATH_ENV: &str = "DYN_LOGGING_CONFIG_PATH";

const SYSTEM_CONFIG_PATH: &str = "/opt/dynamo/etc/logging.toml";

static INIT: Once = Once::new();

#[derive(Serialize, Deserialize, Debug)]
struct LoggingConfig {
    log_level: String,
    log_filters: HashMap<String, String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            log_level: DEFAULT_FILTER_LEVEL.to_string(),
            log_filters: HashMap::from([
                ("h2".to_string(), "error".to_string()),
                ("tower".to_string(), "error".to_string()),
                ("tonic".to_string(), "error".to_string()),
                ("hyper_util".to_string(), "error".to_string()),
            ]),
        }
    }
}

/// Install the global subscriber. Later calls do nothing.
pub fn init() {
    INIT.call_once(setup_logging);
}

fn setup_logging() {
    let stderr = std::io::stderr;
    let layer: Box<dyn Layer<Registry> + Send + Sync> = if env_is_truthy("DYN_LOGGING_JSONL") {
        fmt::layer()
            .json()
            .with_current_span(false)
            .with_writer(stderr)
            .boxed()
    } else if env_is_truthy("DYN_LOG_USE_LOCAL_TZ") {
        fmt::layer()
            .compact()
            .with_ansi(!env_is_truthy("DYN_SDK_DISABLE_ANSI_LOGGING"))
            .with_timer(LocalTime::rfc_3339())
            .with_writer(stderr)
            .boxed()
    } else {
        fmt::layer()
            .compact()
            .with_ansi(!env_is_truthy("DYN_SDK_DISABLE_ANSI_LOGGING"))
            .with_writer(stderr)
            .boxed()
    };

    let subscriber = tracing_subscriber::registry().with(layer.with_filter(filters(load_config())));
    if let Err(e) = subscriber.try_init() {
        eprintln!("Logging already initialized elsewhere: {e}");
    }
}

fn filters(config: LoggingConfig) -> EnvFilter {
    let default_directive = config
        .log_level
        .parse::<Directive>()
        .unwrap_or_else(|_| Directive::from(tracing::Level::INFO));

    let mut filter_layer = EnvFilter::builder()
        .with_default_directive(default_directive)
        .with_env_var(FILTER_ENV)
        .from_env_lossy();

    for (module, level) in config.log_filters {
        match format!("{module}={level}").parse::<Directive>() {
            Ok(d) => {
                filter_layer = filter_layer.add_directive(d);
            }
            Err(e) => {
                eprintln!("Failed parsing filter '{level}' for module '{module}': {e}");
            }
        }
    }
    filter_layer
}

fn load_config() -> LoggingConfig {
    let mut figment = Figment::new()
        .merge(Serialized::defaults(LoggingConfig::default()))
        .merge(Toml::file(SYSTEM_CONFIG_PATH));
    if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
        figment = figment.merge(Toml::file(path));
    }

    figment.extract().unwrap_or_else(|e| {
        eprintln!("Invalid logging configuration, using defaults: {e}");
        LoggingConfig::default()
    })
}

fn env_is_truthy(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "on" | "yes"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filters_quiet_transport_crates() {
        temp_env::with_var_unset(FILTER_ENV, || {
            let rendered = filters(LoggingConfig::default()).to_string();
            assert!(rendered.contains("h2=error"), "{rendered}");
            assert!(rendered.contains("tonic=error"), "{rendered}");
            assert!(rendered.contains("info"), "{rendered}");
        });
    }

    #[test]
    fn test_env_filter_takes_priority() {
        temp_env::with_var(FILTER_ENV, Some("dynamo_rendezvous=trace"), || {
            let rendered = filters(LoggingConfig::default()).to_string();
            assert!(rendered.contains("dynamo_rendezvous=trace"), "{rendered}");
        });
    }

    #[test]
    fn test_bad_module_filter_is_skipped() {
        temp_env::with_var_unset(FILTER_ENV, || {
            let config = LoggingConfig {
                log_level: "warn".to_string(),
                log_filters: HashMap::from([("barrier".to_string(), "loud".to_string())]),
            };
            let rendered = filters(config).to_string();
            assert!(!rendered.contains("barrier"), "{rendered}");
            assert!(rendered.contains("warn"), "{rendered}");
        });
    }

    #[test]
    fn test_config_file_overrides_defaults() {
        let dir = std::env::temp_dir().join(format!("rendezvous-logging-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("logging.toml");
        std::fs::write(&path, "log_level = \"debug\"\n").unwrap();

        temp_env::with_var(CONFIG_PATH_ENV, Some(path.to_str().unwrap()), || {
            let config = load_config();
            assert_eq!(config.log_level, "debug");
            assert!(config.log_filters.contains_key("h2"));
        });
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_truthy_values() {
        temp_env::with_vars(
            [
                ("RENDEZVOUS_TEST_FLAG_A", Some("1")),
                ("RENDEZVOUS_TEST_FLAG_B", Some("TRUE")),
                ("RENDEZVOUS_TEST_FLAG_C", Some("0")),
            ],
            || {
                assert!(env_is_truthy("RENDEZVOUS_TEST_FLAG_A"));
                assert!(env_is_truthy("RENDEZVOUS_TEST_FLAG_B"));
                assert!(!env_is_truthy("RENDEZVOUS_TEST_FLAG_C"));
                assert!(!env_is_truthy("RENDEZVOUS_TEST_FLAG_UNSET"));
            },
        );
    }
}
