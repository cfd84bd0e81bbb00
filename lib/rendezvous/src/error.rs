// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy for rendezvous operations.
//!
//! - **Fatal**: [`RuntimeError::Connect`], [`RuntimeError::Lock`] and
//!   [`RuntimeError::GroupFull`] happen before a rank exists. The caller is
//!   expected to terminate the process.
//! - **Recoverable**: [`RuntimeError::Timeout`] is returned when a poll budget
//!   runs out. Nothing is retried on the caller's behalf.
//! - **Data**: [`RuntimeError::Parse`] reports a malformed payload at the parse
//!   site without retrying.
//!
//! Store failures inside an operation are wrapped in [`RuntimeError::Store`]
//! so no raw backend error crosses a public operation boundary.

use crate::config::ConfigError;

/// Status reported to drivers that still speak integer return codes.
pub const FAILURE_STATUS: i32 = -1;

pub type RendezvousResult<T> = std::result::Result<T, RuntimeError>;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("unable to connect to coordination store at {endpoints}: {source}")]
    Connect {
        endpoints: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to acquire lock {name}: {source}")]
    Lock {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("group is full: {registered} of {declared} ranks already registered")]
    GroupFull { declared: u32, registered: u32 },

    #[error("{op}: timed out after {attempts} attempts waiting on {waiting_on} (key {key})")]
    Timeout {
        op: &'static str,
        waiting_on: String,
        key: String,
        attempts: u32,
    },

    #[error("{op}: malformed value {value:?} at key {key}: {reason}")]
    Parse {
        op: &'static str,
        key: String,
        value: String,
        reason: String,
    },

    #[error("{op}: rank {rank} is not a valid peer in a group of {size}")]
    InvalidRank {
        op: &'static str,
        rank: u32,
        size: u32,
    },

    #[error("{op}: invalid identifier {id:?}, must be non-empty and contain no '/'")]
    InvalidId { op: &'static str, id: String },

    #[error("{op}: store operation failed on key {key}: {source}")]
    Store {
        op: &'static str,
        key: String,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl RuntimeError {
    /// Errors raised before a rank was assigned; there is no safe way to continue.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RuntimeError::Connect { .. }
                | RuntimeError::Lock { .. }
                | RuntimeError::GroupFull { .. }
                | RuntimeError::Config(_)
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, RuntimeError::Timeout { .. })
    }

    /// Negative status for callers that report integer codes.
    pub fn status_code(&self) -> i32 {
        FAILURE_STATUS
    }

    pub(crate) fn store(op: &'static str, key: impl Into<String>, source: anyhow::Error) -> Self {
        RuntimeError::Store {
            op,
            key: key.into(),
            source,
        }
    }

    pub(crate) fn parse(
        op: &'static str,
        key: impl Into<String>,
        value: &[u8],
        reason: impl ToString,
    ) -> Self {
        RuntimeError::Parse {
            op,
            key: key.into(),
            value: String::from_utf8_lossy(value).into_owned(),
            reason: reason.to_string(),
        }
    }
}

/// Parse a trimmed UTF-8 store value; anything else is a `Parse` error.
pub(crate) fn parse_value<T>(op: &'static str, key: &str, raw: &[u8]) -> RendezvousResult<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    std::str::from_utf8(raw)
        .map_err(|e| RuntimeError::parse(op, key, raw, e))?
        .trim()
        .parse::<T>()
        .map_err(|e| RuntimeError::parse(op, key, raw, e))
}

/// Attach the failing operation and key to a store error.
pub(crate) trait StoreResultExt<T> {
    fn store_context(self, op: &'static str, key: &str) -> RendezvousResult<T>;
}

impl<T> StoreResultExt<T> for anyhow::Result<T> {
    fn store_context(self, op: &'static str, key: &str) -> RendezvousResult<T> {
        self.map_err(|e| RuntimeError::store(op, key, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_value_trims_and_reports_bad_input() {
        assert_eq!(parse_value::<u32>("barrier", "ns/count", b" 3\n").unwrap(), 3);
        assert_eq!(parse_value::<i32>("recv_int", "ns/msg", b"-17").unwrap(), -17);

        let err = parse_value::<u32>("barrier", "ns/count", b"three").unwrap_err();
        match err {
            RuntimeError::Parse { op, key, value, .. } => {
                assert_eq!((op, key.as_str(), value.as_str()), ("barrier", "ns/count", "three"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(matches!(
            parse_value::<f64>("reduce_sum", "ns/r", &[0xff, 0xfe]),
            Err(RuntimeError::Parse { .. })
        ));
    }

    #[test]
    fn test_fatal_classification() {
        let err = RuntimeError::Lock {
            name: "xferbench/lock".to_string(),
            source: anyhow::anyhow!("lease expired"),
        };
        assert!(err.is_fatal());
        assert!(!err.is_timeout());

        let err = RuntimeError::Timeout {
            op: "send_int",
            waiting_on: "rank 1".to_string(),
            key: "xferbench/msg+int_data/src=0/dst=1/ack".to_string(),
            attempts: 60,
        };
        assert!(!err.is_fatal());
        assert!(err.is_timeout());
        assert_eq!(err.status_code(), FAILURE_STATUS);
    }

    #[test]
    fn test_timeout_message_names_peer_and_key() {
        let err = RuntimeError::Timeout {
            op: "recv_bytes",
            waiting_on: "rank 3".to_string(),
            key: "xferbench/msg+char_data/src=3/dst=0".to_string(),
            attempts: 60,
        };
        let msg = err.to_string();
        assert!(msg.contains("recv_bytes"));
        assert!(msg.contains("rank 3"));
        assert!(msg.contains("src=3/dst=0"));
    }

    #[test]
    fn test_parse_keeps_lossy_value() {
        let err = RuntimeError::parse("recv_int", "k", b"abc", "invalid digit");
        match err {
            RuntimeError::Parse { value, .. } => assert_eq!(value, "abc"),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
