// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Key layout under the namespace prefix.
//!
//! ```text
//! <ns>lock                                  group mutual-exclusion lock
//! <ns>size                                  registration counter
//! <ns>run                                   group run id
//! <ns>rank/<r>                              "active"
//! <ns>msg+int_data/src=<s>/dst=<d>          decimal i32
//! <ns>msg+char_data/src=<s>/dst=<d>         "<s>:<d>:<len>"
//! <ns>msg+char_data/src=<s>/dst=<d>/data    raw bytes
//! <message key>/ack                         "received"
//! <ns>barrier/<id>/{count,proc-<r>,ready}
//! <ns>bcast/int/<root>                      little-endian i32 array
//! <ns>reduce/<opid>/rank-<r>                fixed 16-digit decimal
//! ```

use std::fmt;

pub const MESSAGE_OP: &str = "msg";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadKind {
    Int,
    Bytes,
}

impl PayloadKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayloadKind::Int => "int_data",
            PayloadKind::Bytes => "char_data",
        }
    }
}

impl fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Renders every key the runtime touches. Nothing talks to the store with a
/// hand-built key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    /// Scope keys under `namespace`; a trailing `/` is added if missing.
    pub fn new(namespace: impl Into<String>) -> Self {
        let mut prefix = namespace.into();
        if !prefix.ends_with('/') {
            prefix.push('/');
        }
        Self { prefix }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn lock(&self) -> String {
        format!("{}lock", self.prefix)
    }

    pub fn size(&self) -> String {
        format!("{}size", self.prefix)
    }

    pub fn run(&self) -> String {
        format!("{}run", self.prefix)
    }

    pub fn rank(&self, rank: u32) -> String {
        format!("{}rank/{}", self.prefix, rank)
    }

    pub fn message(&self, op: &str, src: u32, dst: u32, kind: PayloadKind) -> String {
        format!("{}{}+{}/src={}/dst={}", self.prefix, op, kind, src, dst)
    }

    pub fn data(message_key: &str) -> String {
        format!("{message_key}/data")
    }

    pub fn ack(message_key: &str) -> String {
        format!("{message_key}/ack")
    }

    /// Root of every barrier record, removed wholesale at teardown.
    pub fn barriers(&self) -> String {
        format!("{}barrier/", self.prefix)
    }

    /// Subtree of one barrier, with trailing `/`.
    pub fn barrier(&self, id: &str) -> String {
        format!("{}barrier/{}/", self.prefix, id)
    }

    pub fn barrier_count(&self, id: &str) -> String {
        format!("{}count", self.barrier(id))
    }

    pub fn barrier_ready(&self, id: &str) -> String {
        format!("{}ready", self.barrier(id))
    }

    pub fn barrier_arrival(&self, id: &str, rank: u32) -> String {
        format!("{}proc-{}", self.barrier(id), rank)
    }

    pub fn broadcast(&self, root: u32) -> String {
        format!("{}bcast/int/{}", self.prefix, root)
    }

    /// Subtree of one reduction, with trailing `/`.
    pub fn reduction(&self, op_id: &str) -> String {
        format!("{}reduce/{}/", self.prefix, op_id)
    }

    pub fn contribution(&self, op_id: &str, rank: u32) -> String {
        format!("{}rank-{}", self.reduction(op_id), rank)
    }
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_NAMESPACE)
    }
}
