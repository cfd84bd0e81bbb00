// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Fixed-interval polling.
//!
//! Every wait in the runtime goes through [`poll_until`]: run a check, and if it
//! does not produce a value sleep for the policy interval and try again, up to
//! a fixed number of attempts. Budgets are counted in attempts, not wall-clock
//! deadlines, so the time spent before giving up is `attempts × interval` plus
//! whatever the checks themselves cost.

use std::future::Future;
use std::time::Duration;

use crate::error::RuntimeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    interval: Duration,
    max_attempts: u32,
}

impl PollPolicy {
    pub fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Nominal time before the budget runs out.
    pub fn budget(&self) -> Duration {
        self.interval * self.max_attempts
    }
}

/// Why [`poll_until`] stopped without a value.
#[derive(Debug)]
pub enum PollError<E> {
    /// The check never produced a value within the budget.
    Exhausted { attempts: u32 },
    /// The check failed; polling stops on its first error.
    Check(E),
}

impl PollError<RuntimeError> {
    /// Translate exhaustion into a [`RuntimeError::Timeout`] for `op`.
    pub fn into_runtime(
        self,
        op: &'static str,
        waiting_on: impl ToString,
        key: &str,
    ) -> RuntimeError {
        match self {
            PollError::Exhausted { attempts } => RuntimeError::Timeout {
                op,
                waiting_on: waiting_on.to_string(),
                key: key.to_string(),
                attempts,
            },
            PollError::Check(err) => err,
        }
    }
}

/// Run `check` until it yields `Some`, sleeping `policy.interval()` after each miss.
///
/// The check receives the zero-based attempt number.
pub async fn poll_until<T, E, F, Fut>(policy: PollPolicy, mut check: F) -> Result<T, PollError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
{
    for attempt in 0..policy.max_attempts {
        match check(attempt).await {
            Ok(Some(value)) => return Ok(value),
            Ok(None) => tokio::time::sleep(policy.interval).await,
            Err(err) => return Err(PollError::Check(err)),
        }
    }

    Err(PollError::Exhausted {
        attempts: policy.max_attempts,
    })
}
