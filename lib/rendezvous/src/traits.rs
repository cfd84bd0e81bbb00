// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;

use crate::error::RendezvousResult;

/// Control-plane operations a benchmark driver needs from its group.
///
/// Every call blocks the calling task until the exchange completes or its poll
/// budget runs out. Peers address each other by rank in `[0, size)`.
#[async_trait]
pub trait CollectiveRuntime: Send + Sync {
    fn rank(&self) -> u32;

    fn size(&self) -> u32;

    async fn send_int(&self, value: i32, dest: u32) -> RendezvousResult<()>;

    async fn recv_int(&self, src: u32) -> RendezvousResult<i32>;

    async fn send_bytes(&self, data: &[u8], dest: u32) -> RendezvousResult<()>;

    /// Returns the number of bytes copied, at most `buffer.len()`.
    async fn recv_bytes(&self, buffer: &mut [u8], src: u32) -> RendezvousResult<usize>;

    async fn barrier(&self, id: &str) -> RendezvousResult<()>;

    /// Replace `values` on every rank with the contents held by `root`.
    async fn broadcast(&self, values: &mut [i32], root: u32) -> RendezvousResult<()>;

    /// Sum `local` across the group; `Some(total)` on `dest`, `None` elsewhere.
    async fn reduce_sum(&self, local: f64, dest: u32) -> RendezvousResult<Option<f64>>;
}
