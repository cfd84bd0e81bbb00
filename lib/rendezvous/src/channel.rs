// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Point-to-point rendezvous between two ranks.
//!
//! ```text
//! Sender                         Store                          Receiver
//!   |-- put msg (+ data) -------->|                                |
//!   |                             |<------------ poll msg (+ data) |
//!   |                             |<----------- put ack "received" |
//!   |-- poll ack ---------------->|                                |
//!   |-- delete ack -------------->|        (settle) delete data, msg
//! ```
//!
//! Only one message per `(src, dst, kind)` may be in flight: a second send on
//! the same pair before the first is acknowledged overwrites it. Callers keep
//! each pair strictly request/response.
//!
//! A sender that times out leaves its message in place; a late receiver can
//! still consume it.

use crate::config::MessageConfig;
use crate::error::{RendezvousResult, RuntimeError, StoreResultExt, parse_value};
use crate::keys::{KeySpace, MESSAGE_OP, PayloadKind};
use crate::poll::poll_until;
use crate::registration::Membership;
use crate::store::CoordinationStore;

const ACK_VALUE: &[u8] = b"received";

pub struct Channel<'a> {
    store: &'a dyn CoordinationStore,
    keys: &'a KeySpace,
    me: Membership,
    config: &'a MessageConfig,
}

/// Length declared by `"<src>:<dst>:<len>"` metadata stored next to a byte payload.
fn declared_len(raw: &[u8]) -> Option<usize> {
    let text = std::str::from_utf8(raw).ok()?;
    let mut parts = text.trim().splitn(3, ':');
    parts.next()?.parse::<u32>().ok()?;
    parts.next()?.parse::<u32>().ok()?;
    parts.next()?.parse().ok()
}

impl<'a> Channel<'a> {
    pub fn new(
        store: &'a dyn CoordinationStore,
        keys: &'a KeySpace,
        me: Membership,
        config: &'a MessageConfig,
    ) -> Self {
        Self {
            store,
            keys,
            me,
            config,
        }
    }

    fn check_peer(&self, op: &'static str, peer: u32) -> RendezvousResult<()> {
        self.me.check_peer(op, peer)?;
        if peer == self.me.rank() {
            return Err(RuntimeError::InvalidRank {
                op,
                rank: peer,
                size: self.me.size(),
            });
        }
        Ok(())
    }

    pub async fn send_int(&self, value: i32, dest: u32) -> RendezvousResult<()> {
        const OP: &str = "send_int";
        self.check_peer(OP, dest)?;

        let msg_key = self
            .keys
            .message(MESSAGE_OP, self.me.rank(), dest, PayloadKind::Int);
        self.store
            .put(&msg_key, value.to_string().as_bytes())
            .await
            .store_context(OP, &msg_key)?;

        self.wait_for_ack(OP, dest, &msg_key).await
    }

    pub async fn recv_int(&self, src: u32) -> RendezvousResult<i32> {
        const OP: &str = "recv_int";
        self.check_peer(OP, src)?;

        let msg_key = self
            .keys
            .message(MESSAGE_OP, src, self.me.rank(), PayloadKind::Int);
        let store = self.store;
        let raw = poll_until(self.config.policy(), |_| {
            let msg_key = &msg_key;
            async move { store.get(msg_key).await.store_context(OP, msg_key) }
        })
        .await
        .map_err(|e| e.into_runtime(OP, format!("rank {src}"), &msg_key))?;

        let value = parse_value::<i32>(OP, &msg_key, &raw)?;

        self.acknowledge(OP, &msg_key, None).await?;
        Ok(value)
    }

    pub async fn send_bytes(&self, data: &[u8], dest: u32) -> RendezvousResult<()> {
        const OP: &str = "send_bytes";
        self.check_peer(OP, dest)?;

        let msg_key = self
            .keys
            .message(MESSAGE_OP, self.me.rank(), dest, PayloadKind::Bytes);
        let data_key = KeySpace::data(&msg_key);

        // data first so a receiver that sees the metadata always finds the payload
        self.store
            .put(&data_key, data)
            .await
            .store_context(OP, &data_key)?;

        let meta = format!("{}:{}:{}", self.me.rank(), dest, data.len());
        self.store
            .put(&msg_key, meta.as_bytes())
            .await
            .store_context(OP, &msg_key)?;

        self.wait_for_ack(OP, dest, &msg_key).await
    }

    /// Copy up to `buffer.len()` bytes from `src` into `buffer`.
    ///
    /// Returns the number of bytes copied. A payload longer than the buffer is
    /// silently truncated.
    pub async fn recv_bytes(&self, buffer: &mut [u8], src: u32) -> RendezvousResult<usize> {
        const OP: &str = "recv_bytes";
        self.check_peer(OP, src)?;

        let msg_key = self
            .keys
            .message(MESSAGE_OP, src, self.me.rank(), PayloadKind::Bytes);
        let data_key = KeySpace::data(&msg_key);

        let store = self.store;
        let (raw_meta, data) = poll_until(self.config.policy(), |_| {
            let (msg_key, data_key) = (&msg_key, &data_key);
            async move {
                let Some(meta) = store.get(msg_key).await.store_context(OP, msg_key)? else {
                    return Ok(None);
                };
                let data = store.get(data_key).await.store_context(OP, data_key)?;
                Ok(data.map(|data| (meta, data)))
            }
        })
        .await
        .map_err(|e| e.into_runtime(OP, format!("rank {src}"), &msg_key))?;

        let declared = declared_len(&raw_meta).ok_or_else(|| {
            RuntimeError::parse(OP, msg_key.as_str(), &raw_meta, "expected <src>:<dst>:<len>")
        })?;
        if declared != data.len() {
            tracing::warn!(
                peer = src,
                key = %msg_key,
                declared,
                received = data.len(),
                "Byte payload length differs from its metadata"
            );
        }

        let copied = data.len().min(buffer.len());
        buffer[..copied].copy_from_slice(&data[..copied]);
        if copied < data.len() {
            tracing::debug!(
                peer = src,
                received = data.len(),
                capacity = buffer.len(),
                "Truncated byte payload to buffer capacity"
            );
        }

        self.acknowledge(OP, &msg_key, Some(&data_key)).await?;
        Ok(copied)
    }

    async fn wait_for_ack(&self, op: &'static str, dest: u32, msg_key: &str) -> RendezvousResult<()> {
        let ack_key = KeySpace::ack(msg_key);
        let store = self.store;

        poll_until(self.config.policy(), |_| {
            let ack_key = &ack_key;
            async move {
                let ack = store.get(ack_key).await.store_context(op, ack_key)?;
                Ok(ack.filter(|v| v.as_slice() == ACK_VALUE).map(|_| ()))
            }
        })
        .await
        .map_err(|e| e.into_runtime(op, format!("rank {dest}"), &ack_key))?;

        store.delete(&ack_key).await.store_context(op, &ack_key)?;
        tracing::trace!(peer = dest, key = msg_key, "Message acknowledged");
        Ok(())
    }

    async fn acknowledge(
        &self,
        op: &'static str,
        msg_key: &str,
        data_key: Option<&str>,
    ) -> RendezvousResult<()> {
        let ack_key = KeySpace::ack(msg_key);
        self.store
            .put(&ack_key, ACK_VALUE)
            .await
            .store_context(op, &ack_key)?;

        // let the sender's ack poll land before the message disappears
        tokio::time::sleep(self.config.settle()).await;

        if let Some(data_key) = data_key {
            self.store
                .delete(data_key)
                .await
                .store_context(op, data_key)?;
        }
        self.store
            .delete(msg_key)
            .await
            .store_context(op, msg_key)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    struct Pair {
        store: MemoryStore,
        keys: KeySpace,
        config: MessageConfig,
    }

    impl Pair {
        fn new() -> Self {
            Self {
                store: MemoryStore::new(),
                keys: KeySpace::default(),
                config: MessageConfig::default(),
            }
        }

        fn channel(&self, rank: u32) -> Channel<'_> {
            Channel::new(&self.store, &self.keys, Membership::new(rank, 2), &self.config)
        }
    }

    #[test]
    fn test_declared_len() {
        assert_eq!(declared_len(b"1:0:4096"), Some(4096));
        assert_eq!(declared_len(b"1:0"), None);
        assert_eq!(declared_len(b"a:b:c"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_int_round_trip_cleans_up() {
        let pair = Pair::new();
        let (sender, receiver) = (pair.channel(0), pair.channel(1));

        let (sent, received) = tokio::join!(sender.send_int(-17, 1), receiver.recv_int(0));
        sent.unwrap();
        assert_eq!(received.unwrap(), -17);
        assert!(pair.store.is_empty(), "leftover keys: {:?}", pair.store.keys());
    }

    #[tokio::test(start_paused = true)]
    async fn test_receiver_first_still_delivers() {
        let pair = Pair::new();
        let (sender, receiver) = (pair.channel(0), pair.channel(1));

        let (received, sent) = tokio::join!(receiver.recv_int(0), async {
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            sender.send_int(9, 1).await
        });
        sent.unwrap();
        assert_eq!(received.unwrap(), 9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bytes_truncate_to_capacity() {
        let pair = Pair::new();
        let (sender, receiver) = (pair.channel(1), pair.channel(0));
        let payload: Vec<u8> = (0..=255).collect();
        let mut buffer = [0u8; 100];

        let (sent, received) = tokio::join!(
            sender.send_bytes(&payload, 0),
            receiver.recv_bytes(&mut buffer, 1)
        );
        sent.unwrap();
        assert_eq!(received.unwrap(), 100);
        assert_eq!(&buffer[..], &payload[..100]);
        assert!(pair.store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_bytes_shorter_than_capacity() {
        let pair = Pair::new();
        let (sender, receiver) = (pair.channel(0), pair.channel(1));
        let mut buffer = [0xffu8; 8];

        let (sent, received) = tokio::join!(
            sender.send_bytes(b"abc", 1),
            receiver.recv_bytes(&mut buffer, 0)
        );
        sent.unwrap();
        assert_eq!(received.unwrap(), 3);
        assert_eq!(&buffer[..3], b"abc");
        assert_eq!(buffer[3], 0xff);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_times_out_without_receiver() {
        let pair = Pair::new();
        let sender = pair.channel(0);
        let start = tokio::time::Instant::now();

        let err = sender.send_int(5, 1).await.unwrap_err();
        match &err {
            RuntimeError::Timeout {
                op,
                waiting_on,
                key,
                attempts,
            } => {
                assert_eq!(*op, "send_int");
                assert_eq!(waiting_on, "rank 1");
                assert!(key.ends_with("/ack"));
                assert_eq!(*attempts, 60);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(start.elapsed(), std::time::Duration::from_secs(60));

        // the message stays for a late receiver
        let msg_key = pair.keys.message(MESSAGE_OP, 0, 1, PayloadKind::Int);
        assert!(pair.store.contains(&msg_key));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recv_times_out_without_sender() {
        let pair = Pair::new();
        let err = pair.channel(1).recv_int(0).await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_int_is_not_retried() {
        let pair = Pair::new();
        let msg_key = pair.keys.message(MESSAGE_OP, 0, 1, PayloadKind::Int);
        pair.store.put(&msg_key, b"forty-two").await.unwrap();

        let start = tokio::time::Instant::now();
        let err = pair.channel(1).recv_int(0).await.unwrap_err();
        assert!(matches!(err, RuntimeError::Parse { .. }));
        assert_eq!(start.elapsed(), std::time::Duration::ZERO);
        assert!(!pair.store.contains(&KeySpace::ack(&msg_key)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recv_bytes_times_out_without_sender() {
        let pair = Pair::new();
        let mut buffer = [0u8; 16];
        let start = tokio::time::Instant::now();

        let err = pair.channel(0).recv_bytes(&mut buffer, 1).await.unwrap_err();
        match &err {
            RuntimeError::Timeout {
                op,
                waiting_on,
                key,
                attempts,
            } => {
                assert_eq!(*op, "recv_bytes");
                assert_eq!(waiting_on, "rank 1");
                assert!(key.ends_with("char_data/src=1/dst=0"));
                assert_eq!(*attempts, 60);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(start.elapsed(), std::time::Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recv_bytes_waits_for_data_behind_metadata() {
        let pair = Pair::new();
        let msg_key = pair.keys.message(MESSAGE_OP, 1, 0, PayloadKind::Bytes);
        pair.store.put(&msg_key, b"1:0:3").await.unwrap();
        let mut buffer = [0u8; 3];

        let channel = pair.channel(0);
        let (received, _) = tokio::join!(channel.recv_bytes(&mut buffer, 1), async {
            tokio::time::sleep(std::time::Duration::from_secs(3)).await;
            pair.store.put(&KeySpace::data(&msg_key), b"xyz").await.unwrap();
        });
        assert_eq!(received.unwrap(), 3);
        assert_eq!(&buffer, b"xyz");
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_buffer_metadata_is_not_retried() {
        let pair = Pair::new();
        let msg_key = pair.keys.message(MESSAGE_OP, 1, 0, PayloadKind::Bytes);
        pair.store.put(&KeySpace::data(&msg_key), b"payload").await.unwrap();
        pair.store.put(&msg_key, b"one:zero:seven").await.unwrap();
        let mut buffer = [0u8; 16];

        let start = tokio::time::Instant::now();
        let err = pair.channel(0).recv_bytes(&mut buffer, 1).await.unwrap_err();
        match &err {
            RuntimeError::Parse { op, key, value, .. } => {
                assert_eq!(*op, "recv_bytes");
                assert_eq!(key, &msg_key);
                assert_eq!(value, "one:zero:seven");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(start.elapsed(), std::time::Duration::ZERO);
        assert!(!pair.store.contains(&KeySpace::ack(&msg_key)));
        assert_eq!(buffer, [0u8; 16]);
    }

    #[tokio::test]
    async fn test_invalid_peers_are_rejected() {
        let pair = Pair::new();
        let channel = pair.channel(0);
        assert!(matches!(
            channel.send_int(1, 0).await,
            Err(RuntimeError::InvalidRank { rank: 0, .. })
        ));
        assert!(matches!(
            channel.recv_int(7).await,
            Err(RuntimeError::InvalidRank { rank: 7, .. })
        ));
        assert!(pair.store.is_empty());
    }
}
