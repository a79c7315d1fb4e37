//! Session buffer + gate: turns bursts of events per `BufferKey` into at-most-one
//! in-flight job, with FIFO replay for whatever arrives while a job is running.

use crate::kv::KvStore;
use crate::model::{BufferKey, Event};
use crate::Result;
use rand::RngCore;
use std::sync::Arc;
use std::time::Duration;

/// Generates a gate token with recommended >=96 bits of entropy (spec §3 GateToken).
pub fn generate_gate_token() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Shared, possibly-distributed FIFO buffer + exclusive gate per [`BufferKey`].
pub struct SessionBuffer {
    kv: Arc<dyn KvStore>,
    gate_ttl: Duration,
}

impl SessionBuffer {
    pub fn new(kv: Arc<dyn KvStore>, gate_ttl: Duration) -> Self {
        Self { kv, gate_ttl }
    }

    /// Pushes `event` to the FIFO tail. Used by the worker to put back events it read via
    /// `drain` but didn't finish (paired with `requeue_front` for partially handled bursts).
    pub async fn append(&self, key: &BufferKey, event: &Event) -> Result<()> {
        let payload = serde_json::to_string(event).map_err(anyhow::Error::from)?;
        self.kv.list_push_back(&key.queue_key(), &payload).await
    }

    /// Pushes `events` to the FIFO head, preserving the given order.
    pub async fn requeue_front(&self, key: &BufferKey, events: &[Event]) -> Result<()> {
        let payloads = events
            .iter()
            .map(|e| serde_json::to_string(e).map_err(anyhow::Error::from))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        self.kv.list_push_front(&key.queue_key(), &payloads).await
    }

    /// Atomically pushes `event` to the FIFO tail and attempts to install `token` as the
    /// gate. Returns `Some(token)` (caller owns the gate and must enqueue a job) or `None`
    /// (gate already held; the owner will observe this event on its next `drain`).
    pub async fn append_and_request_job(
        &self,
        key: &BufferKey,
        event: &Event,
        token: &str,
    ) -> Result<Option<String>> {
        let payload = serde_json::to_string(event).map_err(anyhow::Error::from)?;
        self.kv
            .append_and_try_gate(&key.queue_key(), &key.gate_key(), &payload, token, self.gate_ttl)
            .await
    }

    /// Atomically takes and clears the current FIFO contents, oldest first.
    pub async fn drain(&self, key: &BufferKey) -> Result<Vec<Event>> {
        let raw = self.kv.list_drain(&key.queue_key()).await?;
        raw.iter()
            .map(|s| serde_json::from_str(s).map_err(|e| anyhow::Error::from(e).into()))
            .collect()
    }

    /// Claims the gate for `key`, only if free. Returns true if claimed.
    pub async fn claim_gate(&self, key: &BufferKey, token: &str) -> Result<bool> {
        self.kv.set_nx_ex(&key.gate_key(), token, self.gate_ttl).await
    }

    /// Refreshes the gate TTL; the owner should call this as a heartbeat while processing.
    pub async fn refresh_gate(&self, key: &BufferKey) -> Result<()> {
        self.kv.expire(&key.gate_key(), self.gate_ttl).await
    }

    /// Releases the gate for `key` only if the buffer is currently empty and `token`
    /// still matches. Returns true if released; false means the caller must keep looping
    /// (more events arrived, or someone else's token is installed — stale callers no-op).
    pub async fn try_release_gate(&self, key: &BufferKey, token: &str) -> Result<bool> {
        let remaining = self.kv.list_len(&key.queue_key()).await?;
        if remaining > 0 {
            return Ok(false);
        }
        self.kv.del_if_eq(&key.gate_key(), token).await
    }

    /// Unconditionally releases the gate for `key` if `token` still matches. Used on
    /// enqueue failure to guarantee liveness regardless of buffer contents (spec §9).
    pub async fn release_gate(&self, key: &BufferKey, token: &str) -> Result<bool> {
        self.kv.del_if_eq(&key.gate_key(), token).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKvStore;
    use crate::model::EventKind;
    use std::collections::HashMap;

    fn sample_event(content: &str) -> Event {
        Event {
            kind: EventKind::Message,
            platform: "discord".into(),
            self_id: "bot-1".into(),
            user_id: "u1".into(),
            guild_id: Some("g1".into()),
            channel_id: "c1".into(),
            message_id: None,
            content: content.to_string(),
            elements: Vec::new(),
            timestamp: 0,
            extras: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn burst_of_events_coalesces_to_one_job_and_drains_in_order() {
        let buffer = SessionBuffer::new(MemoryKvStore::new(), Duration::from_secs(60));
        let key = BufferKey::new("discord-bot-1", "g1", "s1");

        let tok_a = generate_gate_token();
        let first = buffer
            .append_and_request_job(&key, &sample_event("hello"), &tok_a)
            .await
            .unwrap();
        assert_eq!(first, Some(tok_a.clone()));

        let tok_b = generate_gate_token();
        let second = buffer
            .append_and_request_job(&key, &sample_event("foo"), &tok_b)
            .await
            .unwrap();
        assert_eq!(second, None, "a second concurrent caller must not win the gate");

        let tok_c = generate_gate_token();
        let third = buffer
            .append_and_request_job(&key, &sample_event("bar"), &tok_c)
            .await
            .unwrap();
        assert_eq!(third, None);

        let drained = buffer.drain(&key).await.unwrap();
        assert_eq!(drained.len(), 3);
        assert_eq!(drained[0].content, "hello");
        assert_eq!(drained[1].content, "foo");
        assert_eq!(drained[2].content, "bar");
    }

    #[tokio::test]
    async fn try_release_gate_fails_while_buffer_non_empty() {
        let buffer = SessionBuffer::new(MemoryKvStore::new(), Duration::from_secs(60));
        let key = BufferKey::new("discord-bot-1", "g1", "s1");
        let token = generate_gate_token();
        buffer.append_and_request_job(&key, &sample_event("hi"), &token).await.unwrap();
        buffer.append(&key, &sample_event("more")).await.unwrap();

        assert!(!buffer.try_release_gate(&key, &token).await.unwrap());
        buffer.drain(&key).await.unwrap();
        assert!(buffer.try_release_gate(&key, &token).await.unwrap());
    }

    #[tokio::test]
    async fn release_gate_unblocks_the_key_for_a_new_owner() {
        let buffer = SessionBuffer::new(MemoryKvStore::new(), Duration::from_secs(60));
        let key = BufferKey::new("discord-bot-1", "g1", "s1");
        let token_a = generate_gate_token();
        buffer.append_and_request_job(&key, &sample_event("hi"), &token_a).await.unwrap();
        buffer.drain(&key).await.unwrap();
        assert!(buffer.release_gate(&key, &token_a).await.unwrap());

        let token_b = generate_gate_token();
        let result = buffer
            .append_and_request_job(&key, &sample_event("next"), &token_b)
            .await
            .unwrap();
        assert_eq!(result, Some(token_b));
    }

    #[tokio::test]
    async fn stale_release_is_a_no_op() {
        let buffer = SessionBuffer::new(MemoryKvStore::new(), Duration::from_secs(60));
        let key = BufferKey::new("discord-bot-1", "g1", "s1");
        let token_a = generate_gate_token();
        buffer.append_and_request_job(&key, &sample_event("hi"), &token_a).await.unwrap();
        assert!(!buffer.release_gate(&key, "not-the-real-token").await.unwrap());
    }
}
