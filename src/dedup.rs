//! `BotMessageStore`: a small KV-backed dedup helper shared by two narrow concerns —
//! recognizing a bot's own previously-sent message reflected back by an upstream network,
//! and suppressing a duplicate outbound send when the at-least-once `SessionQueue`
//! redelivers a job whose reply already went out (spec §2).

use crate::kv::KvStore;
use crate::Result;
use std::sync::Arc;
use std::time::Duration;

pub struct BotMessageStore {
    kv: Arc<dyn KvStore>,
    ttl: Duration,
}

impl BotMessageStore {
    pub fn new(kv: Arc<dyn KvStore>, ttl: Duration) -> Self {
        Self { kv, ttl }
    }

    /// Marks `(bot_id, message_id)` as authored by the bot itself.
    pub async fn mark_self_message(&self, bot_id: &str, message_id: &str) -> Result<()> {
        self.kv.set_ex(&format!("selfmsg:{bot_id}:{message_id}"), "1", self.ttl).await
    }

    /// True if `(bot_id, message_id)` was previously marked as self-authored.
    pub async fn is_self_message(&self, bot_id: &str, message_id: &str) -> Result<bool> {
        Ok(self.kv.get(&format!("selfmsg:{bot_id}:{message_id}")).await?.is_some())
    }

    /// True if `signature` (typically a hash of job id + channel + reply text) has already
    /// been sent, claiming it atomically if not. Callers should only send when this
    /// returns `false`.
    pub async fn claim_reply_signature(&self, signature: &str) -> Result<bool> {
        let already_sent = !self
            .kv
            .set_nx_ex(&format!("replysig:{signature}"), "1", self.ttl)
            .await?;
        Ok(already_sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKvStore;

    #[tokio::test]
    async fn self_message_marking_roundtrips() {
        let store = BotMessageStore::new(MemoryKvStore::new(), Duration::from_secs(30));
        assert!(!store.is_self_message("discord-bot-1", "m1").await.unwrap());
        store.mark_self_message("discord-bot-1", "m1").await.unwrap();
        assert!(store.is_self_message("discord-bot-1", "m1").await.unwrap());
    }

    #[tokio::test]
    async fn reply_signature_claim_is_one_shot() {
        let store = BotMessageStore::new(MemoryKvStore::new(), Duration::from_secs(30));
        assert!(!store.claim_reply_signature("sig-a").await.unwrap());
        assert!(store.claim_reply_signature("sig-a").await.unwrap());
    }
}
