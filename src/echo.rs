//! `EchoTracker` (spec §4.4.1): a single-channel "streak echo". Tracks the last distinct
//! message signature and streak count per `(selfId, channelId)` in the shared KV store so
//! replicas see the same streak, not independent ones (spec §9 re-architecture note).

use crate::kv::KvStore;
use crate::model::Event;
use crate::Result;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct StreakState {
    signature: String,
    streak: u32,
    echoed: bool,
}

pub struct EchoTracker {
    kv: Arc<dyn KvStore>,
    ttl: Duration,
}

impl EchoTracker {
    pub fn new(kv: Arc<dyn KvStore>, ttl: Duration) -> Self {
        Self { kv, ttl }
    }

    fn key(selfid: &str, channel_id: &str) -> String {
        format!("echo:{selfid}:{channel_id}")
    }

    /// Computes the event's echo signature: the normalized element form, or the trimmed
    /// content when there are no elements.
    fn signature(event: &Event) -> String {
        if event.elements.is_empty() {
            event.content.trim().to_string()
        } else {
            serde_json::to_string(&event.elements).unwrap_or_default()
        }
    }

    /// Decides whether `event` should be echoed verbatim, per the streak rules in §4.4.1.
    /// `rate` is a 0..=100 percentage of the weighted coin flip once a streak is eligible.
    pub async fn should_echo(&self, event: &Event, rate: u8) -> Result<bool> {
        if event.is_direct_message() {
            return Ok(false);
        }
        if event.has_any_mention() {
            self.kv.del(&Self::key(&event.self_id, &event.channel_id)).await?;
            return Ok(false);
        }
        if event.user_id == event.self_id {
            return Ok(false);
        }

        let key = Self::key(&event.self_id, &event.channel_id);
        let signature = Self::signature(event);
        let current = match self.kv.get(&key).await? {
            Some(raw) => serde_json::from_str::<StreakState>(&raw).ok(),
            None => None,
        };

        let mut state = match current {
            Some(state) if state.signature == signature => state,
            _ => {
                let fresh = StreakState {
                    signature,
                    streak: 1,
                    echoed: false,
                };
                self.persist(&key, &fresh).await?;
                return Ok(false);
            }
        };

        if state.streak < 2 {
            state.streak += 1;
            self.persist(&key, &state).await?;
            return Ok(false);
        }

        if state.echoed {
            return Ok(false);
        }

        let p = (rate.min(100) as f64) / 100.0;
        let flip = rand::rng().random_bool(p);
        if flip {
            state.echoed = true;
            self.persist(&key, &state).await?;
        }
        Ok(flip)
    }

    async fn persist(&self, key: &str, state: &StreakState) -> Result<()> {
        let payload = serde_json::to_string(state).map_err(anyhow::Error::from)?;
        self.kv.set_ex(key, &payload, self.ttl).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKvStore;
    use crate::model::EventKind;
    use std::collections::HashMap;

    fn event(content: &str, user_id: &str, has_guild: bool) -> Event {
        Event {
            kind: EventKind::Message,
            platform: "discord".into(),
            self_id: "bot-1".into(),
            user_id: user_id.into(),
            guild_id: if has_guild { Some("g1".into()) } else { None },
            channel_id: "c1".into(),
            message_id: None,
            content: content.into(),
            elements: Vec::new(),
            timestamp: 0,
            extras: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn direct_messages_never_echo() {
        let tracker = EchoTracker::new(MemoryKvStore::new(), Duration::from_secs(30));
        assert!(!tracker.should_echo(&event("hi", "u1", false), 100).await.unwrap());
    }

    #[tokio::test]
    async fn self_messages_never_echo() {
        let tracker = EchoTracker::new(MemoryKvStore::new(), Duration::from_secs(30));
        assert!(!tracker.should_echo(&event("hi", "bot-1", true), 100).await.unwrap());
    }

    #[tokio::test]
    async fn streak_of_three_with_full_rate_echoes_on_third() {
        let tracker = EchoTracker::new(MemoryKvStore::new(), Duration::from_secs(30));
        assert!(!tracker.should_echo(&event("same", "u1", true), 100).await.unwrap());
        assert!(!tracker.should_echo(&event("same", "u1", true), 100).await.unwrap());
        assert!(tracker.should_echo(&event("same", "u1", true), 100).await.unwrap());
    }

    #[tokio::test]
    async fn zero_rate_never_echoes_even_at_streak() {
        let tracker = EchoTracker::new(MemoryKvStore::new(), Duration::from_secs(30));
        tracker.should_echo(&event("same", "u1", true), 0).await.unwrap();
        tracker.should_echo(&event("same", "u1", true), 0).await.unwrap();
        assert!(!tracker.should_echo(&event("same", "u1", true), 0).await.unwrap());
    }

    #[tokio::test]
    async fn differing_message_resets_the_streak() {
        let tracker = EchoTracker::new(MemoryKvStore::new(), Duration::from_secs(30));
        tracker.should_echo(&event("a", "u1", true), 100).await.unwrap();
        tracker.should_echo(&event("a", "u1", true), 100).await.unwrap();
        // A different message resets streak to 1, not eligible yet.
        assert!(!tracker.should_echo(&event("b", "u1", true), 100).await.unwrap());
    }

    #[tokio::test]
    async fn any_mention_in_content_resets_and_blocks_echo() {
        let tracker = EchoTracker::new(MemoryKvStore::new(), Duration::from_secs(30));
        tracker.should_echo(&event("a", "u1", true), 100).await.unwrap();
        tracker.should_echo(&event("a", "u1", true), 100).await.unwrap();
        assert!(!tracker.should_echo(&event("a @someone", "u1", true), 100).await.unwrap());
    }
}
