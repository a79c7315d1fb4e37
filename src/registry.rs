//! Llbot registry (reader) and registrar (writer): a TTL-backed presence directory of
//! live bots, shared through the KV store so an `AdapterPool` in any process can
//! reconcile its connections against the current set of live entries.

use crate::error::{ConfigError, InfraError};
use crate::kv::KvStore;
use crate::model::{BotId, LlbotRegistryEntry};
use crate::Result;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

fn entry_key(prefix: &str, bot_id: &str) -> String {
    format!("{prefix}:{bot_id}")
}

fn index_key(prefix: &str) -> String {
    format!("{prefix}:index")
}

/// Advertises this process's bot presence into the registry under TTL, refreshing
/// periodically so the entry survives as long as the process is alive.
pub struct LlbotRegistrar {
    kv: Arc<dyn KvStore>,
    prefix: String,
    ttl: Duration,
    refresh_interval: Duration,
}

impl LlbotRegistrar {
    /// Fails construction if `ttl <= refresh_interval` (spec §4.3 invariant).
    pub fn new(kv: Arc<dyn KvStore>, prefix: impl Into<String>, ttl: Duration, refresh_interval: Duration) -> Result<Self> {
        if ttl <= refresh_interval {
            return Err(ConfigError::Invalid(
                "registrar ttl must be greater than refresh_interval".into(),
            )
            .into());
        }
        Ok(Self {
            kv,
            prefix: prefix.into(),
            ttl,
            refresh_interval,
        })
    }

    async fn publish_once(&self, entry: &LlbotRegistryEntry) -> Result<()> {
        let payload = serde_json::to_string(entry).map_err(anyhow::Error::from)?;
        self.kv.set_ex(&entry_key(&self.prefix, &entry.bot_id), &payload, self.ttl).await?;
        self.kv.set_add(&index_key(&self.prefix), &entry.bot_id).await?;
        Ok(())
    }

    /// Runs the refresh loop until `shutdown` fires, republishing `entry` (with a fresh
    /// `last_seen_at`) every `refresh_interval`. The registry entry expires naturally once
    /// this loop stops being driven.
    pub async fn run(
        &self,
        bot_id: BotId,
        ws_url: String,
        platform: String,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let mut ticker = tokio::time::interval(self.refresh_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let entry = LlbotRegistryEntry {
                        bot_id: bot_id.clone(),
                        ws_url: ws_url.clone(),
                        platform: platform.clone(),
                        last_seen_at: Some(now_ms()),
                    };
                    if let Err(err) = self.publish_once(&entry).await {
                        tracing::warn!(bot_id = %bot_id, error = %err, "registrar refresh failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        self.kv.del(&entry_key(&self.prefix, &bot_id)).await.ok();
                        self.kv.set_remove(&index_key(&self.prefix), &bot_id).await.ok();
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Periodically snapshots the registry from the KV store and emits the result on a
/// `watch` channel for `AdapterPool` to reconcile against.
pub struct LlbotRegistry {
    kv: Arc<dyn KvStore>,
    prefix: String,
    poll_interval: Duration,
}

impl LlbotRegistry {
    pub fn new(kv: Arc<dyn KvStore>, prefix: impl Into<String>, poll_interval: Duration) -> Self {
        Self {
            kv,
            prefix: prefix.into(),
            poll_interval,
        }
    }

    /// Reads the index set, fetches every referenced entry, drops (and scrubs) any
    /// dangling index reference, and returns the resulting map.
    pub async fn snapshot_once(&self) -> Result<HashMap<BotId, LlbotRegistryEntry>> {
        let ids = self.kv.set_members(&index_key(&self.prefix)).await?;
        let mut out = HashMap::with_capacity(ids.len());
        for bot_id in ids {
            match self.kv.get(&entry_key(&self.prefix, &bot_id)).await? {
                Some(raw) => match serde_json::from_str::<LlbotRegistryEntry>(&raw) {
                    Ok(entry) => {
                        out.insert(bot_id, entry);
                    }
                    Err(err) => {
                        tracing::warn!(bot_id = %bot_id, error = %err, "dropping unparsable registry entry");
                        self.kv.set_remove(&index_key(&self.prefix), &bot_id).await.ok();
                    }
                },
                None => {
                    self.kv.set_remove(&index_key(&self.prefix), &bot_id).await.ok();
                }
            }
        }
        Ok(out)
    }

    /// Polls forever, sending each successful snapshot on `tx`. Errors are logged
    /// (`InfraError`) and the loop continues on the next tick.
    pub async fn run(&self, tx: watch::Sender<HashMap<BotId, LlbotRegistryEntry>>) -> Result<()> {
        let mut ticker = tokio::time::interval(self.poll_interval);
        loop {
            ticker.tick().await;
            match self.snapshot_once().await {
                Ok(snapshot) => {
                    if tx.send(snapshot).is_err() {
                        return Ok(());
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "registry snapshot failed");
                    let _ = InfraError::Kv(err.to_string());
                }
            }
        }
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKvStore;

    #[test]
    fn registrar_rejects_ttl_not_greater_than_refresh() {
        let kv = MemoryKvStore::new();
        let result = LlbotRegistrar::new(kv, "llbot", Duration::from_secs(10), Duration::from_secs(10));
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn snapshot_reflects_published_entries_and_scrubs_dangling_index() {
        let kv = MemoryKvStore::new();
        let registrar = LlbotRegistrar::new(kv.clone(), "llbot", Duration::from_secs(30), Duration::from_secs(10)).unwrap();
        registrar
            .publish_once(&LlbotRegistryEntry {
                bot_id: "discord-bot-1".into(),
                ws_url: "ws://a".into(),
                platform: "discord".into(),
                last_seen_at: Some(0),
            })
            .await
            .unwrap();

        // Dangling index reference with no backing value.
        kv.set_add("llbot:index", "ghost-bot").await.unwrap();

        let registry = LlbotRegistry::new(kv.clone(), "llbot", Duration::from_secs(10));
        let snapshot = registry.snapshot_once().await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.contains_key("discord-bot-1"));

        let remaining_index = kv.set_members("llbot:index").await.unwrap();
        assert!(!remaining_index.contains(&"ghost-bot".to_string()));
    }
}
