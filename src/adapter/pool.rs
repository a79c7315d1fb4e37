//! `AdapterPool` (spec §4.2): watches `LlbotRegistry` snapshots and maintains one `Adapter`
//! child per live bot entry for platforms where each bot is its own upstream connection
//! (the Milky/QQ family). Implements `Adapter` itself, so it registers into `MultiAdapter`
//! exactly like a single-bot adapter — outbound sends route internally by `event.self_id`.

use super::{Adapter, AdapterDyn, OnEvent};
use crate::model::{BotId, Element, Event, LlbotRegistryEntry};
use crate::Result;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::watch;

type AdapterFactory = Arc<dyn Fn(&LlbotRegistryEntry) -> Arc<dyn AdapterDyn> + Send + Sync>;

struct Connection {
    ws_url: String,
    adapter: Arc<dyn AdapterDyn>,
}

pub struct AdapterPool {
    platform: String,
    factory: AdapterFactory,
    connections: Mutex<HashMap<BotId, Connection>>,
    connecting: Mutex<HashSet<BotId>>,
    handlers: RwLock<Vec<OnEvent>>,
}

impl AdapterPool {
    pub fn new(platform: impl Into<String>, factory: AdapterFactory) -> Arc<Self> {
        Arc::new(Self {
            platform: platform.into(),
            factory,
            connections: Mutex::new(HashMap::new()),
            connecting: Mutex::new(HashSet::new()),
            handlers: RwLock::new(Vec::new()),
        })
    }

    /// Polls `rx` for registry snapshots and reconciles on every change, until the sender
    /// is dropped.
    pub async fn run(self: &Arc<Self>, mut rx: watch::Receiver<HashMap<BotId, LlbotRegistryEntry>>) {
        loop {
            let snapshot = rx.borrow_and_update().clone();
            self.reconcile(snapshot).await;
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Reconciles live connections against `snapshot`, restricted to entries matching this
    /// pool's platform (spec §4.2 algorithm).
    pub async fn reconcile(self: &Arc<Self>, snapshot: HashMap<BotId, LlbotRegistryEntry>) {
        let live: HashMap<BotId, LlbotRegistryEntry> = snapshot
            .into_iter()
            .filter(|(_, entry)| entry.platform == self.platform)
            .collect();

        // Step 3: drop connections no longer present, or whose ws_url changed (the
        // changed case is handled below by disconnecting here and starting fresh).
        let stale: Vec<BotId> = {
            let connections = self.connections.lock().unwrap();
            connections
                .iter()
                .filter(|(bot_id, conn)| match live.get(*bot_id) {
                    None => true,
                    Some(entry) => entry.ws_url != conn.ws_url,
                })
                .map(|(bot_id, _)| bot_id.clone())
                .collect()
        };

        for bot_id in stale {
            let removed = self.connections.lock().unwrap().remove(&bot_id);
            if let Some(conn) = removed {
                if let Err(err) = conn.adapter.disconnect().await {
                    tracing::warn!(bot_id = %bot_id, platform = %self.platform, error = %err, "adapter disconnect failed, dropping entry anyway");
                }
            }
        }

        // Step 2: start a connection for every live entry we don't already hold, guarded
        // by a per-bot single-flight flag.
        for (bot_id, entry) in live {
            if self.connections.lock().unwrap().contains_key(&bot_id) {
                continue;
            }
            {
                let mut connecting = self.connecting.lock().unwrap();
                if !connecting.insert(bot_id.clone()) {
                    continue; // another reconcile pass is already starting this bot
                }
            }
            self.start_one(bot_id.clone(), entry).await;
            self.connecting.lock().unwrap().remove(&bot_id);
        }
    }

    async fn start_one(self: &Arc<Self>, bot_id: BotId, entry: LlbotRegistryEntry) {
        let adapter = (self.factory)(&entry);
        if let Err(err) = adapter.connect().await {
            tracing::warn!(bot_id = %bot_id, platform = %self.platform, error = %err, "adapter connect failed, will retry next tick");
            return;
        }

        // Step 4: re-subscribe every previously registered handler.
        let handlers: Vec<OnEvent> = self.handlers.read().unwrap().clone();
        for handler in handlers {
            adapter.on_event(handler).await;
        }

        self.connections.lock().unwrap().insert(
            bot_id,
            Connection {
                ws_url: entry.ws_url,
                adapter,
            },
        );
    }
}

impl Adapter for AdapterPool {
    fn platform(&self) -> &str {
        &self.platform
    }

    async fn connect(&self) -> Result<()> {
        // Lifecycle is driven entirely by `reconcile`/`run`; nothing to do on the
        // aggregate pool itself.
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let connections: Vec<_> = self.connections.lock().unwrap().drain().map(|(_, c)| c.adapter).collect();
        for adapter in connections {
            if let Err(err) = adapter.disconnect().await {
                tracing::warn!(platform = %self.platform, error = %err, "adapter disconnect failed during pool shutdown");
            }
        }
        Ok(())
    }

    async fn on_event(&self, handler: OnEvent) {
        self.handlers.write().unwrap().push(handler.clone());
        let adapters: Vec<_> = self.connections.lock().unwrap().values().map(|c| c.adapter.clone()).collect();
        for adapter in adapters {
            adapter.on_event(handler.clone()).await;
        }
    }

    async fn send_message(&self, event: &Event, text: &str, elements: &[Element]) -> Result<()> {
        let adapter = self.connections.lock().unwrap().get(&event.self_id).map(|c| c.adapter.clone());
        let Some(adapter) = adapter else {
            tracing::warn!(self_id = %event.self_id, platform = %self.platform, "no live connection for bot, dropping send");
            return Ok(());
        };
        adapter.send_message(event, text, elements).await
    }

    async fn get_bot_user_id(&self) -> Option<String> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::Adapter as _;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeAdapter {
        connects: Arc<AtomicUsize>,
        disconnects: Arc<AtomicUsize>,
    }

    impl Adapter for FakeAdapter {
        fn platform(&self) -> &str {
            "qq"
        }
        async fn connect(&self) -> Result<()> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn disconnect(&self) -> Result<()> {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn on_event(&self, _handler: OnEvent) {}
        async fn send_message(&self, _event: &Event, _text: &str, _elements: &[Element]) -> Result<()> {
            Ok(())
        }
        async fn get_bot_user_id(&self) -> Option<String> {
            None
        }
    }

    fn entry(bot_id: &str, ws_url: &str) -> LlbotRegistryEntry {
        LlbotRegistryEntry {
            bot_id: bot_id.to_string(),
            ws_url: ws_url.to_string(),
            platform: "qq".to_string(),
            last_seen_at: Some(0),
        }
    }

    #[tokio::test]
    async fn reconcile_adds_and_removes_connections() {
        let connects = Arc::new(AtomicUsize::new(0));
        let disconnects = Arc::new(AtomicUsize::new(0));
        let connects2 = connects.clone();
        let disconnects2 = disconnects.clone();

        let pool = AdapterPool::new(
            "qq",
            Arc::new(move |_entry| {
                Arc::new(FakeAdapter {
                    connects: connects2.clone(),
                    disconnects: disconnects2.clone(),
                }) as Arc<dyn AdapterDyn>
            }),
        );

        let mut snapshot = HashMap::new();
        snapshot.insert("bot-a".to_string(), entry("bot-a", "ws://a"));
        snapshot.insert("bot-b".to_string(), entry("bot-b", "ws://b"));
        pool.reconcile(snapshot.clone()).await;
        assert_eq!(connects.load(Ordering::SeqCst), 2);
        assert_eq!(pool.connections.lock().unwrap().len(), 2);

        snapshot.remove("bot-b");
        pool.reconcile(snapshot.clone()).await;
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(pool.connections.lock().unwrap().len(), 1);

        snapshot.insert("bot-a".to_string(), entry("bot-a", "ws://a2"));
        pool.reconcile(snapshot).await;
        assert_eq!(disconnects.load(Ordering::SeqCst), 2);
        assert_eq!(connects.load(Ordering::SeqCst), 3);
    }
}
