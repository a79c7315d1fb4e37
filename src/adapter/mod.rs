//! Adapter capability (§4.1): the minimal surface every upstream chat-network binding
//! must provide, plus `MultiAdapter` (§4.1, composes by platform) and `AdapterPool`
//! (§4.2, reconciles a registry-driven set of per-bot adapters). Mirrors this codebase's
//! `Messaging`/`MessagingDyn` static-trait-plus-dyn-companion split so adapters stay
//! generic over `impl Adapter` while call sites hold `Arc<dyn AdapterDyn>`.

pub mod discord;
pub mod milky;
pub mod pool;

use crate::model::{Element, Event};
use crate::Result;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

pub use pool::AdapterPool;

/// Invoked once per normalized inbound `Event`. Registered handlers are re-subscribed to
/// every adapter an `AdapterPool` attaches (spec §4.2 step 4).
pub type OnEvent = Arc<dyn Fn(Event) + Send + Sync>;

/// Static trait for adapter implementations. Use this for type-safe construction;
/// `Arc<dyn AdapterDyn>` is what `MultiAdapter`/`AdapterPool` actually store.
pub trait Adapter: Send + Sync + 'static {
    /// The platform this adapter speaks, e.g. `"discord"` or `"qq"`.
    fn platform(&self) -> &str;

    /// Idempotent connect.
    fn connect(&self) -> impl Future<Output = Result<()>> + Send;

    /// Idempotent disconnect. Must not emit further events afterwards.
    fn disconnect(&self) -> impl Future<Output = Result<()>> + Send;

    /// Registers a handler invoked for every inbound event. Adapters may be asked to
    /// register more than one handler over their lifetime (pool re-subscription).
    fn on_event(&self, handler: OnEvent) -> impl Future<Output = ()> + Send;

    /// Sends `text`/`elements` to `event.channel_id`. May split long text.
    fn send_message(
        &self,
        event: &Event,
        text: &str,
        elements: &[Element],
    ) -> impl Future<Output = Result<()>> + Send;

    /// Optional typing indicator. Default is a no-op.
    fn send_typing(&self, event: &Event) -> impl Future<Output = Result<()>> + Send {
        let _ = event;
        async { Ok(()) }
    }

    /// This adapter's upstream `selfId`, or `None` before the connection is ready.
    fn get_bot_user_id(&self) -> impl Future<Output = Option<String>> + Send;
}

/// Dyn-compatible companion to [`Adapter`]. Every `T: Adapter` implements this via the
/// blanket impl below; nothing else should implement it directly.
pub trait AdapterDyn: Send + Sync + 'static {
    fn platform(&self) -> &str;

    fn connect<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    fn disconnect<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    fn on_event<'a>(&'a self, handler: OnEvent) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

    fn send_message<'a>(
        &'a self,
        event: &'a Event,
        text: &'a str,
        elements: &'a [Element],
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    fn send_typing<'a>(&'a self, event: &'a Event) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    fn get_bot_user_id<'a>(&'a self) -> Pin<Box<dyn Future<Output = Option<String>> + Send + 'a>>;
}

impl<T: Adapter> AdapterDyn for T {
    fn platform(&self) -> &str {
        Adapter::platform(self)
    }

    fn connect<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(Adapter::connect(self))
    }

    fn disconnect<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(Adapter::disconnect(self))
    }

    fn on_event<'a>(&'a self, handler: OnEvent) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(Adapter::on_event(self, handler))
    }

    fn send_message<'a>(
        &'a self,
        event: &'a Event,
        text: &'a str,
        elements: &'a [Element],
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(Adapter::send_message(self, event, text, elements))
    }

    fn send_typing<'a>(&'a self, event: &'a Event) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(Adapter::send_typing(self, event))
    }

    fn get_bot_user_id<'a>(&'a self) -> Pin<Box<dyn Future<Output = Option<String>> + Send + 'a>> {
        Box::pin(Adapter::get_bot_user_id(self))
    }
}

/// Composes heterogeneous adapters behind one interface, routing outbound `send_message`
/// by `Event.platform` (spec §4.1).
#[derive(Default)]
pub struct MultiAdapter {
    adapters: RwLock<HashMap<String, Arc<dyn AdapterDyn>>>,
}

impl MultiAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `adapter` under its platform name, connecting isn't implied — callers
    /// connect explicitly (or rely on an `AdapterPool` for registry-driven platforms).
    pub fn register(&self, adapter: impl Adapter) {
        let platform = adapter.platform().to_string();
        self.adapters.write().unwrap().insert(platform, Arc::new(adapter));
    }

    /// Registers an already-shared adapter (most concrete adapters, including
    /// `AdapterPool` itself, are constructed behind an `Arc` so a background task can
    /// hold the same handle the registry routes sends through).
    pub fn register_arc(&self, adapter: Arc<dyn AdapterDyn>) {
        let platform = adapter.platform().to_string();
        self.adapters.write().unwrap().insert(platform, adapter);
    }

    pub fn get(&self, platform: &str) -> Option<Arc<dyn AdapterDyn>> {
        self.adapters.read().unwrap().get(platform).cloned()
    }

    /// Registers `handler` on every currently-known adapter.
    pub async fn on_event(&self, handler: OnEvent) {
        let adapters: Vec<_> = self.adapters.read().unwrap().values().cloned().collect();
        for adapter in adapters {
            adapter.on_event(handler.clone()).await;
        }
    }

    /// Connects every registered adapter concurrently. At least one must succeed, per
    /// spec §5 (`MultiAdapter.connect` ordering guarantee).
    pub async fn connect_all(&self) -> Result<()> {
        let adapters: Vec<_> = self.adapters.read().unwrap().values().cloned().collect();
        let results = futures::future::join_all(adapters.iter().map(|a| a.connect())).await;
        let mut last_err = None;
        let mut any_ok = false;
        for result in results {
            match result {
                Ok(()) => any_ok = true,
                Err(err) => last_err = Some(err),
            }
        }
        if any_ok || last_err.is_none() {
            Ok(())
        } else {
            Err(last_err.unwrap())
        }
    }

    pub async fn disconnect_all(&self) {
        let adapters: Vec<_> = self.adapters.read().unwrap().values().cloned().collect();
        for adapter in adapters {
            if let Err(err) = adapter.disconnect().await {
                tracing::warn!(platform = adapter.platform(), error = %err, "adapter disconnect failed");
            }
        }
    }

    /// Routes an outbound send to the adapter owning `event.platform`. Absence is logged
    /// and the send is dropped, not an error to the caller (mirrors `AdapterPool`'s
    /// send-routing semantics in §4.2).
    pub async fn send_message(&self, event: &Event, text: &str, elements: &[Element]) -> Result<()> {
        let Some(adapter) = self.get(&event.platform) else {
            tracing::warn!(platform = %event.platform, "no adapter registered for platform, dropping send");
            return Ok(());
        };
        adapter.send_message(event, text, elements).await
    }

    pub async fn send_typing(&self, event: &Event) -> Result<()> {
        let Some(adapter) = self.get(&event.platform) else {
            return Ok(());
        };
        adapter.send_typing(event).await
    }
}
