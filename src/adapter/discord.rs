//! Discord adapter: gateway (serenity) for inbound events, REST for outbound sends.
//! Narrowed to the `Adapter` capability surface of spec §4.1 — world/character helpers,
//! rich-content composition, and multi-method monkey-patched adapters from the teacher's
//! `messaging/discord.rs` are explicitly out of scope (spec §1, §9 re-architecture note).

use super::{Adapter, OnEvent};
use crate::error::InfraError;
use crate::model::{Element, Event, EventKind};
use crate::Result;
use anyhow::Context as _;
use serenity::all::{ChannelId, EventHandler, GatewayIntents, Http, Message, Ready, ShardManager, UserId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

pub struct DiscordAdapter {
    token: String,
    http: RwLock<Option<Arc<Http>>>,
    bot_user_id: RwLock<Option<UserId>>,
    shard_manager: RwLock<Option<Arc<ShardManager>>>,
    handlers: Arc<RwLock<Vec<OnEvent>>>,
}

impl DiscordAdapter {
    pub fn new(token: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            token: token.into(),
            http: RwLock::new(None),
            bot_user_id: RwLock::new(None),
            shard_manager: RwLock::new(None),
            handlers: Arc::new(RwLock::new(Vec::new())),
        })
    }

    async fn get_http(&self) -> Result<Arc<Http>> {
        self.http
            .read()
            .await
            .clone()
            .ok_or_else(|| InfraError::AdapterSend {
                platform: "discord".into(),
                source: "not connected".into(),
            }
            .into())
    }
}

impl Adapter for DiscordAdapter {
    fn platform(&self) -> &str {
        "discord"
    }

    async fn connect(&self) -> Result<()> {
        if self.http.read().await.is_some() {
            return Ok(()); // already connected; idempotent
        }

        let handler = Handler {
            handlers: self.handlers.clone(),
            http_slot: Arc::new(RwLock::new(None)),
            bot_user_id_slot: Arc::new(RwLock::new(None)),
        };
        let http_slot = handler.http_slot.clone();
        let bot_user_id_slot = handler.bot_user_id_slot.clone();

        let intents = GatewayIntents::GUILD_MESSAGES
            | GatewayIntents::DIRECT_MESSAGES
            | GatewayIntents::MESSAGE_CONTENT
            | GatewayIntents::GUILDS;

        let mut client = serenity::Client::builder(&self.token, intents)
            .event_handler(handler)
            .await
            .context("failed to build discord client")
            .map_err(|e| InfraError::AdapterSend {
                platform: "discord".into(),
                source: e.to_string(),
            })?;

        *self.http.write().await = Some(client.http.clone());
        *self.shard_manager.write().await = Some(client.shard_manager.clone());
        *http_slot.write().await = Some(client.http.clone());

        tokio::spawn(async move {
            if let Err(error) = client.start().await {
                tracing::error!(%error, "discord gateway error");
            }
        });

        // Poll briefly for `ready()` to populate bot_user_id; dispatch doesn't block on it.
        let bot_user_id = self.bot_user_id.clone();
        tokio::spawn(async move {
            for _ in 0..50 {
                if let Some(id) = *bot_user_id_slot.read().await {
                    *bot_user_id.write().await = Some(id);
                    return;
                }
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        });

        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if let Some(shard_manager) = self.shard_manager.write().await.take() {
            shard_manager.shutdown_all().await;
        }
        *self.http.write().await = None;
        Ok(())
    }

    async fn on_event(&self, handler: OnEvent) {
        self.handlers.write().await.push(handler);
    }

    async fn send_message(&self, event: &Event, text: &str, _elements: &[Element]) -> Result<()> {
        let http = self.get_http().await?;
        let channel_id: ChannelId = event
            .channel_id
            .parse::<u64>()
            .map(ChannelId::new)
            .map_err(|_| InfraError::AdapterSend {
                platform: "discord".into(),
                source: format!("invalid channel id {:?}", event.channel_id),
            })?;

        for chunk in split_message(text, 2000) {
            channel_id
                .say(&*http, &chunk)
                .await
                .map_err(|e| InfraError::AdapterSend {
                    platform: "discord".into(),
                    source: e.to_string(),
                })?;
        }
        Ok(())
    }

    async fn send_typing(&self, event: &Event) -> Result<()> {
        let http = self.get_http().await?;
        let channel_id: ChannelId = event
            .channel_id
            .parse::<u64>()
            .map(ChannelId::new)
            .map_err(|_| InfraError::AdapterSend {
                platform: "discord".into(),
                source: format!("invalid channel id {:?}", event.channel_id),
            })?;
        let _typing = channel_id.start_typing(&http);
        Ok(())
    }

    async fn get_bot_user_id(&self) -> Option<String> {
        self.bot_user_id.read().await.map(|id| id.to_string())
    }
}

struct Handler {
    handlers: Arc<RwLock<Vec<OnEvent>>>,
    http_slot: Arc<RwLock<Option<Arc<Http>>>>,
    bot_user_id_slot: Arc<RwLock<Option<UserId>>>,
}

#[serenity::async_trait]
impl EventHandler for Handler {
    async fn ready(&self, ctx: serenity::client::Context, ready: Ready) {
        tracing::info!(bot_name = %ready.user.name, "discord connected");
        *self.http_slot.write().await = Some(ctx.http.clone());
        *self.bot_user_id_slot.write().await = Some(ready.user.id);
    }

    async fn message(&self, ctx: serenity::client::Context, message: Message) {
        let bot_user_id = *self.bot_user_id_slot.read().await;
        if bot_user_id.is_some_and(|id| message.author.id == id) {
            return; // never react to ourselves
        }
        if message.author.bot {
            return;
        }

        let mut elements = Vec::new();
        for mention in &message.mentions {
            elements.push(Element::Mention {
                user_id: mention.id.to_string(),
            });
        }
        if let Some(reference) = &message.referenced_message {
            elements.push(Element::Quote {
                message_id: reference.id.to_string(),
            });
        }
        elements.push(Element::Text {
            text: message.content.clone(),
        });

        let mut extras = HashMap::new();
        if let Some(guild_id) = message.guild_id {
            let is_owner = ctx
                .cache
                .guild(guild_id)
                .is_some_and(|guild| guild.owner_id == message.author.id);
            extras.insert("isGuildOwner".to_string(), serde_json::Value::Bool(is_owner));

            let is_admin = guild_id
                .member(&ctx.http, message.author.id)
                .await
                .ok()
                .and_then(|member| member.permissions(&ctx.cache).ok())
                .is_some_and(|perms| perms.administrator());
            extras.insert("isGuildAdmin".to_string(), serde_json::Value::Bool(is_admin));
        }

        let event = Event {
            kind: EventKind::Message,
            platform: "discord".into(),
            self_id: bot_user_id.map(|id| id.to_string()).unwrap_or_default(),
            user_id: message.author.id.to_string(),
            guild_id: message.guild_id.map(|g| g.to_string()),
            channel_id: message.channel_id.to_string(),
            message_id: Some(message.id.to_string()),
            content: message.content.clone(),
            elements,
            timestamp: message.timestamp.unix_timestamp() * 1000,
            extras,
        };

        let handlers = self.handlers.read().await.clone();
        for handler in handlers {
            handler(event.clone());
        }
    }
}

/// Splits `text` into chunks of at most `max_len` bytes, preferring to break on a newline
/// or space so words aren't cut mid-token.
fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;
    while !remaining.is_empty() {
        if remaining.len() <= max_len {
            chunks.push(remaining.to_string());
            break;
        }

        let mut safe_max = max_len.min(remaining.len());
        while !remaining.is_char_boundary(safe_max) {
            safe_max -= 1;
        }

        let split_at = remaining[..safe_max]
            .rfind('\n')
            .or_else(|| remaining[..safe_max].rfind(' '))
            .unwrap_or(safe_max);

        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start();
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_message_keeps_short_text_whole() {
        assert_eq!(split_message("hello", 2000), vec!["hello".to_string()]);
    }

    #[test]
    fn split_message_breaks_on_whitespace() {
        let text = format!("{} {}", "a".repeat(1999), "b".repeat(10));
        let chunks = split_message(&text, 2000);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].len() <= 2000);
    }
}
