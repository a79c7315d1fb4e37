//! Milky-style WebSocket adapter: one connection per bot, attached and torn down by
//! `AdapterPool` as registry entries come and go (spec §4.2). The wire format is a
//! generic OneBot-derived event/action protocol — segments in, an `action` envelope out —
//! kept intentionally small since only the `Adapter` capability surface (§4.1) is
//! prescribed for platform bindings.

use super::{Adapter, OnEvent};
use crate::error::InfraError;
use crate::model::{Element, Event, EventKind};
use crate::Result;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type WsWriter = futures::stream::SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;

/// One Milky-protocol wire segment, OneBot-style tagged union.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireSegment {
    Text { data: TextData },
    Image { data: ImageData },
    At { data: AtData },
    Reply { data: ReplyData },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TextData {
    text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ImageData {
    url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AtData {
    #[serde(rename = "qq")]
    user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ReplyData {
    id: String,
}

/// An inbound Milky event frame. Only `message` events are normalized; everything else
/// (heartbeats, lifecycle notices) is acknowledged by tungstenite's own ping/pong and
/// otherwise ignored.
#[derive(Debug, Clone, Deserialize)]
struct WireEvent {
    #[serde(default)]
    post_type: String,
    self_id: String,
    user_id: Option<String>,
    group_id: Option<String>,
    message_id: Option<String>,
    #[serde(default)]
    raw_message: String,
    #[serde(default)]
    message: Vec<WireSegment>,
    time: Option<i64>,
}

#[derive(Serialize)]
struct WireAction<'a> {
    action: &'a str,
    params: WireSendParams<'a>,
}

#[derive(Serialize)]
struct WireSendParams<'a> {
    group_id: Option<&'a str>,
    user_id: Option<&'a str>,
    message: Vec<WireSegment>,
}

fn elements_to_segments(text: &str, elements: &[Element]) -> Vec<WireSegment> {
    if elements.is_empty() {
        return vec![WireSegment::Text {
            data: TextData { text: text.to_string() },
        }];
    }
    elements
        .iter()
        .map(|el| match el {
            Element::Text { text } => WireSegment::Text {
                data: TextData { text: text.clone() },
            },
            Element::Image { url } => WireSegment::Image {
                data: ImageData { url: url.clone() },
            },
            Element::Mention { user_id } => WireSegment::At {
                data: AtData { user_id: user_id.clone() },
            },
            Element::Quote { message_id } => WireSegment::Reply {
                data: ReplyData { id: message_id.clone() },
            },
        })
        .collect()
}

fn segments_to_elements(segments: &[WireSegment]) -> Vec<Element> {
    segments
        .iter()
        .map(|seg| match seg {
            WireSegment::Text { data } => Element::Text { text: data.text.clone() },
            WireSegment::Image { data } => Element::Image { url: data.url.clone() },
            WireSegment::At { data } => Element::Mention {
                user_id: data.user_id.clone(),
            },
            WireSegment::Reply { data } => Element::Quote {
                message_id: data.id.clone(),
            },
        })
        .collect()
}

/// A single Milky-protocol WebSocket connection, normalized to the `Adapter` capability.
/// Shared state lives behind `Arc` so the spawned read loop can write back into it
/// directly instead of polling a separate slot.
pub struct MilkyAdapter {
    ws_url: String,
    writer: RwLock<Option<WsWriter>>,
    handlers: Arc<RwLock<Vec<OnEvent>>>,
    bot_user_id: Arc<RwLock<Option<String>>>,
}

impl MilkyAdapter {
    pub fn new(ws_url: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            ws_url: ws_url.into(),
            writer: RwLock::new(None),
            handlers: Arc::new(RwLock::new(Vec::new())),
            bot_user_id: Arc::new(RwLock::new(None)),
        })
    }
}

impl Adapter for MilkyAdapter {
    fn platform(&self) -> &str {
        "qq"
    }

    async fn connect(&self) -> Result<()> {
        if self.writer.read().await.is_some() {
            return Ok(()); // already connected; idempotent
        }

        let (ws, _response) = tokio_tungstenite::connect_async(&self.ws_url)
            .await
            .map_err(|e| InfraError::AdapterSend {
                platform: "qq".into(),
                source: e.to_string(),
            })?;
        let (writer, mut reader) = ws.split();
        *self.writer.write().await = Some(writer);

        let handlers = self.handlers.clone();
        let bot_user_id = self.bot_user_id.clone();

        tokio::spawn(async move {
            while let Some(frame) = reader.next().await {
                let text = match frame {
                    Ok(WsMessage::Text(text)) => text.to_string(),
                    Ok(WsMessage::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                let Ok(wire) = serde_json::from_str::<WireEvent>(&text) else {
                    continue;
                };
                if wire.post_type != "message" {
                    continue;
                }

                *bot_user_id.write().await = Some(wire.self_id.clone());

                let event = Event {
                    kind: EventKind::Message,
                    platform: "qq".into(),
                    self_id: wire.self_id,
                    user_id: wire.user_id.unwrap_or_default(),
                    guild_id: wire.group_id,
                    channel_id: wire.message_id.clone().unwrap_or_default(),
                    message_id: wire.message_id,
                    content: wire.raw_message,
                    elements: segments_to_elements(&wire.message),
                    timestamp: wire.time.unwrap_or(0) * 1000,
                    extras: HashMap::new(),
                };

                let snapshot = handlers.read().await.clone();
                for handler in &snapshot {
                    handler(event.clone());
                }
            }
        });

        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if let Some(mut writer) = self.writer.write().await.take() {
            let _ = writer.close().await;
        }
        Ok(())
    }

    async fn on_event(&self, handler: OnEvent) {
        self.handlers.write().await.push(handler);
    }

    async fn send_message(&self, event: &Event, text: &str, elements: &[Element]) -> Result<()> {
        let payload = WireAction {
            action: "send_message",
            params: WireSendParams {
                group_id: event.guild_id.as_deref(),
                user_id: Some(&event.user_id),
                message: elements_to_segments(text, elements),
            },
        };
        let json = serde_json::to_string(&payload).map_err(anyhow::Error::from)?;

        let mut guard = self.writer.write().await;
        let Some(writer) = guard.as_mut() else {
            return Err(InfraError::AdapterSend {
                platform: "qq".into(),
                source: "not connected".into(),
            }
            .into());
        };
        writer.send(WsMessage::Text(json.into())).await.map_err(|e| {
            InfraError::AdapterSend {
                platform: "qq".into(),
                source: e.to_string(),
            }
            .into()
        })
    }

    async fn get_bot_user_id(&self) -> Option<String> {
        self.bot_user_id.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segments_roundtrip_through_elements() {
        let segments = vec![
            WireSegment::At {
                data: AtData { user_id: "u1".into() },
            },
            WireSegment::Text {
                data: TextData { text: " hi".into() },
            },
        ];
        let elements = segments_to_elements(&segments);
        assert_eq!(
            elements,
            vec![
                Element::Mention { user_id: "u1".into() },
                Element::Text { text: " hi".into() },
            ]
        );

        let back = elements_to_segments("unused", &elements);
        assert_eq!(back.len(), 2);
    }

    #[test]
    fn empty_elements_fall_back_to_plain_text_segment() {
        let segments = elements_to_segments("hello", &[]);
        assert_eq!(segments.len(), 1);
    }
}
