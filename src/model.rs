//! Core data model: normalized events, identifiers, and the pure helper functions the
//! dispatcher pipeline is built from.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A platform-normalized inbound event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub platform: String,
    pub self_id: String,
    pub user_id: String,
    pub guild_id: Option<String>,
    pub channel_id: String,
    pub message_id: Option<String>,
    pub content: String,
    pub elements: Vec<Element>,
    pub timestamp: i64,
    #[serde(default)]
    pub extras: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Message,
}

/// One normalized content fragment within an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Element {
    Text { text: String },
    Image { url: String },
    Mention { user_id: String },
    Quote { message_id: String },
}

impl Event {
    /// True if any element mentions `user_id`, or the raw content contains a platform
    /// mention token for it (`<@id>`/`<@!id>`-style, checked loosely since wire-level
    /// mention syntax is adapter-specific).
    pub fn mentions(&self, user_id: &str) -> bool {
        self.elements
            .iter()
            .any(|e| matches!(e, Element::Mention { user_id: u } if u == user_id))
            || self.content.contains(&format!("<@{user_id}>"))
            || self.content.contains(&format!("<@!{user_id}>"))
    }

    /// True if the event carries any mention at all (used by the echo tracker).
    pub fn has_any_mention(&self) -> bool {
        self.elements.iter().any(|e| matches!(e, Element::Mention { .. })) || self.content.contains('@')
    }

    pub fn is_direct_message(&self) -> bool {
        self.guild_id.is_none()
    }
}

/// Internal filesystem-safe bot identifier: `platform-selfId` after alias resolution.
pub type BotId = String;

/// Conversation scope: guild id, or `"0"` for direct messages.
pub type GroupId = String;

/// Opaque session identifier minted by the external session repository.
pub type SessionId = String;

/// Per-user multiplex key, parsed from a `#N ` prefix. Defaults to 0.
pub type SessionKey = u32;

/// `(botId, groupId, sessionId)` — the key under which the session buffer and gate live.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BufferKey {
    pub bot_id: BotId,
    pub group_id: GroupId,
    pub session_id: SessionId,
}

impl BufferKey {
    pub fn new(bot_id: impl Into<BotId>, group_id: impl Into<GroupId>, session_id: impl Into<SessionId>) -> Self {
        Self {
            bot_id: bot_id.into(),
            group_id: group_id.into(),
            session_id: session_id.into(),
        }
    }

    /// Storage key for the FIFO queue list.
    pub fn queue_key(&self) -> String {
        format!("buf:{}:{}:{}:queue", self.bot_id, self.group_id, self.session_id)
    }

    /// Storage key for the gate token string.
    pub fn gate_key(&self) -> String {
        format!("buf:{}:{}:{}:gate", self.bot_id, self.group_id, self.session_id)
    }
}

/// A unit of work handed to the external LLM worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionJob {
    pub bot_id: BotId,
    pub group_id: GroupId,
    pub user_id: String,
    pub session_id: SessionId,
    pub key: SessionKey,
    pub gate_token: String,
    pub trace_id: String,
    pub trace_started_at: i64,
    pub enqueued_at: i64,
}

/// A live bot presence entry as written by a registrar and read by the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlbotRegistryEntry {
    pub bot_id: BotId,
    pub ws_url: String,
    pub platform: String,
    pub last_seen_at: Option<i64>,
}

/// Last-known route for a group, consulted by the scheduled push scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupRoute {
    pub platform: String,
    pub self_id: String,
    pub channel_id: String,
    pub updated_at: i64,
}

/// KV key for a group's last-known route (§6).
pub fn group_route_key(group_id: &str) -> String {
    format!("group:route:{group_id}")
}

/// KV key for a group's daily push lock, keyed by a `YYYY-MM-DD` date string (§6).
pub fn group_push_lock_key(group_id: &str, date: &str) -> String {
    format!("group:push:{group_id}:{date}")
}

/// Per-group configuration (`<data>/groups/<id>/config.yaml`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub trigger_mode: TriggerMode,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub admin_users: Vec<String>,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: u32,
    pub model: Option<String>,
    pub echo_rate: Option<u8>,
    pub push: Option<PushConfig>,
    /// Sticky group-id override (world/channel rewriting excluded from the core; this is
    /// a narrower per-platform "forced groupId" knob, e.g. to merge two channels).
    #[serde(default)]
    pub forced_group_id: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_max_sessions() -> u32 {
    1
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            trigger_mode: TriggerMode::Mention,
            keywords: Vec::new(),
            admin_users: Vec::new(),
            max_sessions: default_max_sessions(),
            model: None,
            echo_rate: None,
            push: None,
            forced_group_id: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    #[default]
    Mention,
    Keyword,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushConfig {
    #[serde(default)]
    pub enabled: bool,
    /// `HH:MM`, 24-hour local time in `timezone`.
    pub time: String,
    pub timezone: String,
}

/// Per-bot keyword/echo/routing configuration (`<data>/bots/<botId>/config.yaml`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BotKeywordConfig {
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub keyword_routing: KeywordRouting,
    pub echo_rate: Option<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeywordRouting {
    #[serde(default = "default_true")]
    pub enable_global: bool,
    #[serde(default = "default_true")]
    pub enable_group: bool,
    #[serde(default = "default_true")]
    pub enable_bot: bool,
}

impl Default for KeywordRouting {
    fn default() -> Self {
        Self {
            enable_global: true,
            enable_group: true,
            enable_bot: true,
        }
    }
}

/// Global router configuration (`<data>/router/global.yaml`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouterGlobalConfig {
    #[serde(default)]
    pub keywords: Vec<String>,
    pub echo_rate: Option<u8>,
}

/// Cached snapshot combining the global config with every known per-bot config.
#[derive(Debug, Clone, Default)]
pub struct RouterSnapshot {
    pub global_keywords: Vec<String>,
    pub global_echo_rate: Option<u8>,
    pub bot_configs: HashMap<BotId, BotKeywordConfig>,
}

// --- Pure helper functions (spec §8 Testable Properties) -------------------------------

/// `isSafePathSegment`: matches `[A-Za-z0-9][A-Za-z0-9._-]*` and contains no `..`.
pub fn is_safe_path_segment(s: &str) -> bool {
    if s.is_empty() || s.contains("..") {
        return false;
    }
    let mut chars = s.chars();
    let Some(first) = chars.next() else { return false };
    if !first.is_ascii_alphanumeric() {
        return false;
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-')
}

/// Resolves a raw upstream `selfId` through the configured alias map. Idempotent: an id
/// absent from the map resolves to itself, and resolving the result again is a no-op.
pub fn resolve_canonical_bot_id(alias_map: &HashMap<String, String>, raw_self_id: &str) -> String {
    alias_map
        .get(raw_self_id)
        .cloned()
        .unwrap_or_else(|| raw_self_id.to_string())
}

/// Derives the internal `BotId` from a platform and an already-canonicalized selfId.
pub fn derive_bot_id(platform: &str, canonical_self_id: &str) -> BotId {
    format!("{platform}-{canonical_self_id}")
}

/// Resolves the `GroupId` for an event: forced override, then guild id, then `"0"` for DMs.
pub fn resolve_group_id(event: &Event, forced_override: Option<&str>) -> GroupId {
    if let Some(forced) = forced_override {
        return forced.to_string();
    }
    event.guild_id.clone().unwrap_or_else(|| "0".to_string())
}

/// Parses a leading `#N ` session-key prefix. Returns `(key, remainder)`; `key` defaults
/// to 0 and `remainder` is `content` unchanged when no prefix is present. Left-inverse of
/// prepending `"#<k> "` for any `k`.
pub fn extract_session_key(content: &str) -> (SessionKey, &str) {
    let trimmed = content.trim_start();
    let Some(rest) = trimmed.strip_prefix('#') else {
        return (0, content);
    };
    let digits_end = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
    if digits_end == 0 {
        return (0, content);
    }
    let Ok(key) = rest[..digits_end].parse::<u32>() else {
        return (0, content);
    };
    let after = &rest[digits_end..];
    let remainder = after.strip_prefix(' ').unwrap_or(after);
    (key, remainder)
}

/// Parses an `NdM` dice specification: 1<=N<=10, 1<=M<=100.
pub fn parse_dice_spec(spec: &str) -> Option<(u32, u32)> {
    let spec = spec.trim();
    let (n_part, m_part) = spec.split_once(['d', 'D'])?;
    if n_part.is_empty() || m_part.is_empty() {
        return None;
    }
    let n: u32 = n_part.parse().ok()?;
    let m: u32 = m_part.parse().ok()?;
    if (1..=10).contains(&n) && (1..=100).contains(&m) {
        Some((n, m))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_segment_accepts_simple_ids() {
        assert!(is_safe_path_segment("bot-1"));
        assert!(is_safe_path_segment("discord_123.45"));
        assert!(is_safe_path_segment("a"));
    }

    #[test]
    fn safe_segment_rejects_traversal_and_empty_and_bad_start() {
        assert!(!is_safe_path_segment(""));
        assert!(!is_safe_path_segment("../etc"));
        assert!(!is_safe_path_segment("a/../b"));
        assert!(!is_safe_path_segment("-leading-dash"));
        assert!(!is_safe_path_segment(".leading-dot"));
        assert!(!is_safe_path_segment("has space"));
    }

    #[test]
    fn canonical_bot_id_is_idempotent() {
        let mut map = HashMap::new();
        map.insert("old".to_string(), "new".to_string());
        assert_eq!(resolve_canonical_bot_id(&map, "old"), "new");
        assert_eq!(resolve_canonical_bot_id(&map, "new"), "new");
        assert_eq!(resolve_canonical_bot_id(&map, "untouched"), "untouched");
    }

    #[test]
    fn session_key_roundtrips() {
        for k in [0u32, 1, 42, 10000] {
            let content = format!("#{k} hello world");
            let (parsed, rest) = extract_session_key(&content);
            assert_eq!(parsed, k);
            assert_eq!(rest, "hello world");
        }
    }

    #[test]
    fn session_key_defaults_when_absent() {
        let (key, rest) = extract_session_key("hello world");
        assert_eq!(key, 0);
        assert_eq!(rest, "hello world");
    }

    #[test]
    fn session_key_does_not_consume_bare_hashtag() {
        let (key, rest) = extract_session_key("#notanumber");
        assert_eq!(key, 0);
        assert_eq!(rest, "#notanumber");
    }

    #[test]
    fn dice_spec_accepts_valid_range() {
        assert_eq!(parse_dice_spec("1d6"), Some((1, 6)));
        assert_eq!(parse_dice_spec("10d100"), Some((10, 100)));
        assert_eq!(parse_dice_spec(" 2D20 "), Some((2, 20)));
    }

    #[test]
    fn dice_spec_rejects_out_of_range_and_malformed() {
        assert_eq!(parse_dice_spec("0d6"), None);
        assert_eq!(parse_dice_spec("11d6"), None);
        assert_eq!(parse_dice_spec("1d101"), None);
        assert_eq!(parse_dice_spec("abc"), None);
        assert_eq!(parse_dice_spec("d6"), None);
        assert_eq!(parse_dice_spec("1d"), None);
    }

    #[test]
    fn group_id_prefers_forced_override_then_guild_then_dm() {
        let mut event = sample_event();
        event.guild_id = Some("g1".to_string());
        assert_eq!(resolve_group_id(&event, Some("forced")), "forced");
        assert_eq!(resolve_group_id(&event, None), "g1");
        event.guild_id = None;
        assert_eq!(resolve_group_id(&event, None), "0");
    }

    fn sample_event() -> Event {
        Event {
            kind: EventKind::Message,
            platform: "discord".into(),
            self_id: "bot-1".into(),
            user_id: "u1".into(),
            guild_id: None,
            channel_id: "c1".into(),
            message_id: None,
            content: String::new(),
            elements: Vec::new(),
            timestamp: 0,
            extras: HashMap::new(),
        }
    }
}
