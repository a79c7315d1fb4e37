//! `MessageDispatcher` (spec §4.4): the control plane. Validates the envelope, authorizes
//! and trigger-matches, extracts the session key, parses management commands, and either
//! gates + enqueues a `SessionJob` or falls through to passive echo. Never propagates an
//! error to the caller — every failure is logged and the event is dropped or answered
//! inline.

use crate::adapter::MultiAdapter;
use crate::buffer::{generate_gate_token, SessionBuffer};
use crate::config::GatewayConfig;
use crate::echo::EchoTracker;
use crate::error::{DispatchError, ValidationError};
use crate::kv::KvStore;
use crate::model::{
    derive_bot_id, extract_session_key, group_route_key, is_safe_path_segment, resolve_canonical_bot_id,
    resolve_group_id, BufferKey, Element, Event, GroupConfig, GroupRoute, RouterSnapshot, SessionJob,
};
use crate::queue::SessionQueue;
use crate::session::SessionRepository;
use crate::store::{GroupStore, RouterStore};
use crate::Result;
use std::sync::Arc;
use std::time::Duration;

/// Everything `MessageDispatcher::dispatch` needs, wired up once at startup.
pub struct MessageDispatcher {
    config: Arc<GatewayConfig>,
    router_store: Arc<RouterStore>,
    group_store: Arc<GroupStore>,
    session_repo: Arc<SessionRepository>,
    buffer: Arc<SessionBuffer>,
    queue: Arc<SessionQueue>,
    echo: Arc<EchoTracker>,
    adapters: Arc<MultiAdapter>,
    kv: Arc<dyn KvStore>,
}

const GROUP_ROUTE_TTL: Duration = Duration::from_secs(30 * 24 * 3600);

impl MessageDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<GatewayConfig>,
        router_store: Arc<RouterStore>,
        group_store: Arc<GroupStore>,
        session_repo: Arc<SessionRepository>,
        buffer: Arc<SessionBuffer>,
        queue: Arc<SessionQueue>,
        echo: Arc<EchoTracker>,
        adapters: Arc<MultiAdapter>,
        kv: Arc<dyn KvStore>,
    ) -> Self {
        Self {
            config,
            router_store,
            group_store,
            session_repo,
            buffer,
            queue,
            echo,
            adapters,
            kv,
        }
    }

    /// Handles one inbound event end to end. Never throws: every error is logged and the
    /// event is dropped (spec §4.4, §7 propagation policy).
    pub async fn dispatch(&self, mut event: Event) {
        seed_trace(&mut event);
        let trace_id = event
            .extras
            .get("traceId")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        if let Err(err) = self.dispatch_inner(event).await {
            tracing::error!(trace_id = %trace_id, error = %err, "dispatch failed");
        }
    }

    async fn dispatch_inner(&self, mut event: Event) -> Result<()> {
        // Step 2: envelope validation against the provisional group id (pre-override).
        let provisional_group_id = resolve_group_id(&event, None);
        validate_segment(&provisional_group_id, "groupId")?;
        validate_segment(&event.self_id, "selfId")?;
        if event.user_id.is_empty() {
            return Err(ValidationError::EmptyUserId.into());
        }
        validate_segment(&event.user_id, "userId")?;

        // Step 3: alias resolution.
        let canonical_self_id = resolve_canonical_bot_id(&self.config.alias_map, &event.self_id);
        let bot_id = derive_bot_id(&event.platform, &canonical_self_id);
        if bot_id.is_empty() {
            return Err(ValidationError::EmptyBotId.into());
        }

        // Step 4: config ensure + load, resolving any forced group-id override.
        self.router_store.ensure_bot_config(&bot_id).await?;
        self.group_store.ensure_group_dir(&provisional_group_id).await?;
        let provisional_config = self.group_store.get_group(&provisional_group_id).await?;
        let (group_id, group_config) = match &provisional_config.forced_group_id {
            Some(forced) if forced != &provisional_group_id => {
                validate_segment(forced, "groupId")?;
                self.group_store.ensure_group_dir(forced).await?;
                (forced.clone(), self.group_store.get_group(forced).await?)
            }
            _ => (provisional_group_id.clone(), provisional_config),
        };

        self.record_group_route(&event, &canonical_self_id, &group_id).await;

        if !group_config.enabled {
            tracing::debug!(bot_id = %bot_id, group_id = %group_id, "group disabled, dropping event");
            return Ok(());
        }

        // Step 5: snapshot load.
        let snapshot = self.router_store.get_snapshot().await?;

        // Step 6: trigger rule evaluation.
        let keywords = effective_keywords(&snapshot, &bot_id, &group_config);
        let matched_keyword = matching_keyword(&event.content, &keywords);
        let keyword_wake = group_config.trigger_mode == crate::model::TriggerMode::Keyword && matched_keyword.is_some();
        let wake = event.mentions(&canonical_self_id) || keyword_wake;

        if !wake {
            if group_config.trigger_mode == crate::model::TriggerMode::Mention {
                self.passive_echo(&event, &snapshot, &bot_id, &group_config).await;
            }
            return Ok(());
        }

        // Step 7: session-key extraction, with a wake-keyword strip on either side. The
        // stripped result is written back onto the event so the buffered/replayed copy
        // doesn't carry the `#N` prefix either.
        let stripped = strip_wake_prefix(&event.content, &canonical_self_id, matched_keyword.as_deref());
        let (key, after_key) = extract_session_key(&stripped);
        let content = strip_wake_prefix(after_key, &canonical_self_id, matched_keyword.as_deref());
        let content = content.trim().to_string();
        apply_stripped_content(&mut event, &content);

        if key >= group_config.max_sessions {
            tracing::warn!(
                bot_id = %bot_id, group_id = %group_id, key, max = group_config.max_sessions,
                "session key exceeds max_sessions, dropping"
            );
            return Err(ValidationError::SessionKeyOutOfRange {
                key,
                max: group_config.max_sessions,
                group_id: group_id.clone(),
            }
            .into());
        }

        // Step 8: management-command parse.
        if let Some(command) = parse_management_command(&content) {
            return self
                .handle_management_command(&event, &bot_id, &group_id, &group_config, key, command)
                .await;
        }

        // Step 9: session resolve.
        let target_user_id = event.user_id.clone();
        let session_id = self
            .session_repo
            .resolve_or_create(&bot_id, &group_id, &target_user_id, key)
            .await
            .map_err(|e| DispatchError::SessionResolutionFailed(e.to_string()))?;

        // Step 10: gate & enqueue.
        let buffer_key = BufferKey::new(bot_id.clone(), group_id.clone(), session_id.clone());
        let token = generate_gate_token();
        let owned = self.buffer.append_and_request_job(&buffer_key, &event, &token).await?;
        let Some(token) = owned else {
            return Ok(()); // GateContention: the existing owner will observe this on drain.
        };

        let job = SessionJob {
            bot_id,
            group_id,
            user_id: target_user_id,
            session_id,
            key,
            gate_token: token.clone(),
            trace_id: event
                .extras
                .get("traceId")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            trace_started_at: event
                .extras
                .get("traceStartedAt")
                .and_then(|v| v.as_i64())
                .unwrap_or(0),
            enqueued_at: now_ms(),
        };

        if let Err(err) = self.queue.enqueue(&job).await {
            // EnqueueFailure: release unconditionally so the key isn't stuck (spec §9).
            self.buffer.release_gate(&buffer_key, &token).await.ok();
            return Err(err);
        }

        Ok(())
    }

    async fn record_group_route(&self, event: &Event, canonical_self_id: &str, group_id: &str) {
        let route = GroupRoute {
            platform: event.platform.clone(),
            self_id: canonical_self_id.to_string(),
            channel_id: event.channel_id.clone(),
            updated_at: now_ms(),
        };
        let Ok(payload) = serde_json::to_string(&route) else { return };
        if let Err(err) = self.kv.set_ex(&group_route_key(group_id), &payload, GROUP_ROUTE_TTL).await {
            tracing::warn!(group_id, error = %err, "failed to record group route");
        }
    }

    async fn passive_echo(&self, event: &Event, snapshot: &RouterSnapshot, bot_id: &str, group_config: &GroupConfig) {
        let Some(rate) = effective_echo_rate(snapshot, bot_id, group_config, self.config.global_echo_rate_default)
        else {
            return;
        };
        match self.echo.should_echo(event, rate).await {
            Ok(true) => {
                if let Err(err) = self.adapters.send_message(event, &event.content, &event.elements).await {
                    tracing::warn!(error = %err, "echo send failed");
                }
            }
            Ok(false) => {}
            Err(err) => tracing::warn!(error = %err, "echo tracker failed"),
        }
    }

    async fn handle_management_command(
        &self,
        event: &Event,
        bot_id: &str,
        group_id: &str,
        group_config: &GroupConfig,
        key: crate::model::SessionKey,
        command: ManagementCommand,
    ) -> Result<()> {
        let is_admin = group_config.admin_users.iter().any(|u| u == &event.user_id);
        let is_discord_owner_or_admin = event.platform == "discord"
            && (extras_bool(event, "isGuildOwner") || extras_bool(event, "isGuildAdmin"));

        let reply = match command {
            ManagementCommand::ResetSelf => {
                let target = mentioned_target(event, &event.self_id).unwrap_or_else(|| event.user_id.clone());
                self.session_repo.reset(bot_id, group_id, &target, key).await?;
                reply_reset_self_confirmed()
            }
            ManagementCommand::ResetAll => {
                if !(is_admin || is_discord_owner_or_admin) {
                    reply_permission_denied()
                } else {
                    let outcome = self.session_repo.reset_all(bot_id, group_id).await?;
                    reply_reset_all_outcome(outcome)
                }
            }
            ManagementCommand::SetModel(name) => {
                if !is_admin {
                    reply_permission_denied()
                } else if is_clear_keyword(&name) {
                    self.group_store.set_model_override(group_id, None).await?;
                    reply_model_cleared()
                } else if name.contains('/') || !self.config.model_whitelist.iter().any(|m| m == &name) {
                    reply_model_unknown(&name)
                } else {
                    self.group_store.set_model_override(group_id, Some(name.clone())).await?;
                    reply_model_set(&name)
                }
            }
        };

        if let Err(err) = self.adapters.send_message(event, &reply, &[]).await {
            tracing::warn!(error = %err, "management command reply send failed");
        }
        Ok(())
    }
}

fn extras_bool(event: &Event, key: &str) -> bool {
    event.extras.get(key).and_then(|v| v.as_bool()).unwrap_or(false)
}

fn mentioned_target(event: &Event, canonical_self_id: &str) -> Option<String> {
    event.elements.iter().find_map(|e| match e {
        Element::Mention { user_id } if user_id != canonical_self_id && user_id != &event.user_id => {
            Some(user_id.clone())
        }
        _ => None,
    })
}

fn validate_segment(segment: &str, label: &str) -> Result<()> {
    if is_safe_path_segment(segment) {
        Ok(())
    } else {
        tracing::error!(label, segment, "unsafe path segment");
        Err(ValidationError::UnsafeSegment(segment.to_string()).into())
    }
}

/// Rewrites `event`'s `content` and its first text element to `stripped`, so the
/// session-key/wake-prefix strip in step 7 carries through to the buffered and replayed
/// copy of the event, not just the locally computed string (spec §4.4 step 7).
fn apply_stripped_content(event: &mut Event, stripped: &str) {
    event.content = stripped.to_string();
    if let Some(Element::Text { text }) = event.elements.iter_mut().find(|e| matches!(e, Element::Text { .. })) {
        *text = stripped.to_string();
    }
}

fn seed_trace(event: &mut Event) {
    if !event.extras.contains_key("traceId") {
        let trace_id = uuid::Uuid::new_v4().simple().to_string();
        event.extras.insert("traceId".to_string(), serde_json::Value::String(trace_id));
    }
    event
        .extras
        .entry("traceStartedAt".to_string())
        .or_insert_with(|| serde_json::Value::from(now_ms()));
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Composes the effective keyword list from global/group/bot sources, filtered by the
/// bot's `keywordRouting` flags (spec §4.4 step 6).
fn effective_keywords(snapshot: &RouterSnapshot, bot_id: &str, group_config: &GroupConfig) -> Vec<String> {
    let routing = snapshot.bot_configs.get(bot_id).map(|c| c.keyword_routing.clone());
    let enable_global = routing.as_ref().is_none_or(|r| r.enable_global);
    let enable_group = routing.as_ref().is_none_or(|r| r.enable_group);
    let enable_bot = routing.as_ref().is_none_or(|r| r.enable_bot);

    let mut out = Vec::new();
    if enable_global {
        out.extend(snapshot.global_keywords.iter().cloned());
    }
    if enable_group {
        out.extend(group_config.keywords.iter().cloned());
    }
    if enable_bot {
        if let Some(cfg) = snapshot.bot_configs.get(bot_id) {
            out.extend(cfg.keywords.iter().cloned());
        }
    }
    out
}

fn matching_keyword<'a>(content: &str, keywords: &'a [String]) -> Option<&'a str> {
    let lower = content.to_lowercase();
    keywords.iter().find(|k| !k.is_empty() && lower.contains(&k.to_lowercase())).map(String::as_str)
}

fn effective_echo_rate(
    snapshot: &RouterSnapshot,
    bot_id: &str,
    group_config: &GroupConfig,
    default_rate: Option<u8>,
) -> Option<u8> {
    group_config
        .echo_rate
        .or_else(|| snapshot.bot_configs.get(bot_id).and_then(|c| c.echo_rate))
        .or(snapshot.global_echo_rate)
        .or(default_rate)
}

/// Strips a leading wake marker (mention token or the matched keyword) from `content`, used
/// both before and after session-key extraction (spec §4.4 step 7).
fn strip_wake_prefix<'a>(content: &'a str, self_id: &str, matched_keyword: Option<&str>) -> String {
    let trimmed = content.trim_start();
    for token in [format!("<@{self_id}>"), format!("<@!{self_id}>")] {
        if let Some(rest) = trimmed.strip_prefix(&token) {
            return rest.trim_start().to_string();
        }
    }
    if let Some(keyword) = matched_keyword {
        let lower = trimmed.to_lowercase();
        let keyword_lower = keyword.to_lowercase();
        if lower.starts_with(&keyword_lower) {
            return trimmed[keyword.len()..].trim_start().to_string();
        }
    }
    trimmed.to_string()
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ManagementCommand {
    ResetSelf,
    ResetAll,
    SetModel(String),
}

const RESET_ALL_LITERALS: &[&str] = &[
    "/resetall",
    "/reset all",
    "/reset everyone",
    "/reset 所有人",
    "/reset 全群",
    "/重置全部",
    "/重置所有人",
    "/全员重置",
];
const RESET_SELF_LITERALS: &[&str] = &["/reset", "/重置"];
const MODEL_PREFIXES: &[&str] = &["/model ", "/模型 "];
const CLEAR_MODEL_KEYWORDS: &[&str] = &["default", "clear", "none", "off", "reset", "默认"];

fn parse_management_command(content: &str) -> Option<ManagementCommand> {
    let trimmed = content.trim();
    let lower = trimmed.to_lowercase();

    if RESET_ALL_LITERALS.iter().any(|l| lower == *l) {
        return Some(ManagementCommand::ResetAll);
    }
    if RESET_SELF_LITERALS.iter().any(|l| lower == *l) {
        return Some(ManagementCommand::ResetSelf);
    }
    for prefix in MODEL_PREFIXES {
        if let Some(rest) = lower.strip_prefix(prefix) {
            let name = trimmed[prefix.len()..].trim();
            if !name.is_empty() {
                return Some(ManagementCommand::SetModel(name.to_string()));
            }
            let _ = rest;
        }
    }
    None
}

fn is_clear_keyword(name: &str) -> bool {
    let lower = name.to_lowercase();
    CLEAR_MODEL_KEYWORDS.iter().any(|k| *k == lower)
}

fn reply_reset_self_confirmed() -> String {
    "会话已重置。".to_string()
}

fn reply_permission_denied() -> String {
    "你没有权限执行此操作。".to_string()
}

fn reply_reset_all_outcome(outcome: crate::session::ResetAllOutcome) -> String {
    if outcome.users == 0 {
        "当前没有可重置的用户会话。".to_string()
    } else {
        format!(
            "已重置 {} 个会话，共 {} 个用户，失败 {} 个。",
            outcome.archived, outcome.users, outcome.failed
        )
    }
}

fn reply_model_cleared() -> String {
    "已恢复默认模型。".to_string()
}

fn reply_model_set(name: &str) -> String {
    format!("模型已切换为 {name}。")
}

fn reply_model_unknown(name: &str) -> String {
    format!("未知的模型：{name}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BotKeywordConfig, KeywordRouting, TriggerMode};
    use std::collections::HashMap;

    #[test]
    fn effective_keywords_respects_routing_flags() {
        let mut snapshot = RouterSnapshot {
            global_keywords: vec!["global".into()],
            global_echo_rate: None,
            bot_configs: HashMap::new(),
        };
        snapshot.bot_configs.insert(
            "discord-bot-1".into(),
            BotKeywordConfig {
                keywords: vec!["botword".into()],
                keyword_routing: KeywordRouting {
                    enable_global: false,
                    enable_group: true,
                    enable_bot: true,
                },
                echo_rate: None,
            },
        );
        let group_config = GroupConfig {
            keywords: vec!["groupword".into()],
            ..Default::default()
        };
        let keywords = effective_keywords(&snapshot, "discord-bot-1", &group_config);
        assert!(!keywords.contains(&"global".to_string()));
        assert!(keywords.contains(&"groupword".to_string()));
        assert!(keywords.contains(&"botword".to_string()));
    }

    #[test]
    fn matching_keyword_is_case_insensitive() {
        let keywords = vec!["Hello".to_string()];
        assert_eq!(matching_keyword("well HELLO there", &keywords), Some("Hello"));
        assert_eq!(matching_keyword("nothing here", &keywords), None);
    }

    #[test]
    fn strip_wake_prefix_removes_mention_token() {
        let stripped = strip_wake_prefix("<@bot-1> hello", "bot-1", None);
        assert_eq!(stripped, "hello");
    }

    #[test]
    fn strip_wake_prefix_removes_matched_keyword() {
        let stripped = strip_wake_prefix("hey bot do something", "bot-1", Some("hey bot"));
        assert_eq!(stripped, "do something");
    }

    #[test]
    fn parse_management_command_recognizes_reset_variants() {
        assert_eq!(parse_management_command("/reset"), Some(ManagementCommand::ResetSelf));
        assert_eq!(parse_management_command("/RESET"), Some(ManagementCommand::ResetSelf));
        assert_eq!(parse_management_command("/reset all"), Some(ManagementCommand::ResetAll));
        assert_eq!(parse_management_command("/resetall"), Some(ManagementCommand::ResetAll));
        assert_eq!(parse_management_command("/重置"), Some(ManagementCommand::ResetSelf));
        assert_eq!(parse_management_command("/重置所有人"), Some(ManagementCommand::ResetAll));
    }

    #[test]
    fn parse_management_command_recognizes_model() {
        assert_eq!(
            parse_management_command("/model claude-opus"),
            Some(ManagementCommand::SetModel("claude-opus".to_string()))
        );
        assert_eq!(
            parse_management_command("/模型 default"),
            Some(ManagementCommand::SetModel("default".to_string()))
        );
        assert_eq!(parse_management_command("/model"), None);
    }

    #[test]
    fn parse_management_command_ignores_unrelated_text() {
        assert_eq!(parse_management_command("hello world"), None);
    }

    #[test]
    fn is_clear_keyword_matches_known_aliases() {
        assert!(is_clear_keyword("default"));
        assert!(is_clear_keyword("默认"));
        assert!(is_clear_keyword("DEFAULT"));
        assert!(!is_clear_keyword("claude-opus"));
    }

    #[test]
    fn reply_reset_all_outcome_matches_spec_literal_when_empty() {
        let outcome = crate::session::ResetAllOutcome::default();
        assert_eq!(reply_reset_all_outcome(outcome), "当前没有可重置的用户会话。");
    }

    #[test]
    fn trigger_mode_default_is_mention() {
        assert_eq!(GroupConfig::default().trigger_mode, TriggerMode::Mention);
    }

    fn sample_event(content: &str, elements: Vec<Element>) -> Event {
        Event {
            kind: crate::model::EventKind::Message,
            platform: "discord".into(),
            self_id: "bot-1".into(),
            user_id: "u1".into(),
            guild_id: Some("g1".into()),
            channel_id: "c1".into(),
            message_id: None,
            content: content.to_string(),
            elements,
            timestamp: 0,
            extras: HashMap::new(),
        }
    }

    #[test]
    fn apply_stripped_content_rewrites_content_and_first_text_element() {
        let mut event = sample_event(
            "#3 hi",
            vec![
                Element::Mention { user_id: "bot-1".into() },
                Element::Text { text: "#3 hi".into() },
            ],
        );
        apply_stripped_content(&mut event, "hi");
        assert_eq!(event.content, "hi");
        assert_eq!(
            event.elements,
            vec![
                Element::Mention { user_id: "bot-1".into() },
                Element::Text { text: "hi".into() },
            ]
        );
    }

    #[test]
    fn apply_stripped_content_is_a_no_op_on_elements_without_a_text_fragment() {
        let mut event = sample_event("#3 hi", vec![Element::Mention { user_id: "bot-1".into() }]);
        apply_stripped_content(&mut event, "hi");
        assert_eq!(event.content, "hi");
        assert_eq!(event.elements, vec![Element::Mention { user_id: "bot-1".into() }]);
    }
}
