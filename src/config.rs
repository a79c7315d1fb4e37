//! Configuration loading and validation.

use crate::error::{ConfigError, Result};
use anyhow::Context as _;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Raw, pre-validation view of every setting `GatewayConfig::load` accepts, loaded through the
/// `config` crate so an optional TOML file and the `LLBOT_*` environment both populate the same
/// field set (env wins on conflict). Keys match the env var names with the `LLBOT_` prefix and
/// case stripped, e.g. `LLBOT_QUEUE_DB` -> `queue_db`.
#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    data_dir: Option<String>,
    kv_url: Option<String>,
    queue_db: Option<String>,
    alias_map: Option<String>,
    model_whitelist: Option<String>,
    default_timezone: Option<String>,
    push_tick_secs: Option<u64>,
    gate_ttl_secs: Option<u64>,
    registrar_ttl_secs: Option<u64>,
    registrar_refresh_secs: Option<u64>,
    registry_poll_secs: Option<u64>,
    snapshot_ttl_secs: Option<u64>,
    echo_streak_ttl_secs: Option<u64>,
    global_echo_rate: Option<u8>,
    discord_token: Option<String>,
    milky_ws_url: Option<String>,
    shutdown_grace_secs: Option<u64>,
}

impl RawConfig {
    fn load(toml_path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = toml_path {
            builder = builder.add_source(config::File::from(path.to_path_buf()).required(false));
        }
        builder
            .add_source(config::Environment::with_prefix("LLBOT"))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| ConfigError::Invalid(format!("failed to load configuration: {e}")).into())
    }
}

/// Process-wide gateway configuration. Built once by [`GatewayConfig::load`] and threaded
/// explicitly into every constructor — no global mutable cache.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Data directory holding the router/group filesystem tree.
    pub data_dir: std::path::PathBuf,

    /// Distributed KV store connection string (registry, buffer/gate, push locks).
    /// `None` selects the in-process `MemoryKvStore` backend.
    pub kv_url: Option<String>,

    /// SQLite database file backing the durable session job queue.
    pub queue_db_path: std::path::PathBuf,

    /// Alias map applied to a raw upstream `selfId` before deriving a `BotId`.
    pub alias_map: std::collections::HashMap<String, String>,

    /// Model names management commands are permitted to switch a group to.
    pub model_whitelist: Vec<String>,

    /// Fallback IANA timezone for push scheduling when a group doesn't specify one.
    pub default_timezone: String,

    /// `GroupHotPushScheduler` tick cadence.
    pub push_tick_interval: Duration,

    /// Session buffer gate TTL (liveness backstop, §4.5 invariant 3).
    pub gate_ttl: Duration,

    /// TTL a registrar's presence entry carries.
    pub registrar_ttl: Duration,

    /// How often a registrar refreshes its presence entry. Must be < `registrar_ttl`.
    pub registrar_refresh_interval: Duration,

    /// How often `LlbotRegistry` polls the KV store for a fresh snapshot.
    pub registry_poll_interval: Duration,

    /// Router/group config snapshot cache TTL.
    pub snapshot_cache_ttl: Duration,

    /// Echo-tracker streak state TTL.
    pub echo_streak_ttl: Duration,

    /// Default global echo rate (0..=100). No built-in fallback — absence is fatal only
    /// where an echo decision is actually reached without a group-level override.
    pub global_echo_rate_default: Option<u8>,

    /// Discord bot token, if the Discord adapter is enabled.
    pub discord_token: Option<String>,

    /// Milky-protocol WebSocket URL, if that adapter is enabled.
    pub milky_ws_url: Option<String>,

    /// Graceful shutdown hard deadline.
    pub shutdown_grace: Duration,
}

impl GatewayConfig {
    /// Load configuration from `LLBOT_*` environment variables, falling back to
    /// `~/.local/share`-style defaults for paths the way the rest of this codebase does.
    pub fn load() -> Result<Self> {
        Self::from_raw(RawConfig::load(None)?)
    }

    /// Load configuration from an optional TOML file overlaid by the `LLBOT_*` environment
    /// (env wins on conflict). `path` need not exist; a missing file is equivalent to `load()`.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        Self::from_raw(RawConfig::load(Some(path))?)
    }

    fn from_raw(raw: RawConfig) -> Result<Self> {
        let data_dir = raw
            .data_dir
            .map(std::path::PathBuf::from)
            .unwrap_or_else(|| {
                dirs::data_dir()
                    .map(|d| d.join("llbot-gateway"))
                    .unwrap_or_else(|| std::path::PathBuf::from("./data"))
            });

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;

        let kv_url = raw.kv_url;

        let queue_db_path = raw
            .queue_db
            .map(std::path::PathBuf::from)
            .unwrap_or_else(|| data_dir.join("queue.db"));

        let alias_map = raw.alias_map.as_deref().map(parse_pair_list).unwrap_or_default();

        let model_whitelist = raw
            .model_whitelist
            .as_deref()
            .map(|raw| raw.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
            .unwrap_or_default();

        let default_timezone = raw.default_timezone.unwrap_or_else(|| "UTC".to_string());

        let push_tick_interval = Duration::from_secs(raw.push_tick_secs.unwrap_or(30));
        let gate_ttl = Duration::from_secs(raw.gate_ttl_secs.unwrap_or(60));
        let registrar_ttl = Duration::from_secs(raw.registrar_ttl_secs.unwrap_or(30));
        let registrar_refresh_interval = Duration::from_secs(raw.registrar_refresh_secs.unwrap_or(10));
        let registry_poll_interval = Duration::from_secs(raw.registry_poll_secs.unwrap_or(10));
        let snapshot_cache_ttl = Duration::from_secs(raw.snapshot_ttl_secs.unwrap_or(3));
        let echo_streak_ttl = Duration::from_secs(raw.echo_streak_ttl_secs.unwrap_or(30));

        if registrar_ttl <= registrar_refresh_interval {
            return Err(ConfigError::Invalid(
                "registrar_ttl_secs must be greater than registrar_refresh_secs".into(),
            )
            .into());
        }

        let global_echo_rate_default = raw.global_echo_rate;

        let discord_token = raw.discord_token;
        let milky_ws_url = raw.milky_ws_url;

        if discord_token.is_none() && milky_ws_url.is_none() {
            return Err(ConfigError::MissingKey(
                "at least one of LLBOT_DISCORD_TOKEN or LLBOT_MILKY_WS_URL must be set".into(),
            )
            .into());
        }

        let shutdown_grace = Duration::from_secs(raw.shutdown_grace_secs.unwrap_or(15));

        Ok(Self {
            data_dir,
            kv_url,
            queue_db_path,
            alias_map,
            model_whitelist,
            default_timezone,
            push_tick_interval,
            gate_ttl,
            registrar_ttl,
            registrar_refresh_interval,
            registry_poll_interval,
            snapshot_cache_ttl,
            echo_streak_ttl,
            global_echo_rate_default,
            discord_token,
            milky_ws_url,
            shutdown_grace,
        })
    }

    pub fn router_dir(&self) -> std::path::PathBuf {
        self.data_dir.join("router")
    }

    pub fn bots_dir(&self) -> std::path::PathBuf {
        self.data_dir.join("bots")
    }

    pub fn groups_dir(&self) -> std::path::PathBuf {
        self.data_dir.join("groups")
    }
}

/// Parses `a=b,c=d` into a map, ignoring blank entries.
fn parse_pair_list(raw: &str) -> std::collections::HashMap<String, String> {
    raw.split(',')
        .filter_map(|entry| {
            let entry = entry.trim();
            if entry.is_empty() {
                return None;
            }
            let (k, v) = entry.split_once('=')?;
            Some((k.trim().to_string(), v.trim().to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_alias_pairs() {
        let map = parse_pair_list("old-id=new-id, other=canonical");
        assert_eq!(map.get("old-id").map(String::as_str), Some("new-id"));
        assert_eq!(map.get("other").map(String::as_str), Some("canonical"));
    }

    #[test]
    fn parses_empty_alias_list() {
        assert!(parse_pair_list("").is_empty());
    }

    #[test]
    fn raw_config_loads_values_from_toml_file() {
        std::env::remove_var("LLBOT_DISCORD_TOKEN");
        std::env::remove_var("LLBOT_DEFAULT_TIMEZONE");

        let dir = std::env::temp_dir().join(format!("llbot-gateway-config-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("gateway.toml");
        std::fs::write(&path, "discord_token = \"from-toml\"\ndefault_timezone = \"Asia/Tokyo\"\n").unwrap();

        let raw = RawConfig::load(Some(&path)).unwrap();
        assert_eq!(raw.discord_token.as_deref(), Some("from-toml"));
        assert_eq!(raw.default_timezone.as_deref(), Some("Asia/Tokyo"));
    }

    #[test]
    fn raw_config_env_overrides_toml_file() {
        let dir = std::env::temp_dir().join(format!("llbot-gateway-config-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("gateway.toml");
        std::fs::write(&path, "discord_token = \"from-toml\"\n").unwrap();
        std::env::set_var("LLBOT_DISCORD_TOKEN", "from-env");

        let raw = RawConfig::load(Some(&path)).unwrap();
        assert_eq!(raw.discord_token.as_deref(), Some("from-env"));

        std::env::remove_var("LLBOT_DISCORD_TOKEN");
    }

    #[test]
    fn raw_config_missing_toml_file_is_not_an_error() {
        let missing = std::env::temp_dir().join(format!("llbot-gateway-config-missing-{}.toml", uuid::Uuid::new_v4()));
        assert!(RawConfig::load(Some(&missing)).is_ok());
    }
}
