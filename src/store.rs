//! Router and group configuration stores: filesystem-backed trees of YAML configuration,
//! fronted by a short-TTL cache so the hot dispatch path doesn't hit disk on every event.

use crate::error::InfraError;
use crate::model::{
    is_safe_path_segment, BotKeywordConfig, GroupConfig, RouterGlobalConfig, RouterSnapshot,
};
use crate::Result;
use moka::future::Cache;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Loads and caches the global router config plus every known per-bot config.
pub struct RouterStore {
    root: PathBuf,
    snapshot_cache: Cache<(), RouterSnapshot>,
}

impl RouterStore {
    pub fn new(root: PathBuf, cache_ttl: Duration) -> Self {
        Self {
            root,
            snapshot_cache: Cache::builder().time_to_live(cache_ttl).max_capacity(1).build(),
        }
    }

    fn global_path(&self) -> PathBuf {
        self.root.join("global.yaml")
    }

    fn bot_dir(&self, bot_id: &str) -> PathBuf {
        self.root.parent().map(|p| p.join("bots")).unwrap_or_else(|| self.root.join("bots")).join(bot_id)
    }

    /// Writes a default `global.yaml` if one doesn't exist yet.
    pub async fn ensure_global_config(&self) -> Result<()> {
        let path = self.global_path();
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(());
        }
        tokio::fs::create_dir_all(&self.root).await?;
        let default = RouterGlobalConfig::default();
        let yaml = serde_yaml::to_string(&default).map_err(|e| InfraError::Filesystem(e.to_string()))?;
        tokio::fs::write(&path, yaml).await?;
        Ok(())
    }

    /// Writes a default per-bot `config.yaml` if one doesn't exist for `bot_id`.
    pub async fn ensure_bot_config(&self, bot_id: &str) -> Result<()> {
        if !is_safe_path_segment(bot_id) {
            return Err(InfraError::Filesystem(format!("refusing unsafe bot id {bot_id:?}")).into());
        }
        let dir = self.bot_dir(bot_id);
        let path = dir.join("config.yaml");
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(());
        }
        tokio::fs::create_dir_all(&dir).await?;
        let default = BotKeywordConfig::default();
        let yaml = serde_yaml::to_string(&default).map_err(|e| InfraError::Filesystem(e.to_string()))?;
        tokio::fs::write(&path, yaml).await?;
        Ok(())
    }

    /// Returns the cached snapshot, rebuilding it from disk on a cache miss.
    pub async fn get_snapshot(&self) -> Result<RouterSnapshot> {
        if let Some(cached) = self.snapshot_cache.get(&()).await {
            return Ok(cached);
        }
        let snapshot = self.load_snapshot_uncached().await?;
        self.snapshot_cache.insert((), snapshot.clone()).await;
        Ok(snapshot)
    }

    async fn load_snapshot_uncached(&self) -> Result<RouterSnapshot> {
        let global = match tokio::fs::read_to_string(self.global_path()).await {
            Ok(raw) => serde_yaml::from_str::<RouterGlobalConfig>(&raw).unwrap_or_default(),
            Err(_) => RouterGlobalConfig::default(),
        };

        let mut bot_configs = std::collections::HashMap::new();
        let bots_root = self.root.parent().map(|p| p.join("bots")).unwrap_or_else(|| self.root.join("bots"));
        if let Ok(mut entries) = tokio::fs::read_dir(&bots_root).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                    continue;
                };
                if !is_safe_path_segment(&name) {
                    continue;
                }
                let config_path = entry.path().join("config.yaml");
                if let Ok(raw) = tokio::fs::read_to_string(&config_path).await {
                    if let Ok(cfg) = serde_yaml::from_str::<BotKeywordConfig>(&raw) {
                        bot_configs.insert(name, cfg);
                    }
                }
            }
        }

        Ok(RouterSnapshot {
            global_keywords: global.keywords,
            global_echo_rate: global.echo_rate,
            bot_configs,
        })
    }
}

/// Loads and caches per-group configuration, and watches the tree for hot-reload.
pub struct GroupStore {
    root: PathBuf,
    group_cache: Cache<String, GroupConfig>,
}

impl GroupStore {
    pub fn new(root: PathBuf, cache_ttl: Duration) -> Self {
        Self {
            root,
            group_cache: Cache::builder().time_to_live(cache_ttl).max_capacity(10_000).build(),
        }
    }

    fn group_dir(&self, group_id: &str) -> PathBuf {
        self.root.join(group_id)
    }

    /// Creates a default group directory (`agent.md` + `config.yaml`) on first reference.
    pub async fn ensure_group_dir(&self, group_id: &str) -> Result<()> {
        if !is_safe_path_segment(group_id) {
            return Err(InfraError::Filesystem(format!("refusing unsafe group id {group_id:?}")).into());
        }
        let dir = self.group_dir(group_id);
        let config_path = dir.join("config.yaml");
        if tokio::fs::try_exists(&config_path).await.unwrap_or(false) {
            return Ok(());
        }
        tokio::fs::create_dir_all(&dir).await?;
        let default = GroupConfig::default();
        let yaml = serde_yaml::to_string(&default).map_err(|e| InfraError::Filesystem(e.to_string()))?;
        tokio::fs::write(&config_path, yaml).await?;
        let agent_md = dir.join("agent.md");
        if !tokio::fs::try_exists(&agent_md).await.unwrap_or(false) {
            tokio::fs::write(&agent_md, "").await?;
        }
        Ok(())
    }

    /// Returns the cached group config, loading (and defaulting) it from disk on miss.
    pub async fn get_group(&self, group_id: &str) -> Result<GroupConfig> {
        if !is_safe_path_segment(group_id) {
            return Err(InfraError::Filesystem(format!("refusing unsafe group id {group_id:?}")).into());
        }
        if let Some(cached) = self.group_cache.get(group_id).await {
            return Ok(cached);
        }
        self.ensure_group_dir(group_id).await?;
        let config_path = self.group_dir(group_id).join("config.yaml");
        let raw = tokio::fs::read_to_string(&config_path).await?;
        let config: GroupConfig = serde_yaml::from_str(&raw).unwrap_or_default();
        self.group_cache.insert(group_id.to_string(), config.clone()).await;
        Ok(config)
    }

    /// Drops the cached entry for `group_id` so the next `get_group` rereads from disk.
    /// Called by the filesystem watcher on a detected change.
    pub async fn invalidate(&self, group_id: &str) {
        self.group_cache.invalidate(group_id).await;
    }

    /// Rewrites `group_id`'s `model` override on disk and invalidates the cache entry, for
    /// the `/model` management command (spec §4.4.2).
    pub async fn set_model_override(&self, group_id: &str, model: Option<String>) -> Result<()> {
        let mut config = self.get_group(group_id).await?;
        config.model = model;
        let config_path = self.group_dir(group_id).join("config.yaml");
        let yaml = serde_yaml::to_string(&config).map_err(|e| InfraError::Filesystem(e.to_string()))?;
        tokio::fs::write(&config_path, yaml).await?;
        self.invalidate(group_id).await;
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Watches the group tree recursively and invalidates a group's cache entry as soon as
    /// its `config.yaml` changes on disk, so the short TTL cache isn't the only path to a
    /// hot-reloaded config (spec §4.8). Runs until the returned watcher is dropped.
    pub fn watch(self: &Arc<Self>) -> Result<RecommendedWatcher> {
        let store = self.clone();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<notify::Event>| {
                if let Ok(event) = res {
                    let _ = tx.send(event);
                }
            },
            notify::Config::default(),
        )
        .map_err(|e| InfraError::Filesystem(e.to_string()))?;

        if self.root.exists() {
            watcher
                .watch(&self.root, RecursiveMode::Recursive)
                .map_err(|e| InfraError::Filesystem(e.to_string()))?;
        }

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if !matches!(
                    event.kind,
                    notify::EventKind::Modify(_) | notify::EventKind::Create(_) | notify::EventKind::Remove(_)
                ) {
                    continue;
                }
                for path in event.paths {
                    if path.file_name().and_then(|n| n.to_str()) != Some("config.yaml") {
                        continue;
                    }
                    let Some(group_id) = path
                        .parent()
                        .and_then(|p| p.file_name())
                        .and_then(|n| n.to_str())
                    else {
                        continue;
                    };
                    if is_safe_path_segment(group_id) {
                        store.invalidate(group_id).await;
                    }
                }
            }
        });

        Ok(watcher)
    }

    /// Lists every known group id by scanning the group tree, for the push scheduler's
    /// sweep (spec §4.7). Unreadable or unsafe entries are skipped rather than failing
    /// the whole scan.
    pub async fn list_group_ids(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(err) => return Err(err.into()),
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if is_safe_path_segment(&name) {
                ids.push(name);
            }
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn group_store_creates_default_on_first_reference() {
        let dir = tempdir();
        let store = GroupStore::new(dir.clone(), Duration::from_secs(3));
        let config = store.get_group("g1").await.unwrap();
        assert!(config.enabled);
        assert_eq!(config.max_sessions, 1);
        assert!(tokio::fs::try_exists(dir.join("g1").join("agent.md")).await.unwrap());
    }

    #[tokio::test]
    async fn group_store_rejects_unsafe_ids() {
        let dir = tempdir();
        let store = GroupStore::new(dir, Duration::from_secs(3));
        assert!(store.get_group("../escape").await.is_err());
    }

    #[tokio::test]
    async fn set_model_override_persists_and_invalidates_cache() {
        let dir = tempdir();
        let store = GroupStore::new(dir, Duration::from_secs(3));
        store.get_group("g1").await.unwrap();
        store.set_model_override("g1", Some("claude".to_string())).await.unwrap();
        let reloaded = store.get_group("g1").await.unwrap();
        assert_eq!(reloaded.model.as_deref(), Some("claude"));

        store.set_model_override("g1", None).await.unwrap();
        assert_eq!(store.get_group("g1").await.unwrap().model, None);
    }

    #[tokio::test]
    async fn watch_invalidates_cache_when_config_changes_on_disk() {
        let dir = tempdir();
        let store = Arc::new(GroupStore::new(dir.clone(), Duration::from_secs(3600)));
        store.get_group("g1").await.unwrap();
        let _watcher = store.watch().unwrap();

        let mut config = GroupConfig::default();
        config.model = Some("claude".to_string());
        let yaml = serde_yaml::to_string(&config).unwrap();
        tokio::fs::write(dir.join("g1").join("config.yaml"), yaml).await.unwrap();

        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            if store.get_group("g1").await.unwrap().model.as_deref() == Some("claude") {
                return;
            }
        }
        panic!("expected the watcher to invalidate the cache within the deadline");
    }

    #[tokio::test]
    async fn group_store_reads_hand_written_config_yaml() {
        use indoc::indoc;

        let dir = tempdir();
        tokio::fs::create_dir_all(dir.join("g1")).await.unwrap();
        tokio::fs::write(
            dir.join("g1").join("config.yaml"),
            indoc! {"
                enabled: true
                trigger_mode: keyword
                keywords:
                  - 龙图腾
                  - /roll
                admin_users:
                  - \"100200300\"
                max_sessions: 3
                model: claude
                echo_rate: 20
                push:
                  enabled: true
                  time: \"09:00\"
                  timezone: Asia/Shanghai
            "},
        )
        .await
        .unwrap();

        let store = GroupStore::new(dir, Duration::from_secs(3));
        let config = store.get_group("g1").await.unwrap();
        assert_eq!(config.max_sessions, 3);
        assert_eq!(config.model.as_deref(), Some("claude"));
        assert_eq!(config.keywords, vec!["龙图腾".to_string(), "/roll".to_string()]);
        let push = config.push.expect("push config present");
        assert!(push.enabled);
        assert_eq!(push.time, "09:00");
        assert_eq!(push.timezone, "Asia/Shanghai");
    }

    #[tokio::test]
    async fn router_store_defaults_when_no_files_exist() {
        let dir = tempdir();
        let store = RouterStore::new(dir.join("router"), Duration::from_secs(3));
        let snapshot = store.get_snapshot().await.unwrap();
        assert!(snapshot.global_keywords.is_empty());
        assert!(snapshot.bot_configs.is_empty());
    }

    fn tempdir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("llbot-gateway-test-{}", uuid::Uuid::new_v4()));
        dir
    }
}
