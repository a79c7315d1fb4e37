//! Distributed key-value abstraction backing the llbot registry, the session buffer/gate,
//! and the group-push locks. Two implementations ship: a Redis-backed store for real
//! cross-process deployments, and an in-process store for tests and single-replica runs.

use crate::error::{InfraError, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// The minimal set of KV operations the gateway's components need. Every async method
/// represents a suspension point (§5).
#[async_trait::async_trait]
pub trait KvStore: Send + Sync + 'static {
    /// Fetch a raw string value.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Set a value with TTL, unconditionally.
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Set a value with TTL only if the key doesn't already exist. Returns true if set.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Delete a key. No-op if absent.
    async fn del(&self, key: &str) -> Result<()>;

    /// Delete a key only if its current value equals `expected`. Returns true if deleted.
    async fn del_if_eq(&self, key: &str, expected: &str) -> Result<bool>;

    /// Add `member` to the set at `key`.
    async fn set_add(&self, key: &str, member: &str) -> Result<()>;

    /// Remove `member` from the set at `key`.
    async fn set_remove(&self, key: &str, member: &str) -> Result<()>;

    /// List all members of the set at `key`.
    async fn set_members(&self, key: &str) -> Result<Vec<String>>;

    /// Push a value to the tail of the list at `key`.
    async fn list_push_back(&self, key: &str, value: &str) -> Result<()>;

    /// Push values to the head of the list at `key`, in the order given (so that after the
    /// push, `values[0]` is first).
    async fn list_push_front(&self, key: &str, values: &[String]) -> Result<()>;

    /// Atomically take and clear the full contents of the list at `key`, oldest first.
    async fn list_drain(&self, key: &str) -> Result<Vec<String>>;

    /// Number of elements in the list at `key`, or 0 if absent.
    async fn list_len(&self, key: &str) -> Result<u64>;

    /// Refresh the TTL on an existing key without changing its value. No-op if absent.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<()>;

    /// Atomically push `event` to the tail of the queue list at `buffer_key.queue_key()`
    /// and attempt to install `token` as the gate at `buffer_key.gate_key()` (only if no
    /// gate is currently held). Returns `Some(token)` if the gate was free (caller becomes
    /// the new owner and must enqueue a job), or `None` if a different gate token is
    /// already installed (the existing owner will observe this event on its next drain).
    ///
    /// This is the one operation in the trait that must be atomic end-to-end to satisfy
    /// the buffer's at-most-one-in-flight invariant (spec §4.5 invariant 1); the Redis
    /// backend implements it as a single Lua script, the in-memory backend holds its
    /// global mutex for the duration of both sub-operations.
    async fn append_and_try_gate(
        &self,
        queue_key: &str,
        gate_key: &str,
        event_json: &str,
        token: &str,
        gate_ttl: Duration,
    ) -> Result<Option<String>>;
}

/// Redis-backed implementation. Used whenever [`crate::config::GatewayConfig::kv_url`] is
/// set, so that registry/buffer/gate/push-lock state is shared across replicas.
pub struct RedisKvStore {
    manager: redis::aio::ConnectionManager,
}

impl RedisKvStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(|e| InfraError::Kv(e.to_string()))?;
        let manager = client
            .get_connection_manager()
            .await
            .map_err(|e| InfraError::Kv(e.to_string()))?;
        Ok(Self { manager })
    }
}

#[async_trait::async_trait]
impl KvStore for RedisKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.manager.clone();
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| InfraError::Kv(e.to_string()).into())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.manager.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| InfraError::Kv(e.to_string()))?;
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.manager.clone();
        let result: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .map_err(|e| InfraError::Kv(e.to_string()))?;
        Ok(result.is_some())
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        redis::cmd("DEL")
            .arg(key)
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| InfraError::Kv(e.to_string()))?;
        Ok(())
    }

    async fn del_if_eq(&self, key: &str, expected: &str) -> Result<bool> {
        const SCRIPT: &str = r#"
            if redis.call("GET", KEYS[1]) == ARGV[1] then
                return redis.call("DEL", KEYS[1])
            else
                return 0
            end
        "#;
        let mut conn = self.manager.clone();
        let deleted: i64 = redis::Script::new(SCRIPT)
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| InfraError::Kv(e.to_string()))?;
        Ok(deleted > 0)
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        redis::cmd("SADD")
            .arg(key)
            .arg(member)
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| InfraError::Kv(e.to_string()))?;
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        redis::cmd("SREM")
            .arg(key)
            .arg(member)
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| InfraError::Kv(e.to_string()))?;
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.manager.clone();
        redis::cmd("SMEMBERS")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| InfraError::Kv(e.to_string()).into())
    }

    async fn list_push_back(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        redis::cmd("RPUSH")
            .arg(key)
            .arg(value)
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| InfraError::Kv(e.to_string()))?;
        Ok(())
    }

    async fn list_push_front(&self, key: &str, values: &[String]) -> Result<()> {
        if values.is_empty() {
            return Ok(());
        }
        // LPUSH reverses argument order, so push the reverse of `values` to land them
        // back at the head in their original order.
        let mut conn = self.manager.clone();
        let mut cmd = redis::cmd("LPUSH");
        cmd.arg(key);
        for value in values.iter().rev() {
            cmd.arg(value);
        }
        cmd.query_async::<()>(&mut conn)
            .await
            .map_err(|e| InfraError::Kv(e.to_string()))?;
        Ok(())
    }

    async fn list_drain(&self, key: &str) -> Result<Vec<String>> {
        const SCRIPT: &str = r#"
            local items = redis.call("LRANGE", KEYS[1], 0, -1)
            redis.call("DEL", KEYS[1])
            return items
        "#;
        let mut conn = self.manager.clone();
        redis::Script::new(SCRIPT)
            .key(key)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| InfraError::Kv(e.to_string()).into())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.manager.clone();
        redis::cmd("EXPIRE")
            .arg(key)
            .arg(ttl.as_secs().max(1))
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| InfraError::Kv(e.to_string()))?;
        Ok(())
    }

    async fn list_len(&self, key: &str) -> Result<u64> {
        let mut conn = self.manager.clone();
        redis::cmd("LLEN")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| InfraError::Kv(e.to_string()).into())
    }

    async fn append_and_try_gate(
        &self,
        queue_key: &str,
        gate_key: &str,
        event_json: &str,
        token: &str,
        gate_ttl: Duration,
    ) -> Result<Option<String>> {
        const SCRIPT: &str = r#"
            redis.call("RPUSH", KEYS[1], ARGV[1])
            local set = redis.call("SET", KEYS[2], ARGV[2], "NX", "EX", ARGV[3])
            if set then
                return ARGV[2]
            else
                return false
            end
        "#;
        let mut conn = self.manager.clone();
        let result: Option<String> = redis::Script::new(SCRIPT)
            .key(queue_key)
            .key(gate_key)
            .arg(event_json)
            .arg(token)
            .arg(gate_ttl.as_secs().max(1))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| InfraError::Kv(e.to_string()))?;
        Ok(result)
    }
}

/// In-process implementation for tests and single-replica deployments. A single global
/// mutex guards all state, which is the simplest way to preserve the atomicity the buffer
/// invariants require without a scripting engine.
#[derive(Default)]
pub struct MemoryKvStore {
    inner: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    strings: HashMap<String, String>,
    expirations: HashMap<String, std::time::Instant>,
    sets: HashMap<String, std::collections::HashSet<String>>,
    lists: HashMap<String, Vec<String>>,
}

impl MemoryState {
    fn is_expired(&self, key: &str) -> bool {
        self.expirations
            .get(key)
            .is_some_and(|deadline| std::time::Instant::now() >= *deadline)
    }

    fn evict_if_expired(&mut self, key: &str) {
        if self.is_expired(key) {
            self.strings.remove(key);
            self.expirations.remove(key);
        }
    }
}

impl MemoryKvStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait::async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut state = self.inner.lock().await;
        state.evict_if_expired(key);
        Ok(state.strings.get(key).cloned())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut state = self.inner.lock().await;
        state.strings.insert(key.to_string(), value.to_string());
        state
            .expirations
            .insert(key.to_string(), std::time::Instant::now() + ttl);
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut state = self.inner.lock().await;
        state.evict_if_expired(key);
        if state.strings.contains_key(key) {
            return Ok(false);
        }
        state.strings.insert(key.to_string(), value.to_string());
        state
            .expirations
            .insert(key.to_string(), std::time::Instant::now() + ttl);
        Ok(true)
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut state = self.inner.lock().await;
        state.strings.remove(key);
        state.expirations.remove(key);
        Ok(())
    }

    async fn del_if_eq(&self, key: &str, expected: &str) -> Result<bool> {
        let mut state = self.inner.lock().await;
        state.evict_if_expired(key);
        if state.strings.get(key).map(String::as_str) == Some(expected) {
            state.strings.remove(key);
            state.expirations.remove(key);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<()> {
        let mut state = self.inner.lock().await;
        state.sets.entry(key.to_string()).or_default().insert(member.to_string());
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<()> {
        let mut state = self.inner.lock().await;
        if let Some(set) = state.sets.get_mut(key) {
            set.remove(member);
        }
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        let state = self.inner.lock().await;
        Ok(state.sets.get(key).map(|s| s.iter().cloned().collect()).unwrap_or_default())
    }

    async fn list_push_back(&self, key: &str, value: &str) -> Result<()> {
        let mut state = self.inner.lock().await;
        state.lists.entry(key.to_string()).or_default().push(value.to_string());
        Ok(())
    }

    async fn list_push_front(&self, key: &str, values: &[String]) -> Result<()> {
        let mut state = self.inner.lock().await;
        let list = state.lists.entry(key.to_string()).or_default();
        for (i, value) in values.iter().enumerate() {
            list.insert(i, value.clone());
        }
        Ok(())
    }

    async fn list_drain(&self, key: &str) -> Result<Vec<String>> {
        let mut state = self.inner.lock().await;
        Ok(state.lists.remove(key).unwrap_or_default())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut state = self.inner.lock().await;
        if state.strings.contains_key(key) {
            state
                .expirations
                .insert(key.to_string(), std::time::Instant::now() + ttl);
        }
        Ok(())
    }

    async fn list_len(&self, key: &str) -> Result<u64> {
        let state = self.inner.lock().await;
        Ok(state.lists.get(key).map_or(0, |list| list.len() as u64))
    }

    async fn append_and_try_gate(
        &self,
        queue_key: &str,
        gate_key: &str,
        event_json: &str,
        token: &str,
        gate_ttl: Duration,
    ) -> Result<Option<String>> {
        let mut state = self.inner.lock().await;
        state.lists.entry(queue_key.to_string()).or_default().push(event_json.to_string());
        state.evict_if_expired(gate_key);
        if state.strings.contains_key(gate_key) {
            return Ok(None);
        }
        state.strings.insert(gate_key.to_string(), token.to_string());
        state
            .expirations
            .insert(gate_key.to_string(), std::time::Instant::now() + gate_ttl);
        Ok(Some(token.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn append_and_try_gate_grants_exactly_one_owner() {
        let kv = MemoryKvStore::new();
        let ttl = Duration::from_secs(60);
        let first = kv.append_and_try_gate("q", "g", "e1", "tok-a", ttl).await.unwrap();
        let second = kv.append_and_try_gate("q", "g", "e2", "tok-b", ttl).await.unwrap();
        assert_eq!(first, Some("tok-a".to_string()));
        assert_eq!(second, None);
        let drained = kv.list_drain("q").await.unwrap();
        assert_eq!(drained, vec!["e1".to_string(), "e2".to_string()]);
    }

    #[tokio::test]
    async fn del_if_eq_only_deletes_matching_token() {
        let kv = MemoryKvStore::new();
        kv.set_ex("gate", "tok-a", Duration::from_secs(60)).await.unwrap();
        assert!(!kv.del_if_eq("gate", "tok-wrong").await.unwrap());
        assert!(kv.get("gate").await.unwrap().is_some());
        assert!(kv.del_if_eq("gate", "tok-a").await.unwrap());
        assert!(kv.get("gate").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_push_front_preserves_order() {
        let kv = MemoryKvStore::new();
        kv.list_push_back("q", "c").await.unwrap();
        kv.list_push_front("q", &["a".to_string(), "b".to_string()]).await.unwrap();
        assert_eq!(kv.list_drain("q").await.unwrap(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn list_len_reflects_contents_and_is_zero_when_absent() {
        let kv = MemoryKvStore::new();
        assert_eq!(kv.list_len("q").await.unwrap(), 0);
        kv.list_push_back("q", "a").await.unwrap();
        kv.list_push_back("q", "b").await.unwrap();
        assert_eq!(kv.list_len("q").await.unwrap(), 2);
        kv.list_drain("q").await.unwrap();
        assert_eq!(kv.list_len("q").await.unwrap(), 0);
    }
}
