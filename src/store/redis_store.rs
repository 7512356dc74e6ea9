// src/store/redis_store.rs
//! Redis-backed shared store, letting relays in separate processes exchange events.

use super::SharedStore;
use crate::error::SyncError;
use async_trait::async_trait;
use log::{debug, error, info};
use redis::{aio::ConnectionManager, AsyncCommands, Script};
use std::fmt;

// ARGV[1] = "1" when the key is expected to be absent, ARGV[2] = expected value, ARGV[3] = new value.
const COMPARE_AND_SET_LUA: &str = r#"
local current = redis.call('GET', KEYS[1])
if ARGV[1] == '1' then
  if current then return 0 end
elseif (not current) or current ~= ARGV[2] then
  return 0
end
redis.call('SET', KEYS[1], ARGV[3])
return 1
"#;

/// Uses a `ConnectionManager` for automatic reconnection.
#[derive(Clone)]
pub struct RedisStore {
    conn_manager: ConnectionManager,
    namespace: String,
    redis_url: String,
    cas_script: Script,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("redis_url", &self.redis_url)
            .field("namespace", &self.namespace)
            .field("conn_manager", &"<ConnectionManager instance>")
            .finish()
    }
}

impl RedisStore {
    pub async fn new(redis_url: &str, namespace: &str) -> Result<Self, SyncError> {
        info!("Initializing Redis connection manager for URL: {}", redis_url);
        let client = redis::Client::open(redis_url)?;
        let conn_manager = ConnectionManager::new(client).await.map_err(|e| {
            error!("Failed to create Redis ConnectionManager: {}", e);
            SyncError::StoreError(format!("Failed to create Redis ConnectionManager: {}", e))
        })?;
        info!(
            "Redis ConnectionManager initialized successfully. Namespace: {}",
            namespace
        );
        Ok(Self {
            conn_manager,
            namespace: namespace.to_string(),
            redis_url: redis_url.to_string(),
            cas_script: Script::new(COMPARE_AND_SET_LUA),
        })
    }

    pub(crate) fn generate_key(prefix: &str, params: &[&str]) -> String {
        let mut key = prefix.to_string();
        for param in params {
            key.push(':');
            key.push_str(param);
        }
        key
    }

    fn namespaced(&self, key: &str) -> String {
        Self::generate_key(&self.namespace, &[key])
    }
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, SyncError> {
        let key = self.namespaced(key);
        debug!("Redis GET {}", key);
        let mut conn = self.conn_manager.clone();
        conn.get::<_, Option<String>>(&key).await.map_err(|e| {
            error!("Redis GET error for key {}: {}", key, e);
            SyncError::from(e)
        })
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), SyncError> {
        let key = self.namespaced(key);
        let mut conn = self.conn_manager.clone();
        conn.set::<_, _, ()>(&key, value).await.map_err(|e| {
            error!("Redis SET error for key {}: {}", key, e);
            SyncError::from(e)
        })?;
        debug!("Redis SET success for key: {}", key);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), SyncError> {
        let key = self.namespaced(key);
        let mut conn = self.conn_manager.clone();
        conn.del::<_, i32>(&key).await.map_err(|e| {
            error!("Redis DEL error for key {}: {}", key, e);
            SyncError::from(e)
        })?;
        Ok(())
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
    ) -> Result<bool, SyncError> {
        let key = self.namespaced(key);
        let mut conn = self.conn_manager.clone();
        let expect_absent = if expected.is_none() { "1" } else { "0" };
        let written: i32 = self
            .cas_script
            .key(&key)
            .arg(expect_absent)
            .arg(expected.unwrap_or(""))
            .arg(value)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| {
                error!("Redis compare-and-set error for key {}: {}", key, e);
                SyncError::from(e)
            })?;
        debug!("Redis compare-and-set for key {} -> {}", key, written == 1);
        Ok(written == 1)
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_colon_joined() {
        assert_eq!(
            RedisStore::generate_key("reel-sync", &["cross-browser-events"]),
            "reel-sync:cross-browser-events"
        );
        assert_eq!(RedisStore::generate_key("ns", &["a", "b"]), "ns:a:b");
    }
}
