//! Redis storage backend for distributed rate limiting.
//!
//! Uses connection pooling for high performance. Every read-modify-write
//! runs server-side as a Lua script, so concurrent instances never race on
//! a check-then-act sequence.

use std::collections::HashMap;
use std::time::Duration;

use dashmap::DashMap;
use deadpool_redis::redis::{AsyncCommands, RedisError, Script as LuaScript, cmd};
use deadpool_redis::{Config, Connection, Pool, PoolConfig, Runtime};

use crate::error::{ConfigError, ConnectionError, Result, StorageError};
use crate::storage::{Script, ScriptReply, Storage, StorageEntry};

/// `INCR` plus `PEXPIRE` on first use, as one atomic unit.
const INCREMENT_SCRIPT: &str = r#"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return count
"#;

/// Redis storage configuration.
#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// Redis connection URL (e.g., "redis://localhost:6379")
    pub url: String,
    /// Connection pool size
    pub pool_size: usize,
    /// Key prefix for rate limit keys
    pub key_prefix: String,
    /// Connection timeout
    pub connection_timeout: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            pool_size: 10,
            key_prefix: "rl:".to_string(),
            connection_timeout: Duration::from_secs(5),
        }
    }
}

impl RedisConfig {
    /// Create a new Redis configuration.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Set the key prefix.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Set the pool size.
    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self
    }

    /// Set the connection timeout.
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }
}

/// Redis storage backend for distributed rate limiting.
///
/// # Example
///
/// ```ignore
/// use resilient_ratelimit::storage::{RedisStorage, RedisConfig};
///
/// let config = RedisConfig::new("redis://localhost:6379")
///     .with_prefix("myapp:rl:")
///     .with_pool_size(20);
///
/// let storage = RedisStorage::new(config).await?;
/// ```
pub struct RedisStorage {
    pool: Pool,
    key_prefix: String,
    scripts: DashMap<&'static str, LuaScript>,
}

impl std::fmt::Debug for RedisStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStorage")
            .field("key_prefix", &self.key_prefix)
            .field("cached_scripts", &self.scripts.len())
            .finish()
    }
}

impl RedisStorage {
    /// Create a new Redis storage from configuration.
    pub async fn new(config: RedisConfig) -> Result<Self> {
        if config.pool_size == 0 {
            return Err(ConfigError::InvalidStorage("pool_size must be greater than 0".into()).into());
        }

        let mut cfg = Config::from_url(&config.url);
        let mut pool_cfg = PoolConfig::new(config.pool_size);
        pool_cfg.timeouts.wait = Some(config.connection_timeout);
        pool_cfg.timeouts.create = Some(config.connection_timeout);
        cfg.pool = Some(pool_cfg);

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| ConnectionError::ConnectionFailed(e.to_string()))?;

        // Test connection
        let mut conn = pool
            .get()
            .await
            .map_err(|e| ConnectionError::ConnectionFailed(e.to_string()))?;
        let _: () = cmd("PING")
            .query_async(&mut *conn)
            .await
            .map_err(|e| ConnectionError::ConnectionFailed(e.to_string()))?;

        tracing::info!(url = %config.url, pool_size = config.pool_size, "Connected to Redis");

        Ok(Self {
            pool,
            key_prefix: config.key_prefix,
            scripts: DashMap::new(),
        })
    }

    /// Create a new Redis storage from a URL.
    pub async fn from_url(url: impl Into<String>) -> Result<Self> {
        Self::new(RedisConfig::new(url)).await
    }

    /// Get the full key with prefix.
    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    /// Get a connection from the pool.
    async fn get_conn(&self) -> Result<Connection> {
        self.pool
            .get()
            .await
            .map_err(|_| StorageError::PoolExhausted.into())
    }

    /// Compiled script for `source`, cached by source text.
    fn script(&self, source: &'static str) -> LuaScript {
        self.scripts
            .entry(source)
            .or_insert_with(|| LuaScript::new(source))
            .clone()
    }
}

fn op_failed(e: RedisError) -> StorageError {
    StorageError::operation_failed(e.to_string())
}

impl Storage for RedisStorage {
    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64> {
        let mut conn = self.get_conn().await?;
        let script = self.script(INCREMENT_SCRIPT);
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);

        let count: i64 = script
            .prepare_invoke()
            .key(self.full_key(key))
            .arg(ttl_ms)
            .invoke_async(&mut *conn)
            .await
            .map_err(op_failed)?;

        u64::try_from(count)
            .map_err(|_| StorageError::MalformedReply(format!("counter {count}")).into())
    }

    async fn counter(&self, key: &str) -> Result<Option<u64>> {
        let mut conn = self.get_conn().await?;

        let value: Option<u64> = conn.get(self.full_key(key)).await.map_err(op_failed)?;
        Ok(value)
    }

    async fn get(&self, key: &str) -> Result<Option<StorageEntry>> {
        let mut conn = self.get_conn().await?;

        let fields: HashMap<String, String> =
            conn.hgetall(self.full_key(key)).await.map_err(op_failed)?;
        Ok(StorageEntry::from_fields(&fields)?)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.get_conn().await?;

        conn.del::<_, ()>(self.full_key(key))
            .await
            .map_err(op_failed)?;

        Ok(())
    }

    async fn execute_atomic<S: Script>(&self, key: &str, script: &S, now: u64) -> Result<ScriptReply> {
        let mut conn = self.get_conn().await?;
        let lua = self.script(script.source());

        let mut invocation = lua.prepare_invoke();
        invocation.key(self.full_key(key));
        for arg in script.args(now) {
            invocation.arg(arg);
        }

        let raw: Vec<i64> = invocation
            .invoke_async(&mut *conn)
            .await
            .map_err(op_failed)?;

        Ok(ScriptReply::from_raw(&raw)?)
    }
}
