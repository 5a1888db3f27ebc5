//! Redis-backed window counter store.
//!
//! Counters are plain integer string values with a Redis expiry:
//! - `GET` reads the count
//! - `SET key value EX ttl` opens a window
//! - a small script runs `INCR` only when the key still exists, so a window
//!   that expired between the read and the increment is never recreated
//!   without an expiry
//! - `TTL` reports the seconds left
//!
//! The connection is opened on first use and shared by every request through
//! a `redis::aio::ConnectionManager`, which reconnects on demand. Acquiring
//! the connection and every command are each bounded by a timeout and surface
//! as [`StoreError::Timeout`] when the bound is hit.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::{AsyncCommands, Client, ErrorKind, RedisError, RedisResult, Script};
use tokio::sync::OnceCell;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::store::{StoreError, WindowStore};

const INCREMENT_EXISTING: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
  return redis.call('INCR', KEYS[1])
end
return false
"#;

impl From<RedisError> for StoreError {
    fn from(err: RedisError) -> Self {
        match err.kind() {
            ErrorKind::TypeError => StoreError::Protocol(err.to_string()),
            _ => StoreError::Unavailable(err.to_string()),
        }
    }
}

/// A [`WindowStore`] backed by a shared Redis instance.
pub struct RedisStore {
    client: Client,
    connection: OnceCell<ConnectionManager>,
    increment_script: Script,
    connect_timeout: Duration,
    command_timeout: Duration,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("addr", &self.client.get_connection_info().addr)
            .field("connected", &self.connection.initialized())
            .field("connect_timeout", &self.connect_timeout)
            .field("command_timeout", &self.command_timeout)
            .finish()
    }
}

impl RedisStore {
    /// Create a store for the given Redis URL.
    ///
    /// No connection is made until the first command.
    ///
    /// # Errors
    /// Returns an error if the URL cannot be parsed.
    pub fn new(
        url: &str,
        connect_timeout: Duration,
        command_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let client = Client::open(url)?;
        Ok(Self {
            client,
            connection: OnceCell::new(),
            increment_script: Script::new(INCREMENT_EXISTING),
            connect_timeout,
            command_timeout,
        })
    }

    /// Whether the shared connection has been established.
    pub fn is_connected(&self) -> bool {
        self.connection.initialized()
    }

    /// The shared connection, opened on first use.
    ///
    /// The connect timeout bounds the whole acquisition, including the wait
    /// behind another request that is already connecting.
    async fn connection(&self) -> Result<ConnectionManager, StoreError> {
        let init = self.connection.get_or_try_init(|| async move {
            let addr = &self.client.get_connection_info().addr;
            debug!(addr = %addr, "Connecting to Redis");

            // A refused connection fails now rather than retrying with backoff
            let config = ConnectionManagerConfig::new()
                .set_number_of_retries(0)
                .set_connection_timeout(self.connect_timeout);
            let manager = ConnectionManager::new_with_config(self.client.clone(), config).await?;

            info!(addr = %addr, "Connected to Redis");
            Ok::<_, StoreError>(manager)
        });

        match timeout(self.connect_timeout, init).await {
            Ok(manager) => Ok(manager?.clone()),
            Err(_) => Err(StoreError::Timeout(self.connect_timeout)),
        }
    }

    async fn bounded<T>(
        &self,
        command: impl Future<Output = RedisResult<T>>,
    ) -> Result<T, StoreError> {
        match timeout(self.command_timeout, command).await {
            Ok(result) => result.map_err(StoreError::from),
            Err(_) => Err(StoreError::Timeout(self.command_timeout)),
        }
    }
}

#[async_trait]
impl WindowStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<u64>, StoreError> {
        let mut conn = self.connection().await?;
        self.bounded(conn.get::<_, Option<u64>>(key)).await
    }

    async fn set_with_expiry(
        &self,
        key: &str,
        value: u64,
        ttl_secs: u64,
    ) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        self.bounded(conn.set_ex::<_, _, ()>(key, value, ttl_secs))
            .await
    }

    async fn increment(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let count: Option<u64> = self
            .bounded(self.increment_script.key(key).invoke_async(&mut conn))
            .await?;

        if count.is_none() {
            debug!(key = %key, "Window expired before increment");
        }
        Ok(())
    }

    async fn ttl(&self, key: &str) -> Result<u64, StoreError> {
        let mut conn = self.connection().await?;
        let ttl: i64 = self.bounded(conn.ttl::<_, i64>(key)).await?;

        // -2: key is gone, -1: key has no expiry
        if ttl == -1 {
            warn!(key = %key, "Counter has no expiry");
        }
        Ok(ttl.max(0) as u64)
    }
}
