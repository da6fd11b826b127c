//! # Store
//!
//! The external state store port. The worker core only ever talks to this
//! trait; the production implementation speaks Redis over a multiplexed
//! async connection.

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, RedisError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::timeout;

const DEFAULT_STORE_TIMEOUT_MILLISECS: u64 = 100;

fn get_store_timeout_ms() -> u64 {
    std::env::var("REDIS_TIMEOUT_MS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(DEFAULT_STORE_TIMEOUT_MILLISECS)
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Not found in store")]
    NotFound,
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("Store error: {0}")]
    Other(String),
    #[error("Timeout error")]
    Timeout,
}

impl From<RedisError> for StoreError {
    fn from(err: RedisError) -> Self {
        StoreError::Other(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for StoreError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        StoreError::Timeout
    }
}

/// The operations the worker core needs from the external store.
///
/// `get` reports a missing key as [`StoreError::NotFound`]; the list pops
/// report an empty list as `None`, since draining a queue is routine rather
/// than exceptional.
#[async_trait]
pub trait Client: Send + Sync {
    async fn get(&self, k: String) -> Result<String, StoreError>;
    async fn set(&self, k: String, v: String) -> Result<(), StoreError>;
    async fn del(&self, k: String) -> Result<(), StoreError>;
    async fn exists(&self, k: String) -> Result<bool, StoreError>;
    async fn incrby(&self, k: String, delta: i64) -> Result<i64, StoreError>;
    async fn lpush(&self, k: String, v: String) -> Result<(), StoreError>;
    async fn rpush(&self, k: String, v: String) -> Result<(), StoreError>;
    async fn lpop(&self, k: String) -> Result<Option<String>, StoreError>;
    async fn lindex(&self, k: String, index: isize) -> Result<Option<String>, StoreError>;
    async fn llen(&self, k: String) -> Result<u64, StoreError>;
    async fn sadd(&self, k: String, v: String) -> Result<(), StoreError>;
    async fn srem(&self, k: String, v: String) -> Result<(), StoreError>;

    /// Drop any live connection. A worker calls this right before spawning a
    /// job child process so parent and child each dial their own connection
    /// afterwards; the next command reconnects on demand.
    async fn disconnect(&self) {}
}

/// Redis-backed [`Client`] over a lazily dialed multiplexed connection.
pub struct RedisClient {
    url: String,
    connection: Mutex<Option<MultiplexedConnection>>,
}

impl RedisClient {
    /// Build a client for `url`. No connection is made until the first
    /// command runs, which keeps the client usable on both sides of a
    /// `disconnect`.
    pub fn new(url: impl Into<String>) -> RedisClient {
        RedisClient {
            url: url.into(),
            connection: Mutex::new(None),
        }
    }

    async fn connection(&self) -> Result<MultiplexedConnection, StoreError> {
        let mut guard = self.connection.lock().await;
        if let Some(connection) = guard.as_ref() {
            return Ok(connection.clone());
        }

        let client = redis::Client::open(self.url.as_str())?;
        let connection = client.get_multiplexed_tokio_connection().await?;
        *guard = Some(connection.clone());
        Ok(connection)
    }
}

#[async_trait]
impl Client for RedisClient {
    async fn get(&self, k: String) -> Result<String, StoreError> {
        let mut conn = self.connection().await?;
        let results = conn.get(k);
        let fut: Result<Option<String>, RedisError> =
            timeout(Duration::from_millis(get_store_timeout_ms()), results).await?;

        match fut? {
            Some(value) => Ok(value),
            None => Err(StoreError::NotFound),
        }
    }

    async fn set(&self, k: String, v: String) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let results = conn.set(k, v);
        let fut = timeout(Duration::from_millis(get_store_timeout_ms()), results).await?;
        Ok(fut?)
    }

    async fn del(&self, k: String) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let results = conn.del(k);
        let fut: Result<(), RedisError> =
            timeout(Duration::from_millis(get_store_timeout_ms()), results).await?;
        fut.map_err(|e| StoreError::Other(e.to_string()))
    }

    async fn exists(&self, k: String) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;
        let results = conn.exists(k);
        let fut = timeout(Duration::from_millis(get_store_timeout_ms()), results).await?;
        Ok(fut?)
    }

    async fn incrby(&self, k: String, delta: i64) -> Result<i64, StoreError> {
        let mut conn = self.connection().await?;
        let results = conn.incr(k, delta);
        let fut = timeout(Duration::from_millis(get_store_timeout_ms()), results).await?;
        Ok(fut?)
    }

    async fn lpush(&self, k: String, v: String) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let results = conn.lpush(k, v);
        let fut: Result<(), RedisError> =
            timeout(Duration::from_millis(get_store_timeout_ms()), results).await?;
        Ok(fut?)
    }

    async fn rpush(&self, k: String, v: String) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let results = conn.rpush(k, v);
        let fut: Result<(), RedisError> =
            timeout(Duration::from_millis(get_store_timeout_ms()), results).await?;
        Ok(fut?)
    }

    async fn lpop(&self, k: String) -> Result<Option<String>, StoreError> {
        let mut conn = self.connection().await?;
        let results = conn.lpop(k, None);
        let fut = timeout(Duration::from_millis(get_store_timeout_ms()), results).await?;
        Ok(fut?)
    }

    async fn lindex(&self, k: String, index: isize) -> Result<Option<String>, StoreError> {
        let mut conn = self.connection().await?;
        let results = conn.lindex(k, index);
        let fut = timeout(Duration::from_millis(get_store_timeout_ms()), results).await?;
        Ok(fut?)
    }

    async fn llen(&self, k: String) -> Result<u64, StoreError> {
        let mut conn = self.connection().await?;
        let results = conn.llen(k);
        let fut = timeout(Duration::from_millis(get_store_timeout_ms()), results).await?;
        Ok(fut?)
    }

    async fn sadd(&self, k: String, v: String) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let results = conn.sadd(k, v);
        let fut: Result<(), RedisError> =
            timeout(Duration::from_millis(get_store_timeout_ms()), results).await?;
        Ok(fut?)
    }

    async fn srem(&self, k: String, v: String) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let results = conn.srem(k, v);
        let fut: Result<(), RedisError> =
            timeout(Duration::from_millis(get_store_timeout_ms()), results).await?;
        Ok(fut?)
    }

    async fn disconnect(&self) {
        *self.connection.lock().await = None;
    }
}
