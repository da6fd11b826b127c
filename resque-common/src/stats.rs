//! # Stats
//!
//! Monotonic counters keyed by string, e.g. `processed` and `failed`.
//! Concurrency semantics belong to the backend; the worker just counts.

use std::sync::Arc;

use async_trait::async_trait;

use crate::store::{Client, StoreError};

fn stat_key(key: &str) -> String {
    format!("stat:{key}")
}

/// A counter store. A missing counter reads as zero.
#[async_trait]
pub trait StatsSink: Send + Sync {
    async fn increment(&self, key: &str) -> Result<(), StoreError>;
    async fn decrement(&self, key: &str) -> Result<(), StoreError>;
    async fn get(&self, key: &str) -> Result<i64, StoreError>;
    async fn clear(&self, key: &str) -> Result<(), StoreError>;
}

/// Counters stored under `stat:<key>` in the store.
pub struct RedisStatsSink {
    store: Arc<dyn Client>,
}

impl RedisStatsSink {
    pub fn new(store: Arc<dyn Client>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl StatsSink for RedisStatsSink {
    async fn increment(&self, key: &str) -> Result<(), StoreError> {
        self.store.incrby(stat_key(key), 1).await?;
        Ok(())
    }

    async fn decrement(&self, key: &str) -> Result<(), StoreError> {
        self.store.incrby(stat_key(key), -1).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<i64, StoreError> {
        match self.store.get(stat_key(key)).await {
            Ok(value) => value
                .parse::<i64>()
                .map_err(|_| StoreError::ParseError(format!("{value} is not a counter value"))),
            Err(StoreError::NotFound) => Ok(0),
            Err(error) => Err(error),
        }
    }

    async fn clear(&self, key: &str) -> Result<(), StoreError> {
        self.store.del(stat_key(key)).await
    }
}
