//! In-memory [`Client`](crate::store::Client) used by tests across the
//! workspace. Unlike a canned-response mock, this fake keeps real string,
//! list, and set state so FIFO ordering and head-insert semantics hold.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use crate::store::{Client, StoreError};

#[derive(Debug, Clone)]
enum Entry {
    String(String),
    List(VecDeque<String>),
    Set(HashSet<String>),
}

impl Entry {
    fn type_name(&self) -> &'static str {
        match self {
            Entry::String(_) => "string",
            Entry::List(_) => "list",
            Entry::Set(_) => "set",
        }
    }
}

fn wrong_type(entry: &Entry) -> StoreError {
    StoreError::Other(format!(
        "WRONGTYPE operation against a {} key",
        entry.type_name()
    ))
}

/// A functional in-memory store. Cloneable handles are not needed: share it
/// through an `Arc` like any other [`Client`].
#[derive(Debug, Default)]
pub struct MemoryClient {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryClient {
    pub fn new() -> Self {
        Self::default()
    }

    // Helper method to safely lock the entries mutex
    fn lock_entries(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl Client for MemoryClient {
    async fn get(&self, k: String) -> Result<String, StoreError> {
        match self.lock_entries().get(&k) {
            Some(Entry::String(value)) => Ok(value.clone()),
            Some(other) => Err(wrong_type(other)),
            None => Err(StoreError::NotFound),
        }
    }

    async fn set(&self, k: String, v: String) -> Result<(), StoreError> {
        self.lock_entries().insert(k, Entry::String(v));
        Ok(())
    }

    async fn del(&self, k: String) -> Result<(), StoreError> {
        self.lock_entries().remove(&k);
        Ok(())
    }

    async fn exists(&self, k: String) -> Result<bool, StoreError> {
        Ok(self.lock_entries().contains_key(&k))
    }

    async fn incrby(&self, k: String, delta: i64) -> Result<i64, StoreError> {
        let mut entries = self.lock_entries();
        let current = match entries.get(&k) {
            Some(Entry::String(value)) => value
                .parse::<i64>()
                .map_err(|_| StoreError::ParseError(format!("{value} is not an integer")))?,
            Some(other) => return Err(wrong_type(other)),
            None => 0,
        };
        let next = current + delta;
        entries.insert(k, Entry::String(next.to_string()));
        Ok(next)
    }

    async fn lpush(&self, k: String, v: String) -> Result<(), StoreError> {
        let mut entries = self.lock_entries();
        match entries.entry(k).or_insert_with(|| Entry::List(VecDeque::new())) {
            Entry::List(list) => {
                list.push_front(v);
                Ok(())
            }
            other => Err(wrong_type(other)),
        }
    }

    async fn rpush(&self, k: String, v: String) -> Result<(), StoreError> {
        let mut entries = self.lock_entries();
        match entries.entry(k).or_insert_with(|| Entry::List(VecDeque::new())) {
            Entry::List(list) => {
                list.push_back(v);
                Ok(())
            }
            other => Err(wrong_type(other)),
        }
    }

    async fn lpop(&self, k: String) -> Result<Option<String>, StoreError> {
        let mut entries = self.lock_entries();
        let popped = match entries.get_mut(&k) {
            Some(Entry::List(list)) => list.pop_front(),
            Some(other) => return Err(wrong_type(other)),
            None => None,
        };
        // Redis removes a list key once it drains.
        if matches!(entries.get(&k), Some(Entry::List(list)) if list.is_empty()) {
            entries.remove(&k);
        }
        Ok(popped)
    }

    async fn lindex(&self, k: String, index: isize) -> Result<Option<String>, StoreError> {
        match self.lock_entries().get(&k) {
            Some(Entry::List(list)) => {
                let index = if index < 0 {
                    list.len() as isize + index
                } else {
                    index
                };
                if index < 0 {
                    return Ok(None);
                }
                Ok(list.get(index as usize).cloned())
            }
            Some(other) => Err(wrong_type(other)),
            None => Ok(None),
        }
    }

    async fn llen(&self, k: String) -> Result<u64, StoreError> {
        match self.lock_entries().get(&k) {
            Some(Entry::List(list)) => Ok(list.len() as u64),
            Some(other) => Err(wrong_type(other)),
            None => Ok(0),
        }
    }

    async fn sadd(&self, k: String, v: String) -> Result<(), StoreError> {
        let mut entries = self.lock_entries();
        match entries.entry(k).or_insert_with(|| Entry::Set(HashSet::new())) {
            Entry::Set(set) => {
                set.insert(v);
                Ok(())
            }
            other => Err(wrong_type(other)),
        }
    }

    async fn srem(&self, k: String, v: String) -> Result<(), StoreError> {
        let mut entries = self.lock_entries();
        let emptied = match entries.get_mut(&k) {
            Some(Entry::Set(set)) => {
                set.remove(&v);
                set.is_empty()
            }
            Some(other) => return Err(wrong_type(other)),
            None => false,
        };
        if emptied {
            entries.remove(&k);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_set_del_exists() {
        let store = MemoryClient::new();

        assert_eq!(store.get("k".into()).await, Err(StoreError::NotFound));
        store.set("k".into(), "v".into()).await.unwrap();
        assert_eq!(store.get("k".into()).await.unwrap(), "v");
        assert!(store.exists("k".into()).await.unwrap());

        store.del("k".into()).await.unwrap();
        assert!(!store.exists("k".into()).await.unwrap());
    }

    #[tokio::test]
    async fn test_lists_are_fifo_with_rpush_and_lpop() {
        let store = MemoryClient::new();

        store.rpush("l".into(), "first".into()).await.unwrap();
        store.rpush("l".into(), "second".into()).await.unwrap();

        assert_eq!(store.llen("l".into()).await.unwrap(), 2);
        assert_eq!(store.lpop("l".into()).await.unwrap(), Some("first".into()));
        assert_eq!(store.lpop("l".into()).await.unwrap(), Some("second".into()));
        assert_eq!(store.lpop("l".into()).await.unwrap(), None);
        // A drained list key disappears, matching Redis.
        assert!(!store.exists("l".into()).await.unwrap());
    }

    #[tokio::test]
    async fn test_lpush_inserts_at_the_head() {
        let store = MemoryClient::new();

        store.lpush("l".into(), "older".into()).await.unwrap();
        store.lpush("l".into(), "newest".into()).await.unwrap();

        assert_eq!(
            store.lindex("l".into(), 0).await.unwrap(),
            Some("newest".into())
        );
        assert_eq!(
            store.lindex("l".into(), -1).await.unwrap(),
            Some("older".into())
        );
        assert_eq!(store.lindex("l".into(), 5).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_incrby_accumulates_from_zero() {
        let store = MemoryClient::new();

        assert_eq!(store.incrby("n".into(), 1).await.unwrap(), 1);
        assert_eq!(store.incrby("n".into(), 2).await.unwrap(), 3);
        assert_eq!(store.incrby("n".into(), -3).await.unwrap(), 0);
        assert_eq!(store.get("n".into()).await.unwrap(), "0");
    }

    #[tokio::test]
    async fn test_sets_deduplicate_and_vanish_when_empty() {
        let store = MemoryClient::new();

        store.sadd("s".into(), "a".into()).await.unwrap();
        store.sadd("s".into(), "a".into()).await.unwrap();
        assert!(store.exists("s".into()).await.unwrap());

        store.srem("s".into(), "a".into()).await.unwrap();
        assert!(!store.exists("s".into()).await.unwrap());
    }

    #[tokio::test]
    async fn test_type_mismatches_are_rejected() {
        let store = MemoryClient::new();

        store.set("k".into(), "v".into()).await.unwrap();
        assert!(matches!(
            store.lpush("k".into(), "x".into()).await,
            Err(StoreError::Other(_))
        ));
        assert!(matches!(
            store.incrby("k".into(), 1).await,
            Err(StoreError::ParseError(_))
        ));
    }
}
