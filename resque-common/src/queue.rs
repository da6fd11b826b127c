//! # Queue
//!
//! A FIFO source of jobs. The worker polls queues through this trait and
//! never learns how they are stored.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use thiserror::Error;

use crate::job::{CodecError, Job};
use crate::store::{Client, StoreError};

/// Store key of the set of known queue names.
pub const QUEUES_KEY: &str = "queues";

fn queue_key(name: &str) -> String {
    format!("queue:{name}")
}

/// Enumeration of errors for queue operations.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("store operation failed: {0}")]
    Store(#[from] StoreError),
    #[error("failed to encode or decode a queued job: {0}")]
    Codec(#[from] CodecError),
}

/// A named FIFO of jobs.
///
/// Ordering within one queue follows successful `push` calls; ordering
/// across queues is the worker's business. `pop` may block for a bounded
/// interval or return immediately, the worker treats both the same.
#[async_trait]
pub trait Queue: Send + Sync {
    /// Stable identifier, used in worker ids and log context.
    fn name(&self) -> &str;

    async fn push(&self, job: Job) -> Result<(), QueueError>;

    /// Remove and return the next job, or `None` when empty. The returned
    /// job carries this queue's name as its origin.
    async fn pop(&self) -> Result<Option<Job>, QueueError>;
}

/// A queue stored as a Redis list under `queue:<name>`.
///
/// Pushing also registers the queue name in the `queues` set so operators
/// can discover which queues exist.
pub struct RedisQueue {
    name: String,
    store: Arc<dyn Client>,
}

impl RedisQueue {
    pub fn new(name: impl Into<String>, store: Arc<dyn Client>) -> Self {
        Self {
            name: name.into(),
            store,
        }
    }
}

#[async_trait]
impl Queue for RedisQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn push(&self, job: Job) -> Result<(), QueueError> {
        let payload = job.encode()?;
        self.store
            .sadd(QUEUES_KEY.to_owned(), self.name.clone())
            .await?;
        self.store.rpush(queue_key(&self.name), payload).await?;
        Ok(())
    }

    async fn pop(&self) -> Result<Option<Job>, QueueError> {
        match self.store.lpop(queue_key(&self.name)).await? {
            Some(payload) => {
                let mut job = Job::decode(&payload)?;
                job.assign_queue(self.name.clone());
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }
}

/// An in-process queue for tests and embedders that do not need Redis.
pub struct MemoryQueue {
    name: String,
    jobs: Mutex<VecDeque<Job>>,
}

impl MemoryQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            jobs: Mutex::new(VecDeque::new()),
        }
    }

    fn lock_jobs(&self) -> MutexGuard<'_, VecDeque<Job>> {
        match self.jobs.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn push(&self, job: Job) -> Result<(), QueueError> {
        self.lock_jobs().push_back(job);
        Ok(())
    }

    async fn pop(&self) -> Result<Option<Job>, QueueError> {
        let mut job = self.lock_jobs().pop_front();
        if let Some(job) = job.as_mut() {
            job.assign_queue(self.name.clone());
        }
        Ok(job)
    }
}
