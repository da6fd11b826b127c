//! # Failure
//!
//! Failure records and the sink that persists them. Every failed job leaves
//! one record; the sink never deduplicates.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::job::{CodecError, Job};
use crate::registry::{FactoryError, PerformError};
use crate::store::{Client, StoreError};

/// Store key of the failure log list. New records go to the head.
pub const FAILED_KEY: &str = "failed";

/// An error that made a job fail, in the vocabulary the failure log uses.
#[derive(Error, Debug)]
pub enum WorkError {
    /// The job class ran and raised.
    #[error(transparent)]
    Perform(#[from] PerformError),
    /// The factory could not turn the descriptor into something runnable.
    #[error(transparent)]
    InvalidJob(#[from] FactoryError),
    /// The descriptor could not be re-encoded for a child process.
    #[error("failed to encode job payload: {0}")]
    Codec(#[from] CodecError),
    /// The job child process exited on its own with a non-zero status.
    #[error("job child process exited with exit code {0}")]
    DirtyExit(i32),
    /// The job child process was killed by a signal.
    #[error("job child process was terminated by signal {0}")]
    KilledBySignal(i32),
    /// The job child process could not be reaped.
    #[error("job child process was lost: {0}")]
    ChildLost(String),
}

impl WorkError {
    /// The stable kind string recorded in the failure log's `exception`
    /// field.
    pub fn exception(&self) -> &str {
        match self {
            WorkError::Perform(error) => &error.kind,
            WorkError::InvalidJob(_) | WorkError::Codec(_) => "invalid-job",
            WorkError::DirtyExit(_) | WorkError::KilledBySignal(_) | WorkError::ChildLost(_) => {
                "dirty-exit"
            }
        }
    }

    pub fn backtrace(&self) -> &[String] {
        match self {
            WorkError::Perform(error) => &error.backtrace,
            _ => &[],
        }
    }
}

/// One entry in the failure log.
#[derive(Debug, Serialize, Deserialize)]
pub struct FailureRecord {
    pub failed_at: String,
    pub payload: Value,
    pub exception: String,
    pub error: String,
    pub backtrace: Vec<String>,
    pub worker: String,
    pub queue: String,
}

/// Enumeration of errors for failure sink operations.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("store operation failed: {0}")]
    Store(#[from] StoreError),
    #[error("failed to encode failure record: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to encode failed job payload: {0}")]
    Codec(#[from] CodecError),
}

/// Where failed jobs are written down.
///
/// Repeated saves append repeated records. Implementations are
/// interchangeable over the `{save, count, clear}` capability set.
#[async_trait]
pub trait FailureSink: Send + Sync {
    async fn save(
        &self,
        job: &Job,
        error: &WorkError,
        queue: Option<&str>,
        worker: &str,
    ) -> Result<(), SinkError>;

    async fn count(&self) -> Result<u64, SinkError>;

    async fn clear(&self) -> Result<(), SinkError>;
}

/// Failure sink backed by the `failed` list in the store, newest record at
/// the head.
pub struct RedisFailureSink {
    store: Arc<dyn Client>,
}

impl RedisFailureSink {
    pub fn new(store: Arc<dyn Client>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl FailureSink for RedisFailureSink {
    async fn save(
        &self,
        job: &Job,
        error: &WorkError,
        queue: Option<&str>,
        worker: &str,
    ) -> Result<(), SinkError> {
        let record = FailureRecord {
            failed_at: Utc::now().to_rfc3339(),
            payload: job.to_value()?,
            exception: error.exception().to_owned(),
            error: error.to_string(),
            backtrace: error.backtrace().to_vec(),
            worker: worker.to_owned(),
            queue: queue.unwrap_or_default().to_owned(),
        };
        let record = serde_json::to_string(&record)?;
        self.store.lpush(FAILED_KEY.to_owned(), record).await?;
        Ok(())
    }

    async fn count(&self) -> Result<u64, SinkError> {
        Ok(self.store.llen(FAILED_KEY.to_owned()).await?)
    }

    async fn clear(&self) -> Result<(), SinkError> {
        self.store.del(FAILED_KEY.to_owned()).await?;
        Ok(())
    }
}

/// A failure sink that drops everything. Used when no sink is configured.
pub struct NullFailureSink;

#[async_trait]
impl FailureSink for NullFailureSink {
    async fn save(
        &self,
        _job: &Job,
        _error: &WorkError,
        _queue: Option<&str>,
        _worker: &str,
    ) -> Result<(), SinkError> {
        Ok(())
    }

    async fn count(&self) -> Result<u64, SinkError> {
        Ok(0)
    }

    async fn clear(&self) -> Result<(), SinkError> {
        Ok(())
    }
}
