//! End-to-end forked execution: the worker re-executes this very binary as
//! its job child through the production `ProcessForeman`. Built without the
//! libtest harness so the child branch owns `main` when the payload
//! variable is set.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use resque_common::failure::{FailureRecord, FailureSink, RedisFailureSink, FAILED_KEY};
use resque_common::job::Job;
use resque_common::mock::MemoryClient;
use resque_common::queue::{Queue, RedisQueue};
use resque_common::registry::{JobRegistry, Perform, PerformError};
use resque_common::stats::{RedisStatsSink, StatsSink};
use resque_common::store::Client;
use resque_worker::child;
use resque_worker::foreman::{CHILD_PAYLOAD_ENV, CHILD_WORKER_ENV, HANDLED_FAILURE_EXIT_CODE};
use resque_worker::worker::Worker;

struct OkJob;

#[async_trait]
impl Perform for OkJob {
    async fn perform(&self) -> Result<(), PerformError> {
        Ok(())
    }
}

struct FailingJob;

#[async_trait]
impl Perform for FailingJob {
    async fn perform(&self) -> Result<(), PerformError> {
        Err(PerformError::new("RuntimeError", "boom"))
    }
}

fn job_registry() -> Arc<JobRegistry> {
    let mut registry = JobRegistry::new();
    registry.register("OkJob", |_| Ok(Box::new(OkJob)));
    registry.register("FailingJob", |_| Ok(Box::new(FailingJob)));
    Arc::new(registry)
}

#[tokio::main]
async fn main() {
    match std::env::var(CHILD_PAYLOAD_ENV) {
        Ok(payload) => child_main(&payload).await,
        Err(_) => parent_main().await,
    }
}

/// The spawned child: perform the payload against this process's own store,
/// verify what this side wrote, and report back through the exit code. A
/// failed assertion exits non-zero, which the parent surfaces as an
/// unexpected dirty exit.
async fn child_main(payload: &str) {
    let store: Arc<dyn Client> = Arc::new(MemoryClient::new());
    let failures = Arc::new(RedisFailureSink::new(store.clone()));
    let worker = Worker::new(store.clone(), Vec::new(), job_registry())
        .with_failure_sink(failures.clone());
    let worker = match std::env::var(CHILD_WORKER_ENV) {
        Ok(id) if !id.is_empty() => worker.with_id(id),
        _ => worker,
    };

    let code = child::run(&worker, payload).await;

    if code == HANDLED_FAILURE_EXIT_CODE {
        // The record and the failed counter must exist on this side of the
        // process boundary before the exit code reports the failure.
        assert_eq!(failures.count().await.unwrap(), 1);
        let raw = store
            .lindex(FAILED_KEY.to_owned(), 0)
            .await
            .unwrap()
            .expect("child should have written a failure record");
        let record: FailureRecord = serde_json::from_str(&raw).unwrap();
        assert_eq!(record.exception, "RuntimeError");
        assert_eq!(record.error, "boom");
        assert_eq!(record.worker, worker.id());
        let stats = RedisStatsSink::new(store.clone());
        assert_eq!(stats.get("failed").await.unwrap(), 1);
    }
    std::process::exit(code);
}

/// The worker side: run one succeeding and one failing job, each in a real
/// child process, and check the accounting afterwards.
async fn parent_main() {
    let store = Arc::new(MemoryClient::new());
    let queue = Arc::new(RedisQueue::new("default", store.clone()));
    queue.push(Job::new("OkJob", vec![])).await.unwrap();
    queue.push(Job::new("FailingJob", vec![])).await.unwrap();
    let queues: Vec<Arc<dyn Queue>> = vec![queue];
    let failures = Arc::new(RedisFailureSink::new(store.clone()));
    let mut worker = Worker::new(store.clone(), queues, job_registry())
        .with_failure_sink(failures.clone())
        .with_fork(true)
        .with_interval(Duration::ZERO);

    tokio::time::timeout(Duration::from_secs(30), worker.work())
        .await
        .expect("forked worker should drain its queue promptly")
        .expect("worker loop should exit cleanly");

    let stats = RedisStatsSink::new(store.clone());
    // Only the job whose child exited 0 is credited as processed.
    assert_eq!(stats.get("processed").await.unwrap(), 1);
    // The handled failure was recorded in the child's store; the parent
    // neither re-records it nor counts it as failed on this side.
    assert_eq!(stats.get("failed").await.unwrap(), 0);
    assert_eq!(failures.count().await.unwrap(), 0);

    println!("forked execution ok");
}
