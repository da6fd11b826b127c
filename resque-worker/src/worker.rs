//! The reservation loop.
//!
//! A worker polls its queues in order, reserves one job at a time, executes
//! it inline or in a throwaway child process, and records the outcome in the
//! stats and failure sinks. Signals steer the loop through [`Flags`]; the
//! flags are read at the top of each iteration and while waiting on a child.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use once_cell::sync::OnceCell;
use tracing::{error, info, warn};

use resque_common::events::{Event, EventBus, EventKind};
use resque_common::failure::{FailureSink, NullFailureSink, WorkError};
use resque_common::health::HealthHandle;
use resque_common::job::{Job, JobState};
use resque_common::queue::Queue;
use resque_common::registry::JobRegistry;
use resque_common::stats::{RedisStatsSink, StatsSink};
use resque_common::store::Client;

use crate::error::WorkerError;
use crate::foreman::{Foreman, HANDLED_FAILURE_EXIT_CODE, ProcessForeman};
use crate::signals::{self, Flags};
use crate::title;

/// Store key of the set of live worker ids.
pub const WORKERS_KEY: &str = "workers";

/// How often the child-wait loop re-reads the kill flag.
const KILL_POLL_INTERVAL: Duration = Duration::from_millis(100);

fn worker_key(id: &str) -> String {
    format!("worker:{id}")
}

fn exit_error(status: std::process::ExitStatus) -> WorkError {
    if let Some(code) = status.code() {
        return WorkError::DirtyExit(code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return WorkError::KilledBySignal(signal);
        }
    }
    WorkError::ChildLost(status.to_string())
}

/// A single background worker. One per process: it registers process-wide
/// signal handlers and sets the process title.
pub struct Worker {
    queues: Vec<Arc<dyn Queue>>,
    store: Arc<dyn Client>,
    registry: Arc<JobRegistry>,
    failures: Arc<dyn FailureSink>,
    stats: Arc<dyn StatsSink>,
    events: Arc<EventBus>,
    foreman: Option<Arc<dyn Foreman>>,
    fork: bool,
    interval: Duration,
    flags: Arc<Flags>,
    liveness: Option<HealthHandle>,
    current_job: Option<Job>,
    child_pid: Mutex<Option<u32>>,
    id: OnceCell<String>,
}

impl Worker {
    /// A worker polling `queues` in the given order. Without further
    /// configuration it performs jobs inline, records no failures, and keeps
    /// stats in the store it was given.
    pub fn new(
        store: Arc<dyn Client>,
        queues: Vec<Arc<dyn Queue>>,
        registry: Arc<JobRegistry>,
    ) -> Self {
        let mut worker = Self {
            queues: Vec::new(),
            stats: Arc::new(RedisStatsSink::new(store.clone())),
            failures: Arc::new(NullFailureSink),
            events: Arc::new(EventBus::new()),
            foreman: None,
            fork: false,
            interval: Duration::from_secs(5),
            flags: Arc::new(Flags::default()),
            liveness: None,
            current_job: None,
            child_pid: Mutex::new(None),
            id: OnceCell::new(),
            store,
            registry,
        };
        for queue in queues {
            worker.add_queue(queue);
        }
        worker
    }

    /// Append a queue to the polling order. A queue with an already-known
    /// name replaces the earlier one in place.
    pub fn add_queue(&mut self, queue: Arc<dyn Queue>) {
        match self.queues.iter().position(|q| q.name() == queue.name()) {
            Some(index) => self.queues[index] = queue,
            None => self.queues.push(queue),
        }
    }

    pub fn with_failure_sink(mut self, failures: Arc<dyn FailureSink>) -> Self {
        self.failures = failures;
        self
    }

    pub fn with_stats_sink(mut self, stats: Arc<dyn StatsSink>) -> Self {
        self.stats = stats;
        self
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Arc::new(events);
        self
    }

    pub fn with_foreman(mut self, foreman: Arc<dyn Foreman>) -> Self {
        self.foreman = Some(foreman);
        self
    }

    /// Run each job in its own child process instead of inline.
    pub fn with_fork(mut self, fork: bool) -> Self {
        self.fork = fork;
        self
    }

    /// Sleep time between empty polls. Zero makes `work` single-shot: it
    /// drains what is queued and returns.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_liveness(mut self, liveness: HealthHandle) -> Self {
        self.liveness = Some(liveness);
        self
    }

    /// Fix the worker id instead of deriving it. Used by job children so
    /// their records name the parent worker.
    pub fn with_id(self, id: impl Into<String>) -> Self {
        self.id.set(id.into()).ok();
        self
    }

    /// `<hostname>:<pid>:<comma-joined queue names>`, derived once.
    pub fn id(&self) -> &str {
        self.id.get_or_init(|| {
            let hostname = gethostname::gethostname().to_string_lossy().into_owned();
            format!(
                "{}:{}:{}",
                hostname,
                std::process::id(),
                self.queue_names().join(",")
            )
        })
    }

    pub fn queue_names(&self) -> Vec<String> {
        self.queues.iter().map(|q| q.name().to_owned()).collect()
    }

    /// The flags steering this worker, shared with the signal router.
    pub fn flags(&self) -> Arc<Flags> {
        self.flags.clone()
    }

    /// The bus lifecycle events are dispatched on.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Pid of the currently running job child, if any.
    pub fn child_pid(&self) -> Option<u32> {
        self.child_pid.lock().ok().and_then(|slot| *slot)
    }

    fn store_child_pid(&self, pid: Option<u32>) {
        if let Ok(mut slot) = self.child_pid.lock() {
            *slot = pid;
        }
    }

    /// Run the reservation loop until shutdown is requested, or, with a zero
    /// interval, until the queues run empty.
    pub async fn work(&mut self) -> Result<(), WorkerError> {
        self.startup().await?;
        loop {
            if let Some(liveness) = &self.liveness {
                liveness.report_healthy();
            }
            if self.flags.shutdown() {
                break;
            }
            if self.flags.paused() {
                title::set("Paused");
                tokio::time::sleep(self.interval).await;
                continue;
            }
            // A job reserved here is processed even if shutdown comes in
            // before execution starts: dequeued work is never dropped.
            let Some(job) = self.reserve().await else {
                if self.interval.is_zero() {
                    break;
                }
                title::set(&format!("Waiting for {}", self.queue_names().join(",")));
                tokio::time::sleep(self.interval).await;
                continue;
            };
            self.process(job).await;
        }
        self.unregister().await;
        Ok(())
    }

    async fn startup(&mut self) -> Result<(), WorkerError> {
        title::set("Starting");
        signals::install(self.flags.clone())?;
        if self.fork && self.foreman.is_none() {
            match ProcessForeman::from_current_exe() {
                Ok(foreman) => self.foreman = Some(Arc::new(foreman)),
                Err(error) => {
                    warn!(%error, "job isolation unavailable, jobs will run inline");
                    self.fork = false;
                }
            }
        }
        info!(worker = self.id(), queues = ?self.queue_names(), "worker starting");
        self.events
            .dispatch(&Event::for_worker(EventKind::WorkerStartup, self.id()));
        self.register().await;
        Ok(())
    }

    /// Poll the queues in order; the first job wins.
    async fn reserve(&mut self) -> Option<Job> {
        for queue in &self.queues {
            match queue.pop().await {
                Ok(Some(job)) => {
                    info!(
                        queue = queue.name(),
                        job = job.id(),
                        class = %job.class,
                        "reserved job"
                    );
                    return Some(job);
                }
                Ok(None) => {}
                Err(error) => warn!(queue = queue.name(), %error, "failed to poll queue"),
            }
        }
        None
    }

    async fn process(&mut self, mut job: Job) {
        if let Err(error) = job.transition(JobState::Running) {
            warn!(%error, job = job.id(), "reserved job arrived in an unexpected state");
        }
        let labels = [("queue", job.queue().unwrap_or("none").to_owned())];
        if job.queue_time() > 0.0 {
            let queued_for = Utc::now().timestamp_millis() as f64 / 1000.0 - job.queue_time();
            if queued_for >= 0.0 {
                metrics::histogram!("job_queue_latency_seconds", &labels).record(queued_for);
            }
        }

        let started = tokio::time::Instant::now();
        self.set_current_job(job).await;
        let job = self.current_job.as_ref().expect("current job was just set");
        let success = if self.fork {
            self.fork_and_wait(job).await
        } else {
            self.perform(job).await
        };
        metrics::histogram!("job_processing_duration_seconds", &labels)
            .record(started.elapsed().as_secs_f64());
        if success {
            metrics::counter!("jobs_processed_total", &labels).increment(1);
        }

        if let Some(job) = self.current_job.as_mut() {
            let outcome = if success {
                JobState::Complete
            } else {
                JobState::Failed
            };
            if let Err(error) = job.transition(outcome) {
                warn!(%error, "job finished in an unexpected state");
            }
        }
        self.done_working(success).await;
    }

    /// Perform one job in this process, recording failure or success. Job
    /// children run the exact same path after the fork.
    pub async fn perform(&self, job: &Job) -> bool {
        title::set(&format!(
            "Processing {} since {}",
            job.queue().unwrap_or_default(),
            Utc::now().timestamp()
        ));
        self.events
            .dispatch(&Event::for_job(EventKind::JobBeforePerform, self.id(), job));
        let task = match self.registry.create(job) {
            Ok(task) => task,
            Err(factory_error) => {
                self.handle_failure(job, &WorkError::InvalidJob(factory_error))
                    .await;
                return false;
            }
        };
        match task.perform().await {
            Ok(()) => {
                self.events
                    .dispatch(&Event::for_job(EventKind::JobAfterPerform, self.id(), job));
                self.events
                    .dispatch(&Event::for_job(EventKind::JobPerformed, self.id(), job));
                info!(job = job.id(), class = %job.class, "performed job");
                true
            }
            Err(perform_error) => {
                self.handle_failure(job, &WorkError::Perform(perform_error))
                    .await;
                false
            }
        }
    }

    /// Hand the job to a child process and wait for it. A pending kill
    /// request SIGKILLs the child. Exit 0 is a success,
    /// [`HANDLED_FAILURE_EXIT_CODE`] is a failure the child already
    /// recorded, and any other non-zero exit is recorded as a dirty exit.
    async fn fork_and_wait(&self, job: &Job) -> bool {
        let Some(foreman) = self.foreman.as_ref() else {
            return self.perform(job).await;
        };
        self.events
            .dispatch(&Event::for_job(EventKind::WorkerBeforeFork, self.id(), job));
        let payload = match job.encode() {
            Ok(payload) => payload,
            Err(codec_error) => {
                self.handle_failure(job, &WorkError::Codec(codec_error)).await;
                return false;
            }
        };
        // Drop our connection first; parent and child each redial on demand.
        self.store.disconnect().await;
        let mut child = match foreman.spawn(self.id(), &payload) {
            Ok(child) => child,
            Err(error) => {
                warn!(%error, "failed to spawn job child process, performing inline");
                return self.perform(job).await;
            }
        };

        let pid = child.id();
        self.store_child_pid(pid);
        title::set(&format!(
            "Forked {} at {}",
            pid.unwrap_or_default(),
            Utc::now().timestamp()
        ));
        let status = loop {
            if self.flags.take_kill_child() {
                warn!(job = job.id(), ?pid, "killing job child process");
                if let Err(error) = child.start_kill() {
                    warn!(%error, "failed to kill job child process");
                }
            }
            tokio::select! {
                status = child.wait() => break status,
                _ = tokio::time::sleep(KILL_POLL_INTERVAL) => {}
            }
        };
        self.store_child_pid(None);

        match status {
            Ok(status) if status.success() => true,
            Ok(status) if status.code() == Some(HANDLED_FAILURE_EXIT_CODE) => {
                // The child wrote the failure record and counted the failure
                // before exiting; only the parent-side metric is left to us.
                warn!(job = job.id(), "job failed in child, failure recorded there");
                let labels = [("queue", job.queue().unwrap_or("none").to_owned())];
                metrics::counter!("jobs_failed_total", &labels).increment(1);
                false
            }
            Ok(status) => {
                self.handle_failure(job, &exit_error(status)).await;
                false
            }
            Err(wait_error) => {
                self.handle_failure(job, &WorkError::ChildLost(wait_error.to_string()))
                    .await;
                false
            }
        }
    }

    /// Record a failed job. Never raises: a broken sink must not take the
    /// loop down with it.
    async fn handle_failure(&self, job: &Job, error: &WorkError) {
        error!(
            job = job.id(),
            class = %job.class,
            queue = job.queue().unwrap_or_default(),
            %error,
            "job failed"
        );
        let labels = [("queue", job.queue().unwrap_or("none").to_owned())];
        metrics::counter!("jobs_failed_total", &labels).increment(1);
        if let Err(sink_error) = self
            .failures
            .save(job, error, job.queue(), self.id())
            .await
        {
            warn!(%sink_error, "failed to record job failure");
        }
        self.increment_stat("failed").await;
        self.increment_stat(&format!("failed:{}", self.id())).await;
        self.events
            .dispatch(&Event::for_failure(self.id(), job, error));
    }

    async fn done_working(&mut self, success: bool) {
        if success {
            self.increment_stat("processed").await;
            let per_worker = format!("processed:{}", self.id());
            self.increment_stat(&per_worker).await;
        }
        self.clear_current_job().await;
    }

    async fn increment_stat(&self, key: &str) {
        if let Err(error) = self.stats.increment(key).await {
            warn!(%error, key, "failed to increment stat");
        }
    }

    /// Take the job as the current one and publish the current-job record.
    /// The record key exists exactly while a job is in flight.
    async fn set_current_job(&mut self, job: Job) {
        assert!(
            self.current_job.is_none(),
            "worker already has a current job, refusing to take a second one"
        );
        match job.to_value() {
            Ok(payload) => {
                let record = serde_json::json!({
                    "queue": job.queue(),
                    "run_at": Utc::now().to_rfc3339(),
                    "payload": payload,
                });
                if let Err(error) = self
                    .store
                    .set(worker_key(self.id()), record.to_string())
                    .await
                {
                    warn!(%error, "failed to publish current job record");
                }
            }
            Err(error) => warn!(%error, "failed to encode current job record"),
        }
        self.current_job = Some(job);
    }

    async fn clear_current_job(&mut self) {
        self.current_job = None;
        if let Err(error) = self.store.del(worker_key(self.id())).await {
            warn!(%error, "failed to clear current job record");
        }
    }

    async fn register(&self) {
        let id = self.id().to_owned();
        if let Err(error) = self.store.sadd(WORKERS_KEY.to_owned(), id.clone()).await {
            warn!(%error, "failed to register worker");
        }
        if let Err(error) = self
            .store
            .set(format!("worker:{id}:started"), Utc::now().to_rfc3339())
            .await
        {
            warn!(%error, "failed to record worker start time");
        }
    }

    async fn unregister(&mut self) {
        self.clear_current_job().await;
        let id = self.id().to_owned();
        if let Err(error) = self.store.srem(WORKERS_KEY.to_owned(), id.clone()).await {
            warn!(%error, "failed to unregister worker");
        }
        if let Err(error) = self.store.del(format!("worker:{id}:started")).await {
            warn!(%error, "failed to clear worker start time");
        }
        for stat in [format!("processed:{id}"), format!("failed:{id}")] {
            if let Err(error) = self.stats.clear(&stat).await {
                warn!(%error, %stat, "failed to clear per-worker stat");
            }
        }
        info!(worker = id, "worker stopped");
    }
}
