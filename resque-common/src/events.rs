//! # Events
//!
//! Synchronous fan-out of worker lifecycle events. Subscribers register for
//! one kind and run in registration order; a failing subscriber is logged
//! and never stops the others.

use std::sync::Arc;

use tracing::warn;

use crate::job::Job;

/// The lifecycle moments the worker announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    WorkerStartup,
    WorkerBeforeFork,
    WorkerAfterFork,
    JobBeforePerform,
    JobAfterPerform,
    JobPerformed,
    JobFailed,
}

impl EventKind {
    /// Every kind, handy for subscribers that want the full stream.
    pub const ALL: [EventKind; 7] = [
        EventKind::WorkerStartup,
        EventKind::WorkerBeforeFork,
        EventKind::WorkerAfterFork,
        EventKind::JobBeforePerform,
        EventKind::JobAfterPerform,
        EventKind::JobPerformed,
        EventKind::JobFailed,
    ];
}

/// A lifecycle event. Job fields are string snapshots: events never carry
/// the descriptor itself, since cloning one mints a new id.
#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    pub worker: String,
    pub job_id: Option<String>,
    pub class: Option<String>,
    pub queue: Option<String>,
    pub error: Option<String>,
}

impl Event {
    pub fn for_worker(kind: EventKind, worker: &str) -> Self {
        Self {
            kind,
            worker: worker.to_owned(),
            job_id: None,
            class: None,
            queue: None,
            error: None,
        }
    }

    pub fn for_job(kind: EventKind, worker: &str, job: &Job) -> Self {
        Self {
            kind,
            worker: worker.to_owned(),
            job_id: Some(job.id().to_owned()),
            class: Some(job.class.clone()),
            queue: job.queue().map(str::to_owned),
            error: None,
        }
    }

    pub fn for_failure(worker: &str, job: &Job, error: impl ToString) -> Self {
        let mut event = Self::for_job(EventKind::JobFailed, worker, job);
        event.error = Some(error.to_string());
        event
    }
}

/// Something that wants to hear about lifecycle events.
pub trait Subscriber: Send + Sync {
    fn on_event(&self, event: &Event) -> anyhow::Result<()>;
}

/// Synchronous, single-threaded event dispatch in registration order.
#[derive(Default)]
pub struct EventBus {
    subscribers: Vec<(EventKind, Arc<dyn Subscriber>)>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `subscriber` for events of `kind`. The same subscriber may
    /// be registered for several kinds.
    pub fn subscribe(&mut self, kind: EventKind, subscriber: Arc<dyn Subscriber>) {
        self.subscribers.push((kind, subscriber));
    }

    /// Deliver `event` to every subscriber registered for its kind.
    /// Subscriber errors are logged and swallowed.
    pub fn dispatch(&self, event: &Event) {
        for (kind, subscriber) in &self.subscribers {
            if *kind != event.kind {
                continue;
            }
            if let Err(error) = subscriber.on_event(event) {
                warn!(%error, kind = ?event.kind, "event subscriber failed");
            }
        }
    }
}
