//! The job-child entry point.
//!
//! A binary that finds [`CHILD_PAYLOAD_ENV`](crate::foreman::CHILD_PAYLOAD_ENV)
//! in its environment is a job child: it performs that one payload and
//! exits. The exit code is the contract with the waiting parent: 0 means
//! the job succeeded, [`HANDLED_FAILURE_EXIT_CODE`] means the job failed
//! and the failure record was already written from here, and anything else
//! is a crash the parent turns into a dirty-exit record.

use resque_common::events::{Event, EventKind};
use resque_common::job::{Job, JobState};
use tracing::{error, warn};

use crate::foreman::HANDLED_FAILURE_EXIT_CODE;
use crate::worker::Worker;

/// Perform `payload` as a job child of `worker` and return the process exit
/// code. The worker passed in is the child's own instance, configured with
/// the parent's id.
pub async fn run(worker: &Worker, payload: &str) -> i32 {
    worker
        .events()
        .dispatch(&Event::for_worker(EventKind::WorkerAfterFork, worker.id()));

    let mut job = match Job::decode(payload) {
        Ok(job) => job,
        Err(decode_error) => {
            error!(%decode_error, "job child received an undecodable payload");
            return 1;
        }
    };
    if let Err(error) = job.transition(JobState::Running) {
        warn!(%error, "job child payload arrived in an unexpected state");
    }

    if worker.perform(&job).await {
        0
    } else {
        // The failure record was written here; the exit code lets the
        // parent account for the failure without recording it again.
        HANDLED_FAILURE_EXIT_CODE
    }
}
