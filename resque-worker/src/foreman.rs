//! Per-job process isolation.
//!
//! The worker does not fork: it re-executes its own binary with the encoded
//! descriptor in the environment, which gives the same isolation guarantee
//! (a leaky or crashing job takes down a throwaway process, not the worker)
//! with memory-safe plumbing. The spawned binary notices the payload
//! variable, performs that one job, and exits.

use std::path::PathBuf;
use std::process::Stdio;

use thiserror::Error;
use tokio::process::{Child, Command};

/// Environment variable carrying the encoded descriptor to a job child.
pub const CHILD_PAYLOAD_ENV: &str = "RESQUE_CHILD_PAYLOAD";

/// Environment variable carrying the parent worker's id to a job child, so
/// failure records name the worker the job belonged to.
pub const CHILD_WORKER_ENV: &str = "RESQUE_CHILD_WORKER";

/// Exit code reserved for a job child whose job failed but whose failure the
/// child already recorded (sysexits EX_SOFTWARE). The parent counts such an
/// exit as a failure without writing a second record; every other non-zero
/// exit is a crash the parent records as a dirty exit.
pub const HANDLED_FAILURE_EXIT_CODE: i32 = 70;

/// Enumeration of errors for spawning job children.
#[derive(Error, Debug)]
pub enum ForemanError {
    /// The platform or binary cannot run job children at all; the worker
    /// degrades to inline execution.
    #[error("job child processes are unavailable: {0}")]
    Unsupported(std::io::Error),
    #[error("failed to spawn job child process: {0}")]
    Spawn(std::io::Error),
}

/// Splits off a child process that performs exactly one job.
pub trait Foreman: Send + Sync {
    fn spawn(&self, worker_id: &str, payload: &str) -> Result<Child, ForemanError>;
}

/// The production foreman: re-executes the current binary.
pub struct ProcessForeman {
    program: PathBuf,
}

impl ProcessForeman {
    pub fn from_current_exe() -> Result<Self, ForemanError> {
        let program = std::env::current_exe().map_err(ForemanError::Unsupported)?;
        Ok(Self { program })
    }
}

impl Foreman for ProcessForeman {
    fn spawn(&self, worker_id: &str, payload: &str) -> Result<Child, ForemanError> {
        Command::new(&self.program)
            .env(CHILD_PAYLOAD_ENV, payload)
            .env(CHILD_WORKER_ENV, worker_id)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(ForemanError::Spawn)
    }
}
