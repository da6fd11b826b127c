//! # Job
//!
//! The unit of work moved through queues: a class tag naming the code to run,
//! an argument list, and a unique id.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Enumeration of errors for encoding and decoding job payloads.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("invalid job payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// Enumeration of possible states for a Job.
///
/// A job only ever moves forward: `Waiting` to `Running` to either
/// `Complete` or `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// A job that is sitting in a queue.
    Waiting,
    /// A job that a worker has reserved and is currently performing.
    Running,
    /// A job that finished without error.
    Complete,
    /// A job that finished with a recorded failure.
    Failed,
}

impl JobState {
    fn rank(self) -> u8 {
        match self {
            JobState::Waiting => 0,
            JobState::Running => 1,
            JobState::Complete | JobState::Failed => 2,
        }
    }
}

/// Error returned when a job state would move backwards.
#[derive(Error, Debug, PartialEq, Eq)]
#[error("job state cannot move from {from:?} to {to:?}")]
pub struct StateError {
    pub from: JobState,
    pub to: JobState,
}

fn fresh_id() -> String {
    Uuid::now_v7().simple().to_string()
}

fn now_epoch_seconds() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

/// The JSON shape jobs travel in. `args` wraps the argument list in a
/// single-element array; that wrapping is part of the format and is kept
/// stable across restarts.
#[derive(Serialize, Deserialize)]
struct Payload {
    class: String,
    args: Vec<Vec<Value>>,
    #[serde(default = "fresh_id")]
    id: String,
    #[serde(default)]
    queue_time: f64,
}

/// A unit of work to be pushed onto a queue and performed by a worker.
///
/// Identity is the `id`: two jobs compare equal iff their ids match,
/// regardless of class or arguments. Cloning deliberately mints a fresh id,
/// so a clone is a *new* job carrying the same work, never the same job.
#[derive(Debug)]
pub struct Job {
    /// Tag naming the registered job class that performs this work.
    pub class: String,
    /// Arguments handed to the job class constructor, as plain JSON values.
    pub args: Vec<Value>,
    id: String,
    state: JobState,
    queue: Option<String>,
    queue_time: f64,
}

impl Job {
    pub fn new(class: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            class: class.into(),
            args,
            id: fresh_id(),
            state: JobState::Waiting,
            queue: None,
            queue_time: now_epoch_seconds(),
        }
    }

    /// Replace the generated id, e.g. when a producer tracks its own ids.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    /// The name of the queue this job was popped from, if any. This is a
    /// weak relation: just the name, never a handle on the queue itself.
    pub fn queue(&self) -> Option<&str> {
        self.queue.as_deref()
    }

    pub fn assign_queue(&mut self, queue: impl Into<String>) {
        self.queue = Some(queue.into());
    }

    /// Seconds since the epoch at which this job was enqueued.
    pub fn queue_time(&self) -> f64 {
        self.queue_time
    }

    /// Advance the job state. Only forward transitions are allowed.
    pub fn transition(&mut self, to: JobState) -> Result<(), StateError> {
        if to.rank() <= self.state.rank() {
            return Err(StateError {
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }

    /// The job as its wire-format JSON value.
    pub fn to_value(&self) -> Result<Value, CodecError> {
        Ok(serde_json::to_value(self.payload())?)
    }

    /// Serialize to the wire format.
    pub fn encode(&self) -> Result<String, CodecError> {
        Ok(serde_json::to_string(&self.payload())?)
    }

    /// Deserialize from the wire format. A payload without an id gets a
    /// fresh one; the state always starts over at `Waiting`.
    pub fn decode(payload: &str) -> Result<Self, CodecError> {
        let payload: Payload = serde_json::from_str(payload)?;
        Ok(Self {
            class: payload.class,
            args: payload.args.into_iter().next().unwrap_or_default(),
            id: payload.id,
            state: JobState::Waiting,
            queue: None,
            queue_time: payload.queue_time,
        })
    }

    fn payload(&self) -> Payload {
        Payload {
            class: self.class.clone(),
            args: vec![self.args.clone()],
            id: self.id.clone(),
            queue_time: self.queue_time,
        }
    }
}

impl Clone for Job {
    /// Cloning copies the work but mints a fresh id, so the clone is
    /// enqueueable as a distinct job.
    fn clone(&self) -> Self {
        Self {
            class: self.class.clone(),
            args: self.args.clone(),
            id: fresh_id(),
            state: self.state,
            queue: self.queue.clone(),
            queue_time: self.queue_time,
        }
    }
}

impl PartialEq for Job {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Job {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_encode_decode_round_trip() {
        let job = Job::new("EchoJob", vec![json!({"msg": "hi"}), json!(2)]).with_id("abc");

        let encoded = job.encode().expect("failed to encode job");
        let decoded = Job::decode(&encoded).expect("failed to decode job");

        assert_eq!(decoded.class, "EchoJob");
        assert_eq!(decoded.args, vec![json!({"msg": "hi"}), json!(2)]);
        assert_eq!(decoded.id(), "abc");
        assert_eq!(decoded, job);
    }

    #[test]
    fn test_encoded_args_are_wrapped_in_a_single_element_array() {
        let job = Job::new("EchoJob", vec![json!("a"), json!(1)]);

        let encoded: Value =
            serde_json::from_str(&job.encode().expect("failed to encode job")).unwrap();

        assert_eq!(encoded["args"], json!([["a", 1]]));
        assert!(encoded["queue_time"].as_f64().unwrap() > 0.0);
    }

    #[test]
    fn test_decode_generates_an_id_when_missing() {
        let decoded = Job::decode(r#"{"class": "EchoJob", "args": [[]]}"#)
            .expect("failed to decode job");

        assert!(!decoded.id().is_empty());
        assert_eq!(decoded.queue_time(), 0.0);
        assert_eq!(decoded.state(), JobState::Waiting);
    }

    #[test]
    fn test_decode_rejects_malformed_payloads() {
        assert!(Job::decode("not json").is_err());
        assert!(Job::decode(r#"{"args": [[]]}"#).is_err());
    }

    #[test]
    fn test_clone_mints_a_fresh_id() {
        let job = Job::new("EchoJob", vec![json!(1)]);
        let copy = job.clone();

        assert_ne!(job.id(), copy.id());
        assert_eq!(job.class, copy.class);
        assert_eq!(job.args, copy.args);
        assert_ne!(job, copy);
    }

    #[test]
    fn test_equality_is_by_id_only() {
        let a = Job::new("EchoJob", vec![json!(1)]).with_id("same");
        let b = Job::new("OtherJob", vec![json!(2)]).with_id("same");

        assert_eq!(a, b);
    }

    #[test]
    fn test_state_only_moves_forward() {
        let mut job = Job::new("EchoJob", vec![]);

        job.transition(JobState::Running).expect("waiting to running");
        job.transition(JobState::Complete)
            .expect("running to complete");

        let error = job.transition(JobState::Running).unwrap_err();
        assert_eq!(error.from, JobState::Complete);
        assert_eq!(error.to, JobState::Running);
    }

    #[test]
    fn test_failed_is_terminal() {
        let mut job = Job::new("EchoJob", vec![]);

        job.transition(JobState::Running).expect("waiting to running");
        job.transition(JobState::Failed).expect("running to failed");

        assert!(job.transition(JobState::Complete).is_err());
        assert!(job.transition(JobState::Waiting).is_err());
    }
}
