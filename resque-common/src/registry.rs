//! # Registry
//!
//! Turns a job descriptor into something runnable. Applications register a
//! constructor per class tag; the worker only ever sees the `Perform`
//! capability.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::job::Job;

/// The error a job raises from `perform`. `kind` is the stable name that
/// lands in the failure log's `exception` field (e.g. `RuntimeError`).
#[derive(Error, Debug)]
#[error("{message}")]
pub struct PerformError {
    pub kind: String,
    pub message: String,
    pub backtrace: Vec<String>,
}

impl PerformError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            backtrace: Vec::new(),
        }
    }

    pub fn with_backtrace(mut self, backtrace: Vec<String>) -> Self {
        self.backtrace = backtrace;
        self
    }
}

/// The single capability a runnable job exposes. Success is the absence of
/// an error.
#[async_trait]
pub trait Perform: Send + Sync {
    async fn perform(&self) -> Result<(), PerformError>;
}

/// Enumeration of errors for materialising jobs. Both variants surface as
/// `invalid-job` failures.
#[derive(Error, Debug)]
pub enum FactoryError {
    #[error("no job class registered for {0}")]
    UnknownClass(String),
    #[error("job class {class} rejected its arguments: {reason}")]
    Unconstructible { class: String, reason: String },
}

type Constructor = Box<dyn Fn(&[Value]) -> Result<Box<dyn Perform>, FactoryError> + Send + Sync>;

/// Maps class tags to job constructors. The shape of the arguments is each
/// constructor's concern, not the worker's.
#[derive(Default)]
pub struct JobRegistry {
    constructors: HashMap<String, Constructor>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `constructor` under `class`. Registering the same class
    /// again replaces the earlier constructor.
    pub fn register<F>(&mut self, class: impl Into<String>, constructor: F)
    where
        F: Fn(&[Value]) -> Result<Box<dyn Perform>, FactoryError> + Send + Sync + 'static,
    {
        self.constructors.insert(class.into(), Box::new(constructor));
    }

    /// Materialise the runnable for `job`.
    pub fn create(&self, job: &Job) -> Result<Box<dyn Perform>, FactoryError> {
        let constructor = self
            .constructors
            .get(&job.class)
            .ok_or_else(|| FactoryError::UnknownClass(job.class.clone()))?;
        constructor(&job.args)
    }

    pub fn contains(&self, class: &str) -> bool {
        self.constructors.contains_key(class)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Shout {
        message: String,
    }

    #[async_trait]
    impl Perform for Shout {
        async fn perform(&self) -> Result<(), PerformError> {
            if self.message.is_empty() {
                return Err(PerformError::new("RuntimeError", "nothing to shout"));
            }
            Ok(())
        }
    }

    fn registry() -> JobRegistry {
        let mut registry = JobRegistry::new();
        registry.register("Shout", |args| {
            let message = args
                .first()
                .and_then(Value::as_str)
                .ok_or_else(|| FactoryError::Unconstructible {
                    class: "Shout".to_owned(),
                    reason: "first argument must be a string".to_owned(),
                })?
                .to_owned();
            Ok(Box::new(Shout { message }))
        });
        registry
    }

    #[tokio::test]
    async fn test_create_and_perform() {
        let registry = registry();
        let job = Job::new("Shout", vec![json!("hello")]);

        let task = registry.create(&job).expect("job should materialise");
        task.perform().await.expect("perform should succeed");
    }

    #[tokio::test]
    async fn test_perform_errors_carry_kind_and_message() {
        let registry = registry();
        let job = Job::new("Shout", vec![json!("")]);

        let task = registry.create(&job).unwrap();
        let error = task.perform().await.unwrap_err();

        assert_eq!(error.kind, "RuntimeError");
        assert_eq!(error.to_string(), "nothing to shout");
    }

    #[test]
    fn test_unknown_class_is_rejected() {
        let registry = registry();
        let job = Job::new("Missing", vec![]);

        let error = registry.create(&job).err().unwrap();
        assert!(matches!(error, FactoryError::UnknownClass(class) if class == "Missing"));
    }

    #[test]
    fn test_bad_arguments_are_rejected() {
        let registry = registry();
        let job = Job::new("Shout", vec![json!(42)]);

        let error = registry.create(&job).err().unwrap();
        assert!(matches!(error, FactoryError::Unconstructible { .. }));
    }

    #[test]
    fn test_registering_twice_replaces() {
        let mut registry = registry();
        assert!(registry.contains("Shout"));

        registry.register("Shout", |_| {
            Err(FactoryError::Unconstructible {
                class: "Shout".to_owned(),
                reason: "disabled".to_owned(),
            })
        });

        let error = registry.create(&Job::new("Shout", vec![json!("hi")])).err().unwrap();
        assert!(matches!(error, FactoryError::Unconstructible { .. }));
    }
}
