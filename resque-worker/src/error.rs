use thiserror::Error;

/// Enumeration of errors that stop the worker loop from starting. Errors
/// inside the loop never surface here: job errors route to the failure
/// handler and infrastructure errors are logged and swallowed.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("failed to install signal handlers: {0}")]
    SignalInstall(#[from] std::io::Error),
}
