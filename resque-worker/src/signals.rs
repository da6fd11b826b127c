//! Signal-driven worker state.
//!
//! OS signal handlers only ever flip the atomic flags in [`Flags`]; the
//! worker loop reads them at its checkpoints. Nothing here allocates or
//! logs from a handler context: the tokio signal driver hands deliveries to
//! an ordinary task, which does the flag writes.
//!
//! Signal map: TERM and INT force shutdown (current child is killed), QUIT
//! shuts down gracefully, USR1 kills the current child, USR2 pauses, CONT
//! resumes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// The worker's asynchronous state, shared with the signal router and with
/// anything else that wants to steer the worker (tests, embedders).
#[derive(Debug, Default)]
pub struct Flags {
    shutdown: AtomicBool,
    paused: AtomicBool,
    kill_child: AtomicBool,
}

impl Flags {
    pub fn shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Stop the loop after the in-flight job finishes.
    pub fn request_graceful_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Stop the loop and kill any in-flight child; its job is recorded as a
    /// dirty exit.
    pub fn request_forced_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.kill_child.store(true, Ordering::SeqCst);
    }

    pub fn paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn request_kill_child(&self) {
        self.kill_child.store(true, Ordering::SeqCst);
    }

    /// Consume a pending kill-child request. The request stays pending until
    /// a child is there to receive it.
    pub fn take_kill_child(&self) -> bool {
        self.kill_child.swap(false, Ordering::SeqCst)
    }

    pub fn kill_child_requested(&self) -> bool {
        self.kill_child.load(Ordering::SeqCst)
    }
}

/// Route OS signals to `flags`. The listener task runs for the life of the
/// process.
#[cfg(unix)]
pub fn install(flags: Arc<Flags>) -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    use tracing::info;

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigquit = signal(SignalKind::quit())?;
    let mut sigusr1 = signal(SignalKind::user_defined1())?;
    let mut sigusr2 = signal(SignalKind::user_defined2())?;
    let mut sigcont = signal(SignalKind::from_raw(libc::SIGCONT))?;

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("received SIGTERM, shutting down now");
                    flags.request_forced_shutdown();
                }
                _ = sigint.recv() => {
                    info!("received SIGINT, shutting down now");
                    flags.request_forced_shutdown();
                }
                _ = sigquit.recv() => {
                    info!("received SIGQUIT, shutting down once the current job finishes");
                    flags.request_graceful_shutdown();
                }
                _ = sigusr1.recv() => {
                    info!("received SIGUSR1, killing the current job child");
                    flags.request_kill_child();
                }
                _ = sigusr2.recv() => {
                    info!("received SIGUSR2, pausing");
                    flags.pause();
                }
                _ = sigcont.recv() => {
                    info!("received SIGCONT, resuming");
                    flags.resume();
                }
            }
        }
    });

    Ok(())
}

/// Signals cannot be routed on this platform; the worker still runs, its
/// state just cannot be changed from outside the process.
#[cfg(not(unix))]
pub fn install(_flags: Arc<Flags>) -> std::io::Result<()> {
    tracing::warn!("signal handling is unsupported on this platform, skipping registration");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forced_shutdown_also_requests_a_child_kill() {
        let flags = Flags::default();

        flags.request_forced_shutdown();

        assert!(flags.shutdown());
        assert!(flags.kill_child_requested());
    }

    #[test]
    fn test_graceful_shutdown_leaves_the_child_alone() {
        let flags = Flags::default();

        flags.request_graceful_shutdown();

        assert!(flags.shutdown());
        assert!(!flags.kill_child_requested());
    }

    #[test]
    fn test_pause_and_resume_round_trip() {
        let flags = Flags::default();

        flags.pause();
        assert!(flags.paused());
        flags.resume();
        assert!(!flags.paused());
    }

    #[test]
    fn test_kill_child_request_is_consumed_once() {
        let flags = Flags::default();

        flags.request_kill_child();

        assert!(flags.take_kill_child());
        assert!(!flags.take_kill_child());
    }
}
