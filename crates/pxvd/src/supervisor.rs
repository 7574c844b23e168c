//! Child process supervision.
//!
//! The controller launches the proxy (and helpers) through
//! [`ProcessSupervisor`] and kills everything at once on stop. Both calls
//! are synchronous; async callers wrap `kill_all` in `spawn_blocking`.

use std::process::{Child, Command, Stdio};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

/// Starts tracked children and kills them all on demand.
pub trait ProcessSupervisor: Send + Sync {
    /// Spawns `argv[0]` with the remaining arguments. Returns the child pid.
    fn start(&self, argv: Vec<String>) -> Result<u32, LaunchError>;

    /// Terminates every tracked child and waits for it. Idempotent.
    fn kill_all(&self);

    /// Number of children currently tracked.
    fn tracked(&self) -> usize;
}

/// Errors that can occur launching a child process.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("Empty command line")]
    EmptyCommand,

    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Time a child gets to exit after SIGTERM before it is killed.
pub const DEFAULT_GRACE: Duration = Duration::from_millis(500);

const POLL_INTERVAL: Duration = Duration::from_millis(20);

struct Tracked {
    program: String,
    child: Child,
}

/// [`ProcessSupervisor`] backed by `std::process`.
pub struct ProcessPool {
    children: Mutex<Vec<Tracked>>,
    grace: Duration,
}

impl ProcessPool {
    pub fn new() -> Self {
        Self::with_grace(DEFAULT_GRACE)
    }

    pub fn with_grace(grace: Duration) -> Self {
        Self {
            children: Mutex::new(Vec::new()),
            grace,
        }
    }

    fn terminate(&self, tracked: &mut Tracked) {
        let pid = tracked.child.id();
        match tracked.child.try_wait() {
            Ok(Some(status)) => {
                debug!(pid, program = %tracked.program, %status, "Child already exited");
                return;
            }
            Ok(None) => {}
            Err(e) => warn!(pid, error = %e, "Failed to poll child"),
        }

        // SAFETY: kill(2) with a pid we spawned and still own; no memory is touched.
        let result = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if result != 0 {
            debug!(pid, "SIGTERM failed, falling back to SIGKILL");
        } else {
            let deadline = Instant::now() + self.grace;
            while Instant::now() < deadline {
                if let Ok(Some(status)) = tracked.child.try_wait() {
                    debug!(pid, program = %tracked.program, %status, "Child exited");
                    return;
                }
                std::thread::sleep(POLL_INTERVAL);
            }
        }

        if let Err(e) = tracked.child.kill() {
            warn!(pid, program = %tracked.program, error = %e, "Failed to kill child");
        }
        if let Err(e) = tracked.child.wait() {
            warn!(pid, program = %tracked.program, error = %e, "Failed to reap child");
        }
    }
}

impl Default for ProcessPool {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessSupervisor for ProcessPool {
    fn start(&self, argv: Vec<String>) -> Result<u32, LaunchError> {
        let mut args = argv.into_iter();
        let program = args.next().ok_or(LaunchError::EmptyCommand)?;

        let child = Command::new(&program)
            .args(args)
            .stdin(Stdio::null())
            .spawn()
            .map_err(|source| LaunchError::Spawn {
                program: program.clone(),
                source,
            })?;

        let pid = child.id();
        info!(pid, program = %program, "Started child process");
        self.children
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Tracked { program, child });
        Ok(pid)
    }

    fn kill_all(&self) {
        let drained: Vec<Tracked> = std::mem::take(
            &mut *self.children.lock().unwrap_or_else(PoisonError::into_inner),
        );
        if drained.is_empty() {
            return;
        }
        let count = drained.len();
        for mut tracked in drained {
            self.terminate(&mut tracked);
        }
        info!(count, "Killed tracked processes");
    }

    fn tracked(&self) -> usize {
        self.children
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
