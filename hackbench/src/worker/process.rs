//! Workers as forked child processes.
//!
//! The child runs the entry function in its copy of the address space and
//! leaves with `_exit`, so it never unwinds into the parent's stack frames or
//! runs the parent's destructors. In the parent the entry closure is dropped
//! right after `fork`, which closes the parent's copies of every descriptor
//! the closure owns.

use std::io;
use std::os::fd::AsFd;
use std::panic::{self, AssertUnwindSafe};

use rustix::process::{Pid, PidfdFlags, pidfd_open};

use super::{Entry, Exit, Spawner, Worker};
use crate::error::BenchError;
use crate::ipc::{Readiness, poll_readable};
use crate::signal::{AbortSignal, TerminationMask, reset_worker_signals};
use crate::trace::{error, trace, warn};

/// Exit status of a child whose entry function failed.
const EXIT_FAILED: i32 = 1;
/// Exit status of a child whose entry function panicked.
const EXIT_PANICKED: i32 = 101;

/// Spawns each worker in a forked child process.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessSpawner;

impl ProcessSpawner {
    /// Forks a child running `entry`.
    ///
    /// Termination signals are blocked across the fork, so a signal aimed at
    /// a brand-new child is only delivered after it has restored the default
    /// dispositions and is not swallowed by the inherited handler.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the signal mask cannot be changed or the
    /// fork fails.
    pub fn fork(&self, label: String, entry: Entry) -> io::Result<ProcessWorker> {
        let mask = TerminationMask::block()?;

        // SAFETY: the child only runs `entry` and then `_exit`s.
        match unsafe { libc::fork() } {
            -1 => Err(io::Error::last_os_error()),
            0 => {
                reset_worker_signals();
                drop(mask);
                run_child(&label, entry)
            }
            pid => {
                drop(mask);
                // The child owns these descriptors now.
                drop(entry);
                trace!("spawned {label} as pid {pid}");
                Ok(ProcessWorker { pid, label })
            }
        }
    }
}

impl Spawner for ProcessSpawner {
    fn spawn(&self, label: String, entry: Entry) -> io::Result<Box<dyn Worker>> {
        Ok(Box::new(self.fork(label, entry)?))
    }

    fn isolated(&self) -> bool {
        true
    }
}

fn run_child(label: &str, entry: Entry) -> ! {
    let status = match panic::catch_unwind(AssertUnwindSafe(entry)) {
        Ok(Ok(())) => 0,
        Ok(Err(err)) => {
            error!("{label}: {err}");
            EXIT_FAILED
        }
        Err(_) => EXIT_PANICKED,
    };

    // SAFETY: terminates the child without touching the parent's state.
    unsafe { libc::_exit(status) }
}

/// A forked worker, identified by its pid.
#[derive(Debug)]
pub struct ProcessWorker {
    pid: libc::pid_t,
    label: String,
}

impl ProcessWorker {
    /// Process id of the child.
    #[must_use]
    pub const fn pid(&self) -> libc::pid_t {
        self.pid
    }

    /// Blocks until the child has exited or `abort` is raised, without
    /// reaping it.
    ///
    /// A signal that lands between an abort check and a blocking `waitpid`
    /// would otherwise go unnoticed until the child exits on its own.
    /// Without pidfd support, or for a child that is already gone, this
    /// returns at once and `waitpid` plus `EINTR` does the waiting.
    fn await_exit(&self, abort: &AbortSignal) -> Result<(), BenchError> {
        abort.check()?;

        let Some(pid) = Pid::from_raw(self.pid) else {
            return Ok(());
        };
        let Ok(pidfd) = pidfd_open(pid, PidfdFlags::empty()) else {
            return Ok(());
        };

        loop {
            let readiness =
                poll_readable(pidfd.as_fd(), Some(abort.as_fd())).map_err(BenchError::Reap)?;
            if readiness != Readiness::Interrupted {
                return Ok(());
            }
            abort.check()?;
        }
    }
}

impl Worker for ProcessWorker {
    fn label(&self) -> &str {
        &self.label
    }

    fn terminate(&mut self) {
        // SAFETY: plain syscall; a stale pid only yields ESRCH.
        unsafe {
            libc::kill(self.pid, libc::SIGTERM);
        }
    }

    fn reap(&mut self, abort: Option<&AbortSignal>) -> Result<Exit, BenchError> {
        if let Some(abort) = abort {
            self.await_exit(abort)?;
        }

        let mut status = 0;
        loop {
            // SAFETY: `status` is a valid out-pointer.
            let rc = unsafe { libc::waitpid(self.pid, &mut status, 0) };
            if rc == self.pid {
                break;
            }

            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => {
                    if let Some(abort) = abort {
                        abort.check()?;
                    }
                }
                Some(libc::ECHILD) => return Ok(Exit::Missing),
                _ => return Err(BenchError::Reap(err)),
            }
        }

        if libc::WIFEXITED(status) && libc::WEXITSTATUS(status) == 0 {
            return Ok(Exit::Clean);
        }
        if libc::WIFSIGNALED(status) {
            warn!("{} killed by signal {}", self.label, libc::WTERMSIG(status));
        } else {
            warn!("{} exited with status {}", self.label, libc::WEXITSTATUS(status));
        }
        Ok(Exit::Failed)
    }
}
