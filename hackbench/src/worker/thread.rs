//! Workers as OS threads.
//!
//! Threads share the orchestrator's descriptors, so nothing is duplicated and
//! nothing needs closing after spawn. `JoinHandle::join` cannot be
//! interrupted, so every thread also announces its exit on a shared exit
//! channel: the reaper polls that channel next to the abort pipe and only
//! joins a thread once it has flagged itself done.

use std::io;
use std::os::fd::{AsFd, OwnedFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use rustix::pipe::{PipeFlags, pipe_with};

use super::{Entry, Exit, Spawner, Worker};
use crate::error::BenchError;
use crate::ipc::{Readiness, poll_readable};
use crate::signal::AbortSignal;
use crate::trace::{debug, trace, warn};

/// Stack size of worker threads. Message buffers live on the heap.
pub const WORKER_STACK_SIZE: usize = if libc::PTHREAD_STACK_MIN > 64 * 1024 {
    libc::PTHREAD_STACK_MIN
} else {
    64 * 1024
};

const EXIT_MARKER: u8 = b'x';

/// Non-blocking pipe carrying one marker per finished thread.
#[derive(Debug)]
struct ExitChannel {
    rx: OwnedFd,
    tx: OwnedFd,
}

impl ExitChannel {
    fn new() -> io::Result<Self> {
        let (rx, tx) = pipe_with(PipeFlags::NONBLOCK | PipeFlags::CLOEXEC)?;
        Ok(Self { rx, tx })
    }

    /// Blocks until at least one exit marker is pending, then drains them.
    fn wait(&self, abort: Option<&AbortSignal>) -> Result<(), BenchError> {
        if let Some(abort) = abort {
            abort.check()?;
        }

        let readiness = poll_readable(self.rx.as_fd(), abort.map(|abort| abort.as_fd()))
            .map_err(BenchError::Reap)?;
        if readiness == Readiness::Interrupted {
            if let Some(abort) = abort {
                abort.check()?;
            }
        }

        let mut buf = [0u8; 64];
        while matches!(rustix::io::read(&self.rx, &mut buf), Ok(n) if n > 0) {}
        Ok(())
    }

    fn notify(&self) {
        // A full pipe already guarantees a pending wake-up.
        let _ = rustix::io::write(&self.tx, &[EXIT_MARKER]);
    }
}

/// Flags the thread done and posts its exit marker, even on panic.
struct ExitNotice {
    done: Arc<AtomicBool>,
    exits: Arc<ExitChannel>,
}

impl Drop for ExitNotice {
    fn drop(&mut self) {
        self.done.store(true, Ordering::Release);
        self.exits.notify();
    }
}

/// Spawns each worker on a small-stack OS thread.
#[derive(Debug)]
pub struct ThreadSpawner {
    exits: Arc<ExitChannel>,
}

impl ThreadSpawner {
    /// Creates a spawner and its exit channel.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the exit channel cannot be created.
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            exits: Arc::new(ExitChannel::new()?),
        })
    }

    /// Starts `entry` on a new thread named `label`.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the thread cannot be created.
    pub fn start(&self, label: String, entry: Entry) -> io::Result<ThreadWorker> {
        let done = Arc::new(AtomicBool::new(false));
        let notice = ExitNotice {
            done: Arc::clone(&done),
            exits: Arc::clone(&self.exits),
        };

        let join = thread::Builder::new()
            .name(label.clone())
            .stack_size(WORKER_STACK_SIZE)
            .spawn(move || {
                let _notice = notice;
                entry()
            })?;
        trace!("spawned {label}");

        Ok(ThreadWorker {
            join: Some(join),
            done,
            exits: Arc::clone(&self.exits),
            label,
            abandoned: false,
        })
    }
}

impl Spawner for ThreadSpawner {
    fn spawn(&self, label: String, entry: Entry) -> io::Result<Box<dyn Worker>> {
        Ok(Box::new(self.start(label, entry)?))
    }
}

/// A worker thread.
#[derive(Debug)]
pub struct ThreadWorker {
    join: Option<JoinHandle<io::Result<()>>>,
    done: Arc<AtomicBool>,
    exits: Arc<ExitChannel>,
    label: String,
    abandoned: bool,
}

impl ThreadWorker {
    /// Returns `true` once the entry function has returned or unwound.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }
}

impl Worker for ThreadWorker {
    fn label(&self) -> &str {
        &self.label
    }

    fn terminate(&mut self) {
        // Threads cannot be killed; a forced reap stops waiting for this one
        // and process exit tears it down.
        self.abandoned = true;
    }

    fn reap(&mut self, abort: Option<&AbortSignal>) -> Result<Exit, BenchError> {
        while !self.is_done() {
            if self.abandoned {
                debug!("abandoning {}", self.label);
                // Dropping the handle detaches the thread.
                self.join = None;
                return Ok(Exit::Abandoned);
            }
            self.exits.wait(abort)?;
        }

        let Some(join) = self.join.take() else {
            return Ok(Exit::Missing);
        };
        match join.join() {
            Ok(Ok(())) => Ok(Exit::Clean),
            Ok(Err(err)) => {
                warn!("{} failed: {err}", self.label);
                Ok(Exit::Failed)
            }
            Err(_) => {
                warn!("{} panicked", self.label);
                Ok(Exit::Failed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::config::ChannelKind;
    use crate::ipc::{Channel, read_exact, write_all};

    #[test]
    fn exits_are_classified() {
        let spawner = ThreadSpawner::new().unwrap();
        let mut ok = spawner.start("ok".into(), Box::new(|| Ok(()))).unwrap();
        let mut failed = spawner
            .start("failed".into(), Box::new(|| Err(io::Error::other("boom"))))
            .unwrap();
        let mut panicked = spawner
            .start("panicked".into(), Box::new(|| panic!("worker panic")))
            .unwrap();

        assert_eq!(ok.reap(None).unwrap(), Exit::Clean);
        assert_eq!(failed.reap(None).unwrap(), Exit::Failed);
        assert_eq!(panicked.reap(None).unwrap(), Exit::Failed);
    }

    #[test]
    fn reap_waits_for_a_slow_thread() {
        let spawner = ThreadSpawner::new().unwrap();
        let (reader, writer) = Channel::create(ChannelKind::Pipe).unwrap().into_parts();
        let mut worker = spawner
            .start(
                "slow".into(),
                Box::new(move || {
                    let mut buf = [0u8; 4];
                    read_exact(&reader, &mut buf)
                }),
            )
            .unwrap();

        // Another thread finishing first must not confuse the wait.
        let mut quick = spawner.start("quick".into(), Box::new(|| Ok(()))).unwrap();
        assert_eq!(quick.reap(None).unwrap(), Exit::Clean);
        assert!(!worker.is_done());

        let feeder = thread::spawn(move || {
            thread::sleep(std::time::Duration::from_millis(20));
            write_all(&writer, b"done").unwrap();
        });
        assert_eq!(worker.reap(None).unwrap(), Exit::Clean);
        feeder.join().unwrap();
    }

    #[test]
    fn abort_interrupts_and_terminate_abandons() {
        let spawner = ThreadSpawner::new().unwrap();
        let (reader, writer) = Channel::create(ChannelKind::Pipe).unwrap().into_parts();
        let mut worker = spawner
            .start(
                "stuck".into(),
                Box::new(move || {
                    let mut buf = [0u8; 1];
                    read_exact(&reader, &mut buf)
                }),
            )
            .unwrap();

        let abort = AbortSignal::new().unwrap();
        abort.raise(libc::SIGTERM);
        assert!(matches!(
            worker.reap(Some(&abort)),
            Err(BenchError::Aborted(libc::SIGTERM))
        ));

        worker.terminate();
        assert_eq!(worker.reap(None).unwrap(), Exit::Abandoned);

        // Let the detached thread finish.
        write_all(&writer, b"!").unwrap();
    }
}
