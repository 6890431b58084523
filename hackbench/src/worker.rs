//! Worker spawning and the worker table.
//!
//! A worker runs one entry function to completion, either in a forked child
//! ([`ProcessSpawner`]) or on an OS thread ([`ThreadSpawner`]). The kind is
//! picked once per run; everything above this module only sees the
//! [`Spawner`] and [`Worker`] capabilities.
//!
//! [`Workers`] is the orchestrator-owned table. It is append-only while the
//! groups are built and is drained front to back by [`reap_all`], which keeps
//! a cursor so a reap interrupted by an abort resumes at the first worker that
//! has not been reaped yet.

mod process;
mod reap;
mod thread;

pub use process::ProcessSpawner;
pub use reap::reap_all;
pub use thread::ThreadSpawner;

use std::io;

use crate::config::WorkerKind;
use crate::error::BenchError;
use crate::signal::AbortSignal;

/// Work executed by one worker. Errors make the worker exit uncleanly.
pub type Entry = Box<dyn FnOnce() -> io::Result<()> + Send + 'static>;

/// How a worker ended, as observed by the reaper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// Entry function returned `Ok`.
    Clean,
    /// Entry failed, panicked, or the process died from a signal.
    Failed,
    /// Already reaped elsewhere; nothing left to wait for.
    Missing,
    /// Still running when a forced reap gave up on it.
    Abandoned,
}

impl Exit {
    /// Returns `true` for exits that count against the run.
    #[must_use]
    pub const fn is_failure(self) -> bool {
        matches!(self, Self::Failed | Self::Abandoned)
    }
}

/// A spawned unit of execution.
pub trait Worker: Send {
    /// Label used in diagnostics.
    fn label(&self) -> &str;

    /// Requests termination. Best effort; threads cannot be preempted.
    fn terminate(&mut self);

    /// Blocks until the worker has terminated and releases its resources.
    ///
    /// With an `abort` signal the wait ends early with
    /// [`BenchError::Aborted`]; the worker is then left unreaped.
    ///
    /// # Errors
    ///
    /// [`BenchError::Aborted`] when interrupted, [`BenchError::Reap`] when
    /// the OS wait itself fails.
    fn reap(&mut self, abort: Option<&AbortSignal>) -> Result<Exit, BenchError>;
}

/// Launches workers of one kind.
pub trait Spawner {
    /// Starts `entry` on a new worker.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the process or thread cannot be created.
    fn spawn(&self, label: String, entry: Entry) -> io::Result<Box<dyn Worker>>;

    /// Returns `true` if each worker gets its own copy of the descriptor
    /// table, so descriptors open at spawn time stay open in the worker
    /// until it closes them.
    fn isolated(&self) -> bool {
        false
    }
}

/// Returns the spawner for `kind`.
///
/// # Errors
///
/// Returns [`BenchError::Spawn`] if the spawner's bookkeeping channel cannot
/// be created.
pub fn spawner(kind: WorkerKind) -> Result<Box<dyn Spawner>, BenchError> {
    Ok(match kind {
        WorkerKind::Process => Box::new(ProcessSpawner),
        WorkerKind::Thread => Box::new(ThreadSpawner::new().map_err(BenchError::Spawn)?),
    })
}

/// The table of every worker spawned during a run, in spawn order.
pub struct Workers {
    spawner: Box<dyn Spawner>,
    table: Vec<Box<dyn Worker>>,
    /// Workers before this index have been reaped.
    reaped: usize,
}

impl Workers {
    /// Creates an empty table spawning workers of `kind`.
    ///
    /// # Errors
    ///
    /// See [`spawner`].
    pub fn new(kind: WorkerKind) -> Result<Self, BenchError> {
        Ok(Self::with_spawner(spawner(kind)?))
    }

    /// Creates an empty table around an existing spawner.
    #[must_use]
    pub fn with_spawner(spawner: Box<dyn Spawner>) -> Self {
        Self {
            spawner,
            table: Vec::new(),
            reaped: 0,
        }
    }

    /// Spawns a worker and appends it to the table.
    ///
    /// # Errors
    ///
    /// Returns [`BenchError::Spawn`]. The table is unchanged in that case.
    pub fn spawn(&mut self, label: String, entry: Entry) -> Result<(), BenchError> {
        let worker = self.spawner.spawn(label, entry).map_err(BenchError::Spawn)?;
        self.table.push(worker);
        Ok(())
    }

    /// See [`Spawner::isolated`].
    #[must_use]
    pub fn isolated(&self) -> bool {
        self.spawner.isolated()
    }

    #[cfg(test)]
    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Box<dyn Worker>> {
        self.table.iter_mut()
    }

    /// Number of workers ever spawned.
    #[must_use]
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Returns `true` if nothing was spawned.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Number of workers not reaped yet.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.table.len() - self.reaped
    }
}

impl std::fmt::Debug for Workers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workers")
            .field("spawned", &self.table.len())
            .field("reaped", &self.reaped)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Refuses every spawn, like a process hitting its task limit.
    struct Exhausted;

    impl Spawner for Exhausted {
        fn spawn(&self, _label: String, _entry: Entry) -> io::Result<Box<dyn Worker>> {
            Err(io::Error::from_raw_os_error(libc::EAGAIN))
        }
    }

    #[test]
    fn failed_spawn_leaves_the_table_unchanged() {
        let mut workers = Workers::with_spawner(Box::new(Exhausted));
        let err = workers.spawn("w".into(), Box::new(|| Ok(()))).unwrap_err();

        assert!(matches!(err, BenchError::Spawn(_)));
        assert!(workers.is_empty());
        assert_eq!(workers.outstanding(), 0);
    }

    #[test]
    fn only_real_failures_count() {
        assert!(!Exit::Clean.is_failure());
        assert!(!Exit::Missing.is_failure());
        assert!(Exit::Failed.is_failure());
        assert!(Exit::Abandoned.is_failure());
    }
}
