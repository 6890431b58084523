//! Fatal errors of a benchmark run.

use std::io;

use thiserror::Error;

/// Everything that can end a run without a result.
///
/// None of these are retried: a benchmark is only meaningful when every
/// worker moved its exact message count.
#[derive(Debug, Error)]
pub enum BenchError {
    /// A data, readiness or wake channel could not be created.
    #[error("creating channel: {0}")]
    Channel(io::Error),
    /// A worker process or thread could not be started.
    #[error("spawning worker: {0}")]
    Spawn(io::Error),
    /// The orchestrator's side of the barrier failed.
    #[error("barrier: {0}")]
    Barrier(io::Error),
    /// The one-shot barrier was released a second time.
    #[error("barrier already released")]
    BarrierReleased,
    /// Waiting for a worker failed for a reason other than it being gone.
    #[error("reaping worker: {0}")]
    Reap(io::Error),
    /// The orchestrator could not switch to real-time scheduling.
    #[error("can't change to fifo in main: {0}")]
    Realtime(io::Error),
    /// Termination signal handlers could not be installed.
    #[error("installing signal handlers: {0}")]
    Signals(io::Error),
    /// A termination signal arrived; the run was torn down.
    #[error("signal {0} caught, exiting")]
    Aborted(i32),
    /// Some workers did not exit cleanly, so the timing is meaningless.
    #[error("{0} worker(s) did not exit cleanly, result discarded")]
    Invalidated(usize),
}

impl BenchError {
    /// Process exit status for this error.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        1
    }

    /// Returns `true` if the run was ended by a termination signal.
    #[must_use]
    pub const fn is_abort(&self) -> bool {
        matches!(self, Self::Aborted(_))
    }
}
