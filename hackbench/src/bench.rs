//! One complete benchmark run.
//!
//! Every group is built, the orchestrator waits for a readiness marker from
//! each worker, then releases the barrier and times the window until the
//! last worker has been reaped. Setup and teardown fall outside the window.
//!
//! Any failure before or during the window, including an abort, tears the
//! topology down with a forced reap before the error is returned, so no
//! worker outlives [`run`].

use std::fmt;
use std::io;
use std::time::Duration;

use minstant::Instant;

use crate::config::RunConfig;
use crate::error::BenchError;
use crate::group::{GroupSpec, build_group};
use crate::ipc::Barrier;
use crate::signal::AbortSignal;
use crate::trace::{debug, info, warn};
use crate::worker::{Workers, reap_all};

/// Outcome of a successful run.
#[derive(Debug, Clone, Copy)]
pub struct RunResult {
    start: Instant,
    stop: Instant,
    workers: usize,
}

impl RunResult {
    /// Length of the timed window.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.stop.duration_since(self.start)
    }

    /// Number of workers that took part.
    #[must_use]
    pub const fn workers(&self) -> usize {
        self.workers
    }
}

impl fmt::Display for RunResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Time: {:.3} s", self.elapsed().as_secs_f64())
    }
}

/// Runs the benchmark described by `config`.
///
/// `abort` is checked between group builds and polled while waiting for
/// readiness markers and for workers to exit.
///
/// # Errors
///
/// - [`BenchError::Aborted`] once `abort` is raised.
/// - [`BenchError::Invalidated`] if any worker did not exit cleanly.
/// - Any setup error: channel creation, spawn, barrier or real-time request.
pub fn run(config: &RunConfig, abort: &AbortSignal) -> Result<RunResult, BenchError> {
    let mut workers = Workers::new(config.worker_kind)?;
    let mut barrier = Barrier::new(config.channel_kind)?;

    match measure(config, abort, &mut workers, &mut barrier) {
        Ok((start, stop)) => Ok(RunResult {
            start,
            stop,
            workers: workers.len(),
        }),
        Err(err) => {
            // Unreleased waiters see the wake channel close.
            drop(barrier);
            if workers.isolated() && workers.outstanding() > 0 {
                eprintln!("Sending SIGTERM to all child processes");
            }
            if let Err(reap) = reap_all(&mut workers, true, None) {
                warn!("teardown incomplete: {reap}");
            }
            Err(err)
        }
    }
}

/// Builds, releases and reaps; returns the bounds of the timed window.
fn measure(
    config: &RunConfig,
    abort: &AbortSignal,
    workers: &mut Workers,
    barrier: &mut Barrier,
) -> Result<(Instant, Instant), BenchError> {
    let spec = GroupSpec::from(config);
    let handle = barrier.handle();

    for index in 0..config.groups {
        abort.check()?;
        build_group(index, &spec, &handle, workers)?;
    }
    drop(handle);
    debug!("spawned {} workers in {} groups", workers.len(), config.groups);

    if config.realtime {
        set_realtime()?;
    }

    barrier.await_ready(workers.len(), Some(abort))?;
    let start = Instant::now();
    barrier.release_all()?;

    let failed = reap_all(workers, false, Some(abort))?;
    let stop = Instant::now();

    if failed > 0 {
        return Err(BenchError::Invalidated(failed));
    }
    info!(
        "{} workers done in {:?}",
        workers.len(),
        stop.duration_since(start)
    );
    Ok((start, stop))
}

/// Moves the calling thread to `SCHED_FIFO` at the lowest priority.
fn set_realtime() -> Result<(), BenchError> {
    let param = libc::sched_param { sched_priority: 1 };
    // SAFETY: `param` is fully initialised; pid 0 is the caller.
    if unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) } == -1 {
        return Err(BenchError::Realtime(io::Error::last_os_error()));
    }
    debug!("switched to SCHED_FIFO");
    Ok(())
}
