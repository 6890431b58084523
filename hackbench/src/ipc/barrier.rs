//! Start barrier: readiness report plus one-shot wake broadcast.
//!
//! Every worker writes one marker to the readiness channel once its setup is
//! done, then waits for the wake channel to become readable. The orchestrator
//! counts one marker per spawned worker and writes a single marker to the wake
//! channel.
//!
//! Workers only *test* the wake channel for readability and never read it, so
//! the one wake marker stays pending and releases any number of waiters at
//! once. The flip side is that the barrier cannot be reused: after
//! [`Barrier::release_all`] every later wait returns immediately.
//!
//! ```text
//!  worker ──ready──> [readiness channel] ──> orchestrator counts N markers
//!  worker <──poll─── [ wake channel    ] <── orchestrator writes 1 marker
//! ```

use std::io::{self, ErrorKind};
use std::os::fd::{AsFd, OwnedFd};
use std::sync::Arc;

use rustix::io::Errno;

use super::channel::{Channel, write_all};
use super::{Readiness, poll_readable};
use crate::config::ChannelKind;
use crate::error::BenchError;
use crate::signal::AbortSignal;
use crate::trace::debug;

const MARKER: u8 = b'*';

/// Readiness markers drained per read while waiting for workers.
const DRAIN_CHUNK: usize = 256;

/// Orchestrator side of the barrier.
#[derive(Debug)]
pub struct Barrier {
    ready_rx: OwnedFd,
    wake_tx: OwnedFd,
    handle: BarrierHandle,
    released: bool,
}

/// Worker side of the barrier.
///
/// Cloning is cheap; every worker gets its own clone.
#[derive(Debug, Clone)]
pub struct BarrierHandle {
    ready_tx: Arc<OwnedFd>,
    wake_rx: Arc<OwnedFd>,
}

impl Barrier {
    /// Creates the readiness and wake channels.
    ///
    /// # Errors
    ///
    /// Returns [`BenchError::Channel`] if either channel cannot be created.
    pub fn new(kind: ChannelKind) -> Result<Self, BenchError> {
        let (ready_rx, ready_tx) = Channel::create(kind)?.into_parts();
        let (wake_rx, wake_tx) = Channel::create(kind)?.into_parts();

        Ok(Self {
            ready_rx,
            wake_tx,
            handle: BarrierHandle {
                ready_tx: Arc::new(ready_tx),
                wake_rx: Arc::new(wake_rx),
            },
            released: false,
        })
    }

    /// Returns a handle to pass to a worker.
    #[must_use]
    pub fn handle(&self) -> BarrierHandle {
        self.handle.clone()
    }

    /// Returns `true` once [`release_all`](Self::release_all) succeeded.
    #[must_use]
    pub const fn is_released(&self) -> bool {
        self.released
    }

    /// Blocks until `workers` readiness markers have arrived.
    ///
    /// With an `abort` signal the wait also ends as soon as it is raised.
    ///
    /// # Errors
    ///
    /// - [`BenchError::Aborted`] if `abort` was raised first.
    /// - [`BenchError::Barrier`] if the readiness channel fails or closes.
    pub fn await_ready(
        &self,
        workers: usize,
        abort: Option<&AbortSignal>,
    ) -> Result<(), BenchError> {
        let mut buf = [0u8; DRAIN_CHUNK];
        let mut seen = 0;

        while seen < workers {
            if let Some(abort) = abort {
                abort.check()?;
            }

            let readiness = poll_readable(
                self.ready_rx.as_fd(),
                abort.map(|abort| abort.as_fd()),
            )
            .map_err(BenchError::Barrier)?;

            match readiness {
                Readiness::Interrupted => continue,
                Readiness::Closed => {
                    return Err(BenchError::Barrier(io::Error::new(
                        ErrorKind::BrokenPipe,
                        format!("readiness channel closed after {seen} of {workers} workers"),
                    )));
                }
                Readiness::Readable => {}
            }

            // Never read past the markers we are waiting for.
            let want = (workers - seen).min(DRAIN_CHUNK);
            match rustix::io::read(&self.ready_rx, &mut buf[..want]) {
                Ok(0) => {
                    return Err(BenchError::Barrier(ErrorKind::UnexpectedEof.into()));
                }
                Ok(n) => seen += n,
                Err(Errno::INTR) => {}
                Err(e) => return Err(BenchError::Barrier(e.into())),
            }
        }

        debug!("all {workers} workers reported ready");
        Ok(())
    }

    /// Wakes every worker blocked in [`BarrierHandle::report_ready`].
    ///
    /// # Errors
    ///
    /// - [`BenchError::BarrierReleased`] if the barrier was already released.
    /// - [`BenchError::Barrier`] if the wake marker cannot be written.
    pub fn release_all(&mut self) -> Result<(), BenchError> {
        if self.released {
            return Err(BenchError::BarrierReleased);
        }
        write_all(&self.wake_tx, &[MARKER]).map_err(BenchError::Barrier)?;
        self.released = true;
        debug!("barrier released");
        Ok(())
    }
}

impl BarrierHandle {
    /// Reports this worker ready and blocks until the barrier is released.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::BrokenPipe`] if the orchestrator dropped the
    /// barrier without releasing it, or the OS error of the marker write.
    pub fn report_ready(&self) -> io::Result<()> {
        write_all(&*self.ready_tx, &[MARKER])?;

        loop {
            match poll_readable(self.wake_rx.as_fd(), None)? {
                Readiness::Readable => return Ok(()),
                Readiness::Closed => {
                    return Err(io::Error::new(
                        ErrorKind::BrokenPipe,
                        "barrier dropped before release",
                    ));
                }
                Readiness::Interrupted => {}
            }
        }
    }
}
