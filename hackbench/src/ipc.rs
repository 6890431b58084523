//! OS channels between workers and the orchestrator.
//!
//! - [`channel`]: stream pipe / socket pair creation and exact-length I/O.
//! - [`barrier`]: readiness report plus one-shot wake broadcast.

pub mod barrier;
pub mod channel;

pub use barrier::{Barrier, BarrierHandle};
pub use channel::{Channel, read_exact, write_all};

use std::io;
use std::os::fd::BorrowedFd;

use rustix::event::{PollFd, PollFlags, poll};
use rustix::io::Errno;

/// Outcome of waiting for a descriptor to become readable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Readiness {
    /// Data is pending and the peer is still open.
    Readable,
    /// The peer hung up or the descriptor is in an error state.
    Closed,
    /// The interrupt descriptor became readable first.
    Interrupted,
}

/// Blocks until `fd` is readable, without consuming anything.
///
/// When `interrupt` is given it is polled alongside `fd` and takes priority.
/// `EINTR` restarts the wait; a signal handler that wants to end it writes to
/// the interrupt descriptor.
pub(crate) fn poll_readable(
    fd: BorrowedFd<'_>,
    interrupt: Option<BorrowedFd<'_>>,
) -> io::Result<Readiness> {
    loop {
        let mut fds = Vec::with_capacity(2);
        fds.push(PollFd::from_borrowed_fd(fd, PollFlags::IN));
        if let Some(interrupt) = interrupt {
            fds.push(PollFd::from_borrowed_fd(interrupt, PollFlags::IN));
        }

        match poll(&mut fds, None) {
            Ok(_) => {}
            Err(Errno::INTR) => continue,
            Err(e) => return Err(e.into()),
        }

        if fds.len() > 1 && fds[1].revents().contains(PollFlags::IN) {
            return Ok(Readiness::Interrupted);
        }

        let revents = fds[0].revents();
        if revents.intersects(PollFlags::HUP | PollFlags::ERR | PollFlags::NVAL) {
            // A socket reports its own EOF as readable, so only queued bytes
            // written before the hang-up count.
            let pending = revents.contains(PollFlags::IN)
                && rustix::io::ioctl_fionread(fd).is_ok_and(|n| n > 0);
            return Ok(if pending {
                Readiness::Readable
            } else {
                Readiness::Closed
            });
        }
        if revents.contains(PollFlags::IN) {
            return Ok(Readiness::Readable);
        }
    }
}
