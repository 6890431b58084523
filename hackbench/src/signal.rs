//! Signal-driven abort.
//!
//! The handler does the minimum that is async-signal-safe: it writes the
//! signal number into the [`AbortSignal`] self-pipe and switches `SIGINT` and
//! `SIGTERM` to ignored, so a second signal during teardown is dropped. The
//! orchestrator notices the abort at its suspension points (between groups,
//! while waiting for readiness markers, while reaping) by polling the pipe
//! next to whatever it is blocked on, then runs the forced reap and returns
//! [`BenchError::Aborted`].
//!
//! Handlers are installed without `SA_RESTART`, so a `waitpid` blocked in the
//! orchestrator returns `EINTR` and re-checks the pipe.

use std::io;
use std::marker::PhantomData;
use std::mem;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::ptr;
use std::sync::atomic::{AtomicI32, Ordering};

use rustix::pipe::{PipeFlags, pipe_with};

use crate::error::BenchError;
use crate::trace::warn;

/// Write end of the installed controller's self-pipe, or `-1`.
static ABORT_FD: AtomicI32 = AtomicI32::new(-1);

/// Cooperative abort request, raised by a signal handler or directly.
///
/// Both pipe ends are non-blocking: raising never blocks, checking never
/// waits.
#[derive(Debug)]
pub struct AbortSignal {
    rx: OwnedFd,
    tx: OwnedFd,
    /// Signal number once observed, `0` before.
    caught: AtomicI32,
}

impl AbortSignal {
    /// Creates an abort signal that has not been raised.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the self-pipe cannot be created.
    pub fn new() -> io::Result<Self> {
        let (rx, tx) = pipe_with(PipeFlags::NONBLOCK | PipeFlags::CLOEXEC)?;
        Ok(Self {
            rx,
            tx,
            caught: AtomicI32::new(0),
        })
    }

    /// Requests an abort on behalf of `signal`.
    ///
    /// Only the first request is remembered.
    pub fn raise(&self, signal: i32) {
        let _ = rustix::io::write(&self.tx, &[signal_byte(signal)]);
    }

    /// Returns the signal that raised the abort, if any.
    #[must_use]
    pub fn raised(&self) -> Option<i32> {
        self.check().err().and_then(|err| match err {
            BenchError::Aborted(signal) => Some(signal),
            _ => None,
        })
    }

    /// Returns [`BenchError::Aborted`] once an abort has been raised.
    ///
    /// # Errors
    ///
    /// Fails exactly when the abort was raised.
    pub fn check(&self) -> Result<(), BenchError> {
        let caught = self.caught.load(Ordering::Acquire);
        if caught != 0 {
            return Err(BenchError::Aborted(caught));
        }

        let mut byte = [0u8; 1];
        match rustix::io::read(&self.rx, &mut byte) {
            Ok(1) => {
                let signal = i32::from(byte[0]);
                let first = match self.caught.compare_exchange(
                    0,
                    signal,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => signal,
                    Err(earlier) => earlier,
                };
                warn!("abort raised by signal {first}");
                Err(BenchError::Aborted(first))
            }
            _ => Ok(()),
        }
    }
}

impl AsFd for AbortSignal {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.rx.as_fd()
    }
}

/// Zero is reserved for "not raised".
fn signal_byte(signal: i32) -> u8 {
    u8::try_from(signal).ok().filter(|&b| b != 0).unwrap_or(u8::MAX)
}

/// Installed termination-signal handlers.
///
/// Borrows the [`AbortSignal`] the handler writes to, so the pipe cannot be
/// closed while the handler may still fire. Dropping the controller puts
/// back the dispositions that were in place before [`install`], so an
/// inherited `SIG_IGN` (as under `nohup`) survives the run.
///
/// [`install`]: SignalController::install
pub struct SignalController<'a> {
    previous: Vec<(libc::c_int, libc::sigaction)>,
    _abort: PhantomData<&'a AbortSignal>,
}

impl<'a> SignalController<'a> {
    /// Routes `SIGINT` and `SIGTERM` to `abort` and ignores `SIGHUP`.
    ///
    /// # Errors
    ///
    /// Returns [`BenchError::Signals`] if a disposition cannot be changed.
    /// Dispositions changed before the failure are restored.
    pub fn install(abort: &'a AbortSignal) -> Result<Self, BenchError> {
        ABORT_FD.store(abort.tx.as_raw_fd(), Ordering::SeqCst);

        let mut controller = Self {
            previous: Vec::with_capacity(3),
            _abort: PhantomData,
        };
        let handler = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
        for (signal, disposition) in [
            (libc::SIGINT, handler),
            (libc::SIGTERM, handler),
            (libc::SIGHUP, libc::SIG_IGN),
        ] {
            let previous = swap_disposition(signal, disposition).map_err(BenchError::Signals)?;
            controller.previous.push((signal, previous));
        }
        Ok(controller)
    }
}

impl Drop for SignalController<'_> {
    fn drop(&mut self) {
        for (signal, previous) in self.previous.drain(..).rev() {
            // SAFETY: `previous` was filled in by the kernel in `install`.
            unsafe {
                libc::sigaction(signal, &previous, ptr::null_mut());
            }
        }
        ABORT_FD.store(-1, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for SignalController<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let signals: Vec<_> = self.previous.iter().map(|(signal, _)| signal).collect();
        f.debug_struct("SignalController")
            .field("signals", &signals)
            .finish()
    }
}

extern "C" fn on_signal(signal: libc::c_int) {
    // SAFETY: only async-signal-safe calls below; errno is restored so the
    // interrupted code sees its own error value.
    unsafe {
        let errno = *libc::__errno_location();

        let fd = ABORT_FD.load(Ordering::SeqCst);
        if fd >= 0 {
            let byte = signal_byte(signal);
            libc::write(fd, ptr::from_ref(&byte).cast(), 1);
        }
        raw_disposition(libc::SIGINT, libc::SIG_IGN);
        raw_disposition(libc::SIGTERM, libc::SIG_IGN);

        *libc::__errno_location() = errno;
    }
}

/// Restores default `SIGINT`/`SIGTERM` handling in a freshly forked worker.
pub(crate) fn reset_worker_signals() {
    let _ = set_disposition(libc::SIGINT, libc::SIG_DFL);
    let _ = set_disposition(libc::SIGTERM, libc::SIG_DFL);
}

/// `SIGINT` and `SIGTERM` blocked for the calling thread until dropped.
pub(crate) struct TerminationMask {
    previous: libc::sigset_t,
}

impl TerminationMask {
    pub(crate) fn block() -> io::Result<Self> {
        // SAFETY: sigset_t is plain data initialised by sigemptyset.
        unsafe {
            let mut set: libc::sigset_t = mem::zeroed();
            libc::sigemptyset(&mut set);
            libc::sigaddset(&mut set, libc::SIGINT);
            libc::sigaddset(&mut set, libc::SIGTERM);

            let mut previous: libc::sigset_t = mem::zeroed();
            let rc = libc::pthread_sigmask(libc::SIG_BLOCK, &set, &mut previous);
            if rc != 0 {
                return Err(io::Error::from_raw_os_error(rc));
            }
            Ok(Self { previous })
        }
    }
}

impl Drop for TerminationMask {
    fn drop(&mut self) {
        // SAFETY: restores the mask saved by `block`.
        unsafe {
            libc::pthread_sigmask(libc::SIG_SETMASK, &self.previous, ptr::null_mut());
        }
    }
}

fn set_disposition(signal: libc::c_int, handler: libc::sighandler_t) -> io::Result<()> {
    // SAFETY: `sigaction` with a fully initialised action struct.
    if unsafe { raw_disposition(signal, handler) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Like [`set_disposition`], returning the action it replaced.
fn swap_disposition(
    signal: libc::c_int,
    handler: libc::sighandler_t,
) -> io::Result<libc::sigaction> {
    let action = disposition(handler);
    // SAFETY: both structs are valid; the kernel fills in `previous`.
    unsafe {
        let mut previous: libc::sigaction = mem::zeroed();
        if libc::sigaction(signal, &action, &mut previous) == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(previous)
    }
}

/// No `SA_RESTART`: blocking waits in the orchestrator must see `EINTR`.
fn disposition(handler: libc::sighandler_t) -> libc::sigaction {
    // SAFETY: all-zero is a valid `sigaction`; the mask is emptied explicitly.
    unsafe {
        let mut action: libc::sigaction = mem::zeroed();
        action.sa_sigaction = handler;
        action.sa_flags = 0;
        libc::sigemptyset(&mut action.sa_mask);
        action
    }
}

/// Async-signal-safe: only `sigemptyset` and `sigaction`.
unsafe fn raw_disposition(signal: libc::c_int, handler: libc::sighandler_t) -> libc::c_int {
    let action = disposition(handler);
    // SAFETY: `action` is fully initialised.
    unsafe { libc::sigaction(signal, &action, ptr::null_mut()) }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serial_test::serial;

    fn current(signal: libc::c_int) -> libc::sighandler_t {
        // SAFETY: query only; `action` is an out-pointer.
        unsafe {
            let mut action: libc::sigaction = mem::zeroed();
            assert_eq!(libc::sigaction(signal, ptr::null(), &mut action), 0);
            action.sa_sigaction
        }
    }

    #[test]
    #[serial]
    fn drop_restores_inherited_dispositions() {
        let hup = current(libc::SIGHUP);
        let int = current(libc::SIGINT);
        let term = current(libc::SIGTERM);
        // Started under `nohup`.
        set_disposition(libc::SIGHUP, libc::SIG_IGN).unwrap();

        let abort = AbortSignal::new().unwrap();
        {
            let _controller = SignalController::install(&abort).unwrap();
            let handler = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
            assert_eq!(current(libc::SIGINT), handler);
            assert_eq!(current(libc::SIGTERM), handler);
        }

        assert_eq!(current(libc::SIGHUP), libc::SIG_IGN);
        assert_eq!(current(libc::SIGINT), int);
        assert_eq!(current(libc::SIGTERM), term);
        set_disposition(libc::SIGHUP, hup).unwrap();
    }

    #[test]
    fn fresh_signal_is_not_raised() {
        let abort = AbortSignal::new().unwrap();
        assert!(abort.check().is_ok());
        assert_eq!(abort.raised(), None);
    }

    #[test]
    fn first_raise_wins_and_sticks() {
        let abort = AbortSignal::new().unwrap();
        abort.raise(libc::SIGINT);
        abort.raise(libc::SIGTERM);

        assert!(matches!(abort.check(), Err(BenchError::Aborted(libc::SIGINT))));
        // Still raised after the pipe byte was consumed.
        assert_eq!(abort.raised(), Some(libc::SIGINT));
        assert!(abort.check().unwrap_err().is_abort());
    }

    #[test]
    fn zero_is_never_mistaken_for_not_raised() {
        assert_eq!(signal_byte(0), u8::MAX);
        assert_eq!(signal_byte(-3), u8::MAX);
        assert_eq!(signal_byte(libc::SIGTERM), 15);
    }
}
