//! Fully connected sender/receiver groups.
//!
//! A group of fan-out `n` has `n` channels, `n` receivers and `n` senders.
//! Receiver `i` owns the read side of channel `i`; every sender writes to
//! every channel, so each receiver gets `n * loops` messages.
//!
//! ```text
//!   sender 0 ──┬──────> channel 0 ──> receiver 0
//!   sender 1 ──┼──────> channel 1 ──> receiver 1
//!      ...     └─ ... > channel n ──> receiver n
//! ```
//!
//! The write sides live in one [`Sender`] shared by all senders of the group
//! behind an `Arc`. Nothing mutates it after construction and every sender
//! only issues `write` calls against it, so no locking is needed. Once the
//! last sender is spawned the orchestrator drops its reference; in process
//! mode that closes the parent's copies of the write sides.
//!
//! A forked receiver also inherits every write side the orchestrator holds
//! at fork time, its own channel's included. It closes them before it
//! reports ready, so its stream ends once every sender of the group is gone.

use std::io::{self, ErrorKind};
use std::iter;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use crate::config::{ChannelKind, RunConfig};
use crate::error::BenchError;
use crate::ipc::{BarrierHandle, Channel, read_exact, write_all};
use crate::trace::debug;
use crate::worker::Workers;

/// Byte every sender fills its messages with.
pub const FILL_BYTE: u8 = b'-';

/// Shape of one group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupSpec {
    /// Channels, senders and receivers in the group.
    pub fanout: usize,
    /// Rounds per sender.
    pub loops: usize,
    /// Bytes per message.
    pub payload_size: usize,
    /// Channel kind for the data channels.
    pub channel_kind: ChannelKind,
    /// Whether receivers check message contents.
    pub verify: bool,
}

impl GroupSpec {
    /// Messages every receiver of the group reads.
    #[must_use]
    pub const fn messages_per_receiver(&self) -> usize {
        self.fanout * self.loops
    }
}

impl From<&RunConfig> for GroupSpec {
    fn from(config: &RunConfig) -> Self {
        Self {
            fanout: config.fanout,
            loops: config.loops,
            payload_size: config.payload_size,
            channel_kind: config.channel_kind,
            verify: config.verify,
        }
    }
}

/// Builds group `index`: creates its channels and spawns its workers.
///
/// Returns the number of workers spawned, `2 * fanout`.
///
/// # Errors
///
/// [`BenchError::Channel`] or [`BenchError::Spawn`]. Workers spawned before
/// the failure stay in `workers` for the caller to tear down.
pub fn build_group(
    index: usize,
    spec: &GroupSpec,
    barrier: &BarrierHandle,
    workers: &mut Workers,
) -> Result<usize, BenchError> {
    let mut outputs = Vec::with_capacity(spec.fanout);

    for i in 0..spec.fanout {
        let (input, output) = Channel::create(spec.channel_kind)?.into_parts();
        let inherited = if workers.isolated() {
            outputs
                .iter()
                .chain(iter::once(&output))
                .map(|fd| fd.as_raw_fd())
                .collect()
        } else {
            Vec::new()
        };
        let mut receiver = Receiver {
            input,
            messages: spec.messages_per_receiver(),
            payload_size: spec.payload_size,
            verify: spec.verify,
            inherited,
        };
        let barrier = barrier.clone();
        workers.spawn(
            format!("g{index}-rx{i}"),
            Box::new(move || {
                receiver.close_inherited();
                receiver.run(&barrier).map(drop)
            }),
        )?;
        outputs.push(output);
    }

    let sender = Arc::new(Sender {
        outputs: outputs.into_boxed_slice(),
        loops: spec.loops,
        payload_size: spec.payload_size,
    });
    for i in 0..spec.fanout {
        let sender = Arc::clone(&sender);
        let barrier = barrier.clone();
        workers.spawn(
            format!("g{index}-tx{i}"),
            Box::new(move || sender.run(&barrier)),
        )?;
    }

    debug!(
        "group {index}: {} channels, {} messages per receiver",
        spec.fanout,
        spec.messages_per_receiver()
    );
    Ok(2 * spec.fanout)
}

/// Receiving end bound to one channel.
#[derive(Debug)]
pub struct Receiver {
    input: OwnedFd,
    messages: usize,
    payload_size: usize,
    verify: bool,
    /// Write sides duplicated into a forked receiver.
    inherited: Vec<RawFd>,
}

impl Receiver {
    /// Closes the write sides this receiver inherited from the orchestrator.
    fn close_inherited(&mut self) {
        for fd in self.inherited.drain(..) {
            // SAFETY: the descriptor is this process's private duplicate;
            // its owner lives in the orchestrator's address space and is
            // never dropped here.
            unsafe { rustix::io::close(fd) };
        }
    }

    /// Waits for the barrier, then reads the expected number of messages.
    ///
    /// Returns the number of messages read.
    ///
    /// # Errors
    ///
    /// Any read failure, including a stream that ends early. With
    /// verification on, a byte other than [`FILL_BYTE`] is
    /// [`ErrorKind::InvalidData`].
    pub fn run(&self, barrier: &BarrierHandle) -> io::Result<usize> {
        let mut buf = vec![0u8; self.payload_size];
        barrier.report_ready()?;

        for n in 0..self.messages {
            read_exact(&self.input, &mut buf)?;
            if self.verify && buf.iter().any(|&b| b != FILL_BYTE) {
                return Err(io::Error::new(
                    ErrorKind::InvalidData,
                    format!("message {n} does not match the fill byte"),
                ));
            }
        }
        Ok(self.messages)
    }
}

/// Write sides of a group's channels, shared read-only by its senders.
#[derive(Debug)]
pub struct Sender {
    outputs: Box<[OwnedFd]>,
    loops: usize,
    payload_size: usize,
}

impl Sender {
    /// Waits for the barrier, then writes one message per channel per round.
    ///
    /// # Errors
    ///
    /// Any write failure, e.g. `EPIPE` after a receiver died.
    pub fn run(&self, barrier: &BarrierHandle) -> io::Result<()> {
        let buf = vec![FILL_BYTE; self.payload_size];
        barrier.report_ready()?;

        for _ in 0..self.loops {
            for output in &self.outputs {
                write_all(output, &buf)?;
            }
        }
        Ok(())
    }
}
