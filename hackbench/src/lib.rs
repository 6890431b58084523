//! Scheduler and IPC stress test.
//!
//! A run builds `groups` independent fan-out meshes. Each mesh has `fanout`
//! byte-stream channels (socket pairs or pipes), one receiver per channel
//! and `fanout` senders that each write to every channel. Workers are either
//! forked processes or threads. Once every worker has reported ready, a
//! barrier releases them all at once and the time until the last one exits
//! is the benchmark result.
//!
//! ```no_run
//! use hackbench::{AbortSignal, RunConfig, SignalController};
//!
//! let abort = AbortSignal::new()?;
//! let _signals = SignalController::install(&abort)?;
//! let result = hackbench::run(&RunConfig::default(), &abort)?;
//! println!("{result}");
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod bench;
pub mod config;
pub mod error;
pub mod group;
pub mod ipc;
pub mod signal;
pub mod worker;

mod trace;

pub use bench::{RunResult, run};
pub use config::{ChannelKind, RunConfig, WorkerKind};
pub use error::BenchError;
pub use signal::{AbortSignal, SignalController};
pub use trace::init_tracing;
