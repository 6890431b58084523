//! Scheduler and IPC stress test.
//!
//! # Usage
//!
//! ```sh
//! hackbench --pipe --threads -g 20 -f 40 -l 1000
//! ```
//!
//! # Signals
//!
//! - `SIGINT` / `SIGTERM`: tear every worker down and exit with status 1
//! - `SIGHUP`: ignored

use std::io::{self, Write};
use std::process;

use clap::Parser;

use hackbench::{AbortSignal, BenchError, ChannelKind, RunConfig, SignalController, WorkerKind};

#[derive(Parser, Debug)]
#[command(name = "hackbench")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Use pipes instead of socket pairs
    #[arg(short, long)]
    pipe: bool,

    /// Bytes per message
    #[arg(short = 's', long, default_value_t = 100)]
    datasize: usize,

    /// Messages each sender passes to every receiver of its group
    #[arg(short, long, default_value_t = 100)]
    loops: usize,

    /// Number of groups
    #[arg(short, long, default_value_t = 10)]
    groups: usize,

    /// Senders and receivers per group
    #[arg(short, long, default_value_t = 20)]
    fds: usize,

    /// Run workers as threads
    #[arg(short = 'T', long, overrides_with = "process")]
    threads: bool,

    /// Run workers as processes (default)
    #[arg(short = 'P', long, visible_alias = "processes", overrides_with = "threads")]
    process: bool,

    /// Switch to SCHED_FIFO before releasing the workers
    #[arg(short = 'F', long)]
    fifo: bool,

    /// Check every received byte
    #[arg(long)]
    verify: bool,
}

impl From<Cli> for RunConfig {
    fn from(cli: Cli) -> Self {
        Self {
            groups: cli.groups,
            fanout: cli.fds,
            loops: cli.loops,
            payload_size: cli.datasize,
            channel_kind: if cli.pipe {
                ChannelKind::Pipe
            } else {
                ChannelKind::Socket
            },
            // The two flags override each other, so at most one is set.
            worker_kind: if cli.threads && !cli.process {
                WorkerKind::Thread
            } else {
                WorkerKind::Process
            },
            realtime: cli.fifo,
            verify: cli.verify,
        }
    }
}

fn main() {
    hackbench::init_tracing();

    let config = RunConfig::from(Cli::parse());
    if let Err(e) = run(&config) {
        eprintln!("hackbench: {e}");
        process::exit(e.exit_code());
    }
}

fn run(config: &RunConfig) -> Result<(), BenchError> {
    print!("{config}");
    // Forked workers inherit unflushed output.
    let _ = io::stdout().flush();

    let abort = AbortSignal::new().map_err(BenchError::Signals)?;
    let _signals = SignalController::install(&abort)?;

    let result = hackbench::run(config, &abort)?;
    println!("{result}");
    Ok(())
}
