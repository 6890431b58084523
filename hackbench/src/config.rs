//! Run configuration.
//!
//! A [`RunConfig`] is fixed before the first channel is created and never
//! changes afterwards. Zero groups or zero channels per group are valid and
//! simply produce a run without workers.

use std::fmt;

/// The kind of OS channel connecting senders to receivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelKind {
    /// Connected `AF_UNIX` stream socket pair.
    #[default]
    Socket,
    /// Anonymous byte-stream pipe.
    Pipe,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Socket => write!(f, "socketpair"),
            Self::Pipe => write!(f, "pipe"),
        }
    }
}

/// The unit of concurrent execution used for every worker of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkerKind {
    /// Forked child process.
    #[default]
    Process,
    /// OS thread sharing the orchestrator's address space.
    Thread,
}

impl fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Process => write!(f, "process"),
            Self::Thread => write!(f, "threaded"),
        }
    }
}

/// Parameters of one benchmark run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
    /// Number of independent fully-connected groups.
    pub groups: usize,
    /// Channels per group; each group runs this many senders and receivers.
    pub fanout: usize,
    /// Rounds per sender. One round writes one message to every channel.
    pub loops: usize,
    /// Size of every message in bytes.
    pub payload_size: usize,
    /// Channel kind used for data, readiness and wake channels alike.
    pub channel_kind: ChannelKind,
    /// Whether workers are processes or threads.
    pub worker_kind: WorkerKind,
    /// Switch the orchestrator to `SCHED_FIFO` once every group is built.
    pub realtime: bool,
    /// Have receivers check every byte against the sender fill byte.
    pub verify: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            groups: 10,
            fanout: 20,
            loops: 100,
            payload_size: 100,
            channel_kind: ChannelKind::default(),
            worker_kind: WorkerKind::default(),
            realtime: false,
            verify: false,
        }
    }
}

impl RunConfig {
    /// Workers spawned per group: one sender and one receiver per channel.
    #[must_use]
    pub const fn workers_per_group(&self) -> usize {
        2 * self.fanout
    }

    /// Workers spawned by the whole run.
    #[must_use]
    pub const fn total_workers(&self) -> usize {
        self.groups * self.workers_per_group()
    }

    /// Messages every receiver reads before it terminates.
    #[must_use]
    pub const fn messages_per_receiver(&self) -> usize {
        self.fanout * self.loops
    }
}

impl fmt::Display for RunConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Running in {} mode with {} groups using {} file descriptors each (== {} tasks)",
            self.worker_kind,
            self.groups,
            self.workers_per_group(),
            self.total_workers()
        )?;
        writeln!(
            f,
            "Each sender will pass {} messages of {} bytes",
            self.loops, self.payload_size
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_classic_hackbench() {
        let config = RunConfig::default();
        assert_eq!(config.groups, 10);
        assert_eq!(config.fanout, 20);
        assert_eq!(config.loops, 100);
        assert_eq!(config.payload_size, 100);
        assert_eq!(config.channel_kind, ChannelKind::Socket);
        assert_eq!(config.worker_kind, WorkerKind::Process);
        assert!(!config.realtime);
        assert!(!config.verify);
    }

    #[test]
    fn worker_counts_follow_fanout() {
        let config = RunConfig {
            groups: 3,
            fanout: 4,
            loops: 7,
            ..RunConfig::default()
        };
        assert_eq!(config.workers_per_group(), 8);
        assert_eq!(config.total_workers(), 24);
        assert_eq!(config.messages_per_receiver(), 28);
    }

    #[test]
    fn degenerate_configs_have_no_workers() {
        let no_groups = RunConfig {
            groups: 0,
            ..RunConfig::default()
        };
        let no_channels = RunConfig {
            fanout: 0,
            ..RunConfig::default()
        };
        assert_eq!(no_groups.total_workers(), 0);
        assert_eq!(no_channels.total_workers(), 0);
        assert_eq!(no_channels.messages_per_receiver(), 0);
    }

    #[test]
    fn banner_describes_the_run() {
        let config = RunConfig {
            groups: 2,
            fanout: 5,
            worker_kind: WorkerKind::Thread,
            ..RunConfig::default()
        };
        let banner = config.to_string();
        assert_eq!(
            banner,
            "Running in threaded mode with 2 groups using 10 file descriptors each (== 20 tasks)\n\
             Each sender will pass 100 messages of 100 bytes\n"
        );
    }
}
