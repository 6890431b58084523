//! Reaper: waits for every outstanding worker to terminate.

use super::{Exit, Workers};
use crate::error::BenchError;
use crate::signal::AbortSignal;
use crate::trace::{debug, trace, warn};

/// Waits for every worker not reaped yet, in spawn order.
///
/// With `force_kill` every outstanding worker is first asked to terminate.
/// A worker that did not exit cleanly is counted but does not stop the loop;
/// the returned count is informational. Workers that were already reaped
/// elsewhere are skipped silently. During a forced reap a failed OS wait is
/// logged and counted too, so one bad worker cannot leave the rest behind.
///
/// With an `abort` signal the wait can be interrupted. The worker being
/// waited for stays outstanding, so a later forced reap picks it up.
///
/// # Errors
///
/// [`BenchError::Aborted`] if `abort` was raised, or [`BenchError::Reap`]
/// if the OS wait fails outside a forced reap.
pub fn reap_all(
    workers: &mut Workers,
    force_kill: bool,
    abort: Option<&AbortSignal>,
) -> Result<usize, BenchError> {
    if force_kill {
        warn!("terminating {} outstanding workers", workers.outstanding());
        for worker in &mut workers.table[workers.reaped..] {
            trace!("terminating {}", worker.label());
            worker.terminate();
        }
    }

    let mut failed = 0;
    let mut missing = 0;
    while let Some(worker) = workers.table.get_mut(workers.reaped) {
        match worker.reap(abort) {
            Ok(Exit::Clean) => {}
            Ok(Exit::Missing) => missing += 1,
            Ok(exit) => {
                debug_assert!(exit.is_failure());
                failed += 1;
            }
            Err(BenchError::Reap(err)) if force_kill => {
                warn!("giving up on {}: {err}", worker.label());
                failed += 1;
            }
            Err(err) => return Err(err),
        }
        workers.reaped += 1;
    }

    if missing > 0 {
        debug!("{missing} workers were already reaped");
    }
    Ok(failed)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io;

    use serial_test::serial;

    use crate::config::{ChannelKind, WorkerKind};
    use crate::ipc::{Channel, read_exact, write_all};
    use crate::worker::{Entry, Spawner, Worker};

    /// Workers whose outcome is picked by their label.
    struct Scripted;

    struct ScriptedWorker(String);

    impl Spawner for Scripted {
        fn spawn(&self, label: String, _entry: Entry) -> io::Result<Box<dyn Worker>> {
            Ok(Box::new(ScriptedWorker(label)))
        }
    }

    impl Worker for ScriptedWorker {
        fn label(&self) -> &str {
            &self.0
        }

        fn terminate(&mut self) {}

        fn reap(&mut self, _abort: Option<&AbortSignal>) -> Result<Exit, BenchError> {
            match self.0.as_str() {
                "broken" => Err(BenchError::Reap(io::Error::from_raw_os_error(libc::EINVAL))),
                "failed" => Ok(Exit::Failed),
                _ => Ok(Exit::Clean),
            }
        }
    }

    fn scripted(labels: &[&str]) -> Workers {
        let mut workers = Workers::with_spawner(Box::new(Scripted));
        for label in labels {
            workers.spawn((*label).into(), Box::new(|| Ok(()))).unwrap();
        }
        workers
    }

    #[test]
    fn counts_failures_without_stopping() {
        let mut workers = Workers::new(WorkerKind::Thread).unwrap();
        workers.spawn("a".into(), Box::new(|| Ok(()))).unwrap();
        workers
            .spawn("b".into(), Box::new(|| Err(io::Error::other("b"))))
            .unwrap();
        workers.spawn("c".into(), Box::new(|| Ok(()))).unwrap();
        workers
            .spawn("d".into(), Box::new(|| Err(io::Error::other("d"))))
            .unwrap();

        assert_eq!(reap_all(&mut workers, false, None).unwrap(), 2);
        assert_eq!(workers.outstanding(), 0);
        assert_eq!(workers.len(), 4);
    }

    #[test]
    fn failed_wait_stops_a_normal_reap() {
        let mut workers = scripted(&["ok", "broken", "ok"]);
        let err = reap_all(&mut workers, false, None).unwrap_err();
        assert!(matches!(err, BenchError::Reap(_)));
        assert_eq!(workers.outstanding(), 2);
    }

    #[test]
    fn forced_reap_carries_on_past_a_failed_wait() {
        let mut workers = scripted(&["ok", "broken", "failed", "ok"]);
        assert_eq!(reap_all(&mut workers, true, None).unwrap(), 2);
        assert_eq!(workers.outstanding(), 0);
    }

    #[test]
    fn empty_table_reaps_nothing() {
        let mut workers = Workers::new(WorkerKind::Thread).unwrap();
        assert!(workers.is_empty());
        assert_eq!(reap_all(&mut workers, false, None).unwrap(), 0);
        assert_eq!(reap_all(&mut workers, true, None).unwrap(), 0);
    }

    #[test]
    fn interrupted_reap_resumes_where_it_stopped() {
        let mut workers = Workers::new(WorkerKind::Thread).unwrap();
        let (reader, writer) = Channel::create(ChannelKind::Pipe).unwrap().into_parts();

        workers.spawn("quick".into(), Box::new(|| Ok(()))).unwrap();
        workers
            .spawn(
                "stuck".into(),
                Box::new(move || {
                    let mut buf = [0u8; 1];
                    read_exact(&reader, &mut buf)
                }),
            )
            .unwrap();

        let abort = AbortSignal::new().unwrap();
        // Reap the quick one by hand so the abort lands on the stuck one.
        assert_eq!(workers.table[0].reap(None).unwrap(), Exit::Clean);
        workers.reaped = 1;

        abort.raise(libc::SIGINT);
        let err = reap_all(&mut workers, false, Some(&abort)).unwrap_err();
        assert!(err.is_abort());
        assert_eq!(workers.outstanding(), 1);

        assert_eq!(reap_all(&mut workers, true, None).unwrap(), 1);
        assert_eq!(workers.outstanding(), 0);
        write_all(&writer, b"!").unwrap();
    }

    #[test]
    #[serial]
    fn forced_reap_terminates_processes() {
        let mut workers = Workers::new(WorkerKind::Process).unwrap();
        let mut writers = Vec::new();
        for i in 0..3 {
            let (reader, writer) = Channel::create(ChannelKind::Socket).unwrap().into_parts();
            workers
                .spawn(
                    format!("blocked-{i}"),
                    Box::new(move || {
                        let mut buf = [0u8; 1];
                        read_exact(&reader, &mut buf)
                    }),
                )
                .unwrap();
            writers.push(writer);
        }

        assert_eq!(reap_all(&mut workers, true, None).unwrap(), 3);
        assert_eq!(workers.outstanding(), 0);
    }

    #[test]
    #[serial]
    fn processes_reaped_elsewhere_are_tolerated() {
        let mut workers = Workers::new(WorkerKind::Process).unwrap();
        workers.spawn("gone".into(), Box::new(|| Ok(()))).unwrap();
        workers.spawn("here".into(), Box::new(|| Ok(()))).unwrap();

        // Collect one child behind the table's back.
        let mut status = 0;
        // SAFETY: valid out-pointer.
        let pid = unsafe { libc::wait(&mut status) };
        assert!(pid > 0);

        assert_eq!(reap_all(&mut workers, false, None).unwrap(), 0);
        assert_eq!(workers.outstanding(), 0);
    }
}
