//! The loop run by every worker process.

use crate::{
    catalog::Catalog,
    job::{Job, Report},
    registry::{Registry, Status},
    StopFlag,
};
use evofuzz_ipc::{Channel, Error as IpcError};
use evofuzz_trace::{Monitor, Target, Verdict};
use std::path::PathBuf;
use tracing::{debug, warn};

/// Exit code of a worker that lost its channel to an error other than a hang-up.
pub const EXIT_CHANNEL: i32 = 3;

/// Everything a worker needs to turn a [Job] into a [Report].
#[derive(Clone, Debug)]
pub struct Worker {
    catalog: Catalog,
    monitor: Monitor,
    executor: PathBuf,
}

impl Worker {
    pub fn new(catalog: Catalog, monitor: Monitor, executor: PathBuf) -> Self {
        Self {
            catalog,
            monitor,
            executor,
        }
    }

    /// Execute one job and judge the target.
    ///
    /// Returns `None` if the job could not be executed: the syscall is unknown or the engine
    /// failed to supervise the target. Such failures abort only this job.
    pub fn execute(&self, job: &Job) -> Option<Verdict> {
        let Some(syscall) = self.catalog.get(job.syscall) else {
            warn!(syscall = job.syscall, "job for unknown syscall");
            return None;
        };
        let args = std::iter::once(job.syscall)
            .chain(job.args.genes().iter().copied())
            .map(|value| value.to_string());
        let target = match Target::new(&self.executor, args, syscall.needs_root, syscall.needs_alarm)
        {
            Ok(target) => target,
            Err(err) => {
                warn!(?err, "unable to describe target");
                return None;
            }
        };
        match self.monitor.run(&target) {
            Ok(verdict) => {
                if verdict.is_finding() {
                    warn!(
                        syscall = %syscall.name,
                        args = ?job.args.genes(),
                        ?verdict,
                        "finding"
                    );
                }
                Some(verdict)
            }
            Err(err) => {
                warn!(syscall = %syscall.name, ?err, "job aborted");
                None
            }
        }
    }

    /// Serve jobs from `channel` until it closes or `stop` is raised.
    ///
    /// Returns the exit code of the worker process.
    pub fn run<C: Channel>(
        &self,
        slot: usize,
        channel: C,
        registry: &Registry,
        stop: &StopFlag,
    ) -> i32 {
        let Ok(record) = registry.get(slot) else {
            return EXIT_CHANNEL;
        };
        let code = loop {
            if stop.is_stopped() {
                break 0;
            }
            record.set_status(Status::Idle);
            let job: Job = match channel.recv() {
                Ok(job) => job,
                Err(IpcError::Closed) => break 0,
                Err(err) => {
                    warn!(slot, ?err, "unable to receive job");
                    break EXIT_CHANNEL;
                }
            };

            record.set_status(Status::Busy);
            let verdict = self.execute(&job);
            record.count(verdict.is_some_and(|verdict| verdict.is_finding()));
            match channel.send(&Report::answer(&job, verdict)) {
                Ok(()) => {}
                Err(IpcError::Closed) => break 0,
                Err(err) => {
                    warn!(slot, ?err, "unable to send report");
                    break EXIT_CHANNEL;
                }
            }
        };
        record.set_status(Status::Exiting);
        debug!(slot, code, "worker exiting");
        code
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        catalog::{tests::descriptor, ArgKind},
        job::JobKind,
        population::Chromosome,
    };
    use commonware_macros::test_traced;
    use evofuzz_ipc::{pipe::Pipe, Transport};
    use evofuzz_trace::Config as TargetConfig;
    use nix::sys::wait::{waitpid, WaitStatus};
    use std::path::Path;

    fn worker(executor: &str) -> Worker {
        let catalog = Catalog::new(vec![descriptor("close", 3, &[ArgKind::Fd])]).unwrap();
        Worker::new(
            catalog,
            Monitor::new(TargetConfig::default()),
            Path::new(executor).to_path_buf(),
        )
    }

    fn job(syscall: u64) -> Job {
        Job {
            kind: JobKind::Genesis,
            syscall,
            species: 0,
            organism: 4,
            generation: 0,
            args: Chromosome::from_genes(&[99]).unwrap(),
        }
    }

    #[test_traced]
    fn test_execute() {
        // Test case 0: the executor runs to completion
        assert_eq!(
            worker("/bin/true").execute(&job(3)),
            Some(Verdict::Completed { status: 0 })
        );

        // Test case 1: a non-zero exit after the trace stop is still a completion
        assert_eq!(
            worker("/bin/false").execute(&job(3)),
            Some(Verdict::Completed { status: 1 })
        );

        // Test case 2: unknown syscalls and missing executors abort the job
        assert_eq!(worker("/bin/true").execute(&job(4)), None);
        assert_eq!(worker("/nonexistent/executor").execute(&job(3)), None);
    }

    #[test_traced]
    fn test_run_serves_until_closed() {
        let registry = Registry::new().unwrap();
        let stop = StopFlag::new().unwrap();
        let worker = worker("/bin/true");
        let (pid, channel) = Pipe
            .spawn(|channel| worker.run(1, channel, &registry, &stop))
            .unwrap();
        registry.enroll(1, pid).unwrap();

        for organism in 0..3 {
            let job = Job {
                organism,
                ..job(3)
            };
            channel.send(&job).unwrap();
            let report: Report = channel.recv().unwrap();
            assert!(report.answers(&job));
            assert_eq!(report.verdict, Some(Verdict::Completed { status: 0 }));
        }

        // Hanging up ends the worker cleanly
        drop(channel);
        assert_eq!(waitpid(pid, None).unwrap(), WaitStatus::Exited(pid, 0));
        let record = registry.get(1).unwrap();
        assert_eq!(record.jobs(), 3);
        assert_eq!(record.findings(), 0);
        assert_eq!(record.status(), Status::Exiting);
    }

    #[test_traced]
    fn test_run_honors_stop() {
        let registry = Registry::new().unwrap();
        let stop = StopFlag::new().unwrap();
        stop.stop();
        let worker = worker("/bin/true");
        let (pid, _channel) = Pipe
            .spawn(|channel| worker.run(0, channel, &registry, &stop))
            .unwrap();
        assert_eq!(waitpid(pid, None).unwrap(), WaitStatus::Exited(pid, 0));
    }
}
