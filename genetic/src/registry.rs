//! Worker records kept in memory shared by the god and every worker.
//!
//! The god stores a worker's pid right after forking it and clears it only through
//! [atomic::wait_for_exit]. Each worker writes its own status and counters; nobody else does.

use crate::{Error, MAX_WORKERS};
use evofuzz_ipc::{
    atomic::{self, Atomic},
    shm::{Plain, Shared},
};
use nix::unistd::Pid;
use std::sync::atomic::{AtomicI32, AtomicU64, AtomicU8};

/// Lifecycle of a worker slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    /// No worker has been forked into the slot.
    Vacant = 0,
    /// Forked, not yet waiting for jobs.
    Starting = 1,
    /// Waiting for a job.
    Idle = 2,
    /// Running a job.
    Busy = 3,
    /// Left its loop and is about to exit.
    Exiting = 4,
}

impl From<u8> for Status {
    fn from(value: u8) -> Self {
        match value {
            1 => Status::Starting,
            2 => Status::Idle,
            3 => Status::Busy,
            4 => Status::Exiting,
            _ => Status::Vacant,
        }
    }
}

/// The shared state of one worker.
#[derive(Default)]
pub struct Record {
    pub pid: AtomicI32,
    status: AtomicU8,
    jobs: AtomicU64,
    findings: AtomicU64,
}

// SAFETY: a record is made only of atomics.
unsafe impl Plain for Record {}

impl Record {
    pub fn status(&self) -> Status {
        Status::from(self.status.snapshot())
    }

    pub fn set_status(&self, status: Status) {
        atomic::store(&self.status, status as u8);
    }

    /// Count one completed job, and one finding if `finding`.
    pub fn count(&self, finding: bool) {
        atomic::update(&self.jobs, |jobs| jobs + 1);
        if finding {
            atomic::update(&self.findings, |findings| findings + 1);
        }
    }

    pub fn jobs(&self) -> u64 {
        self.jobs.snapshot()
    }

    pub fn findings(&self) -> u64 {
        self.findings.snapshot()
    }
}

/// The table of worker records.
pub struct Registry {
    records: Shared<[Record; MAX_WORKERS]>,
}

impl Registry {
    pub fn new() -> Result<Self, Error> {
        Ok(Self {
            records: Shared::new(std::array::from_fn(|_| Record::default()))?,
        })
    }

    pub fn get(&self, slot: usize) -> Result<&Record, Error> {
        self.records.get(slot).ok_or(Error::UnknownWorker(slot))
    }

    /// Record that a fresh worker was forked into `slot`.
    pub fn enroll(&self, slot: usize, pid: Pid) -> Result<(), Error> {
        let record = self.get(slot)?;
        atomic::store(&record.pid, pid.as_raw());
        atomic::update(&record.status, |status| {
            // The worker may already have announced itself
            if status == Status::Idle as u8 || status == Status::Busy as u8 {
                status
            } else {
                Status::Starting as u8
            }
        });
        Ok(())
    }

    /// Jobs and findings summed over every slot.
    pub fn totals(&self) -> (u64, u64) {
        self.records.iter().fold((0, 0), |(jobs, findings), record| {
            (jobs + record.jobs(), findings + record.findings())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use commonware_macros::test_traced;
    use nix::{
        sys::wait::{waitpid, WaitStatus},
        unistd::{fork, getpid, ForkResult},
    };

    #[test_traced]
    fn test_worker_updates_visible_to_parent() {
        let registry = Registry::new().unwrap();

        // SAFETY: the child only touches its shared record and exits.
        match unsafe { fork() }.unwrap() {
            ForkResult::Child => {
                let record = registry.get(2).unwrap();
                record.set_status(Status::Busy);
                record.count(true);
                record.count(false);
                // SAFETY: _exit is always safe to call.
                unsafe { libc::_exit(0) }
            }
            ForkResult::Parent { child } => {
                registry.enroll(2, child).unwrap();
                assert_eq!(waitpid(child, None).unwrap(), WaitStatus::Exited(child, 0));
            }
        }

        let record = registry.get(2).unwrap();
        assert_eq!(record.jobs(), 2);
        assert_eq!(record.findings(), 1);
        assert_eq!(registry.totals(), (2, 1));
        assert!(matches!(
            record.status(),
            Status::Busy | Status::Starting
        ));
    }

    #[test_traced]
    fn test_enroll() {
        let registry = Registry::new().unwrap();
        assert_eq!(registry.get(0).unwrap().status(), Status::Vacant);

        // Test case 0: a fresh slot starts
        registry.enroll(0, getpid()).unwrap();
        let record = registry.get(0).unwrap();
        assert_eq!(record.status(), Status::Starting);
        assert_eq!(record.pid.snapshot(), getpid().as_raw());

        // Test case 1: a worker that already announced itself keeps its status
        record.set_status(Status::Idle);
        registry.enroll(0, getpid()).unwrap();
        assert_eq!(record.status(), Status::Idle);

        // Test case 2: unknown slots
        assert!(matches!(
            registry.enroll(MAX_WORKERS, getpid()),
            Err(Error::UnknownWorker(_))
        ));
    }
}
