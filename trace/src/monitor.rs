use crate::{
    alarm::Alarm, classify, Config, Error, Observation, Verdict, EXIT_EXEC, EXIT_PRIVILEGE,
    EXIT_TRACE,
};
use nix::{
    errno::Errno,
    sys::{
        prctl, ptrace,
        signal::{kill, Signal},
        wait::{waitpid, WaitStatus},
    },
    unistd::{
        execv, fork, getpid, getppid, setgid, setgroups, setpgid, setuid, ForkResult, Gid, Pid,
        Uid,
    },
};
use std::{
    ffi::CString,
    fs::File,
    os::{fd::AsRawFd, unix::ffi::OsStrExt},
    panic::{self, AssertUnwindSafe},
    path::Path,
};
use tracing::{debug, warn};

/// Exit code of a child whose body panicked.
const EXIT_PANIC: i32 = 101;

/// Source of every target's stdin.
const NULL_DEVICE: &str = "/dev/null";

/// An executable and the arguments it is launched with.
#[derive(Clone, Debug)]
pub struct Target {
    path: CString,
    argv: Vec<CString>,
    needs_root: bool,
    needs_alarm: bool,
}

impl Target {
    /// Describe a target. `argv[0]` is set to `path`.
    pub fn new<I, A>(
        path: &Path,
        args: I,
        needs_root: bool,
        needs_alarm: bool,
    ) -> Result<Self, Error>
    where
        I: IntoIterator<Item = A>,
        A: Into<Vec<u8>>,
    {
        let path = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| Error::InvalidTarget(path.display().to_string()))?;
        let mut argv = vec![path.clone()];
        for arg in args {
            let arg = CString::new(arg).map_err(|err| {
                Error::InvalidTarget(String::from_utf8_lossy(&err.into_vec()).into_owned())
            })?;
            argv.push(arg);
        }
        Ok(Self {
            path,
            argv,
            needs_root,
            needs_alarm,
        })
    }
}

/// Work performed while the target sits in its first trace stop.
pub trait Injector {
    fn inject(&mut self, pid: Pid) -> Result<(), Error>;
}

impl Injector for () {
    fn inject(&mut self, _: Pid) -> Result<(), Error> {
        Ok(())
    }
}

/// A forked child owned by the supervisor.
///
/// Dropping a [Tracee] that has not been reaped kills and reaps it.
pub struct Tracee {
    pid: Pid,
    reaped: bool,
}

impl Tracee {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Wait for the next state change of exactly this child.
    pub fn wait(&mut self) -> Result<WaitStatus, Error> {
        loop {
            match waitpid(self.pid, None) {
                Ok(status) => {
                    if matches!(status, WaitStatus::Exited(..) | WaitStatus::Signaled(..)) {
                        self.reaped = true;
                    }
                    return Ok(status);
                }
                Err(Errno::EINTR) => continue,
                Err(err) => return Err(Error::Wait(err)),
            }
        }
    }

    /// Wait for the next state change and classify it.
    pub fn observe(&mut self) -> Result<Observation, Error> {
        classify(self.wait()?)
    }

    /// Resume a stopped child, delivering `signal` if given.
    pub fn resume(&self, signal: Option<Signal>) -> Result<(), Error> {
        ptrace::cont(self.pid, signal).map_err(Error::Resume)
    }

    fn reap(&mut self) {
        if self.reaped {
            return;
        }
        let _ = kill(self.pid, Signal::SIGKILL);
        while !self.reaped {
            if self.wait().is_err() {
                break;
            }
        }
    }
}

impl Drop for Tracee {
    fn drop(&mut self) {
        self.reap();
    }
}

/// Launches targets under trace control and turns what they do into a [Verdict].
#[derive(Clone, Debug)]
pub struct Monitor {
    cfg: Config,
}

impl Monitor {
    pub fn new(cfg: Config) -> Self {
        Self { cfg }
    }

    /// Fork a child that runs `body` and exits with the code it returns.
    pub fn spawn<F: FnOnce() -> i32>(&self, body: F) -> Result<Tracee, Error> {
        // SAFETY: the child only runs `body` and then exits without returning.
        match unsafe { fork() }.map_err(Error::Spawn)? {
            ForkResult::Child => {
                let code = panic::catch_unwind(AssertUnwindSafe(body)).unwrap_or(EXIT_PANIC);
                // SAFETY: _exit is always safe to call.
                unsafe { libc::_exit(code) }
            }
            ForkResult::Parent { child } => Ok(Tracee {
                pid: child,
                reaped: false,
            }),
        }
    }

    /// Fork a child that requests tracing, drops privileges, and executes `target`.
    ///
    /// The target runs in its own process group with stdin read from `/dev/null`, and is
    /// killed once the thread that launched it exits.
    pub fn launch(&self, target: &Target) -> Result<Tracee, Error> {
        let unprivileged = Uid::effective().is_root() && !target.needs_root;
        let uid = Uid::from_raw(self.cfg.uid);
        let gid = Gid::from_raw(self.cfg.gid);
        let null = File::open(NULL_DEVICE).map_err(Error::NullDevice)?;
        let supervisor = getpid();
        self.spawn(|| {
            if setpgid(Pid::from_raw(0), Pid::from_raw(0)).is_err() {
                return EXIT_TRACE;
            }
            // SAFETY: dup2 onto stdin only changes the descriptor table.
            if unsafe { libc::dup2(null.as_raw_fd(), libc::STDIN_FILENO) } < 0 {
                return EXIT_TRACE;
            }
            if ptrace::traceme().is_err() {
                return EXIT_TRACE;
            }
            if unprivileged
                && (setgroups(&[gid]).is_err() || setgid(gid).is_err() || setuid(uid).is_err())
            {
                return EXIT_PRIVILEGE;
            }

            // Credential changes clear the parent-death signal, so it is armed last
            if prctl::set_pdeathsig(Signal::SIGKILL).is_err() || getppid() != supervisor {
                return EXIT_TRACE;
            }
            let _ = execv(&target.path, &target.argv);
            EXIT_EXEC
        })
    }

    /// Execute `target` to completion.
    pub fn run(&self, target: &Target) -> Result<Verdict, Error> {
        self.run_with(target, &mut ())
    }

    /// Execute `target`, letting `injector` act on it during its first trace stop.
    pub fn run_with(
        &self,
        target: &Target,
        injector: &mut impl Injector,
    ) -> Result<Verdict, Error> {
        let mut tracee = self.launch(target)?;
        match tracee.observe() {
            Ok(Observation::Finding(verdict)) => {
                debug!(pid = %tracee.pid(), ?verdict, "target stopped before trace stop");
                return Ok(verdict);
            }
            Ok(Observation::Stopped(Signal::SIGTRAP)) => {}
            Ok(Observation::Stopped(signal)) => {
                return Err(Error::TraceProtocolViolation(format!(
                    "first stop caused by {signal}"
                )));
            }
            Err(err) => {
                warn!(pid = %tracee.pid(), ?err, "target failed before trace stop");
                return Err(err);
            }
        }
        injector.inject(tracee.pid())?;
        self.finish(&mut tracee, target.needs_alarm)
    }

    /// Resume a tracee from its trace stop until it exits, forwarding any signals it receives.
    fn finish(&self, tracee: &mut Tracee, needs_alarm: bool) -> Result<Verdict, Error> {
        let mut alarm = if needs_alarm {
            Some(Alarm::new(tracee.pid(), self.cfg.alarm)?)
        } else {
            None
        };
        let mut pending = None;
        loop {
            if let Some(alarm) = alarm.as_mut() {
                alarm.start()?;
            }
            tracee.resume(pending)?;
            let status = tracee.wait();
            if let Some(alarm) = alarm.as_mut() {
                alarm.stop();
            }
            let verdict = match status? {
                WaitStatus::Exited(_, status) => Verdict::Completed { status },
                WaitStatus::Signaled(_, Signal::SIGKILL, _)
                    if alarm.as_ref().is_some_and(|alarm| alarm.fired()) =>
                {
                    Verdict::Hung
                }
                WaitStatus::Signaled(_, signal, _) => Verdict::Crashed {
                    signal: signal as i32,
                },
                WaitStatus::Stopped(_, signal) => {
                    pending = (signal != Signal::SIGTRAP).then_some(signal);
                    continue;
                }
                other => {
                    return Err(Error::TraceProtocolViolation(format!(
                        "unexpected status {other:?} after resume"
                    )))
                }
            };
            debug!(pid = %tracee.pid(), ?verdict, "target finished");
            return Ok(verdict);
        }
    }
}
