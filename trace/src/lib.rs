//! Execute a target under trace control and judge how it stopped.
//!
//! # Overview
//!
//! Each execution walks the same state machine:
//!
//! ```txt
//! SPAWNED -> TRACE_REQUESTED -> EXECED -> { STOPPED, EXITED, SIGNALED, CONTINUED }
//! ```
//!
//! The forked child asks to be traced before anything else, drops elevated privileges, and
//! replaces its image with the target. The supervisor waits on exactly that pid and classifies
//! what it observes with [classify]. A nominal run produces a trace stop at the new image, after
//! which the [Monitor] resumes the target (optionally under an [alarm]) until it finishes.
//!
//! Crashes, hangs, and early exits are findings, not failures: they are returned as a
//! [Verdict]. Only engine-side problems (a broken trace protocol, a failed exec) surface as
//! [Error].

use bytes::{Buf, BufMut};
use commonware_codec::{EncodeSize, Error as CodecError, Read, ReadExt, Write};
use nix::{errno::Errno, sys::signal::Signal, sys::wait::WaitStatus};
use std::time::Duration;
use thiserror::Error;

pub mod alarm;
mod monitor;
pub use monitor::{Injector, Monitor, Target, Tracee};

/// Exit code of a child that could not prepare itself for tracing.
pub const EXIT_TRACE: i32 = 124;

/// Exit code of a child that could not drop its privileges.
pub const EXIT_PRIVILEGE: i32 = 126;

/// Exit code of a child whose exec failed.
pub const EXIT_EXEC: i32 = 127;

/// Errors that can occur while supervising a target.
#[derive(Error, Debug)]
pub enum Error {
    #[error("spawn failed: {0}")]
    Spawn(Errno),
    #[error("wait failed: {0}")]
    Wait(Errno),
    #[error("resume failed: {0}")]
    Resume(Errno),
    #[error("timer failed: {0}")]
    Timer(Errno),
    #[error("trace protocol violation: {0}")]
    TraceProtocolViolation(String),
    #[error("trace request failed")]
    TraceRequestFailure,
    #[error("privilege drop failed")]
    PrivilegeDropFailure,
    #[error("exec failed")]
    ExecFailure,
    #[error("invalid target: {0}")]
    InvalidTarget(String),
    #[error("unable to open null device: {0}")]
    NullDevice(std::io::Error),
}

/// Configuration for a [Monitor].
#[derive(Clone, Debug)]
pub struct Config {
    /// Budget for targets whose syscall needs an alarm.
    pub alarm: Duration,

    /// User id assumed by targets that do not need root.
    pub uid: u32,

    /// Group id assumed by targets that do not need root.
    pub gid: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            alarm: Duration::from_secs(2),
            uid: 65534,
            gid: 65534,
        }
    }
}

/// The judged outcome of one target execution.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Verdict {
    /// The target ran after its trace stop and exited on its own.
    Completed { status: i32 },
    /// The target exited before reaching its trace stop.
    ExitedEarly { status: i32 },
    /// The target was killed by a signal.
    Crashed { signal: i32 },
    /// The target outlived its alarm and was killed.
    Hung,
}

impl Verdict {
    /// Whether this verdict is worth reporting as a finding.
    pub fn is_finding(&self) -> bool {
        !matches!(self, Verdict::Completed { .. })
    }
}

const COMPLETED: u8 = 0;
const EXITED_EARLY: u8 = 1;
const CRASHED: u8 = 2;
const HUNG: u8 = 3;

impl Write for Verdict {
    fn write(&self, buf: &mut impl BufMut) {
        match self {
            Verdict::Completed { status } => {
                COMPLETED.write(buf);
                status.write(buf);
            }
            Verdict::ExitedEarly { status } => {
                EXITED_EARLY.write(buf);
                status.write(buf);
            }
            Verdict::Crashed { signal } => {
                CRASHED.write(buf);
                signal.write(buf);
            }
            Verdict::Hung => HUNG.write(buf),
        }
    }
}

impl Read for Verdict {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let verdict = match u8::read(buf)? {
            COMPLETED => Verdict::Completed {
                status: i32::read(buf)?,
            },
            EXITED_EARLY => Verdict::ExitedEarly {
                status: i32::read(buf)?,
            },
            CRASHED => Verdict::Crashed {
                signal: i32::read(buf)?,
            },
            HUNG => Verdict::Hung,
            tag => return Err(CodecError::InvalidEnum(tag)),
        };
        Ok(verdict)
    }
}

impl EncodeSize for Verdict {
    fn encode_size(&self) -> usize {
        match self {
            Verdict::Hung => 1,
            _ => 1 + 4,
        }
    }
}

/// What a single wait on the target revealed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Observation {
    /// The target is in a trace stop caused by the given signal.
    Stopped(Signal),
    /// The target is gone; no further waits are possible.
    Finding(Verdict),
}

/// Classify the status returned by a wait on a target that has not yet been resumed.
///
/// A traced child that reports "continued" before anyone resumed it breaks the trace protocol,
/// as does any status other than stopped, exited, or signaled. Exits with the reserved codes
/// of the child prelude identify which prelude step failed.
pub fn classify(status: WaitStatus) -> Result<Observation, Error> {
    match status {
        WaitStatus::Continued(pid) => Err(Error::TraceProtocolViolation(format!(
            "{pid} continued while awaiting trace stop"
        ))),
        WaitStatus::Exited(_, EXIT_TRACE) => Err(Error::TraceRequestFailure),
        WaitStatus::Exited(_, EXIT_PRIVILEGE) => Err(Error::PrivilegeDropFailure),
        WaitStatus::Exited(_, EXIT_EXEC) => Err(Error::ExecFailure),
        WaitStatus::Exited(_, status) => Ok(Observation::Finding(Verdict::ExitedEarly { status })),
        WaitStatus::Signaled(_, signal, _) => Ok(Observation::Finding(Verdict::Crashed {
            signal: signal as i32,
        })),
        WaitStatus::Stopped(_, signal) => Ok(Observation::Stopped(signal)),
        other => Err(Error::TraceProtocolViolation(format!(
            "unexpected status {other:?}"
        ))),
    }
}
