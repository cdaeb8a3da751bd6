//! A process-wide real-time alarm that kills the running target when it expires.
//!
//! The signal handler only performs async-signal-safe work: it records that the alarm fired
//! and sends `SIGKILL` to the target. The supervisor then observes the kill through its
//! regular wait, so there is no window in which an expiry can be missed.
//!
//! Only one [Alarm] may be running per process at a time.

use crate::Error;
use nix::{
    errno::Errno,
    sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal},
    unistd::Pid,
};
use std::{
    ptr,
    sync::{
        atomic::{AtomicBool, AtomicI32, Ordering},
        OnceLock,
    },
    time::{Duration, Instant},
};

static TARGET: AtomicI32 = AtomicI32::new(0);
static FIRED: AtomicBool = AtomicBool::new(false);
static INSTALLED: OnceLock<Result<(), Errno>> = OnceLock::new();

extern "C" fn on_alarm(_: libc::c_int) {
    FIRED.store(true, Ordering::SeqCst);
    let pid = TARGET.load(Ordering::SeqCst);
    if pid > 0 {
        // SAFETY: kill is async-signal-safe.
        unsafe { libc::kill(pid, libc::SIGKILL) };
    }
}

fn install() -> Result<(), Error> {
    let installed = INSTALLED.get_or_init(|| {
        // No SA_RESTART: a blocked wait in the supervisor returns EINTR.
        let action = SigAction::new(
            SigHandler::Handler(on_alarm),
            SaFlags::empty(),
            SigSet::empty(),
        );
        // SAFETY: the handler only touches atomics and calls kill.
        unsafe { sigaction(Signal::SIGALRM, &action) }.map(|_| ())
    });
    (*installed).map_err(Error::Timer)
}

fn set_timer(value: Duration) -> Result<(), Error> {
    let timer = libc::itimerval {
        it_interval: libc::timeval {
            tv_sec: 0,
            tv_usec: 0,
        },
        it_value: libc::timeval {
            tv_sec: value.as_secs() as libc::time_t,
            tv_usec: value.subsec_micros() as libc::suseconds_t,
        },
    };
    // SAFETY: timer is a valid itimerval and the old value is not requested.
    if unsafe { libc::setitimer(libc::ITIMER_REAL, &timer, ptr::null_mut()) } != 0 {
        return Err(Error::Timer(Errno::last()));
    }
    Ok(())
}

/// A budget of wall-clock time for one target, consumed only while the target runs.
pub struct Alarm {
    remaining: Duration,
    started: Option<Instant>,
}

impl Alarm {
    /// Create an alarm that will kill `target` once `budget` has elapsed.
    pub fn new(target: Pid, budget: Duration) -> Result<Self, Error> {
        install()?;
        FIRED.store(false, Ordering::SeqCst);
        TARGET.store(target.as_raw(), Ordering::SeqCst);
        Ok(Self {
            remaining: budget,
            started: None,
        })
    }

    /// Arm the timer with whatever budget remains. Call before resuming the target.
    pub fn start(&mut self) -> Result<(), Error> {
        if self.started.is_some() {
            return Ok(());
        }
        // A zero itimerval disarms, so an exhausted budget still gets one tick.
        set_timer(self.remaining.max(Duration::from_micros(1)))?;
        self.started = Some(Instant::now());
        Ok(())
    }

    /// Disarm the timer and charge the elapsed time. Call once the target stops.
    pub fn stop(&mut self) {
        let Some(started) = self.started.take() else {
            return;
        };
        let _ = set_timer(Duration::ZERO);
        self.remaining = self.remaining.saturating_sub(started.elapsed());
    }

    /// Whether the alarm expired and killed the target.
    pub fn fired(&self) -> bool {
        FIRED.load(Ordering::SeqCst)
    }
}

impl Drop for Alarm {
    fn drop(&mut self) {
        self.stop();
        TARGET.store(0, Ordering::SeqCst);
    }
}
