//! The process-wide bootstrap slot.
//!
//! The slot is a fixed descriptor number. A child forked while the slot is populated finds the
//! installed capability at the same number without any prior exchange with its parent.
//!
//! The slot only exists while the soft `RLIMIT_NOFILE` exceeds [BOOTSTRAP_SLOT]. Installing a
//! capability raises a lower soft limit as far as the hard limit allows; a hard limit at or
//! below the slot makes the port transport unavailable.

use crate::Error;
use nix::{
    errno::Errno,
    sys::resource::{getrlimit, setrlimit, Resource},
};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use tracing::debug;

/// Descriptor number reserved for the bootstrap capability.
pub const BOOTSTRAP_SLOT: RawFd = 511;

/// Make sure the descriptor limit leaves room for [BOOTSTRAP_SLOT].
fn reserve() -> Result<(), Error> {
    let required = BOOTSTRAP_SLOT as libc::rlim_t + 1;
    let (soft, hard) = getrlimit(Resource::RLIMIT_NOFILE)?;
    if soft >= required {
        return Ok(());
    }
    if hard < required {
        return Err(Error::Handoff("descriptor limit below bootstrap slot"));
    }
    setrlimit(Resource::RLIMIT_NOFILE, required, hard)?;
    debug!(previous = soft, limit = required, "raised descriptor limit");
    Ok(())
}

/// Return a duplicate of the capability currently installed in the slot, if any.
pub fn get() -> Result<Option<OwnedFd>, Error> {
    // SAFETY: F_GETFD only inspects the descriptor table.
    if unsafe { libc::fcntl(BOOTSTRAP_SLOT, libc::F_GETFD) } == -1 {
        return match Errno::last() {
            Errno::EBADF => Ok(None),
            err => Err(err.into()),
        };
    }

    // SAFETY: F_DUPFD_CLOEXEC returns a fresh descriptor that we take ownership of below.
    let fd = unsafe { libc::fcntl(BOOTSTRAP_SLOT, libc::F_DUPFD_CLOEXEC, 0) };
    if fd < 0 {
        return Err(Errno::last().into());
    }

    // SAFETY: fd was just returned by fcntl and is owned by no one else.
    Ok(Some(unsafe { OwnedFd::from_raw_fd(fd) }))
}

/// Install `capability` in the slot, or empty the slot when `None`.
///
/// The slot keeps its own duplicate, so the caller retains ownership of `capability`.
pub fn set(capability: Option<BorrowedFd<'_>>) -> Result<(), Error> {
    match capability {
        Some(fd) => {
            if fd.as_raw_fd() == BOOTSTRAP_SLOT {
                return Ok(());
            }
            reserve()?;

            // SAFETY: dup2 atomically replaces whatever the slot held.
            if unsafe { libc::dup2(fd.as_raw_fd(), BOOTSTRAP_SLOT) } < 0 {
                return Err(Errno::last().into());
            }
        }
        None => {
            // SAFETY: the slot is owned by this module and never wrapped in an OwnedFd.
            if unsafe { libc::close(BOOTSTRAP_SLOT) } < 0 && Errno::last() != Errno::EBADF {
                return Err(Errno::last().into());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use commonware_macros::test_traced;
    use nix::{
        sys::wait::{waitpid, WaitStatus},
        unistd::{fork, ForkResult},
    };
    use std::{
        os::fd::AsFd,
        sync::{Mutex, MutexGuard},
    };

    /// Serializes tests that touch the process-wide slot.
    static SLOT: Mutex<()> = Mutex::new(());

    pub(crate) fn lock() -> MutexGuard<'static, ()> {
        SLOT.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Identity of the open file description behind a descriptor.
    pub(crate) fn identity(fd: BorrowedFd<'_>) -> (u64, u64) {
        let stat = nix::sys::stat::fstat(fd.as_raw_fd()).unwrap();
        (stat.st_dev as u64, stat.st_ino as u64)
    }

    #[test_traced]
    fn test_set_get_clear() {
        let _guard = lock();
        let (left, _right) = super::super::allocate().unwrap();

        // Test case 0: install and read back
        set(Some(left.as_fd())).unwrap();
        let installed = get().unwrap().expect("slot populated");
        assert_eq!(identity(installed.as_fd()), identity(left.as_fd()));

        // Test case 1: clear
        set(None).unwrap();
        assert!(get().unwrap().is_none());

        // Test case 2: clearing an empty slot is a no-op
        set(None).unwrap();
        assert!(get().unwrap().is_none());
    }

    /// Run `check` in a forked child, whose limits can be lowered without affecting the tests.
    fn in_child(check: impl FnOnce() -> bool) {
        // SAFETY: the child only adjusts its own limits and descriptors and exits.
        match unsafe { fork() }.unwrap() {
            ForkResult::Child => {
                let code = if check() { 0 } else { 1 };
                // SAFETY: _exit is always safe to call.
                unsafe { libc::_exit(code) }
            }
            ForkResult::Parent { child } => {
                assert_eq!(waitpid(child, None).unwrap(), WaitStatus::Exited(child, 0));
            }
        }
    }

    #[test_traced]
    fn test_set_raises_soft_limit() {
        let _guard = lock();
        let (_, hard) = getrlimit(Resource::RLIMIT_NOFILE).unwrap();
        if hard <= BOOTSTRAP_SLOT as libc::rlim_t {
            return;
        }
        let (left, _right) = super::super::allocate().unwrap();
        in_child(|| {
            if setrlimit(Resource::RLIMIT_NOFILE, 64, hard).is_err() {
                return false;
            }
            let installed = set(Some(left.as_fd())).is_ok();
            let (soft, _) = getrlimit(Resource::RLIMIT_NOFILE).unwrap_or((0, 0));
            let found = matches!(get(), Ok(Some(_)));
            installed && found && soft > BOOTSTRAP_SLOT as libc::rlim_t
        });
    }

    #[test_traced]
    fn test_set_rejects_low_hard_limit() {
        let _guard = lock();
        let (left, _right) = super::super::allocate().unwrap();
        in_child(|| {
            if set(None).is_err() || setrlimit(Resource::RLIMIT_NOFILE, 256, 256).is_err() {
                return false;
            }
            matches!(set(Some(left.as_fd())), Err(Error::Handoff(_))) && matches!(get(), Ok(None))
        });
    }
}
