//! Lock-free coordination over atomics shared between processes.
//!
//! Every read-modify-write goes through [update]: load a snapshot, compute the next value,
//! and retry the compare-exchange against a freshly reloaded snapshot until it succeeds. No
//! update is lost regardless of how many processes write concurrently.

use crate::Error;
use nix::{
    errno::Errno,
    sys::wait::{waitpid, WaitStatus},
    unistd::Pid,
};
use std::sync::atomic::{
    AtomicBool, AtomicI32, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering,
};

/// An atomic value that supports compare-and-swap.
pub trait Atomic {
    /// The plain type held by the atomic.
    type Value: Copy + Eq;

    /// Load the current value.
    fn snapshot(&self) -> Self::Value;

    /// Replace `current` with `new` if the atomic still holds `current`.
    fn swap_if(&self, current: Self::Value, new: Self::Value) -> Result<Self::Value, Self::Value>;
}

macro_rules! impl_atomic {
    ($atomic:ty, $value:ty) => {
        impl Atomic for $atomic {
            type Value = $value;

            #[inline]
            fn snapshot(&self) -> $value {
                self.load(Ordering::Acquire)
            }

            #[inline]
            fn swap_if(&self, current: $value, new: $value) -> Result<$value, $value> {
                self.compare_exchange_weak(current, new, Ordering::AcqRel, Ordering::Acquire)
            }
        }
    };
}

impl_atomic!(AtomicU8, u8);
impl_atomic!(AtomicU32, u32);
impl_atomic!(AtomicI32, i32);
impl_atomic!(AtomicU64, u64);
impl_atomic!(AtomicUsize, usize);
impl_atomic!(AtomicBool, bool);

/// Apply `f` to the value held by `atomic`, retrying until no concurrent writer interferes.
///
/// Returns the value that `f` replaced.
pub fn update<A: Atomic>(atomic: &A, mut f: impl FnMut(A::Value) -> A::Value) -> A::Value {
    let mut current = atomic.snapshot();
    loop {
        match atomic.swap_if(current, f(current)) {
            Ok(previous) => return previous,
            Err(actual) => current = actual,
        }
    }
}

/// Store `value` through the retry loop and return the value it replaced.
pub fn store<A: Atomic>(atomic: &A, value: A::Value) -> A::Value {
    update(atomic, |_| value)
}

/// Block until the child whose pid is held in `pid` exits, then clear `pid`.
///
/// Returns `None` if no child is recorded (the slot holds zero) or the child was already
/// reaped elsewhere. The slot is only cleared if it still names the reaped child, so a
/// concurrent respawn into the same slot is never overwritten.
pub fn wait_for_exit(pid: &AtomicI32) -> Result<Option<WaitStatus>, Error> {
    let raw = pid.snapshot();
    if raw <= 0 {
        return Ok(None);
    }

    let status = loop {
        match waitpid(Pid::from_raw(raw), None) {
            Ok(status @ (WaitStatus::Exited(..) | WaitStatus::Signaled(..))) => break Some(status),
            Ok(_) => continue,
            Err(Errno::EINTR) => continue,
            Err(Errno::ECHILD) => break None,
            Err(err) => return Err(err.into()),
        }
    };
    let _ = pid.compare_exchange(raw, 0, Ordering::AcqRel, Ordering::Acquire);
    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::Shared;
    use commonware_macros::test_traced;
    use nix::unistd::{fork, ForkResult};
    use std::{collections::HashMap, sync::Arc, thread};

    #[test_traced]
    fn test_update_returns_previous() {
        let counter = AtomicU64::new(5);
        assert_eq!(update(&counter, |v| v * 2), 5);
        assert_eq!(counter.load(Ordering::Acquire), 10);
        assert_eq!(store(&counter, 3), 10);
        assert_eq!(counter.load(Ordering::Acquire), 3);
    }

    #[test_traced]
    fn test_update_flag_and_index() {
        let flag = AtomicBool::new(false);
        assert!(!update(&flag, |v| !v));
        assert!(flag.load(Ordering::Acquire));
        assert!(store(&flag, false));
        assert!(!flag.load(Ordering::Acquire));

        let index = Shared::new(AtomicUsize::new(usize::MAX - 1)).unwrap();
        assert_eq!(update(&*index, |v| v.wrapping_add(2)), usize::MAX - 1);
        assert_eq!(index.load(Ordering::Acquire), 0);
    }

    #[test_traced]
    fn test_no_lost_increments_threads() {
        const WRITERS: u64 = 8;
        const INCREMENTS: u64 = 10_000;
        let counter = Arc::new(AtomicU64::new(0));

        let handles: Vec<_> = (0..WRITERS)
            .map(|_| {
                let counter = counter.clone();
                thread::spawn(move || {
                    for _ in 0..INCREMENTS {
                        update(&*counter, |v| v + 1);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Acquire), WRITERS * INCREMENTS);
    }

    #[test_traced]
    fn test_no_lost_increments_processes() {
        const WRITERS: usize = 4;
        const INCREMENTS: u64 = 5_000;
        let counter = Shared::new(AtomicU64::new(0)).unwrap();

        let mut children = Vec::new();
        for _ in 0..WRITERS {
            // SAFETY: the child only touches the shared atomic and exits.
            match unsafe { fork() }.unwrap() {
                ForkResult::Child => {
                    for _ in 0..INCREMENTS {
                        update(&*counter, |v| v + 1);
                    }
                    // SAFETY: _exit is always safe to call.
                    unsafe { libc::_exit(0) }
                }
                ForkResult::Parent { child } => children.push(child),
            }
        }
        for child in children {
            assert_eq!(waitpid(child, None).unwrap(), WaitStatus::Exited(child, 0));
        }
        assert_eq!(counter.load(Ordering::Acquire), WRITERS as u64 * INCREMENTS);
    }

    #[test_traced]
    fn test_stores_linearize() {
        const WRITERS: u64 = 6;
        const STORES: u64 = 2_000;
        let value = Arc::new(AtomicU64::new(0));

        // Every writer stores unique values and records what each store replaced
        let handles: Vec<_> = (0..WRITERS)
            .map(|writer| {
                let value = value.clone();
                thread::spawn(move || {
                    (0..STORES)
                        .map(|i| {
                            let next = writer * STORES + i + 1;
                            (store(&*value, next), next)
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut successor = HashMap::new();
        for handle in handles {
            for (previous, next) in handle.join().unwrap() {
                // Each value can be replaced at most once
                assert!(successor.insert(previous, next).is_none());
            }
        }

        // Following the replacements from the initial value visits every store exactly once
        // and ends at the final value
        let mut current = 0;
        let mut visited = 0;
        while let Some(next) = successor.get(&current) {
            current = *next;
            visited += 1;
        }
        assert_eq!(visited, WRITERS * STORES);
        assert_eq!(current, value.load(Ordering::Acquire));
    }

    #[test_traced]
    fn test_wait_for_exit_clears_pid() {
        let pid = Shared::new(AtomicI32::new(0)).unwrap();

        // Test case 0: nothing recorded
        assert!(wait_for_exit(&pid).unwrap().is_none());

        // Test case 1: a child that exits with a known code
        // SAFETY: the child exits immediately.
        match unsafe { fork() }.unwrap() {
            ForkResult::Child => {
                // SAFETY: _exit is always safe to call.
                unsafe { libc::_exit(9) }
            }
            ForkResult::Parent { child } => {
                store(&*pid, child.as_raw());
                let status = wait_for_exit(&pid).unwrap();
                assert_eq!(status, Some(WaitStatus::Exited(child, 9)));
                assert_eq!(pid.load(Ordering::Acquire), 0);
            }
        }
    }
}
