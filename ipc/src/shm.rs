//! Values that stay shared with every process forked after their creation.

use crate::Error;
use std::{
    io::Error as IoError,
    mem,
    ops::Deref,
    ptr::{self, NonNull},
    sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, AtomicU8, AtomicUsize},
};

/// Marker for types that may live in memory shared between processes.
///
/// # Safety
///
/// Implementors must be valid when only their bytes are shared: no heap pointers, no
/// process-local handles, and no reliance on `Drop` (the destructor never runs). All mutation
/// must go through atomics so concurrent access from several processes is sound.
pub unsafe trait Plain: Sync {}

// SAFETY: atomics are plain data whose operations are lock-free across processes.
unsafe impl Plain for AtomicBool {}
// SAFETY: see above.
unsafe impl Plain for AtomicU8 {}
// SAFETY: see above.
unsafe impl Plain for AtomicU32 {}
// SAFETY: see above.
unsafe impl Plain for AtomicI32 {}
// SAFETY: see above.
unsafe impl Plain for AtomicU64 {}
// SAFETY: see above.
unsafe impl Plain for AtomicUsize {}
// SAFETY: an array of plain values is plain.
unsafe impl<T: Plain, const N: usize> Plain for [T; N] {}

/// A value placed in an anonymous `MAP_SHARED` mapping.
///
/// The mapping is created before any fork and is inherited by children at the same address,
/// so every process observes the same value. Each process unmaps its own view on drop.
pub struct Shared<T: Plain> {
    ptr: NonNull<T>,
    len: usize,
}

// SAFETY: T is Sync and only ever reached through shared references.
unsafe impl<T: Plain> Send for Shared<T> {}
// SAFETY: see above.
unsafe impl<T: Plain> Sync for Shared<T> {}

impl<T: Plain> Shared<T> {
    /// Map a fresh shared region and move `value` into it.
    pub fn new(value: T) -> Result<Self, Error> {
        let len = mem::size_of::<T>().max(1);

        // SAFETY: an anonymous mapping with no address hint has no preconditions.
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(Error::Map(IoError::last_os_error()));
        }
        let ptr = NonNull::new(addr.cast::<T>()).ok_or(Error::Map(IoError::other("null mapping")))?;

        // SAFETY: the mapping is page-aligned, large enough for T, and not yet observed.
        unsafe { ptr.as_ptr().write(value) };
        Ok(Self { ptr, len })
    }
}

impl<T: Plain> Deref for Shared<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: ptr was initialized in new and stays mapped until drop.
        unsafe { self.ptr.as_ref() }
    }
}

impl<T: Plain> Drop for Shared<T> {
    fn drop(&mut self) {
        // SAFETY: the mapping was created by new with this length and is unmapped once.
        unsafe { libc::munmap(self.ptr.as_ptr().cast(), self.len) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use commonware_macros::test_traced;
    use nix::{
        sys::wait::{waitpid, WaitStatus},
        unistd::{fork, ForkResult},
    };
    use std::sync::atomic::Ordering;

    #[test_traced]
    fn test_visible_across_fork() {
        let counters = Shared::new([AtomicU64::new(0), AtomicU64::new(0)]).unwrap();

        // SAFETY: the child only touches atomics and exits.
        match unsafe { fork() }.unwrap() {
            ForkResult::Child => {
                counters[1].store(7, Ordering::Release);
                // SAFETY: _exit is always safe to call.
                unsafe { libc::_exit(0) }
            }
            ForkResult::Parent { child } => {
                assert_eq!(waitpid(child, None).unwrap(), WaitStatus::Exited(child, 0));
            }
        }

        assert_eq!(counters[0].load(Ordering::Acquire), 0);
        assert_eq!(counters[1].load(Ordering::Acquire), 7);
    }

    #[test_traced]
    fn test_initial_value() {
        let flag = Shared::new(AtomicBool::new(true)).unwrap();
        assert!(flag.load(Ordering::Acquire));
    }
}
