//! Hand work across a fork boundary with pipes, capability ports, and shared memory.
//!
//! # Overview
//!
//! A fuzzing run is made of one supervising process and a pool of forked workers that never
//! share an address space with it. This crate provides the plumbing that lets them cooperate:
//!
//! - [pipe]: a portable message channel built from two unnamed pipes.
//! - [port]: a capability-port channel whose endpoints are exchanged explicitly after fork
//!   through a well-known bootstrap slot.
//! - [shm]: values placed in anonymous shared mappings that stay visible to every process
//!   forked after their creation.
//! - [atomic]: compare-and-swap retry loops and a wait-for-exit helper keyed by an atomic pid.
//!
//! Both channel variants implement [Transport] and [Channel], so callers can select one at
//! construction time and stay generic over the rest. Messages always cross the boundary by
//! value: they are encoded with `commonware-codec` and decoded on the other side.
//!
//! # Status
//!
//! `evofuzz-ipc` is **ALPHA** software and is Linux-only.

use bytes::Buf;
use commonware_codec::{Decode, Encode, Error as CodecError};
use nix::{errno::Errno, unistd::Pid};
use std::{
    io::Error as IoError,
    os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd},
    panic::{catch_unwind, AssertUnwindSafe},
    time::Duration,
};
use thiserror::Error;

pub mod atomic;
pub mod pipe;
pub mod port;
pub mod shm;

/// Largest encoded message accepted by either channel variant.
pub const MAX_FRAME: usize = 64 * 1024;

/// Exit code used by a forked child whose entry point panicked.
pub const EXIT_PANIC: i32 = 101;

/// Errors that can occur when moving data across a process boundary.
#[derive(Error, Debug)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] IoError),
    #[error("system error: {0}")]
    Sys(#[from] Errno),
    #[error("short write: {0} of {1} bytes")]
    ShortWrite(usize, usize),
    #[error("short read: {0} of {1} bytes")]
    ShortRead(usize, usize),
    #[error("closed")]
    Closed,
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),
    #[error("unable to decode: {0}")]
    Codec(#[from] CodecError),
    #[error("handoff failed: {0}")]
    Handoff(&'static str),
    #[error("fork failed: {0}")]
    Fork(Errno),
    #[error("map failed: {0}")]
    Map(IoError),
}

/// A bidirectional, message-oriented channel between a parent and a forked child.
///
/// Per channel, messages are delivered in the order they were sent. [AsFd] exposes the
/// receiving side so callers can wait on many channels with [ready].
pub trait Channel: AsFd + Send + 'static {
    /// Encode `msg` and write it to the peer.
    ///
    /// Blocks while the underlying buffer is full.
    fn send<M: Encode>(&self, msg: &M) -> Result<(), Error>;

    /// Block until the next message arrives and decode it.
    ///
    /// Returns [Error::Closed] once every copy of the peer's sending end is gone.
    fn recv<M: Decode<Cfg = ()>>(&self) -> Result<M, Error>;

    /// Raw descriptors held by this endpoint.
    ///
    /// A child that owns this endpoint passes these to [close_all_except] so that it keeps
    /// them while releasing everything else it inherited.
    fn descriptors(&self) -> Vec<RawFd>;
}

/// A way of forking a worker that is connected to its parent by a [Channel].
pub trait Transport: Clone + Send + 'static {
    /// The channel type produced on both sides of the fork.
    type Channel: Channel;

    /// Fork a child that runs `entry` with its end of a fresh channel.
    ///
    /// The parent receives the child's pid and its own end of the channel. The child never
    /// returns from this call: it exits with the code returned by `entry`.
    fn spawn<F>(&self, entry: F) -> Result<(Pid, Self::Channel), Error>
    where
        F: FnOnce(Self::Channel) -> i32;
}

/// Decode a message that must occupy the whole of `buf`.
pub(crate) fn decode<M: Decode<Cfg = ()>>(buf: impl Buf) -> Result<M, Error> {
    Ok(M::decode_cfg(buf, &())?)
}

/// Encode a message, rejecting anything larger than [MAX_FRAME].
pub(crate) fn encode<M: Encode>(msg: &M) -> Result<Vec<u8>, Error> {
    let encoded = msg.encode();
    if encoded.len() > MAX_FRAME {
        return Err(Error::FrameTooLarge(encoded.len()));
    }
    Ok(encoded.to_vec())
}

/// Run `entry` in a freshly forked child and terminate the child with its result.
///
/// Unwinding out of `entry` would return into the parent's copy of the stack, so panics
/// are caught and reported as [EXIT_PANIC].
pub(crate) fn run_child<F: FnOnce() -> i32>(entry: F) -> ! {
    let code = catch_unwind(AssertUnwindSafe(entry)).unwrap_or(EXIT_PANIC);

    // SAFETY: _exit is async-signal-safe and skips the parent's atexit handlers.
    unsafe { libc::_exit(code) }
}

/// Close every descriptor above standard error that is not listed in `keep`.
///
/// A forked child inherits every descriptor of its parent, including the parent's ends of
/// channels to other children. Holding those open would keep the other children from ever
/// observing a hang-up, so workers call this before serving. The owning values still live in
/// the child's copy of the parent's memory and are never dropped there, so closing the raw
/// numbers does not lead to a double close.
pub fn close_all_except(keep: &[RawFd]) -> Result<(), Error> {
    let mut keep: Vec<libc::c_uint> = keep
        .iter()
        .filter(|fd| **fd > 2)
        .map(|fd| *fd as libc::c_uint)
        .collect();
    keep.sort_unstable();
    keep.dedup();

    let mut first: libc::c_uint = 3;
    for fd in keep.into_iter().chain(std::iter::once(libc::c_uint::MAX)) {
        if fd > first {
            close_range(first, fd - 1)?;
        }
        first = fd.saturating_add(1);
    }
    Ok(())
}

/// Close every descriptor in `[first, last]`.
fn close_range(first: libc::c_uint, last: libc::c_uint) -> Result<(), Error> {
    // SAFETY: close_range only affects the descriptor table.
    let result = unsafe { libc::syscall(libc::SYS_close_range, first, last, 0 as libc::c_uint) };
    if result == 0 {
        return Ok(());
    }
    match Errno::last() {
        // Kernels without close_range: fall back to closing one by one up to the soft limit
        Errno::ENOSYS => {
            // SAFETY: sysconf has no preconditions.
            let limit = unsafe { libc::sysconf(libc::_SC_OPEN_MAX) }.max(1024) as libc::c_uint;
            for fd in first..=last.min(limit) {
                // SAFETY: closing a descriptor number has no memory safety implications.
                unsafe { libc::close(fd as RawFd) };
            }
            Ok(())
        }
        err => Err(err.into()),
    }
}

/// Wait until at least one of `fds` is readable (or hung up), or `timeout` elapses.
///
/// Returns the indices of the ready descriptors, which is empty on timeout or when
/// interrupted by a signal.
pub fn ready(fds: &[BorrowedFd<'_>], timeout: Duration) -> Result<Vec<usize>, Error> {
    let mut polled: Vec<libc::pollfd> = fds
        .iter()
        .map(|fd| libc::pollfd {
            fd: fd.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        })
        .collect();
    let timeout = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);

    // SAFETY: polled is a valid, exclusively borrowed array of pollfd structures.
    let count = unsafe { libc::poll(polled.as_mut_ptr(), polled.len() as libc::nfds_t, timeout) };
    if count < 0 {
        let err = Errno::last();
        if err == Errno::EINTR {
            return Ok(Vec::new());
        }
        return Err(err.into());
    }
    Ok(polled
        .iter()
        .enumerate()
        .filter(|(_, fd)| fd.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0)
        .map(|(i, _)| i)
        .collect())
}
