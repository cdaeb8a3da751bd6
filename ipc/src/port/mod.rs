//! Capability-port channel with an explicit post-fork handoff.
//!
//! # Overview
//!
//! A port is a connected `AF_UNIX` sequenced-packet socket pair: the receive right is one end
//! and the send right is the other. Send rights can be handed to another process as an
//! attachment of a message, and that is the only way the two sides of a [PortChannel] learn
//! about each other's ports.
//!
//! # Handoff
//!
//! [fork_pass_port] establishes the channel in three steps:
//!
//! 1. The parent allocates a port and installs its send right in the bootstrap [slot] before
//!    forking, so the child can locate it by number.
//! 2. The child takes the send right out of the slot, allocates its own private port, and sends
//!    that port's send right to the parent through the bootstrap port.
//! 3. The parent restores its slot as soon as the fork returns, receives the child's send
//!    right, and replies over it with the capability the slot held before step 1. The child
//!    installs the received capability in its own slot and only then runs its entry point.
//!
//! The parent restores its slot whether or not the handoff succeeds. A child whose handoff
//! fails exits with [EXIT_HANDOFF] without running its entry point, and the parent reaps it.

use crate::{decode, encode, run_child, Channel, Error, Transport, MAX_FRAME};
use commonware_codec::{Decode, Encode};
use nix::{
    errno::Errno,
    sys::{
        signal::{kill, Signal},
        socket::{socketpair, AddressFamily, SockFlag, SockType},
        wait::waitpid,
    },
    unistd::{fork, ForkResult, Pid},
};
use std::{
    mem,
    os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd},
    sync::Mutex,
    time::Duration,
};
use tracing::{debug, warn};

pub mod rights;
pub mod slot;

/// Exit code of a child whose handoff failed.
pub const EXIT_HANDOFF: i32 = 125;

/// How long either side waits for its peer during the handoff.
const HANDOFF_TIMEOUT: Duration = Duration::from_secs(5);

/// Held for the duration of a handoff.
static HANDOFF: Mutex<()> = Mutex::new(());

/// Marker byte for a handoff message that carries a capability.
const PRESENT: u8 = 1;

/// Marker byte for a handoff message that reports an empty slot.
const ABSENT: u8 = 0;

/// Allocate a new port, returning its receive right and its send right.
pub fn allocate() -> Result<(OwnedFd, OwnedFd), Error> {
    Ok(socketpair(
        AddressFamily::Unix,
        SockType::SeqPacket,
        None,
        SockFlag::SOCK_CLOEXEC,
    )?)
}

/// Bound (or unbound, when `None`) the time a receive on `port` may block.
fn set_timeout(port: BorrowedFd<'_>, timeout: Option<Duration>) -> Result<(), Error> {
    let timeout = timeout.unwrap_or_default();
    let value = libc::timeval {
        tv_sec: timeout.as_secs() as libc::time_t,
        tv_usec: timeout.subsec_micros() as libc::suseconds_t,
    };

    // SAFETY: value is a valid timeval that outlives the call.
    let result = unsafe {
        libc::setsockopt(
            port.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_RCVTIMEO,
            (&value as *const libc::timeval).cast(),
            mem::size_of::<libc::timeval>() as libc::socklen_t,
        )
    };
    if result < 0 {
        return Err(Errno::last().into());
    }
    Ok(())
}

/// Receive one handoff message and return the capability it carries, if any.
fn recv_capability(port: BorrowedFd<'_>) -> Result<Option<OwnedFd>, Error> {
    let mut marker = [0u8; 1];
    let (_, right) = match rights::recv(port, &mut marker) {
        Ok(received) => received,
        Err(Error::Sys(Errno::EAGAIN)) => return Err(Error::Handoff("peer timed out")),
        Err(err) => return Err(err),
    };
    match (marker[0], right) {
        (PRESENT, Some(right)) => Ok(Some(right)),
        (ABSENT, None) => Ok(None),
        _ => Err(Error::Handoff("malformed capability message")),
    }
}

/// Send one handoff message carrying `capability`, or reporting its absence.
fn send_capability(port: BorrowedFd<'_>, capability: Option<BorrowedFd<'_>>) -> Result<(), Error> {
    let marker = if capability.is_some() { PRESENT } else { ABSENT };
    rights::send(port, &[marker], capability)
}

/// One side of a port-backed channel.
pub struct PortChannel {
    /// Send right of the peer's port.
    tx: OwnedFd,
    /// Receive right of our own port.
    rx: OwnedFd,
}

impl Channel for PortChannel {
    fn send<M: Encode>(&self, msg: &M) -> Result<(), Error> {
        let payload = encode(msg)?;
        rights::send(self.tx.as_fd(), &payload, None)
    }

    fn recv<M: Decode<Cfg = ()>>(&self) -> Result<M, Error> {
        let mut buf = vec![0u8; MAX_FRAME];
        let (len, _) = rights::recv(self.rx.as_fd(), &mut buf)?;
        decode(&buf[..len])
    }

    fn descriptors(&self) -> Vec<RawFd> {
        vec![self.tx.as_raw_fd(), self.rx.as_raw_fd()]
    }
}

impl AsFd for PortChannel {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.rx.as_fd()
    }
}

/// Parent half of the handoff, run after fork.
fn parent_handoff(bootstrap: &OwnedFd, original: Option<&OwnedFd>) -> Result<OwnedFd, Error> {
    set_timeout(bootstrap.as_fd(), Some(HANDOFF_TIMEOUT))?;
    let child_port = recv_capability(bootstrap.as_fd())?
        .ok_or(Error::Handoff("child sent no port"))?;
    send_capability(child_port.as_fd(), original.map(|fd| fd.as_fd()))?;
    set_timeout(bootstrap.as_fd(), None)?;
    Ok(child_port)
}

/// Child half of the handoff, run after fork.
fn child_handoff() -> Result<PortChannel, Error> {
    let parent_port = slot::get()?.ok_or(Error::Handoff("bootstrap slot empty"))?;
    let (rx, tx) = allocate()?;
    send_capability(parent_port.as_fd(), Some(tx.as_fd()))?;
    drop(tx);

    set_timeout(rx.as_fd(), Some(HANDOFF_TIMEOUT))?;
    let original = recv_capability(rx.as_fd())?;
    set_timeout(rx.as_fd(), None)?;
    slot::set(original.as_ref().map(|fd| fd.as_fd()))?;
    Ok(PortChannel {
        tx: parent_port,
        rx,
    })
}

/// Fork a child and establish a [PortChannel] with it through the bootstrap slot.
///
/// On success the parent's slot holds exactly what it held before the call, and the child's
/// slot holds the same capability by the time `entry` runs. On failure the parent's slot is
/// restored as well and the child is killed and reaped.
///
/// Handoffs started from several threads of one process are serialized, since they share the
/// slot. `entry` must not itself call [fork_pass_port].
pub fn fork_pass_port<F>(entry: F) -> Result<(Pid, PortChannel), Error>
where
    F: FnOnce(PortChannel) -> i32,
{
    fork_with_handoff(child_handoff, entry)
}

/// Fork a child that runs `handoff` to obtain its end of the channel before `entry`.
fn fork_with_handoff<H, F>(handoff: H, entry: F) -> Result<(Pid, PortChannel), Error>
where
    H: FnOnce() -> Result<PortChannel, Error>,
    F: FnOnce(PortChannel) -> i32,
{
    let _handoff = HANDOFF.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let original = slot::get()?;
    let (bootstrap_rx, bootstrap_tx) = allocate()?;
    slot::set(Some(bootstrap_tx.as_fd()))?;
    drop(bootstrap_tx);

    // SAFETY: the child only completes the handoff, runs `entry`, and exits.
    let pid = match unsafe { fork() } {
        Ok(ForkResult::Parent { child }) => child,
        Ok(ForkResult::Child) => {
            drop(bootstrap_rx);
            drop(original);
            run_child(move || match handoff() {
                Ok(channel) => entry(channel),
                Err(_) => EXIT_HANDOFF,
            })
        }
        Err(err) => {
            slot::set(original.as_ref().map(|fd| fd.as_fd()))?;
            return Err(Error::Fork(err));
        }
    };

    // The child now holds the only bootstrap send right, so a child that dies before
    // answering shows up as a hang-up
    let restored = slot::set(original.as_ref().map(|fd| fd.as_fd()));
    let handoff = restored.and_then(|()| parent_handoff(&bootstrap_rx, original.as_ref()));
    match handoff {
        Ok(child_port) => {
            debug!(%pid, "completed port handoff");
            Ok((
                pid,
                PortChannel {
                    tx: child_port,
                    rx: bootstrap_rx,
                },
            ))
        }
        Err(err) => {
            warn!(%pid, ?err, "port handoff failed");
            let _ = kill(pid, Signal::SIGKILL);
            loop {
                match waitpid(pid, None) {
                    Err(Errno::EINTR) => continue,
                    _ => break,
                }
            }
            Err(err)
        }
    }
}

/// Forks workers connected by port channels.
#[derive(Clone, Copy, Debug, Default)]
pub struct Port;

impl Transport for Port {
    type Channel = PortChannel;

    fn spawn<F>(&self, entry: F) -> Result<(Pid, PortChannel), Error>
    where
        F: FnOnce(PortChannel) -> i32,
    {
        fork_pass_port(entry)
    }
}
