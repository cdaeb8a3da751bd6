//! Message transfer with optional capability passing (`SCM_RIGHTS`).

use crate::Error;
use nix::errno::Errno;
use std::{
    mem,
    os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd},
    ptr,
};

/// Control buffer large enough for a handful of descriptors, aligned for `cmsghdr`.
type Control = [u64; 8];

/// Send `payload` as one message on `port`, transferring `right` alongside it.
///
/// `payload` must not be empty: a zero-length message is indistinguishable from a hang-up.
pub fn send(port: BorrowedFd<'_>, payload: &[u8], right: Option<BorrowedFd<'_>>) -> Result<(), Error> {
    assert!(!payload.is_empty(), "empty messages are reserved for hang-up");
    let mut iov = libc::iovec {
        iov_base: payload.as_ptr() as *mut libc::c_void,
        iov_len: payload.len(),
    };
    let mut control: Control = [0; 8];

    // SAFETY: msghdr is plain data for which all-zeroes is a valid value.
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    if let Some(right) = right {
        // SAFETY: the control buffer outlives the call and is large enough for one descriptor,
        // so CMSG_FIRSTHDR returns a header inside it.
        unsafe {
            msg.msg_control = control.as_mut_ptr().cast();
            msg.msg_controllen = libc::CMSG_SPACE(mem::size_of::<RawFd>() as u32) as _;
            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(mem::size_of::<RawFd>() as u32) as _;
            ptr::write_unaligned(libc::CMSG_DATA(cmsg).cast::<RawFd>(), right.as_raw_fd());
        }
    }

    let sent = loop {
        // SAFETY: msg points at buffers that stay alive for the duration of the call.
        let sent = unsafe { libc::sendmsg(port.as_raw_fd(), &msg, libc::MSG_NOSIGNAL) };
        if sent >= 0 {
            break sent as usize;
        }
        match Errno::last() {
            Errno::EINTR => continue,
            Errno::EPIPE | Errno::ECONNRESET => return Err(Error::Closed),
            err => return Err(err.into()),
        }
    };
    if sent != payload.len() {
        return Err(Error::ShortWrite(sent, payload.len()));
    }
    Ok(())
}

/// Receive one message from `port` into `buf`.
///
/// Returns the message length and the first capability attached to it. Any additional
/// capabilities are closed.
pub fn recv(port: BorrowedFd<'_>, buf: &mut [u8]) -> Result<(usize, Option<OwnedFd>), Error> {
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr().cast(),
        iov_len: buf.len(),
    };
    let mut control: Control = [0; 8];

    // SAFETY: msghdr is plain data for which all-zeroes is a valid value.
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr().cast();
    msg.msg_controllen = mem::size_of::<Control>() as _;

    let received = loop {
        // SAFETY: msg points at buffers that stay alive for the duration of the call.
        let received = unsafe { libc::recvmsg(port.as_raw_fd(), &mut msg, libc::MSG_CMSG_CLOEXEC) };
        if received >= 0 {
            break received as usize;
        }
        match Errno::last() {
            Errno::EINTR => continue,
            Errno::ECONNRESET => return Err(Error::Closed),
            err => return Err(err.into()),
        }
    };

    // Take ownership of every delivered descriptor before checking anything else
    let mut rights = Vec::new();
    // SAFETY: the kernel filled msg_control with well-formed headers within msg_controllen.
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let data = libc::CMSG_DATA(cmsg).cast::<RawFd>();
                let header = libc::CMSG_LEN(0) as usize;
                let count = ((*cmsg).cmsg_len as usize - header) / mem::size_of::<RawFd>();
                for i in 0..count {
                    let fd = ptr::read_unaligned(data.add(i));
                    rights.push(OwnedFd::from_raw_fd(fd));
                }
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    if received == 0 {
        return Err(Error::Closed);
    }
    if msg.msg_flags & libc::MSG_TRUNC != 0 {
        return Err(Error::FrameTooLarge(received));
    }
    if msg.msg_flags & libc::MSG_CTRUNC != 0 {
        return Err(Error::Handoff("capability truncated"));
    }
    Ok((received, rights.into_iter().next()))
}
