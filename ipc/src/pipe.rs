//! Message channel built from a pair of unnamed pipes.
//!
//! Each [Endpoint] owns the read end of one pipe and the write end of the other. Messages are
//! framed with a big-endian `u32` length prefix followed by the encoded payload, so the bytes
//! that cross the pipe are the message itself rather than a reference into the sender's memory.

use crate::{decode, encode, run_child, Channel, Error, Transport};
use commonware_codec::{Decode, Encode};
use nix::{
    fcntl::OFlag,
    unistd::{fork, pipe2, ForkResult, Pid},
};
use std::{
    fs::File,
    io::{ErrorKind, Read, Write},
    os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd},
};
use tracing::debug;

/// Size of the length prefix in front of every frame.
const PREFIX: usize = 4;

/// One side of a pipe-backed channel.
pub struct Endpoint {
    reader: File,
    writer: File,
}

/// Create two connected endpoints.
///
/// Both pipes are close-on-exec so that traced targets started by a worker never inherit them.
pub fn channel() -> Result<(Endpoint, Endpoint), Error> {
    let (left_read, right_write) = pipe2(OFlag::O_CLOEXEC)?;
    let (right_read, left_write) = pipe2(OFlag::O_CLOEXEC)?;
    let left = Endpoint {
        reader: File::from(left_read),
        writer: File::from(left_write),
    };
    let right = Endpoint {
        reader: File::from(right_read),
        writer: File::from(right_write),
    };
    Ok((left, right))
}

/// Read until `buf` is full or the pipe reports end-of-file, returning the bytes read.
fn fill(mut reader: &File, buf: &mut [u8]) -> Result<usize, Error> {
    let mut read = 0;
    while read < buf.len() {
        match reader.read(&mut buf[read..]) {
            Ok(0) => break,
            Ok(n) => read += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        }
    }
    Ok(read)
}

impl Endpoint {
    /// Write one frame. A single `write` must accept the whole frame.
    fn send_frame(&self, payload: &[u8]) -> Result<(), Error> {
        let mut frame = Vec::with_capacity(PREFIX + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(payload);

        let written = loop {
            match (&self.writer).write(&frame) {
                Ok(n) => break n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::BrokenPipe => return Err(Error::Closed),
                Err(err) => return Err(err.into()),
            }
        };
        if written != frame.len() {
            return Err(Error::ShortWrite(written, frame.len()));
        }
        Ok(())
    }

    /// Read one frame.
    fn recv_frame(&self) -> Result<Vec<u8>, Error> {
        let mut prefix = [0u8; PREFIX];
        match fill(&self.reader, &mut prefix)? {
            0 => return Err(Error::Closed),
            PREFIX => {}
            n => return Err(Error::ShortRead(n, PREFIX)),
        }
        let len = u32::from_be_bytes(prefix) as usize;
        if len > crate::MAX_FRAME {
            return Err(Error::FrameTooLarge(len));
        }

        let mut payload = vec![0u8; len];
        let read = fill(&self.reader, &mut payload)?;
        if read != len {
            return Err(Error::ShortRead(read, len));
        }
        Ok(payload)
    }
}

impl Channel for Endpoint {
    fn send<M: Encode>(&self, msg: &M) -> Result<(), Error> {
        let payload = encode(msg)?;
        self.send_frame(&payload)
    }

    fn recv<M: Decode<Cfg = ()>>(&self) -> Result<M, Error> {
        let payload = self.recv_frame()?;
        decode(payload.as_slice())
    }

    fn descriptors(&self) -> Vec<RawFd> {
        vec![self.reader.as_raw_fd(), self.writer.as_raw_fd()]
    }
}

impl AsFd for Endpoint {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.reader.as_fd()
    }
}

/// Forks workers connected by pipe channels.
///
/// Descriptors survive fork, so no handoff is needed: the channel is created first and each
/// process keeps its own end.
#[derive(Clone, Copy, Debug, Default)]
pub struct Pipe;

impl Transport for Pipe {
    type Channel = Endpoint;

    fn spawn<F>(&self, entry: F) -> Result<(Pid, Endpoint), Error>
    where
        F: FnOnce(Endpoint) -> i32,
    {
        let (parent, child) = channel()?;

        // SAFETY: the child only runs `entry` and then exits without returning.
        match unsafe { fork() }.map_err(Error::Fork)? {
            ForkResult::Parent { child: pid } => {
                drop(child);
                debug!(%pid, "forked pipe worker");
                Ok((pid, parent))
            }
            ForkResult::Child => {
                drop(parent);
                run_child(move || entry(child))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::Note;
    use commonware_macros::test_traced;
    use nix::sys::wait::{waitpid, WaitStatus};

    #[test_traced]
    fn test_round_trip() {
        let (left, right) = channel().unwrap();

        // Test case 0: fixed-size payload
        left.send(&42u64).unwrap();
        assert_eq!(right.recv::<u64>().unwrap(), 42);

        // Test case 1: variable-size payload in the opposite direction
        let note = Note {
            id: 7,
            body: b"syscall".to_vec(),
        };
        right.send(&note).unwrap();
        assert_eq!(left.recv::<Note>().unwrap(), note);

        // Test case 2: order is preserved
        for i in 0..16u32 {
            left.send(&i).unwrap();
        }
        for i in 0..16u32 {
            assert_eq!(right.recv::<u32>().unwrap(), i);
        }
    }

    #[test_traced]
    fn test_closed() {
        let (left, right) = channel().unwrap();
        drop(right);
        assert!(matches!(left.recv::<u64>(), Err(Error::Closed)));
    }

    #[test_traced]
    fn test_truncated_frame() {
        let (left, right) = channel().unwrap();

        // Announce eight bytes but only deliver three
        let mut frame = 8u32.to_be_bytes().to_vec();
        frame.extend_from_slice(&[1, 2, 3]);
        (&left.writer).write_all(&frame).unwrap();
        drop(left);

        assert!(matches!(right.recv::<u64>(), Err(Error::ShortRead(3, 8))));
    }

    #[test_traced]
    fn test_oversized_prefix() {
        let (left, right) = channel().unwrap();
        (&left.writer)
            .write_all(&(crate::MAX_FRAME as u32 + 1).to_be_bytes())
            .unwrap();
        assert!(matches!(right.recv::<u64>(), Err(Error::FrameTooLarge(_))));
    }

    #[test_traced]
    fn test_spawn_echo() {
        let (pid, parent) = Pipe
            .spawn(|channel| {
                while let Ok(note) = channel.recv::<Note>() {
                    if channel.send(&note).is_err() {
                        return 1;
                    }
                }
                0
            })
            .unwrap();

        let note = Note {
            id: 99,
            body: vec![0xAA; 512],
        };
        parent.send(&note).unwrap();
        assert_eq!(parent.recv::<Note>().unwrap(), note);

        // Closing our end lets the child drain and exit cleanly
        drop(parent);
        assert_eq!(waitpid(pid, None).unwrap(), WaitStatus::Exited(pid, 0));
    }
}
