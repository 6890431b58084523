//! Channel factory and exact-length stream I/O.
//!
//! A [`Channel`] is one unidirectional byte stream: the read side goes to a
//! single receiver, the write side is shared by the senders of a group. Both
//! kinds are plain blocking stream descriptors, so a message may arrive in
//! several pieces; [`read_exact`] and [`write_all`] accumulate partial
//! transfers until the full payload has moved.

use std::io::{self, ErrorKind};
use std::os::fd::{AsFd, OwnedFd};

use rustix::io::Errno;
use rustix::net::{AddressFamily, SocketFlags, SocketType, socketpair};

use crate::config::ChannelKind;
use crate::error::BenchError;

/// An owned pair of stream endpoints.
#[derive(Debug)]
pub struct Channel {
    reader: OwnedFd,
    writer: OwnedFd,
}

impl Channel {
    /// Creates a connected endpoint pair of the given kind.
    ///
    /// # Errors
    ///
    /// Returns [`BenchError::Channel`] when the OS refuses, typically because
    /// the descriptor limit is exhausted. There is no retry: a run missing a
    /// channel cannot produce a valid result.
    pub fn create(kind: ChannelKind) -> Result<Self, BenchError> {
        let (reader, writer) = match kind {
            ChannelKind::Pipe => rustix::pipe::pipe(),
            ChannelKind::Socket => socketpair(
                AddressFamily::UNIX,
                SocketType::STREAM,
                SocketFlags::empty(),
                None,
            ),
        }
        .map_err(|e| BenchError::Channel(e.into()))?;

        Ok(Self { reader, writer })
    }

    /// Splits the channel into its read and write sides.
    #[must_use]
    pub fn into_parts(self) -> (OwnedFd, OwnedFd) {
        (self.reader, self.writer)
    }
}

/// Reads exactly `buf.len()` bytes from `fd`, accumulating short reads.
///
/// # Errors
///
/// Fails with [`ErrorKind::UnexpectedEof`] if the stream ends first, or with
/// the underlying OS error.
pub fn read_exact(fd: impl AsFd, buf: &mut [u8]) -> io::Result<()> {
    let fd = fd.as_fd();
    let mut done = 0;
    while done < buf.len() {
        match rustix::io::read(fd, &mut buf[done..]) {
            Ok(0) => {
                return Err(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    format!("stream closed after {done} of {} bytes", buf.len()),
                ));
            }
            Ok(n) => done += n,
            Err(Errno::INTR) => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Writes all of `buf` to `fd`, accumulating short writes.
///
/// # Errors
///
/// Returns the underlying OS error, e.g. `EPIPE` once the reader is gone.
pub fn write_all(fd: impl AsFd, buf: &[u8]) -> io::Result<()> {
    let fd = fd.as_fd();
    let mut done = 0;
    while done < buf.len() {
        match rustix::io::write(fd, &buf[done..]) {
            Ok(0) => return Err(ErrorKind::WriteZero.into()),
            Ok(n) => done += n,
            Err(Errno::INTR) => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::thread;

    use serial_test::serial;

    const KINDS: [ChannelKind; 2] = [ChannelKind::Socket, ChannelKind::Pipe];

    #[test]
    fn carries_bytes_in_order() {
        for kind in KINDS {
            let (reader, writer) = Channel::create(kind).unwrap().into_parts();
            write_all(&writer, b"hello ").unwrap();
            write_all(&writer, b"world").unwrap();

            let mut buf = [0u8; 11];
            read_exact(&reader, &mut buf).unwrap();
            assert_eq!(&buf, b"hello world", "{kind}");
        }
    }

    #[test]
    fn large_message_survives_short_transfers() {
        // Bigger than a default pipe buffer, so both sides see partial I/O.
        const SIZE: usize = 256 * 1024;

        for kind in KINDS {
            let (reader, writer) = Channel::create(kind).unwrap().into_parts();
            let sender = thread::spawn(move || {
                let payload: Vec<u8> = (0..SIZE).map(|i| (i % 251) as u8).collect();
                write_all(&writer, &payload).unwrap();
            });

            let mut buf = vec![0u8; SIZE];
            read_exact(&reader, &mut buf).unwrap();
            sender.join().unwrap();

            assert!(
                buf.iter().enumerate().all(|(i, &b)| b == (i % 251) as u8),
                "{kind}: payload corrupted"
            );
        }
    }

    #[test]
    fn empty_transfers_do_no_io() {
        let (reader, writer) = Channel::create(ChannelKind::Pipe).unwrap().into_parts();
        drop(writer);
        // A closed stream is fine as long as nothing needs to move.
        read_exact(&reader, &mut []).unwrap();
    }

    #[test]
    #[serial]
    fn read_exact_reports_truncated_stream() {
        for kind in KINDS {
            let (reader, writer) = Channel::create(kind).unwrap().into_parts();
            write_all(&writer, b"abc").unwrap();
            drop(writer);

            let mut buf = [0u8; 8];
            let err = read_exact(&reader, &mut buf).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::UnexpectedEof, "{kind}");
        }
    }
}
