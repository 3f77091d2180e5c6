// Copyright 2024-Present Crossbar contributors
// SPDX-License-Identifier: Apache-2.0

//! Byte-stream halves over pipes and sockets.
//!
//! The bridge never blocks inside the kernel: every half runs in
//! non-blocking mode and the callers poll with idle sleeps so the quit
//! flags stay responsive. Socket halves are dup'ed handles of the same
//! descriptor; closing one direction uses `shutdown` so the peer still
//! observes a half-close.

use std::fs::File;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;

use nix::fcntl::{fcntl, FcntlArg, OFlag};

/// Reading side of a peer connection.
pub enum ReadHalf {
    Pipe(File),
    Tcp(TcpStream),
    Unix(UnixStream),
}

/// Writing side of a peer connection.
pub enum WriteHalf {
    Pipe(File),
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Read for ReadHalf {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            ReadHalf::Pipe(f) => f.read(buf),
            ReadHalf::Tcp(s) => s.read(buf),
            ReadHalf::Unix(s) => s.read(buf),
        }
    }
}

impl Write for WriteHalf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            WriteHalf::Pipe(f) => f.write(buf),
            WriteHalf::Tcp(s) => s.write(buf),
            WriteHalf::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            WriteHalf::Pipe(f) => f.flush(),
            WriteHalf::Tcp(s) => s.flush(),
            WriteHalf::Unix(s) => s.flush(),
        }
    }
}

impl ReadHalf {
    /// Close this direction. A pipe end just drops; a socket half
    /// shuts down reading so the shared descriptor keeps writing.
    pub fn close(self) {
        match self {
            ReadHalf::Pipe(_) => {}
            ReadHalf::Tcp(s) => {
                let _ = s.shutdown(Shutdown::Read);
            }
            ReadHalf::Unix(s) => {
                let _ = s.shutdown(Shutdown::Read);
            }
        }
    }
}

impl WriteHalf {
    /// Close this direction; for sockets the peer sees EOF on its read.
    pub fn close(self) {
        match self {
            WriteHalf::Pipe(_) => {}
            WriteHalf::Tcp(s) => {
                let _ = s.shutdown(Shutdown::Write);
            }
            WriteHalf::Unix(s) => {
                let _ = s.shutdown(Shutdown::Write);
            }
        }
    }
}

/// Whether an I/O error just means "try again later".
pub fn retryable(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// Split a TCP stream into non-blocking halves.
pub fn tcp_halves(stream: TcpStream) -> io::Result<(ReadHalf, WriteHalf)> {
    stream.set_nonblocking(true)?;
    let write = stream.try_clone()?;
    Ok((ReadHalf::Tcp(stream), WriteHalf::Tcp(write)))
}

/// Split a UNIX stream into non-blocking halves.
pub fn unix_halves(stream: UnixStream) -> io::Result<(ReadHalf, WriteHalf)> {
    stream.set_nonblocking(true)?;
    let write = stream.try_clone()?;
    Ok((ReadHalf::Unix(stream), WriteHalf::Unix(write)))
}

/// Put a raw descriptor (pipe end) into non-blocking mode.
pub(crate) fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = fcntl(fd, FcntlArg::F_GETFL).map_err(io::Error::from)?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd, FcntlArg::F_SETFL(flags)).map_err(io::Error::from)?;
    Ok(())
}

/// Pipe ends as stream halves, switched to non-blocking mode.
pub(crate) fn pipe_halves(read: File, write: File) -> io::Result<(ReadHalf, WriteHalf)> {
    set_nonblocking(read.as_raw_fd())?;
    set_nonblocking(write.as_raw_fd())?;
    Ok((ReadHalf::Pipe(read), WriteHalf::Pipe(write)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unix_halves_are_nonblocking() {
        let (a, b) = UnixStream::pair().unwrap();
        let (mut read, mut write) = unix_halves(a).unwrap();
        let mut buf = [0u8; 16];
        let err = read.read(&mut buf).unwrap_err();
        assert!(retryable(&err));
        write.write_all(b"x").unwrap();
        let mut got = [0u8; 1];
        (&b).read_exact(&mut got).unwrap();
        assert_eq!(&got, b"x");
    }

    #[test]
    fn write_half_close_signals_eof() {
        let (a, b) = UnixStream::pair().unwrap();
        let (read, write) = unix_halves(a).unwrap();
        write.close();
        let mut buf = [0u8; 4];
        let mut other = b;
        assert_eq!(other.read(&mut buf).unwrap(), 0);
        read.close();
    }
}
