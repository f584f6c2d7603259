// Copyright 2021 Ross Light
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

//! Token pipes.
//!
//! A jobserver session is a pair of unidirectional pipes: one carries grants
//! from the server to the client, the other carries returns back. Every byte
//! is one token. The value of the byte means nothing; only the count matters.

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::poll::{self, PollFd, PollFlags};
use nix::unistd;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};

use super::error::{fatal, JobserverError, JobserverErrorKind, ProtocolError};
use super::helpers;

/// The byte written for each token.
pub(crate) const TOKEN: u8 = b'+';

/// Creates a close-on-exec pipe, returning `(read, write)`.
///
/// Both ends are closed again when dropped, so a failure later in the
/// caller leaves nothing open behind.
pub(crate) fn pipe() -> Result<(File, File), JobserverError> {
    let (r, w) = unistd::pipe2(OFlag::O_CLOEXEC)?;
    // pipe2 hands us two fresh descriptors nobody else owns.
    Ok(unsafe { (File::from_raw_fd(r), File::from_raw_fd(w)) })
}

/// Takes ownership of a pipe pair inherited from a parent jobserver.
///
/// Both descriptors must be open FIFOs; anything else means the parent did
/// not pass its descriptors down.
pub(crate) fn inherit(r: RawFd, w: RawFd) -> Result<(File, File), JobserverError> {
    if r == w {
        return Err(JobserverError::bad_makeflags(format!(
            "--jobserver-auth={},{} names one descriptor twice",
            r, w
        )));
    }
    for &fd in &[r, w] {
        if !helpers::is_fifo(fd) {
            return Err(JobserverError::with_kind(
                JobserverErrorKind::NotRecursiveMake,
                format!(
                    "jobserver descriptor {} is not an open pipe: make rule not marked as recursive \
                     (prefix it with \"+\")",
                    fd
                ),
            ));
        }
    }
    helpers::close_on_exec(r, true)?;
    helpers::close_on_exec(w, true)?;
    // The descriptors were checked above and belong to this process from now on.
    Ok(unsafe { (File::from_raw_fd(r), File::from_raw_fd(w)) })
}

/// Reads a single token.
///
/// Returns `Ok(false)` once every writer has closed the pipe.
pub(crate) fn read_token(f: &File) -> Result<bool, ProtocolError> {
    let mut buf = [0u8; 1];
    let mut f = f;
    loop {
        match f.read(&mut buf) {
            Ok(1) => return Ok(true),
            Ok(0) => return Ok(false),
            Ok(_) => return Err(ProtocolError::ShortRead),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

/// Writes `n` tokens, one byte at a time.
pub(crate) fn send_tokens(f: &File, n: usize) -> Result<(), ProtocolError> {
    let mut f = f;
    for _ in 0..n {
        loop {
            match f.write(&[TOKEN]) {
                Ok(1) => break,
                Ok(_) => return Err(ProtocolError::ShortWrite),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
    Ok(())
}

/// Like [`send_tokens`], but a failed or short write is fatal: the peer is
/// gone or corrupt.
pub(crate) fn write_tokens(f: &File, n: usize) {
    if let Err(e) = send_tokens(f, n) {
        fatal(e);
    }
}

#[inline]
pub(crate) fn write_token(f: &File) {
    write_tokens(f, 1)
}

/// Consumes every token currently buffered in the pipe without blocking.
///
/// Switches the pipe to non-blocking mode, so only call this once no other
/// process can read from it.
pub(crate) fn drain_ready(f: &File) -> io::Result<usize> {
    helpers::set_nonblocking(f.as_raw_fd(), true)?;
    let mut buf = [0u8; 64];
    let mut f = f;
    let mut n = 0;
    loop {
        match f.read(&mut buf) {
            Ok(0) => return Ok(n),
            Ok(k) => n += k,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(n),
            Err(e) => return Err(e),
        }
    }
}

/// What woke up [`wait_readable`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Wakeup {
    /// The token pipe has a byte or hit end-of-stream.
    Token,
    /// Someone wrote to (or closed) the stop pipe.
    Stop,
}

/// Blocks until either `fd` or `stop` becomes readable.
///
/// The stop pipe takes priority, so a listener asked to stop never picks up
/// one more token first.
pub(crate) fn wait_readable(fd: RawFd, stop: RawFd) -> nix::Result<Wakeup> {
    let ready = PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR;
    loop {
        let mut fds = [
            PollFd::new(stop, PollFlags::POLLIN),
            PollFd::new(fd, PollFlags::POLLIN),
        ];
        match poll::poll(&mut fds, -1) {
            Ok(_) => {}
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e),
        }
        if fds[0].revents().map_or(false, |r| r.intersects(ready)) {
            return Ok(Wakeup::Stop);
        }
        if fds[1].revents().map_or(false, |r| r.intersects(ready)) {
            return Ok(Wakeup::Token);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::IntoRawFd;

    #[test]
    fn tokens_cross_the_pipe() {
        let (r, w) = pipe().unwrap();
        write_tokens(&w, 3);
        assert!(read_token(&r).unwrap());
        assert_eq!(drain_ready(&r).unwrap(), 2);
        drop(w);
        assert!(!read_token(&r).unwrap());
    }

    #[test]
    fn drain_ready_on_empty_pipe() {
        let (r, _w) = pipe().unwrap();
        assert_eq!(drain_ready(&r).unwrap(), 0);
    }

    #[test]
    fn inherit_rejects_regular_file() {
        let (r, _w) = pipe().unwrap();
        let f = tempfile::tempfile().unwrap();
        let err = inherit(r.as_raw_fd(), f.as_raw_fd()).unwrap_err();
        assert_eq!(err.kind(), &JobserverErrorKind::NotRecursiveMake);
    }

    #[test]
    fn inherit_takes_pipe_pair() {
        let (r, w) = pipe().unwrap();
        let (r, w) = inherit(r.into_raw_fd(), w.into_raw_fd()).unwrap();
        write_token(&w);
        assert!(read_token(&r).unwrap());
    }

    #[test]
    fn wait_readable_prefers_stop() {
        let (r, w) = pipe().unwrap();
        let (stop_r, stop_w) = pipe().unwrap();
        write_token(&w);
        assert_eq!(
            wait_readable(r.as_raw_fd(), stop_r.as_raw_fd()).unwrap(),
            Wakeup::Token
        );
        write_token(&stop_w);
        assert_eq!(
            wait_readable(r.as_raw_fd(), stop_r.as_raw_fd()).unwrap(),
            Wakeup::Stop
        );
    }
}
