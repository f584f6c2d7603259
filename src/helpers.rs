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

use nix::fcntl::{self, FcntlArg, FdFlag, OFlag};
use nix::sys::stat::{self, SFlag};
use std::os::unix::io::RawFd;

pub(crate) fn close_on_exec(fd: RawFd, yes: bool) -> nix::Result<()> {
    let result = fcntl::fcntl(fd, FcntlArg::F_GETFD)?;
    let mut fl = FdFlag::from_bits_truncate(result);
    fl.set(FdFlag::FD_CLOEXEC, yes);
    fcntl::fcntl(fd, FcntlArg::F_SETFD(fl))?;
    Ok(())
}

/// Sets `O_NONBLOCK` on the open file description behind `fd`.
///
/// The flag is shared with every process holding a duplicate of the
/// description. GNU make cannot cope with a non-blocking jobserver pipe, so
/// only use this on descriptors no other process can still read.
pub(crate) fn set_nonblocking(fd: RawFd, yes: bool) -> nix::Result<()> {
    let result = fcntl::fcntl(fd, FcntlArg::F_GETFL)?;
    let mut fl = OFlag::from_bits_truncate(result);
    fl.set(OFlag::O_NONBLOCK, yes);
    fcntl::fcntl(fd, FcntlArg::F_SETFL(fl))?;
    Ok(())
}

/// Reports whether `fd` is open and refers to a FIFO.
pub(crate) fn is_fifo(fd: RawFd) -> bool {
    match stat::fstat(fd) {
        Ok(st) => SFlag::from_bits_truncate(st.st_mode) & SFlag::S_IFMT == SFlag::S_IFIFO,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd;
    use std::os::unix::io::AsRawFd;

    #[test]
    fn pipe_is_fifo() {
        let (r, w) = unistd::pipe().unwrap();
        assert!(is_fifo(r));
        assert!(is_fifo(w));
        unistd::close(r).unwrap();
        unistd::close(w).unwrap();
    }

    #[test]
    fn regular_file_is_not_fifo() {
        let f = tempfile::tempfile().unwrap();
        assert!(!is_fifo(f.as_raw_fd()));
    }

    #[test]
    fn close_on_exec_round_trip() {
        let f = tempfile::tempfile().unwrap();
        let fd = f.as_raw_fd();
        close_on_exec(fd, false).unwrap();
        let flags = FdFlag::from_bits_truncate(fcntl::fcntl(fd, FcntlArg::F_GETFD).unwrap());
        assert!(!flags.contains(FdFlag::FD_CLOEXEC));
        close_on_exec(fd, true).unwrap();
        let flags = FdFlag::from_bits_truncate(fcntl::fcntl(fd, FcntlArg::F_GETFD).unwrap());
        assert!(flags.contains(FdFlag::FD_CLOEXEC));
    }
}
