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

use nix::fcntl::{self, FcntlArg};
use nix::unistd;
use std::ffi::OsStr;
use std::fs::File;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::process::{Child, Command};

use super::env::MAKEFLAGS_VAR;

/// First descriptor after stdin, stdout and stderr.
const FIRST_EXTRA_FD: RawFd = 3;

/// A [`Command`] plus files the child inherits at fixed descriptors.
///
/// The `n`th extra file becomes descriptor `3 + n` in the child, in the
/// order they were added.
#[derive(Debug)]
pub struct ChildCommand {
    command: Command,
    pub(crate) extra_files: Vec<File>,
}

impl ChildCommand {
    #[inline]
    pub fn new(command: Command) -> ChildCommand {
        ChildCommand {
            command,
            extra_files: Vec::new(),
        }
    }

    #[inline]
    pub fn command(&self) -> &Command {
        &self.command
    }

    #[inline]
    pub fn command_mut(&mut self) -> &mut Command {
        &mut self.command
    }

    /// The descriptor the next extra file will get in the child.
    #[inline]
    pub fn next_fd(&self) -> RawFd {
        FIRST_EXTRA_FD + self.extra_files.len() as RawFd
    }

    /// Arranges for the child to inherit `file`, returning its descriptor
    /// number in the child.
    pub fn extra_file(&mut self, file: File) -> RawFd {
        let fd = self.next_fd();
        self.extra_files.push(file);
        fd
    }

    /// The `MAKEFLAGS` value explicitly set on the command, if any.
    pub(crate) fn makeflags(&self) -> Option<Option<&OsStr>> {
        self.command
            .get_envs()
            .find(|(k, _)| *k == OsStr::new(MAKEFLAGS_VAR))
            .map(|(_, v)| v)
    }

    /// Starts the child.
    ///
    /// The parent's copies of the extra files are closed once the child is
    /// running, so the child holds the only references to them.
    pub fn spawn(mut self) -> io::Result<Child> {
        let fds: Vec<RawFd> = self.extra_files.iter().map(|f| f.as_raw_fd()).collect();
        if !fds.is_empty() {
            let limit = FIRST_EXTRA_FD + fds.len() as RawFd;
            let mut moved: Vec<RawFd> = vec![0; fds.len()];
            // Runs between fork and exec, so it must not allocate.
            unsafe {
                self.command.pre_exec(move || {
                    // Move every source above the target range first, so that
                    // no dup2 below clobbers a source that has not been placed
                    // yet. The copies are close-on-exec and vanish on exec.
                    for (slot, &fd) in moved.iter_mut().zip(fds.iter()) {
                        *slot = fcntl::fcntl(fd, FcntlArg::F_DUPFD_CLOEXEC(limit))?;
                    }
                    for (i, &fd) in moved.iter().enumerate() {
                        unistd::dup2(fd, FIRST_EXTRA_FD + i as RawFd)?;
                    }
                    Ok(())
                });
            }
        }
        let child = self.command.spawn()?;
        self.extra_files.clear();
        Ok(child)
    }
}

impl From<Command> for ChildCommand {
    #[inline]
    fn from(command: Command) -> ChildCommand {
        ChildCommand::new(command)
    }
}
