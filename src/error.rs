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

use std::error::Error;
use std::fmt::{self, Display, Formatter};
use std::io;

use crate::log_err;

/// The error type for the `jobserver` crate.
///
/// These are the errors a caller can recover from: bad configuration
/// inherited from a parent, failure to allocate resources, and a child
/// that went away while still holding tokens. Violations of the token
/// protocol itself are reported through [`fatal`] instead.
#[derive(Clone, Debug)]
pub struct JobserverError {
    pub(crate) kind: JobserverErrorKind,
    pub(crate) msg: String,
}

impl JobserverError {
    /// Returns a generic error with the given message.
    #[inline]
    pub fn new(msg: String) -> JobserverError {
        JobserverError {
            kind: JobserverErrorKind::default(),
            msg,
        }
    }

    #[inline]
    pub(crate) fn with_kind(kind: JobserverErrorKind, msg: String) -> JobserverError {
        JobserverError { kind, msg }
    }

    #[inline]
    pub(crate) fn bad_makeflags<S: Into<String>>(detail: S) -> JobserverError {
        JobserverError::with_kind(
            JobserverErrorKind::BadMakeflags,
            format!("invalid format in MAKEFLAGS: {}", detail.into()),
        )
    }

    #[inline]
    pub fn kind(&self) -> &JobserverErrorKind {
        &self.kind
    }
}

impl Display for JobserverError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        Display::fmt(&self.msg, f)
    }
}

impl Error for JobserverError {}

impl From<JobserverErrorKind> for JobserverError {
    fn from(kind: JobserverErrorKind) -> JobserverError {
        JobserverError {
            msg: format!("{}", kind),
            kind,
        }
    }
}

impl From<io::Error> for JobserverError {
    fn from(e: io::Error) -> JobserverError {
        JobserverError::with_kind(JobserverErrorKind::Io, e.to_string())
    }
}

impl From<nix::Error> for JobserverError {
    fn from(e: nix::Error) -> JobserverError {
        JobserverError::with_kind(JobserverErrorKind::Io, e.to_string())
    }
}

#[derive(Clone, Eq, PartialEq, Debug)]
#[non_exhaustive]
pub enum JobserverErrorKind {
    Generic,
    /// `MAKEFLAGS` could not be parsed.
    BadMakeflags,
    /// `MAKEFLAGS` names descriptors that are not open pipes. GNU make only
    /// passes its descriptors to rules marked with `+`.
    NotRecursiveMake,
    Io,
    /// A child exited without returning every token it consumed.
    ChildHoldingTokens { outstanding: usize },
}

impl JobserverErrorKind {
    /// Finds the kind of the first [`JobserverError`] in an error chain.
    pub fn of(e: &anyhow::Error) -> JobserverErrorKind {
        e.chain()
            .find_map(|e| e.downcast_ref::<JobserverError>())
            .map(|e| e.kind.clone())
            .unwrap_or_default()
    }
}

impl Default for JobserverErrorKind {
    #[inline]
    fn default() -> JobserverErrorKind {
        JobserverErrorKind::Generic
    }
}

impl Display for JobserverErrorKind {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            JobserverErrorKind::Generic => f.write_str("error"),
            JobserverErrorKind::BadMakeflags => f.write_str("invalid format in MAKEFLAGS"),
            JobserverErrorKind::NotRecursiveMake => f.write_str("make rule not marked as recursive"),
            JobserverErrorKind::Io => f.write_str("I/O error"),
            JobserverErrorKind::ChildHoldingTokens { outstanding } => {
                write!(f, "child exited holding {} tokens", outstanding)
            }
        }
    }
}

/// A breach of the token protocol.
///
/// Continuing after one of these risks running more jobs than the parent
/// allowed, so they are never returned as values. See [`fatal`].
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum ProtocolError {
    /// A token pipe read returned an unexpected byte count.
    ShortRead,
    /// A token pipe write transferred fewer bytes than requested.
    ShortWrite,
    /// A child returned a token it was never granted.
    ExtraTokenReturned,
    /// `get_token` was called after `flush_tokens`.
    AcquireWhileDraining,
    /// `put_token` was called with no tokens outstanding.
    ReleaseWithoutToken,
    /// The token pipe failed outright.
    Io(String),
}

impl Display for ProtocolError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            ProtocolError::ShortRead => f.write_str("unexpected byte count reading token pipe"),
            ProtocolError::ShortWrite => f.write_str("unexpected byte count writing token pipe"),
            ProtocolError::ExtraTokenReturned => f.write_str("child returned extra tokens"),
            ProtocolError::AcquireWhileDraining => f.write_str("get_token() while flushing tokens"),
            ProtocolError::ReleaseWithoutToken => f.write_str("put_token() without a token to free"),
            ProtocolError::Io(msg) => write!(f, "token pipe: {}", msg),
        }
    }
}

impl Error for ProtocolError {}

impl From<io::Error> for ProtocolError {
    fn from(e: io::Error) -> ProtocolError {
        ProtocolError::Io(e.to_string())
    }
}

/// Halts the current thread over a protocol violation.
///
/// The panic payload is the [`ProtocolError`] itself, so a supervisor using
/// [`std::panic::catch_unwind`] can tell it apart from other panics with
/// `downcast_ref::<ProtocolError>()`.
///
/// Callers must not hold any jobserver lock when calling this.
pub fn fatal(err: ProtocolError) -> ! {
    log_err!("jobserver protocol violation: {}", err);
    std::panic::panic_any(err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{self, AssertUnwindSafe};

    #[test]
    fn kind_of_finds_wrapped_error() {
        let e = anyhow::Error::new(JobserverError::from(JobserverErrorKind::NotRecursiveMake))
            .context("starting client");
        assert_eq!(
            JobserverErrorKind::of(&e),
            JobserverErrorKind::NotRecursiveMake
        );
        let plain = anyhow::anyhow!("something else");
        assert_eq!(JobserverErrorKind::of(&plain), JobserverErrorKind::Generic);
    }

    #[test]
    fn fatal_payload_is_downcastable() {
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            fatal(ProtocolError::ShortWrite);
        }));
        let payload = result.unwrap_err();
        assert_eq!(
            payload.downcast_ref::<ProtocolError>(),
            Some(&ProtocolError::ShortWrite)
        );
    }
}
