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

//! Parsing and rewriting of the `MAKEFLAGS` environment variable.

use std::fmt::{self, Display, Formatter};
use std::os::unix::io::RawFd;
use std::str::FromStr;

use super::error::JobserverError;

const AUTH_PREFIX: &str = "--jobserver-auth=";
const JOBS_PREFIX: &str = "-j";

/// The `-j` option.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum JobLimit {
    /// `-j` with no number.
    Unlimited,
    /// `-jN`.
    Limited(usize),
}

impl Display for JobLimit {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            JobLimit::Unlimited => f.write_str(JOBS_PREFIX),
            JobLimit::Limited(n) => write!(f, "{}{}", JOBS_PREFIX, n),
        }
    }
}

/// A parsed `MAKEFLAGS` value.
///
/// Words this crate does not understand are kept as-is so that the value can
/// be handed on to a child with only the jobserver words replaced.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Makeflags {
    words: Vec<String>,
    auth: Option<(RawFd, RawFd)>,
    jobs: Option<JobLimit>,
}

impl Makeflags {
    /// Parses a space-separated `MAKEFLAGS` value.
    ///
    /// # Errors
    ///
    /// If a `--jobserver-auth=` word does not hold exactly two decimal
    /// descriptors, if it appears twice, or if a `-j` word has a non-numeric
    /// suffix.
    pub fn parse(s: &str) -> Result<Makeflags, JobserverError> {
        let mut flags = Makeflags::default();
        for word in s.split_whitespace() {
            if let Some(arg) = word.strip_prefix(AUTH_PREFIX) {
                if flags.auth.is_some() {
                    return Err(JobserverError::bad_makeflags(format!(
                        "{} given more than once",
                        AUTH_PREFIX
                    )));
                }
                flags.auth = Some(parse_auth(arg)?);
            } else if let Some(arg) = word.strip_prefix(JOBS_PREFIX) {
                flags.jobs = Some(parse_jobs(arg)?);
            }
            flags.words.push(word.to_string());
        }
        Ok(flags)
    }

    /// The `(read, write)` descriptors of the parent's jobserver, if any.
    #[inline]
    pub fn auth(&self) -> Option<(RawFd, RawFd)> {
        self.auth
    }

    /// The job limit advertised by the parent, if any.
    #[inline]
    pub fn jobs(&self) -> Option<JobLimit> {
        self.jobs
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Returns a copy pointing a child at a new jobserver.
    ///
    /// The first `--jobserver-auth=` and `-j` words are replaced where they
    /// stand and any repeats are dropped. Missing words are appended.
    pub fn with_jobserver(&self, auth: (RawFd, RawFd), jobs: JobLimit) -> Makeflags {
        let auth_word = format!("{}{},{}", AUTH_PREFIX, auth.0, auth.1);
        let jobs_word = jobs.to_string();
        let mut words = Vec::with_capacity(self.words.len() + 2);
        let mut auth_done = false;
        let mut jobs_done = false;
        for word in &self.words {
            if word.starts_with(AUTH_PREFIX) {
                if !auth_done {
                    words.push(auth_word.clone());
                    auth_done = true;
                }
            } else if word.starts_with(JOBS_PREFIX) {
                if !jobs_done {
                    words.push(jobs_word.clone());
                    jobs_done = true;
                }
            } else {
                words.push(word.clone());
            }
        }
        if !auth_done {
            words.push(auth_word);
        }
        if !jobs_done {
            words.push(jobs_word);
        }
        Makeflags {
            words,
            auth: Some(auth),
            jobs: Some(jobs),
        }
    }
}

impl FromStr for Makeflags {
    type Err = JobserverError;

    #[inline]
    fn from_str(s: &str) -> Result<Makeflags, JobserverError> {
        Makeflags::parse(s)
    }
}

impl Display for Makeflags {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str(&self.words.join(" "))
    }
}

fn parse_auth(arg: &str) -> Result<(RawFd, RawFd), JobserverError> {
    let invalid = || JobserverError::bad_makeflags(format!("invalid {}{}", AUTH_PREFIX, arg));
    let mut parts = arg.split(',');
    let (r, w) = match (parts.next(), parts.next(), parts.next()) {
        (Some(r), Some(w), None) => (r, w),
        _ => return Err(invalid()),
    };
    let r = str::parse::<RawFd>(r).map_err(|_| invalid())?;
    let w = str::parse::<RawFd>(w).map_err(|_| invalid())?;
    if r < 0 || w < 0 {
        return Err(invalid());
    }
    Ok((r, w))
}

fn parse_jobs(arg: &str) -> Result<JobLimit, JobserverError> {
    if arg.is_empty() {
        return Ok(JobLimit::Unlimited);
    }
    str::parse::<usize>(arg)
        .map(JobLimit::Limited)
        .map_err(|_| JobserverError::bad_makeflags(format!("invalid {}{}", JOBS_PREFIX, arg)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::JobserverErrorKind;

    macro_rules! parse_tests {
        ($($name:ident: $value:expr,)*) => {
            $(
                #[test]
                fn $name() {
                    let (input, auth, jobs) = $value;
                    let flags = Makeflags::parse(input).unwrap();
                    assert_eq!(flags.auth(), auth);
                    assert_eq!(flags.jobs(), jobs);
                }
            )*
        }
    }

    parse_tests!(
        parse_empty: ("", None, None),
        parse_unrelated: ("ks --no-print-directory", None, None),
        parse_auth_only: ("--jobserver-auth=3,4", Some((3, 4)), None),
        parse_jobs_only: ("-j8", None, Some(JobLimit::Limited(8))),
        parse_unlimited: ("-j", None, Some(JobLimit::Unlimited)),
        parse_gnu_make: (
            " -j4 --jobserver-auth=3,4",
            Some((3, 4)),
            Some(JobLimit::Limited(4))
        ),
        parse_extra_spaces: ("k   -j2    --jobserver-auth=10,11  ", Some((10, 11)), Some(JobLimit::Limited(2))),
    );

    macro_rules! parse_error_tests {
        ($($name:ident: $value:expr,)*) => {
            $(
                #[test]
                fn $name() {
                    let err = Makeflags::parse($value).unwrap_err();
                    assert_eq!(err.kind(), &JobserverErrorKind::BadMakeflags);
                }
            )*
        }
    }

    parse_error_tests!(
        parse_missing_write_fd: "--jobserver-auth=7",
        parse_three_fds: "--jobserver-auth=3,4,5",
        parse_non_numeric_fd: "--jobserver-auth=a,4",
        parse_negative_fd: "--jobserver-auth=-1,4",
        parse_fifo_style_auth: "--jobserver-auth=fifo:/tmp/x",
        parse_duplicate_auth: "--jobserver-auth=3,4 --jobserver-auth=5,6",
        parse_non_numeric_jobs: "-jfoo",
    );

    #[test]
    fn with_jobserver_replaces_in_place() {
        let flags = Makeflags::parse("k -j4 --jobserver-auth=3,4 --no-print-directory").unwrap();
        let child = flags.with_jobserver((5, 6), JobLimit::Limited(2));
        assert_eq!(
            child.to_string(),
            "k -j2 --jobserver-auth=5,6 --no-print-directory"
        );
        assert_eq!(child.auth(), Some((5, 6)));
        assert_eq!(child.jobs(), Some(JobLimit::Limited(2)));
    }

    #[test]
    fn with_jobserver_appends_missing() {
        let flags = Makeflags::parse("k").unwrap();
        let child = flags.with_jobserver((3, 4), JobLimit::Limited(10));
        assert_eq!(child.to_string(), "k --jobserver-auth=3,4 -j10");
        let child = Makeflags::default().with_jobserver((3, 4), JobLimit::Unlimited);
        assert_eq!(child.to_string(), "--jobserver-auth=3,4 -j");
    }

    #[test]
    fn with_jobserver_drops_repeated_jobs() {
        let flags = Makeflags::parse("-j3 s -j5").unwrap();
        let child = flags.with_jobserver((7, 8), JobLimit::Limited(1));
        assert_eq!(child.to_string(), "-j1 s --jobserver-auth=7,8");
    }

    #[test]
    fn rewritten_flags_parse_back() {
        let child = Makeflags::parse("k -j4")
            .unwrap()
            .with_jobserver((3, 4), JobLimit::Limited(2));
        let reparsed: Makeflags = child.to_string().parse().unwrap();
        assert_eq!(reparsed, child);
    }
}
