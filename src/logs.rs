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

//! Process-wide diagnostics.
//!
//! Every log entry is a single structured line (see [`Meta`]). Until
//! [`LogBuilder::setup`] runs, entries go to stderr in pretty form.

use lazy_static::lazy_static;
use libc::pid_t;
use nix::unistd::{self, Pid};
use std::env;
use std::error::Error;
use std::fmt::{self, Display, Formatter};
use std::io::{self, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Mutex;
use std::time::SystemTime;

use super::env::{Env, OptionalBool};

/// A line-based logger.
trait Logger {
    /// Write a line to the logger.
    /// `line` must not contain any `'\n'` characters.
    fn write_line(&mut self, line: &str);
}

/// A log printer that passes structured lines through untouched, for a
/// parent process to parse.
#[derive(Debug)]
struct RawLog<W> {
    file: W,
}

impl<W: Write> RawLog<W> {
    fn new(file: W) -> RawLog<W> {
        RawLog { file }
    }
}

impl<W: Write> Logger for RawLog<W> {
    fn write_line(&mut self, line: &str) {
        debug_assert!(!line.contains('\n'));

        let mut msg_with_nl = String::with_capacity(line.len() + 1);
        msg_with_nl.push_str(line);
        msg_with_nl.push('\n');

        let _ = io::stdout().flush();
        let _ = self.file.write_all(msg_with_nl.as_bytes());
        let _ = self.file.flush();
    }
}

#[derive(Debug)]
struct PrettyLog<W> {
    file: W,
    escapes: ColorEscapes,
    debug_pids: bool,
}

impl<W> PrettyLog<W> {
    fn new(file: W, escapes: ColorEscapes, debug_pids: bool) -> PrettyLog<W> {
        PrettyLog {
            file,
            escapes,
            debug_pids,
        }
    }

    fn pretty(&self, buf: &mut Vec<u8>, pid: pid_t, color: &[u8], s: &str) {
        buf.extend(color);
        if self.debug_pids {
            let _ = write!(buf, "{:<6} jobserver: ", pid);
        } else {
            buf.extend(b"jobserver: ");
        }
        if !color.is_empty() {
            buf.extend(self.escapes.bold);
        }
        buf.extend(s.as_bytes());
        buf.extend(self.escapes.plain);
        buf.push(b'\n')
    }
}

impl<W: Write> Logger for PrettyLog<W> {
    fn write_line(&mut self, line: &str) {
        debug_assert!(!line.contains('\n'));

        let mut buf: Vec<u8> = Vec::with_capacity(line.len() + 1);

        let _ = io::stdout().flush();
        let meta: Option<(usize, Meta)> = line
            .find(Meta::PREFIX)
            .and_then(|start| Meta::parse(&line[start..]).ok().map(|meta| (start, meta)));
        match meta {
            Some((start, meta)) => {
                buf.extend(line[..start].as_bytes());
                match meta.kind {
                    "error" => self.pretty(&mut buf, meta.pid, self.escapes.red, meta.text),
                    "warning" => self.pretty(&mut buf, meta.pid, self.escapes.yellow, meta.text),
                    // Debug and unknown kinds pass through uncolored.
                    _ => self.pretty(&mut buf, meta.pid, b"", meta.text),
                }
            }
            None => {
                buf.extend(line.as_bytes());
                buf.push(b'\n');
            }
        }
        let _ = self.file.write_all(&buf);
        let _ = self.file.flush();
    }
}

lazy_static! {
    static ref GLOBAL_LOGGER: Mutex<Option<Box<dyn Logger + Send>>> = Mutex::new(None);
}

/// A builder used for setting up logs.
#[derive(Clone, Debug)]
pub struct LogBuilder {
    pretty: bool,
    color: OptionalBool,
}

impl LogBuilder {
    #[inline]
    pub fn new() -> LogBuilder {
        LogBuilder {
            pretty: true,
            color: OptionalBool::Auto,
        }
    }

    /// Set whether logs should be pretty-printed.
    #[inline]
    pub fn pretty(&mut self, val: bool) -> &mut Self {
        self.pretty = val;
        self
    }

    /// Sets terminal color behavior.
    #[inline]
    pub fn color(&mut self, val: OptionalBool) -> &mut Self {
        self.color = val;
        self
    }

    /// Set up the process-wide logger with the builder's settings.
    pub fn setup<W: WriteWithMaybeFd + Send + 'static>(&self, env: &Env, tty: W) {
        let logger: Box<dyn Logger + Send> = if self.pretty {
            let escapes = tty
                .as_raw_fd()
                .map(|fd| check_tty(fd, self.color))
                .unwrap_or_default();
            Box::new(PrettyLog::new(tty, escapes, env.debug_pids()))
        } else {
            Box::new(RawLog::new(tty))
        };

        DEBUG_LEVEL.store(env.debug(), Ordering::SeqCst);
        let mut global_logger = GLOBAL_LOGGER.lock().unwrap_or_else(|e| e.into_inner());
        *global_logger = Some(logger);
    }
}

impl Default for LogBuilder {
    #[inline]
    fn default() -> LogBuilder {
        LogBuilder::new()
    }
}

impl From<&Env> for LogBuilder {
    fn from(e: &Env) -> LogBuilder {
        LogBuilder {
            pretty: e.pretty().unwrap_or(true),
            color: e.color(),
        }
    }
}

/// A wrapper over the [`Write`] trait that can optionally capture
/// the raw file descriptor.
pub trait WriteWithMaybeFd: Write {
    fn as_raw_fd(&self) -> Option<RawFd> {
        None
    }
}

impl<T: Write + AsRawFd> WriteWithMaybeFd for T {
    fn as_raw_fd(&self) -> Option<RawFd> {
        Some(AsRawFd::as_raw_fd(self))
    }
}

/// Global debug level (used for `log_*` macros).
static DEBUG_LEVEL: AtomicI32 = AtomicI32::new(0);

/// Return the currently configured global debug level.
#[inline]
pub fn debug_level() -> i32 {
    DEBUG_LEVEL.load(Ordering::SeqCst)
}

/// Write a line to the process-wide logger.
///
/// If this is called before [`LogBuilder::setup`], then the line is written
/// to stderr.
///
/// # Panics
///
/// If `s` contains a `'\n'` character.
pub fn write(line: &str) {
    assert!(!line.contains('\n'));
    {
        let mut logger = GLOBAL_LOGGER.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(logger) = &mut *logger {
            logger.write_line(line);
            return;
        }
    }
    let escapes = check_tty(AsRawFd::as_raw_fd(&io::stderr()), OptionalBool::Auto);
    PrettyLog::new(io::stderr(), escapes, true).write_line(line);
}

/// Write a structured log-line to the process-wide logger.
pub fn meta(kind: &str, s: &str, pid: Option<Pid>) {
    let timestamp = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default();
    debug_assert!(!kind.contains(':'));
    debug_assert!(!kind.contains('@'));
    let pid = pid.unwrap_or_else(unistd::getpid);
    // Multi-line messages become one entry per line.
    for text in s.lines() {
        let meta = Meta {
            kind,
            pid: pid.as_raw(),
            timestamp: timestamp.as_secs_f64(),
            text,
        };
        write(&meta.to_string());
    }
}

/// An immutable reference to a structured log-line.
///
/// The format is `@@JOBSERVER:<kind>:<pid>:<timestamp>@@ <text>`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Meta<'a> {
    kind: &'a str,
    pid: pid_t,
    timestamp: f64,
    text: &'a str,
}

impl<'a> Meta<'a> {
    const PREFIX: &'static str = "@@JOBSERVER:";
    const SEP: &'static str = "@@ ";

    /// Parses a log-line in-place.
    pub fn parse(s: &'a str) -> Result<Meta<'a>, MetaParseError> {
        if !s.starts_with(Meta::PREFIX) {
            return Err(MetaParseError::new(format!(
                "{:?} does not begin with {:?}",
                s,
                Meta::PREFIX
            )));
        }
        if s.contains('\n') {
            return Err(MetaParseError::new(format!("{:?} contains a newline", s)));
        }
        let meta_and_text = &s[Meta::PREFIX.len()..];
        let meta_end = match meta_and_text.find(Meta::SEP) {
            Some(i) => i,
            None => {
                return Err(MetaParseError::new(format!(
                    "{:?} has unterminated metadata",
                    s
                )))
            }
        };
        let (meta, line_with_sep) = meta_and_text.split_at(meta_end);
        let text = &line_with_sep[Meta::SEP.len()..];
        if meta.contains('@') {
            return Err(MetaParseError::new(format!(
                "{:?} contains @ inside metadata",
                s
            )));
        }
        let mut words = meta.split(':');
        let kind = words.next().unwrap_or_default();
        let pid = match words.next() {
            Some(pid) => str::parse::<pid_t>(pid)
                .map_err(|_| MetaParseError::new(format!("cannot parse pid in {:?}", s)))?,
            None => return Err(MetaParseError::new(format!("{:?} is missing a pid", s))),
        };
        let timestamp = match words.next() {
            Some(timestamp) => str::parse::<f64>(timestamp)
                .map_err(|_| MetaParseError::new(format!("cannot parse timestamp in {:?}", s)))?,
            None => {
                return Err(MetaParseError::new(format!(
                    "{:?} is missing a timestamp",
                    s
                )))
            }
        };

        Ok(Meta {
            kind,
            pid,
            timestamp,
            text,
        })
    }

    #[inline]
    pub fn kind(self) -> &'a str {
        self.kind
    }

    #[inline]
    pub fn pid(self) -> Pid {
        Pid::from_raw(self.pid)
    }

    #[inline]
    pub fn timestamp(self) -> f64 {
        self.timestamp
    }

    #[inline]
    pub fn text(self) -> &'a str {
        self.text
    }
}

impl<'a> Display for Meta<'a> {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        write!(
            f,
            "{}{}:{}:{:.4}{}{}",
            Meta::PREFIX,
            self.kind,
            self.pid,
            self.timestamp,
            Meta::SEP,
            self.text
        )
    }
}

/// The error type returned from [`Meta::parse`].
#[derive(Debug)]
pub struct MetaParseError {
    msg: String,
}

impl MetaParseError {
    #[inline]
    fn new(msg: String) -> Self {
        MetaParseError { msg }
    }
}

impl Display for MetaParseError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        Display::fmt(&self.msg, f)
    }
}

impl Error for MetaParseError {}

#[derive(Clone, Debug, PartialEq, Eq)]
struct ColorEscapes {
    red: &'static [u8],
    yellow: &'static [u8],
    bold: &'static [u8],
    plain: &'static [u8],
}

impl Default for ColorEscapes {
    /// Returns an empty set of color escapes.
    fn default() -> ColorEscapes {
        let zero = b"";
        ColorEscapes {
            red: zero,
            yellow: zero,
            bold: zero,
            plain: zero,
        }
    }
}

fn check_tty(tty: RawFd, color: OptionalBool) -> ColorEscapes {
    let color = color.unwrap_or_else(|| {
        unistd::isatty(tty).unwrap_or(false)
            && env::var_os("TERM").map_or(false, |v| v != "dumb" && v != "")
    });
    if color {
        ColorEscapes {
            red: b"\x1b[31m",
            yellow: b"\x1b[33m",
            bold: b"\x1b[1m",
            plain: b"\x1b[m",
        }
    } else {
        ColorEscapes::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_meta_line() {
        let meta = Meta::parse("@@JOBSERVER:warning:42:1.5000@@ pipe closed").unwrap();
        assert_eq!(meta.kind(), "warning");
        assert_eq!(meta.pid(), Pid::from_raw(42));
        assert_eq!(meta.timestamp(), 1.5);
        assert_eq!(meta.text(), "pipe closed");
    }

    #[test]
    fn meta_display_parses_back() {
        let meta = Meta {
            kind: "debug",
            pid: 7,
            timestamp: 12.25,
            text: "granted token to child",
        };
        let line = meta.to_string();
        assert_eq!(line, "@@JOBSERVER:debug:7:12.2500@@ granted token to child");
        assert_eq!(Meta::parse(&line).unwrap(), meta);
    }

    #[test]
    fn parse_rejects_malformed_lines() {
        assert!(Meta::parse("@@MAKE:debug:7:1.0@@ x").is_err());
        assert!(Meta::parse("@@JOBSERVER:debug:7:1.0 x").is_err());
        assert!(Meta::parse("@@JOBSERVER:debug:abc:1.0@@ x").is_err());
        assert!(Meta::parse("@@JOBSERVER:debug@@ x").is_err());
    }

    #[test]
    fn pretty_log_formats_errors() {
        let mut out = Vec::new();
        {
            let mut log = PrettyLog::new(&mut out, ColorEscapes::default(), false);
            log.write_line("@@JOBSERVER:error:7:1.0000@@ child exited holding 2 tokens");
            log.write_line("plain output");
        }
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "jobserver: child exited holding 2 tokens\nplain output\n"
        );
    }

    #[test]
    fn pretty_log_shows_pids() {
        let mut out = Vec::new();
        {
            let mut log = PrettyLog::new(&mut out, ColorEscapes::default(), true);
            log.write_line("@@JOBSERVER:debug:7:1.0000@@ hi");
        }
        assert_eq!(String::from_utf8(out).unwrap(), "7      jobserver: hi\n");
    }

    #[test]
    fn raw_log_passes_lines_through() {
        let mut out = Vec::new();
        RawLog::new(&mut out).write_line("@@JOBSERVER:debug:7:1.0000@@ hi");
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "@@JOBSERVER:debug:7:1.0000@@ hi\n"
        );
    }

    #[test]
    fn forced_color_off() {
        assert_eq!(check_tty(0, OptionalBool::Off), ColorEscapes::default());
        assert_ne!(check_tty(0, OptionalBool::On), ColorEscapes::default());
    }
}
