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

use std::env;
use std::ffi::{OsStr, OsString};
use std::str::FromStr;

/// Name of the variable carrying make's flags between processes.
pub const MAKEFLAGS_VAR: &str = "MAKEFLAGS";

/// Settings read from the process environment.
///
/// This is the only place the crate looks at the environment. Everything
/// downstream receives explicit values.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct Env {
    pub(crate) makeflags: OsString,
    pub(crate) local_jobs: Option<usize>,
    pub(crate) debug: i32,
    pub(crate) debug_pids: bool,
    pub(crate) pretty: OptionalBool,
    pub(crate) color: OptionalBool,
}

impl Env {
    /// Read the environment to get runtime settings.
    pub fn inherit() -> Env {
        Env {
            makeflags: env::var_os(MAKEFLAGS_VAR).unwrap_or_default(),
            local_jobs: match get_int("JOBSERVER_LOCAL_JOBS", 0) {
                x if x > 0 => Some(x as usize),
                _ => None,
            },
            debug: get_int("JOBSERVER_DEBUG", 0),
            debug_pids: get_bool("JOBSERVER_DEBUG_PIDS"),
            pretty: get_optional_bool("JOBSERVER_PRETTY"),
            color: get_optional_bool("JOBSERVER_COLOR"),
        }
    }

    #[inline]
    pub fn makeflags(&self) -> &OsStr {
        &self.makeflags
    }

    #[inline]
    pub fn local_jobs(&self) -> Option<usize> {
        self.local_jobs
    }

    #[inline]
    pub fn debug(&self) -> i32 {
        self.debug
    }

    #[inline]
    pub fn debug_pids(&self) -> bool {
        self.debug_pids
    }

    #[inline]
    pub fn pretty(&self) -> OptionalBool {
        self.pretty
    }

    #[inline]
    pub fn color(&self) -> OptionalBool {
        self.color
    }
}

impl Default for Env {
    fn default() -> Env {
        Env {
            makeflags: OsString::new(),
            local_jobs: None,
            debug: 0,
            debug_pids: false,
            pretty: OptionalBool::Auto,
            color: OptionalBool::Auto,
        }
    }
}

/// A tri-state setting: forced off, forced on, or decided at runtime.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OptionalBool {
    Off,
    Auto,
    On,
}

impl OptionalBool {
    #[inline]
    pub fn unwrap_or(self, default: bool) -> bool {
        self.unwrap_or_else(|| default)
    }

    #[inline]
    pub fn unwrap_or_else<F: FnOnce() -> bool>(self, f: F) -> bool {
        match self {
            OptionalBool::Off => false,
            OptionalBool::Auto => f(),
            OptionalBool::On => true,
        }
    }
}

impl Default for OptionalBool {
    #[inline]
    fn default() -> OptionalBool {
        OptionalBool::Auto
    }
}

impl From<i32> for OptionalBool {
    fn from(v: i32) -> OptionalBool {
        match v {
            x if x <= 0 => OptionalBool::Off,
            1 => OptionalBool::Auto,
            _ => OptionalBool::On,
        }
    }
}

fn get_int<K: AsRef<OsStr>>(key: K, default: i32) -> i32 {
    env::var(key)
        .ok()
        .and_then(|v| i32::from_str(&v).ok())
        .unwrap_or(default)
}

fn get_bool<K: AsRef<OsStr>>(key: K) -> bool {
    env::var_os(key).map_or(false, |v| !v.is_empty() && v != "0")
}

fn get_optional_bool<K: AsRef<OsStr>>(key: K) -> OptionalBool {
    OptionalBool::from(get_int(key, 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn optional_bool_from_int() {
        assert_eq!(OptionalBool::from(0), OptionalBool::Off);
        assert_eq!(OptionalBool::from(1), OptionalBool::Auto);
        assert_eq!(OptionalBool::from(2), OptionalBool::On);
    }

    #[test]
    fn optional_bool_unwrap() {
        assert!(!OptionalBool::Off.unwrap_or(true));
        assert!(OptionalBool::Auto.unwrap_or(true));
        assert!(OptionalBool::On.unwrap_or_else(|| false));
    }
}
