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

use super::env::Env;
use super::error::JobserverError;
use super::makeflags::{JobLimit, Makeflags};

/// Everything a [`Client`](crate::Client) needs to start.
#[derive(Clone, Debug, Default)]
pub struct Config {
    pub(crate) makeflags: Makeflags,
    pub(crate) local_jobs: Option<usize>,
}

impl Config {
    #[inline]
    pub fn new(makeflags: Makeflags) -> Config {
        Config {
            makeflags,
            local_jobs: None,
        }
    }

    /// Builds a configuration from the inherited environment.
    ///
    /// # Errors
    ///
    /// If `MAKEFLAGS` is not valid UTF-8 or cannot be parsed.
    pub fn from_env(env: &Env) -> Result<Config, JobserverError> {
        let makeflags = match env.makeflags().to_str() {
            Some(s) => Makeflags::parse(s)?,
            None => return Err(JobserverError::bad_makeflags("not valid UTF-8")),
        };
        Ok(Config {
            makeflags,
            local_jobs: env.local_jobs(),
        })
    }

    /// Overrides the number of tokens this process may grant itself when
    /// there is no parent jobserver.
    #[inline]
    pub fn local_jobs(mut self, n: usize) -> Config {
        self.local_jobs = Some(n);
        self
    }

    #[inline]
    pub fn makeflags(&self) -> &Makeflags {
        &self.makeflags
    }

    /// The local budget a client built from this configuration gets.
    ///
    /// With a parent jobserver every token comes from the parent, so the
    /// budget is zero. Otherwise an explicit override wins, then a numeric
    /// `-j` from `MAKEFLAGS`, then the number of CPUs.
    pub(crate) fn local_budget(&self) -> usize {
        if self.makeflags.auth().is_some() {
            return 0;
        }
        if let Some(n) = self.local_jobs {
            return n;
        }
        match self.makeflags.jobs() {
            Some(JobLimit::Limited(n)) if n > 0 => n,
            _ => num_cpus::get(),
        }
    }
}
