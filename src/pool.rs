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

//! Token bookkeeping for a client.
//!
//! Two budgets feed one client: a local budget this process may use without
//! asking anybody, and tokens granted by a parent jobserver. They are kept in
//! separate counters and only meet in [`PoolState::try_acquire`] and
//! [`PoolState::release`], where local tokens are always preferred.

use super::error::ProtocolError;

/// Where an acquired token came from.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Source {
    Local,
    Upstream,
}

/// What the caller must do after a release.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Released {
    /// Local headroom grew; wake a waiter.
    Local,
    /// An upstream token went back to the free set; wake a waiter.
    Freed,
    /// The pool is draining; write one token back upstream.
    ReturnUpstream,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub(crate) struct PoolState {
    local_budget: usize,
    local_in_use: usize,
    on_loan: usize,
    free_upstream: usize,
    draining: bool,
}

impl PoolState {
    pub(crate) fn new(local_budget: usize) -> PoolState {
        PoolState {
            local_budget,
            ..PoolState::default()
        }
    }

    /// Takes a token if one is available without waiting.
    pub(crate) fn try_acquire(&mut self) -> Result<Option<Source>, ProtocolError> {
        if self.draining {
            return Err(ProtocolError::AcquireWhileDraining);
        }
        let acquired = if self.local_in_use < self.local_budget {
            self.local_in_use += 1;
            Some(Source::Local)
        } else if self.free_upstream > 0 {
            self.free_upstream -= 1;
            self.on_loan += 1;
            Some(Source::Upstream)
        } else {
            None
        };
        self.check();
        Ok(acquired)
    }

    /// Gives back a token taken by [`try_acquire`](PoolState::try_acquire).
    ///
    /// While draining, upstream tokens go straight back to the parent, so they
    /// are released before local ones.
    pub(crate) fn release(&mut self) -> Result<Released, ProtocolError> {
        let released = if self.draining {
            if self.on_loan > 0 {
                self.on_loan -= 1;
                Released::ReturnUpstream
            } else if self.local_in_use > 0 {
                self.local_in_use -= 1;
                Released::Local
            } else {
                return Err(ProtocolError::ReleaseWithoutToken);
            }
        } else if self.local_in_use > 0 {
            self.local_in_use -= 1;
            Released::Local
        } else if self.on_loan > 0 {
            self.on_loan -= 1;
            self.free_upstream += 1;
            Released::Freed
        } else {
            return Err(ProtocolError::ReleaseWithoutToken);
        };
        self.check();
        Ok(released)
    }

    /// Records a token received from upstream.
    ///
    /// Returns `false` if the pool is draining, in which case the token was
    /// not recorded and must go straight back.
    pub(crate) fn credit(&mut self) -> bool {
        if self.draining {
            return false;
        }
        self.free_upstream += 1;
        self.check();
        true
    }

    /// Enters the draining state and hands over every free upstream token.
    ///
    /// Returns `None` if the pool was already draining.
    pub(crate) fn begin_drain(&mut self) -> Option<usize> {
        if self.draining {
            return None;
        }
        self.draining = true;
        let n = self.free_upstream;
        self.free_upstream = 0;
        self.check();
        Some(n)
    }

    /// Local headroom plus free upstream tokens.
    #[inline]
    pub(crate) fn tokens(&self) -> usize {
        self.local_budget - self.local_in_use + self.free_upstream
    }

    #[inline]
    pub(crate) fn in_use(&self) -> usize {
        self.local_in_use + self.on_loan
    }

    #[inline]
    pub(crate) fn local_budget(&self) -> usize {
        self.local_budget
    }

    #[inline]
    pub(crate) fn on_loan(&self) -> usize {
        self.on_loan
    }

    #[inline]
    pub(crate) fn free_upstream(&self) -> usize {
        self.free_upstream
    }

    #[inline]
    pub(crate) fn is_draining(&self) -> bool {
        self.draining
    }

    #[cfg(feature = "debug-jobserver")]
    fn check(&self) {
        assert!(
            self.local_in_use <= self.local_budget,
            "local_in_use={} local_budget={}",
            self.local_in_use,
            self.local_budget
        );
        assert!(
            !self.draining || self.free_upstream == 0,
            "draining with {} free tokens",
            self.free_upstream
        );
    }

    #[cfg(not(feature = "debug-jobserver"))]
    #[inline]
    fn check(&self) {}
}
