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

//! The consuming side of the jobserver protocol.
//!
//! A client draws tokens from two places. If the process was started by a
//! jobserver (GNU make, or a [`Server`](crate::Server) from this crate), a
//! listener thread reads grants off the inherited pipe into a free set, and
//! tokens from that set are returned to the parent when the client flushes.
//! Independently, a local budget lets a process with no parent run a bounded
//! number of jobs on its own.
//!
//! Every process owns one implicit token it never has to ask for. The parent
//! invoking us with `-jN` therefore only ever puts `N - 1` tokens in the pipe,
//! which [`Client::expected_jobs`] accounts for.

use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;

use super::config::Config;
use super::env::Env;
use super::error::{fatal, JobserverError, ProtocolError};
use super::makeflags::{JobLimit, Makeflags};
use super::pipe::{self, Wakeup};
use super::pool::{PoolState, Released, Source};
use crate::{log_debug, log_debug2, log_warn};

/// A handle to this process's token pool.
///
/// Cloning the handle shares the pool. When the last handle is dropped the
/// client flushes any free upstream tokens back to its parent.
#[derive(Clone, Debug)]
pub struct Client {
    inner: Arc<ClientInner>,
}

#[derive(Debug)]
struct ClientInner {
    shared: Arc<Shared>,
    makeflags: Makeflags,
    /// Write end of the listener's stop pipe. Closing it stops the listener.
    stop: Mutex<Option<File>>,
}

/// State reachable from both callers and the listener thread.
#[derive(Debug)]
struct Shared {
    state: Mutex<PoolState>,
    cvar: Condvar,
    /// Pipe returning tokens to the parent.
    returns: Option<File>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Records a grant read by the listener.
    fn credit(&self) {
        let mut state = self.lock();
        if state.credit() {
            log_debug2!("received token, free {}\n", state.free_upstream());
            self.cvar.notify_one();
            return;
        }
        drop(state);
        // Arrived after flush_tokens; it was never ours to keep.
        if let Some(returns) = &self.returns {
            pipe::write_token(returns);
        }
    }
}

impl Client {
    /// Starts a client from an explicit configuration.
    ///
    /// If `config` names a parent jobserver, its descriptors are taken over
    /// and a listener thread starts collecting grants. Otherwise the client
    /// runs purely on its local budget.
    ///
    /// # Errors
    ///
    /// If the parent's descriptors are not open pipes, or if the listener
    /// cannot be started.
    pub fn new(config: Config) -> Result<Client, JobserverError> {
        let local_budget = config.local_budget();
        let state = Mutex::new(PoolState::new(local_budget));
        let (shared, stop) = match config.makeflags.auth() {
            Some((r, w)) => {
                let (grants, returns) = pipe::inherit(r, w)?;
                let (stop_r, stop_w) = pipe::pipe()?;
                let shared = Arc::new(Shared {
                    state,
                    cvar: Condvar::new(),
                    returns: Some(returns),
                });
                let listener_shared = shared.clone();
                thread::Builder::new()
                    .name("jobserver-listener".into())
                    .spawn(move || listen(&listener_shared, grants, stop_r))?;
                log_debug!("jobserver client: parent pipes {},{}\n", r, w);
                (shared, Some(stop_w))
            }
            None => {
                log_debug!("jobserver client: local budget {}\n", local_budget);
                let shared = Arc::new(Shared {
                    state,
                    cvar: Condvar::new(),
                    returns: None,
                });
                (shared, None)
            }
        };
        Ok(Client {
            inner: Arc::new(ClientInner {
                shared,
                makeflags: config.makeflags,
                stop: Mutex::new(stop),
            }),
        })
    }

    /// Starts a client from the inherited environment.
    pub fn from_env(env: &Env) -> Result<Client, JobserverError> {
        Client::new(Config::from_env(env)?)
    }

    /// Blocks until a token is available and takes it.
    ///
    /// Local budget is used before tokens from the parent. Every successful
    /// call must be paired with a [`put_token`](Client::put_token).
    ///
    /// # Panics
    ///
    /// With a [`ProtocolError`] if called after
    /// [`flush_tokens`](Client::flush_tokens).
    pub fn get_token(&self) {
        let shared = &self.inner.shared;
        let mut state = shared.lock();
        if state.is_draining() {
            drop(state);
            fatal(ProtocolError::AcquireWhileDraining);
        }
        loop {
            // A caller already waiting when the client started draining
            // simply never gets a token.
            if !state.is_draining() {
                match state.try_acquire() {
                    Ok(Some(source)) => {
                        log_debug!(
                            "get_token() {:?}: in use {}, available {}\n",
                            source,
                            state.in_use(),
                            state.tokens()
                        );
                        return;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        drop(state);
                        fatal(e);
                    }
                }
            }
            log_debug2!("get_token() waiting\n");
            state = shared.cvar.wait(state).unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Releases a token taken by [`get_token`](Client::get_token).
    ///
    /// # Panics
    ///
    /// With a [`ProtocolError`] if no token is outstanding.
    pub fn put_token(&self) {
        let shared = &self.inner.shared;
        let mut state = shared.lock();
        match state.release() {
            Ok(Released::ReturnUpstream) => {
                log_debug!("put_token() returning token upstream\n");
                drop(state);
                if let Some(returns) = &shared.returns {
                    pipe::write_token(returns);
                }
            }
            Ok(released) => {
                log_debug!(
                    "put_token() {:?}: in use {}, available {}\n",
                    released,
                    state.in_use(),
                    state.tokens()
                );
                shared.cvar.notify_one();
            }
            Err(e) => {
                drop(state);
                fatal(e);
            }
        }
    }

    /// Like [`get_token`](Client::get_token), but gives up instead of
    /// waiting once the client is draining or `cancel` is set.
    ///
    /// Both conditions are checked under the pool lock, so a drain that
    /// starts while the caller waits is reported as `false` rather than as a
    /// protocol violation. Whoever sets `cancel` must call
    /// [`wake_waiters`](Client::wake_waiters) afterwards.
    pub(crate) fn get_token_unless(&self, cancel: &AtomicBool) -> bool {
        let shared = &self.inner.shared;
        let mut state = shared.lock();
        loop {
            if state.is_draining() || cancel.load(Ordering::SeqCst) {
                // Pass on any wakeup meant for a caller that still wants a token.
                shared.cvar.notify_one();
                return false;
            }
            match state.try_acquire() {
                Ok(Some(source)) => {
                    log_debug!(
                        "get_token() {:?}: in use {}, available {}\n",
                        source,
                        state.in_use(),
                        state.tokens()
                    );
                    return true;
                }
                Ok(None) => {}
                Err(e) => {
                    drop(state);
                    fatal(e);
                }
            }
            state = shared.cvar.wait(state).unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Wakes every caller blocked waiting for a token so it re-checks its
    /// conditions.
    pub(crate) fn wake_waiters(&self) {
        let _state = self.inner.shared.lock();
        self.inner.shared.cvar.notify_all();
    }

    /// Takes a token that is released when the guard is dropped.
    pub fn acquire(&self) -> Acquired<'_> {
        self.get_token();
        Acquired { client: self }
    }

    /// Stops accepting grants and returns every free token to the parent.
    ///
    /// Tokens still in use are returned one by one as their holders call
    /// [`put_token`](Client::put_token). Calling this more than once does
    /// nothing.
    pub fn flush_tokens(&self) {
        self.inner.flush();
    }

    /// The number of tokens that could be taken right now without waiting.
    ///
    /// Advisory only: another thread may take them first.
    pub fn tokens(&self) -> usize {
        self.inner.shared.lock().tokens()
    }

    /// Best guess at the number of jobs this process may run at once.
    pub fn expected_jobs(&self) -> usize {
        let upstream = if self.has_upstream() {
            match self.inner.makeflags.jobs() {
                Some(JobLimit::Limited(n)) if n >= 2 => n - 1,
                Some(JobLimit::Limited(n)) => n,
                Some(JobLimit::Unlimited) | None => 0,
            }
        } else {
            0
        };
        self.local_budget() + upstream
    }

    /// Tokens this process may use without a parent.
    #[inline]
    pub fn local_budget(&self) -> usize {
        self.inner.shared.lock().local_budget()
    }

    /// Reports whether tokens come from a parent jobserver.
    #[inline]
    pub fn has_upstream(&self) -> bool {
        self.inner.shared.returns.is_some()
    }

    /// The number of tokens currently taken.
    #[inline]
    pub fn in_use(&self) -> usize {
        self.inner.shared.lock().in_use()
    }

    /// Reports whether [`flush_tokens`](Client::flush_tokens) has run.
    #[inline]
    pub fn is_draining(&self) -> bool {
        self.inner.shared.lock().is_draining()
    }

    /// The job limit advertised by the parent.
    #[inline]
    pub fn jobs(&self) -> Option<JobLimit> {
        self.inner.makeflags.jobs()
    }

    /// The flags this client was started with.
    #[inline]
    pub fn makeflags(&self) -> &Makeflags {
        &self.inner.makeflags
    }
}

impl ClientInner {
    fn flush(&self) {
        let n = match self.shared.lock().begin_drain() {
            Some(n) => n,
            None => return,
        };
        self.shared.cvar.notify_all();
        // Dropping the write end hangs up the listener's stop pipe.
        drop(self.stop.lock().unwrap_or_else(|e| e.into_inner()).take());
        log_debug!("flush_tokens() returning {} tokens\n", n);
        if let Some(returns) = &self.shared.returns {
            pipe::write_tokens(returns, n);
        }
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.flush();
    }
}

/// A token held until dropped. Returned by [`Client::acquire`].
#[derive(Debug)]
pub struct Acquired<'a> {
    client: &'a Client,
}

impl Drop for Acquired<'_> {
    fn drop(&mut self) {
        self.client.put_token();
    }
}

/// Reads grants from the parent until told to stop.
///
/// The read after a wakeup may block if another process sharing the parent's
/// pipe took the byte first; the listener then picks up the next one.
fn listen(shared: &Shared, grants: File, stop: File) {
    loop {
        match pipe::wait_readable(grants.as_raw_fd(), stop.as_raw_fd()) {
            Ok(Wakeup::Stop) => {
                log_debug2!("jobserver listener stopping\n");
                return;
            }
            Ok(Wakeup::Token) => {}
            Err(e) => fatal(ProtocolError::Io(e.to_string())),
        }
        match pipe::read_token(&grants) {
            Ok(true) => shared.credit(),
            Ok(false) => {
                log_warn!("parent jobserver closed its token pipe\n");
                return;
            }
            Err(e) => fatal(e),
        }
    }
}
