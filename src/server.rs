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

//! The granting side of a jobserver.
//!
//! A [`Server`] relays tokens from a [`Client`] down to one child process.
//! The child's implicit token is covered by the server's proxy token, which
//! costs the client nothing; every further grant is backed by a token the
//! server acquired from its client.

use std::fs::File;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::client::Client;
use super::command::ChildCommand;
use super::env::MAKEFLAGS_VAR;
use super::error::{fatal, JobserverError, JobserverErrorKind, ProtocolError};
use super::makeflags::{JobLimit, Makeflags};
use super::pipe;
use crate::{log_debug, log_debug2, log_err, log_warn};

/// How often [`Server::disable_jobs`] re-checks the outstanding grants.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Coarse lifecycle of a [`Server`], as seen from outside.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ServerPhase {
    /// Set up, but no grant has been attempted yet.
    Idle,
    /// The child has fewer grants than its limit and more are on the way.
    Granting,
    /// The child holds as many grants as its limit allows.
    SteadyState,
    /// Disabled or exited, with grants still outstanding.
    Draining,
    /// Disabled or exited, with every grant accounted for.
    Drained,
}

/// Relays tokens from a [`Client`] to a single child process.
#[derive(Debug)]
pub struct Server {
    shared: Arc<ServerShared>,
    relay: Option<JoinHandle<Result<(), JobserverError>>>,
    granter: Option<JoinHandle<()>>,
}

#[derive(Debug)]
struct ServerShared {
    client: Client,
    grants: File,
    state: Mutex<ServerState>,
    cvar: Condvar,
    /// Set once the child is gone. Checked under the client's lock, so a
    /// granter waiting on the client sees it as soon as it is woken.
    stopped: AtomicBool,
}

#[derive(Debug, Default)]
struct ServerState {
    /// Tokens sitting in the grant pipe or held by the child.
    granted: usize,
    /// Tokens being acquired from the client with the lock released.
    acquiring: usize,
    max_jobs: usize,
    /// Whether one of the grants is the proxy token.
    holds_proxy: bool,
    started: bool,
    disabled: bool,
    /// The child closed its end of the return pipe.
    closed: bool,
    child_error: Option<JobserverError>,
}

impl ServerState {
    #[inline]
    fn upstream_backed(&self) -> usize {
        self.granted - self.holds_proxy as usize
    }

    #[inline]
    fn wants_more(&self) -> bool {
        !self.closed && self.granted + self.acquiring < self.max_jobs
    }

    /// Takes back one grant. Upstream-backed grants are retired before the
    /// proxy token. Returns whether the grant was backed by a client token.
    fn retire(&mut self) -> Result<bool, ProtocolError> {
        if self.granted == 0 {
            return Err(ProtocolError::ExtraTokenReturned);
        }
        let backed = self.upstream_backed() > 0;
        self.granted -= 1;
        if !backed {
            self.holds_proxy = false;
        }
        Ok(backed)
    }
}

impl Server {
    /// Prepares `child` to run under a new jobserver that grants it up to
    /// `job_limit` tokens from `client`.
    ///
    /// The child's `MAKEFLAGS` is rewritten to point at the new pipes, which
    /// are attached as the next two extra files of `child`. If `child`
    /// already sets `MAKEFLAGS` explicitly, that value is rewritten instead
    /// of the client's.
    ///
    /// # Errors
    ///
    /// If the pipes or threads cannot be created, or the explicit
    /// `MAKEFLAGS` cannot be parsed. `child` is unchanged on error.
    pub fn setup(
        client: &Client,
        child: &mut ChildCommand,
        job_limit: usize,
    ) -> Result<Server, JobserverError> {
        let base = match child.makeflags() {
            Some(Some(v)) => match v.to_str() {
                Some(s) => Makeflags::parse(s)?,
                None => return Err(JobserverError::bad_makeflags("not valid UTF-8")),
            },
            Some(None) => Makeflags::default(),
            None => client.makeflags().clone(),
        };
        let (grant_r, grant_w) = pipe::pipe()?;
        let (return_r, return_w) = pipe::pipe()?;
        let leftovers = grant_r.try_clone()?;
        let auth = (child.next_fd(), child.next_fd() + 1);
        let makeflags = base.with_jobserver(auth, JobLimit::Limited(job_limit));

        let shared = Arc::new(ServerShared {
            client: client.clone(),
            grants: grant_w,
            state: Mutex::new(ServerState {
                max_jobs: job_limit,
                ..ServerState::default()
            }),
            cvar: Condvar::new(),
            stopped: AtomicBool::new(false),
        });
        let relay = {
            let shared = shared.clone();
            thread::Builder::new()
                .name("jobserver-relay".to_string())
                .spawn(move || shared.relay(return_r, leftovers))?
        };
        let granter = {
            let shared = shared.clone();
            thread::Builder::new()
                .name("jobserver-granter".to_string())
                .spawn(move || shared.grant_loop())?
        };

        log_debug!("jobserver for child: MAKEFLAGS={}\n", makeflags);
        child
            .command_mut()
            .env(MAKEFLAGS_VAR, makeflags.to_string());
        child.extra_file(grant_r);
        child.extra_file(return_w);
        Ok(Server {
            shared,
            relay: Some(relay),
            granter: Some(granter),
        })
    }

    /// Grants tokens until the child holds `max_jobs` of them.
    ///
    /// The server does this on its own whenever a grant is returned; calling
    /// it directly blocks the caller while the client has no token to spare.
    #[inline]
    pub fn enable_jobs(&self) {
        self.shared.enable_jobs();
    }

    /// Stops granting and waits until the child has returned every grant.
    ///
    /// # Errors
    ///
    /// If the child exited while still holding tokens.
    pub fn disable_jobs(&self) -> Result<(), JobserverError> {
        let mut state = self.shared.lock();
        state.max_jobs = 0;
        state.disabled = true;
        self.shared.cvar.notify_all();
        while state.granted > 0 {
            log_debug2!("waiting for child to return {} tokens\n", state.granted);
            state = self
                .shared
                .cvar
                .wait_timeout(state, DRAIN_POLL_INTERVAL)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
        match &state.child_error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    /// Waits for the child to close its end of the return pipe and for the
    /// server's threads to finish.
    ///
    /// # Errors
    ///
    /// If the child exited while still holding tokens.
    ///
    /// # Panics
    ///
    /// With the [`ProtocolError`](crate::ProtocolError) payload if the child
    /// broke the protocol.
    pub fn wait(mut self) -> Result<(), JobserverError> {
        let result = match self.relay.take() {
            Some(handle) => match handle.join() {
                Ok(result) => result,
                Err(payload) => std::panic::resume_unwind(payload),
            },
            None => Ok(()),
        };
        if let Some(handle) = self.granter.take() {
            if let Err(payload) = handle.join() {
                std::panic::resume_unwind(payload);
            }
        }
        result
    }

    /// Tokens currently granted to the child, including the proxy token.
    #[inline]
    pub fn granted_to_child(&self) -> usize {
        self.shared.lock().granted
    }

    /// The current job limit. Zero once jobs are disabled.
    #[inline]
    pub fn max_jobs(&self) -> usize {
        self.shared.lock().max_jobs
    }

    /// Reports whether one of the child's grants is the free proxy token.
    #[inline]
    pub fn holds_proxy_token(&self) -> bool {
        self.shared.lock().holds_proxy
    }

    /// The client backing this server's grants.
    #[inline]
    pub fn client(&self) -> &Client {
        &self.shared.client
    }

    /// Where the server is in its lifecycle. Advisory, like
    /// [`Client::tokens`].
    pub fn phase(&self) -> ServerPhase {
        let state = self.shared.lock();
        if state.disabled || state.closed {
            if state.granted == 0 {
                ServerPhase::Drained
            } else {
                ServerPhase::Draining
            }
        } else if !state.started {
            ServerPhase::Idle
        } else if state.acquiring > 0 || state.granted < state.max_jobs {
            ServerPhase::Granting
        } else {
            ServerPhase::SteadyState
        }
    }
}

impl ServerShared {
    fn lock(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn enable_jobs(&self) {
        let mut state = self.lock();
        state.started = true;
        while state.wants_more() {
            if !state.holds_proxy {
                state.holds_proxy = true;
                if let Err(e) = self.grant(&mut state) {
                    drop(state);
                    fatal(e);
                }
                log_debug2!("granted proxy token to child\n");
                continue;
            }
            state.acquiring += 1;
            drop(state);
            let acquired = self.client.get_token_unless(&self.stopped);
            state = self.lock();
            state.acquiring -= 1;
            if !acquired {
                // The client is draining or the child is gone.
                drop(state);
                self.cvar.notify_all();
                return;
            }
            if !state.wants_more() {
                // The limit was lowered while waiting.
                drop(state);
                self.client.put_token();
                self.cvar.notify_all();
                return;
            }
            if let Err(e) = self.grant(&mut state) {
                drop(state);
                fatal(e);
            }
        }
        self.cvar.notify_all();
    }

    fn grant(&self, state: &mut ServerState) -> Result<(), ProtocolError> {
        pipe::send_tokens(&self.grants, 1)?;
        state.granted += 1;
        log_debug2!("granted token to child ({} outstanding)\n", state.granted);
        Ok(())
    }

    /// Refills the child's grants until the child goes away.
    fn grant_loop(&self) {
        loop {
            self.enable_jobs();
            if self.client.is_draining() {
                log_warn!("jobserver client flushed; no more tokens for child\n");
                return;
            }
            let mut state = self.lock();
            while !state.closed && !state.wants_more() {
                state = self.cvar.wait(state).unwrap_or_else(|e| e.into_inner());
            }
            if state.closed {
                return;
            }
        }
    }

    /// Reads returned tokens until the child closes the return pipe.
    fn relay(&self, returns: File, leftovers: File) -> Result<(), JobserverError> {
        loop {
            match pipe::read_token(&returns) {
                Ok(true) => self.token_returned(),
                Ok(false) => break,
                Err(e) => fatal(e),
            }
        }
        self.child_exited(&leftovers)
    }

    fn token_returned(&self) {
        let mut state = self.lock();
        let backed = match state.retire() {
            Ok(backed) => backed,
            Err(e) => {
                drop(state);
                fatal(e);
            }
        };
        log_debug2!("child returned a token ({} outstanding)\n", state.granted);
        self.cvar.notify_all();
        drop(state);
        if backed {
            self.client.put_token();
        }
    }

    /// Settles the books once the child is gone.
    ///
    /// Grants the child never read are still in the pipe and count as
    /// returned. Anything else the child took with it is reclaimed and
    /// reported.
    fn child_exited(&self, leftovers: &File) -> Result<(), JobserverError> {
        let mut state = self.lock();
        state.closed = true;
        // Grants are written with the lock held, so this sees all of them.
        let unread = pipe::drain_ready(leftovers).unwrap_or_else(|e| {
            log_warn!("cannot reclaim unread grants: {}\n", e);
            0
        });
        let mut returns = 0;
        for _ in 0..unread {
            match state.retire() {
                Ok(true) => returns += 1,
                Ok(false) => {}
                Err(e) => {
                    drop(state);
                    fatal(e);
                }
            }
        }
        let result = match state.granted {
            0 => Ok(()),
            outstanding => {
                returns += state.upstream_backed();
                state.granted = 0;
                state.holds_proxy = false;
                let err = JobserverError::from(JobserverErrorKind::ChildHoldingTokens {
                    outstanding,
                });
                state.child_error = Some(err.clone());
                Err(err)
            }
        };
        self.cvar.notify_all();
        drop(state);
        self.stopped.store(true, Ordering::SeqCst);
        self.client.wake_waiters();

        for _ in 0..returns {
            self.client.put_token();
        }
        match &result {
            Ok(()) => log_debug!("child closed its token pipe ({} unread)\n", unread),
            Err(e) => log_err!("{}\n", e),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use nix::poll::{self, PollFd, PollFlags};
    use std::os::unix::io::{AsRawFd, IntoRawFd};
    use std::panic::{self, AssertUnwindSafe};
    use std::process::Command;
    use std::time::Instant;

    /// The child's side of a jobserver session.
    struct ChildEnds {
        grants: File,
        returns: File,
    }

    fn take_child_ends(cmd: &mut ChildCommand) -> ChildEnds {
        let mut files = std::mem::take(&mut cmd.extra_files).into_iter();
        ChildEnds {
            grants: files.next().unwrap(),
            returns: files.next().unwrap(),
        }
    }

    fn readable_within(f: &File, timeout: Duration) -> bool {
        let mut fds = [PollFd::new(f.as_raw_fd(), PollFlags::POLLIN)];
        poll::poll(&mut fds, timeout.as_millis() as i32).unwrap() > 0
    }

    fn wait_until<F: FnMut() -> bool>(what: &str, mut cond: F) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn local_client(jobs: usize) -> Client {
        Client::new(Config::default().local_jobs(jobs)).unwrap()
    }

    #[test]
    fn setup_rewrites_makeflags() {
        let client = Client::new(Config::new(Makeflags::parse("k -j8").unwrap())).unwrap();
        let mut cmd = ChildCommand::new(Command::new("true"));
        let (r, _w) = pipe::pipe().unwrap();
        cmd.extra_file(r);
        let _server = Server::setup(&client, &mut cmd, 3).unwrap();
        assert_eq!(
            cmd.makeflags().unwrap().unwrap(),
            "k -j3 --jobserver-auth=4,5"
        );
        assert_eq!(cmd.next_fd(), 6);
    }

    #[test]
    fn setup_prefers_explicit_makeflags() {
        let client = local_client(1);
        let mut command = Command::new("true");
        command.env(MAKEFLAGS_VAR, "-s");
        let mut cmd = ChildCommand::from(command);
        let _server = Server::setup(&client, &mut cmd, 2).unwrap();
        assert_eq!(
            cmd.makeflags().unwrap().unwrap(),
            "-s --jobserver-auth=3,4 -j2"
        );
    }

    #[test]
    fn proxy_token_granted_without_upstream() {
        let (grant_r, parent_grants) = pipe::pipe().unwrap();
        let (parent_returns, return_w) = pipe::pipe().unwrap();
        let flags = format!(
            "-j4 --jobserver-auth={},{}",
            grant_r.into_raw_fd(),
            return_w.into_raw_fd()
        );
        let client = Client::new(Config::new(Makeflags::parse(&flags).unwrap())).unwrap();
        assert_eq!(client.local_budget(), 0);

        let mut cmd = ChildCommand::new(Command::new("true"));
        let server = Arc::new(Server::setup(&client, &mut cmd, 2).unwrap());
        let child = take_child_ends(&mut cmd);

        assert!(pipe::read_token(&child.grants).unwrap());
        wait_until("proxy grant", || server.granted_to_child() == 1);
        assert!(server.holds_proxy_token());
        assert!(!readable_within(&child.grants, Duration::from_millis(100)));
        assert_eq!(server.phase(), ServerPhase::Granting);

        pipe::write_token(&parent_grants);
        assert!(pipe::read_token(&child.grants).unwrap());
        wait_until("second grant", || server.granted_to_child() == 2);
        assert_eq!(server.phase(), ServerPhase::SteadyState);
        assert_eq!(client.in_use(), 1);

        let disabler = {
            let server = server.clone();
            thread::spawn(move || server.disable_jobs())
        };
        wait_until("disable", || server.max_jobs() == 0);
        pipe::write_tokens(&child.returns, 2);
        disabler.join().unwrap().unwrap();
        assert_eq!(server.granted_to_child(), 0);
        assert!(!server.holds_proxy_token());
        assert_eq!(server.phase(), ServerPhase::Drained);
        assert_eq!(client.in_use(), 0);

        drop(child);
        let server = Arc::try_unwrap(server).unwrap();
        server.wait().unwrap();

        client.flush_tokens();
        assert!(pipe::read_token(&parent_returns).unwrap());
    }

    #[test]
    fn grants_never_exceed_client_tokens() {
        let client = local_client(2);
        let mut cmd = ChildCommand::new(Command::new("true"));
        let server = Server::setup(&client, &mut cmd, 5).unwrap();
        let child = take_child_ends(&mut cmd);

        for _ in 0..3 {
            assert!(pipe::read_token(&child.grants).unwrap());
        }
        wait_until("grants", || server.granted_to_child() == 3);
        assert!(!readable_within(&child.grants, Duration::from_millis(100)));
        assert_eq!(client.in_use(), 2);
        assert_eq!(server.phase(), ServerPhase::Granting);

        // A returned token is handed right back out.
        pipe::write_token(&child.returns);
        assert!(pipe::read_token(&child.grants).unwrap());
        wait_until("refill", || server.granted_to_child() == 3);

        drop(child);
        let err = server.wait().unwrap_err();
        assert_eq!(
            err.kind(),
            &JobserverErrorKind::ChildHoldingTokens { outstanding: 3 }
        );
        wait_until("reclaim", || client.in_use() == 0);
    }

    #[test]
    fn unread_grants_are_reclaimed() {
        let client = local_client(1);
        let mut cmd = ChildCommand::new(Command::new("true"));
        let server = Server::setup(&client, &mut cmd, 3).unwrap();
        wait_until("grants", || server.granted_to_child() == 2);

        drop(take_child_ends(&mut cmd));
        server.wait().unwrap();
        wait_until("reclaim", || client.in_use() == 0);
        assert_eq!(client.tokens(), 1);
    }

    #[test]
    fn disable_reports_child_holding_tokens() {
        let client = local_client(1);
        let mut cmd = ChildCommand::new(Command::new("true"));
        let server = Server::setup(&client, &mut cmd, 1).unwrap();
        let child = take_child_ends(&mut cmd);
        assert!(pipe::read_token(&child.grants).unwrap());

        drop(child);
        let err = server.disable_jobs().unwrap_err();
        assert_eq!(
            err.kind(),
            &JobserverErrorKind::ChildHoldingTokens { outstanding: 1 }
        );
        assert_eq!(server.phase(), ServerPhase::Drained);
        assert_eq!(client.in_use(), 0);
    }

    #[test]
    fn flush_while_granting_stops_granter() {
        for _ in 0..20 {
            let client = local_client(200);
            let mut cmd = ChildCommand::new(Command::new("true"));
            let server = Server::setup(&client, &mut cmd, 200).unwrap();
            let child = take_child_ends(&mut cmd);
            wait_until("grants", || server.granted_to_child() >= 50);

            client.flush_tokens();
            wait_until("granter to stop acquiring", || {
                server.shared.lock().acquiring == 0
            });
            drop(child);
            // Re-raises a protocol violation from either thread.
            server.wait().unwrap();
            assert_eq!(client.in_use(), 0);
        }
    }

    #[test]
    fn granter_releases_client_when_child_exits() {
        let (grant_r, parent_grants) = pipe::pipe().unwrap();
        let (parent_returns, return_w) = pipe::pipe().unwrap();
        let flags = format!(
            "-j3 --jobserver-auth={},{}",
            grant_r.into_raw_fd(),
            return_w.into_raw_fd()
        );
        let client = Client::new(Config::new(Makeflags::parse(&flags).unwrap())).unwrap();
        let mut cmd = ChildCommand::new(Command::new("true"));
        let server = Server::setup(&client, &mut cmd, 3).unwrap();

        pipe::write_token(&parent_grants);
        wait_until("grants", || server.granted_to_child() == 2);
        wait_until("granter to block", || server.shared.lock().acquiring == 1);

        drop(take_child_ends(&mut cmd));
        server.wait().unwrap();
        // Nothing else holds the client now, so dropping it flushes.
        drop(client);
        assert!(pipe::read_token(&parent_returns).unwrap());
    }

    #[test]
    fn extra_return_is_fatal() {
        let client = local_client(1);
        let mut cmd = ChildCommand::new(Command::new("true"));
        let server = Server::setup(&client, &mut cmd, 0).unwrap();
        let child = take_child_ends(&mut cmd);
        pipe::write_token(&child.returns);
        drop(child);

        let payload = panic::catch_unwind(AssertUnwindSafe(|| server.wait())).unwrap_err();
        assert_eq!(
            payload.downcast_ref::<ProtocolError>(),
            Some(&ProtocolError::ExtraTokenReturned)
        );
    }

    #[test]
    fn spawned_child_returns_its_grants() {
        let client = local_client(2);
        let mut command = Command::new("sh");
        // Read both grants, then hand them back.
        command.args(&["-c", "head -c 2 <&3 >&4"]);
        let mut cmd = ChildCommand::new(command);
        let server = Server::setup(&client, &mut cmd, 2).unwrap();
        let status = cmd.spawn().unwrap().wait().unwrap();
        assert!(status.success(), "status = {:?}", status);
        server.wait().unwrap();
        wait_until("reclaim", || client.in_use() == 0);
    }
}
