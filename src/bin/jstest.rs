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

//! Exercises a jobserver session end to end, optionally running itself as a
//! child under a [`Server`].

use anyhow::{bail, Context, Error};
use clap::{crate_version, App, AppSettings, Arg, ArgMatches};
use std::env;
use std::io;
use std::process::Command;
use std::thread;
use std::time::Duration;

use jobserver::logs::LogBuilder;
use jobserver::{
    log_debug, log_err, ChildCommand, Client, Config, Env, JobserverErrorKind, Server,
    EXIT_SUCCESS,
};

fn main() {
    match run() {
        Ok(_) => std::process::exit(EXIT_SUCCESS),
        Err(e) => {
            let msg = {
                use std::fmt::Write;

                let mut s = String::new();
                for e in e.chain() {
                    if !s.is_empty() {
                        let _ = write!(s, ": ");
                    }
                    let _ = write!(s, "{}", e);
                }
                s
            };
            log_err!("{}", msg);
            std::process::exit(i32::from(&JobserverErrorKind::of(&e)))
        }
    }
}

fn run() -> Result<(), Error> {
    let matches = App::new("jstest")
        .about("Take and release jobserver tokens, optionally serving a child copy of itself.")
        .version(crate_version!())
        .setting(AppSettings::DeriveDisplayOrder)
        .setting(AppSettings::UnifiedHelpMessage)
        .arg(Arg::from_usage(
            "--tokens [N] 'number of tokens to take at start (default: 1)'",
        ))
        .arg(Arg::from_usage(
            "--local [N] 'local token budget when there is no parent jobserver'",
        ))
        .arg(Arg::from_usage(
            "--recurse 'run a copy of this program under a jobserver'",
        ))
        .arg(Arg::from_usage(
            "--serve [N] 'maximum jobs to grant the child (default: 1)'",
        ))
        .arg(Arg::from_usage(
            "--client [N] 'number of tokens the child takes (default: 1)'",
        ))
        .arg(Arg::from_usage(
            "--sleep [MS] 'milliseconds to wait between phases (default: 500)'",
        ))
        .get_matches();
    let token_count = count_arg(&matches, "tokens", 1)?;
    let local_count = count_arg(&matches, "local", 0)?;
    let serve_count = count_arg(&matches, "serve", 1)?;
    let client_count = count_arg(&matches, "client", 1)?;
    let pause = Duration::from_millis(count_arg(&matches, "sleep", 500)? as u64);

    let env = Env::inherit();
    LogBuilder::from(&env).setup(&env, io::stderr());
    let name = env::args().next().unwrap_or_else(|| String::from("jstest"));

    let mut config = Config::from_env(&env)?;
    if local_count > 0 {
        config = config.local_jobs(local_count);
    }
    let client = Client::new(config)?;
    log_debug!(
        "{}: expecting {} jobs ({} local)\n",
        name,
        client.expected_jobs(),
        client.local_budget()
    );

    let mut tokens = 0;
    for i in 0..token_count {
        client.get_token();
        tokens += 1;
        log_debug!("{}: got token {}\n", name, i);
    }

    let child = if matches.is_present("recurse") {
        let exe = env::current_exe().context("locate jstest executable")?;
        let mut command = Command::new(exe);
        command
            .arg("--tokens")
            .arg(client_count.to_string())
            .arg("--sleep")
            .arg(pause.as_millis().to_string());
        let mut command = ChildCommand::new(command);
        let server = Server::setup(&client, &mut command, serve_count)?;
        let child = command.spawn().context("start child")?;
        Some((server, child))
    } else {
        None
    };

    log_debug!("{}: holding {} tokens\n", name, tokens);
    thread::sleep(pause);
    while tokens > 0 {
        client.put_token();
        tokens -= 1;
    }

    log_debug!("{}: released tokens\n", name);
    thread::sleep(pause);
    if let Some((server, _)) = &child {
        server.disable_jobs()?;
        log_debug!("{}: child jobs disabled\n", name);
    }
    client.flush_tokens();
    log_debug!("{}: flushed tokens\n", name);

    if let Some((server, mut child)) = child {
        let status = child.wait().context("wait for child")?;
        server.wait()?;
        if !status.success() {
            bail!("child failed: {}", status);
        }
    }
    println!(
        "{}: exiting with tokens={} and Tokens()={}",
        name,
        tokens,
        client.tokens()
    );
    Ok(())
}

fn count_arg(matches: &ArgMatches, name: &str, default: usize) -> Result<usize, Error> {
    match matches.value_of(name) {
        Some(v) => str::parse::<usize>(v).with_context(|| format!("invalid --{} value", name)),
        None => Ok(default),
    }
}
