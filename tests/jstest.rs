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

use std::path::Path;
use std::process::{Command, Output};

fn jstest(makeflags: Option<&str>, args: &[&str]) -> Output {
    let mut command = Command::new(Path::new(env!("CARGO_BIN_EXE_jstest")));
    command.args(args);
    for var in &[
        "MAKEFLAGS",
        "JOBSERVER_LOCAL_JOBS",
        "JOBSERVER_DEBUG",
        "JOBSERVER_PRETTY",
        "JOBSERVER_COLOR",
    ] {
        command.env_remove(var);
    }
    if let Some(makeflags) = makeflags {
        command.env("MAKEFLAGS", makeflags);
    }
    command.output().expect("could not run jstest")
}

#[test]
fn standalone_session() {
    let out = jstest(None, &["--local", "2", "--tokens", "2", "--sleep", "10"]);
    assert!(out.status.success(), "jstest status = {:?}", out);
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("tokens=0 and Tokens()=2"), "stdout = {}", stdout);
}

#[test]
fn recursive_session() {
    let out = jstest(
        None,
        &[
            "--recurse", "--local", "4", "--serve", "3", "--tokens", "1", "--client", "2",
            "--sleep", "20",
        ],
    );
    assert!(out.status.success(), "jstest status = {:?}", out);
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert_eq!(stdout.lines().count(), 2, "stdout = {}", stdout);
}

#[test]
fn bad_makeflags_exit_code() {
    let out = jstest(Some("--jobserver-auth=7"), &["--sleep", "0"]);
    assert_eq!(out.status.code(), Some(2), "jstest output = {:?}", out);
}

#[test]
fn not_recursive_exit_code() {
    let out = jstest(Some("-j4 --jobserver-auth=97,98"), &["--sleep", "0"]);
    assert_eq!(out.status.code(), Some(200), "jstest output = {:?}", out);
}
