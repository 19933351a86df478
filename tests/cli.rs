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

use nix::unistd;
use std::path::Path;
use std::process::{Command, Output};

fn jobclient(makeflags: &str, args: &[&str]) -> Output {
    let path = Path::new(env!("CARGO_BIN_EXE_jobclient"));
    Command::new(path)
        .args(args)
        .env("MAKEFLAGS", makeflags)
        .env_remove("DEBUG_JOBCLIENT")
        .env_remove("DEBUG_JOBCLIENT_2")
        .env_remove("JOBCLIENT_DEBUG")
        .output()
        .expect("could not run jobclient")
}

#[test]
fn under_make() {
    // Pipe descriptors from nix::unistd::pipe are inherited by children.
    let (r, w) = unistd::pipe().unwrap();
    assert_eq!(unistd::write(w, b"++").unwrap(), 2);

    let output = jobclient(&format!(" -j3 --jobserver-auth={},{}", r, w), &[]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(output.status.success(), "status = {:?}\n{}", output.status, stdout);
    assert!(stdout.contains("jobclient: maxJobs = 3"), "{}", stdout);
    assert!(stdout.contains("acquire excess token failed = ok"), "{}", stdout);

    // Everything went back.
    let mut buf = [0u8; 8];
    assert_eq!(unistd::read(r, &mut buf).unwrap(), 2);
    assert_eq!(&buf[..2], b"++");
    unistd::close(r).unwrap();
    unistd::close(w).unwrap();
}

#[test]
fn without_jobserver() {
    let output = jobclient("-k", &[]);
    assert!(output.status.success(), "status = {:?}", output.status);
    assert!(String::from_utf8_lossy(&output.stdout).contains("init failed"));

    let output = jobclient("-k", &["--require"]);
    assert_eq!(output.status.code(), Some(200));
}

#[test]
fn bad_argument() {
    let output = jobclient("", &["--max-jobs", "lots"]);
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn debug_flag() {
    let output = jobclient("-k", &[]);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(!stderr.contains(": debug: "), "{}", stderr);

    let output = jobclient("-k", &["-d"]);
    assert!(output.status.success(), "status = {:?}", output.status);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains(": debug: init failed: no jobserver in MAKEFLAGS"),
        "{}",
        stderr
    );
}
