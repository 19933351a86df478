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

//! Parsing of the jobserver parts of `MAKEFLAGS`.

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::str;

/// Where a parent build tool says the token pool lives.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PoolAuth {
    /// Both ends of an inherited pipe.
    Fds { read: RawFd, write: RawFd },
    /// A named pipe on the filesystem (`--jobserver-auth=fifo:PATH`).
    Fifo(PathBuf),
}

/// Everything the client cares about in a `MAKEFLAGS` string.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PoolFlags {
    pub auth: Option<PoolAuth>,
    /// `-jN`
    pub max_jobs: Option<u32>,
    /// `-lN`
    pub max_load: Option<u32>,
}

/// Extract the pool location and advisory limits from a `MAKEFLAGS`-style
/// string.
///
/// Words that aren't understood are skipped, since most of `MAKEFLAGS`
/// belongs to make itself. When a flag repeats, the last occurrence wins.
pub fn parse_makeflags<S: AsRef<OsStr>>(flags: S) -> PoolFlags {
    const AUTH_PREFIXES: &[&[u8]] = &[
        b"--jobserver-auth=", // renamed in GNU make 4.2
        b"--jobserver-fds=",  // fallback syntax
    ];

    let mut result = PoolFlags::default();
    let words = flags
        .as_ref()
        .as_bytes()
        .split(|b| b.is_ascii_whitespace())
        .filter(|w| !w.is_empty());
    for word in words {
        if let Some(arg) = AUTH_PREFIXES.iter().find_map(|p| word.strip_prefix(*p)) {
            match parse_auth(arg) {
                Some(auth) => result.auth = Some(auth),
                None => log_debug!(
                    "MAKEFLAGS: ignoring malformed {:?}",
                    String::from_utf8_lossy(word)
                ),
            }
        } else if let Some(n) = word.strip_prefix(b"-j") {
            if let Some(n) = parse_positive(n) {
                result.max_jobs = Some(n);
            }
        } else if let Some(n) = word.strip_prefix(b"-l") {
            if let Some(n) = parse_positive(n) {
                result.max_load = Some(n);
            }
        }
    }
    result
}

fn parse_auth(arg: &[u8]) -> Option<PoolAuth> {
    if let Some(path) = arg.strip_prefix(b"fifo:") {
        if path.is_empty() {
            return None;
        }
        return Some(PoolAuth::Fifo(PathBuf::from(OsStr::from_bytes(path))));
    }
    let arg = str::from_utf8(arg).ok()?;
    let comma = arg.find(',')?;
    let read = parse_fd(&arg[..comma])?;
    let write = parse_fd(&arg[comma + 1..])?;
    Some(PoolAuth::Fds { read, write })
}

fn parse_fd(s: &str) -> Option<RawFd> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

fn parse_positive(s: &[u8]) -> Option<u32> {
    if s.is_empty() || !s.iter().all(|b| b.is_ascii_digit()) {
        return None;
    }
    match str::from_utf8(s).ok()?.parse() {
        Ok(0) | Err(_) => None,
        Ok(n) => Some(n),
    }
}
