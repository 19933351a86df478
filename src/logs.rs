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

use lazy_static::lazy_static;
use libc::pid_t;
use nix::unistd;
use std::fmt::{self, Display, Formatter};
use std::io::{self, Write};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Mutex;
use std::time::SystemTime;

use super::env::Env;

/// A line-based logger.
trait Logger {
    /// Write a line to the logger.
    /// `line` must not contain any `'\n'` characters.
    fn write_line(&mut self, line: &str);
}

/// Writes each line to a file, flushing after every line so that output
/// from several processes sharing a terminal interleaves by line.
#[derive(Debug)]
struct LineLog<W> {
    file: W,
}

impl<W: Write> Logger for LineLog<W> {
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

lazy_static! {
    static ref GLOBAL_LOGGER: Mutex<Option<Box<dyn Logger + Send>>> = Mutex::new(None);
}

/// A builder used for setting up logs.
#[derive(Clone, Debug)]
pub struct LogBuilder {
    debug: Option<i32>,
}

impl LogBuilder {
    #[inline]
    pub fn new() -> LogBuilder {
        LogBuilder { debug: None }
    }

    /// Override the debug level read from the environment.
    #[inline]
    pub fn debug(&mut self, level: i32) -> &mut Self {
        self.debug = Some(level);
        self
    }

    /// Set up the process-wide logger with the builder's settings.
    pub fn setup<W: Write + Send + 'static>(&self, env: &Env, file: W) {
        DEBUG_LEVEL.store(self.debug.unwrap_or(env.debug), Ordering::SeqCst);
        let mut global_logger = GLOBAL_LOGGER
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *global_logger = Some(Box::new(LineLog { file }));
    }
}

impl Default for LogBuilder {
    #[inline]
    fn default() -> LogBuilder {
        LogBuilder::new()
    }
}

/// Global debug level (used for `log_*` macros).
///
/// Negative until either [`LogBuilder::setup`] runs or the level is first
/// requested, at which point it is read from the environment.
static DEBUG_LEVEL: AtomicI32 = AtomicI32::new(-1);

/// Return the currently configured global debug level.
pub fn debug_level() -> i32 {
    let level = DEBUG_LEVEL.load(Ordering::SeqCst);
    if level >= 0 {
        return level;
    }
    let level = Env::inherit().debug.max(0);
    match DEBUG_LEVEL.compare_exchange(-1, level, Ordering::SeqCst, Ordering::SeqCst) {
        Ok(_) => level,
        Err(curr) => curr,
    }
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
        let mut logger = GLOBAL_LOGGER
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(logger) = &mut *logger {
            logger.write_line(line);
            return;
        }
    }
    LineLog { file: io::stderr() }.write_line(line);
}

/// Write a structured log-line to the process-wide logger.
pub fn meta(kind: &str, s: &str) {
    let timestamp = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default();
    let meta = Meta {
        kind,
        pid: unistd::getpid().as_raw(),
        timestamp,
        text: s,
    };
    write(&format!("{}", meta));
}

/// An immutable reference to a structured log-line.
#[derive(Clone, Copy, Debug, PartialEq)]
struct Meta<'a> {
    kind: &'a str,
    pid: pid_t,
    timestamp: f64,
    text: &'a str,
}

impl Display for Meta<'_> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(
            f,
            "jobclient {} {:.6}: {}: {}",
            self.pid, self.timestamp, self.kind, self.text
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_format() {
        let meta = Meta {
            kind: "debug",
            pid: 1234,
            timestamp: 1.5,
            text: "acquire: read ok",
        };
        assert_eq!(
            meta.to_string(),
            "jobclient 1234 1.500000: debug: acquire: read ok"
        );
    }

    #[test]
    fn line_log_appends_newline() {
        let mut log = LineLog { file: Vec::new() };
        log.write_line("hello");
        log.write_line("world");
        assert_eq!(log.file, b"hello\nworld\n");
    }
}
