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

use std::convert::TryFrom;
use std::ffi::OsString;
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::time::Duration;

use super::acquire::{Acquirer, ReadStrategy};
use super::env::Env;
use super::error::JobClientError;
use super::makeflags::{self, PoolAuth};
use super::pool::{self, AdvisoryLimits, PoolHandle};
use super::release;
use super::token::Token;

/// Default bound on a single acquisition attempt.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Default pause between retries of an interrupted release.
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// A client for a GNU make jobserver.
///
/// Make counts the process running the client as one job already, so a
/// caller needs no token for its first worker, only for each additional
/// one. `max_jobs` is the limit for the whole build: fewer than
/// `max_jobs - 1` tokens may be available to any single client.
///
/// Dropping the client closes descriptors it opened itself. Inherited
/// pipe descriptors stay open, as the rest of the build depends on them.
#[derive(Debug)]
pub struct JobClient {
    pool: PoolHandle,
    limits: AdvisoryLimits,
    acquirer: Acquirer,
    retry_backoff: Duration,
}

impl JobClient {
    /// Connect to the jobserver named in `$MAKEFLAGS`.
    ///
    /// # Errors
    ///
    /// An error with [`ErrorKind::NoJobServer`] means there is no usable
    /// pool; callers should carry on without one.
    ///
    /// [`ErrorKind::NoJobServer`]: crate::ErrorKind::NoJobServer
    #[inline]
    pub fn from_env() -> Result<JobClient, JobClientError> {
        JobClientBuilder::new().build()
    }

    #[inline]
    pub fn builder() -> JobClientBuilder {
        JobClientBuilder::new()
    }

    /// The build-wide job limit (`-jN`), if known.
    #[inline]
    pub fn max_jobs(&self) -> Option<u32> {
        self.limits.max_jobs
    }

    /// The load average limit (`-lN`), if known.
    #[inline]
    pub fn max_load(&self) -> Option<u32> {
        self.limits.max_load
    }

    /// Try to take a token from the pool.
    ///
    /// Returns `Ok(None)` if no token could be had within the read timeout.
    /// There is no retry: callers back off and try again at their own pace.
    #[inline]
    pub fn acquire(&mut self) -> Result<Option<Token>, JobClientError> {
        self.acquirer.acquire(&self.pool)
    }

    /// Put a token back into the pool.
    pub fn release(&self, token: Token) -> Result<(), JobClientError> {
        let fd = self.pool.write_fd();
        release::write_token(
            |buf: &[u8]| nix::unistd::write(fd, buf),
            token,
            self.retry_backoff,
        )
    }

    /// Validate `value` as a token and put it back into the pool.
    ///
    /// Nothing is written if `value` is outside of `0..=255`.
    pub fn release_value(&self, value: i64) -> Result<(), JobClientError> {
        let token = Token::try_from(value)?;
        self.release(token)
    }

    /// Acquire once and give back what was taken, if anything.
    fn self_test(&mut self) -> Result<(), JobClientError> {
        log_debug!("init: test acquire ...");
        match self.acquire()? {
            None => log_debug!("init: test acquire failed. jobserver is full"),
            Some(token) => {
                log_debug!("init: test acquire ok");
                self.release(token)?;
                log_debug!("init: test release ok");
            }
        }
        Ok(())
    }
}

/// Options for connecting a [`JobClient`].
///
/// Explicit settings take precedence over what `MAKEFLAGS` says.
#[derive(Clone, Debug)]
pub struct JobClientBuilder {
    makeflags: Option<OsString>,
    fds: Option<(RawFd, RawFd)>,
    named_pipes: Option<(PathBuf, PathBuf)>,
    max_jobs: Option<u32>,
    max_load: Option<u32>,
    read_timeout: Duration,
    retry_backoff: Duration,
    strategy: ReadStrategy,
}

impl JobClientBuilder {
    #[inline]
    pub fn new() -> JobClientBuilder {
        JobClientBuilder {
            makeflags: None,
            fds: None,
            named_pipes: None,
            max_jobs: None,
            max_load: None,
            read_timeout: DEFAULT_READ_TIMEOUT,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            strategy: ReadStrategy::default(),
        }
    }

    /// Parse `flags` instead of `$MAKEFLAGS`.
    #[inline]
    pub fn makeflags<S: Into<OsString>>(&mut self, flags: S) -> &mut Self {
        self.makeflags = Some(flags.into());
        self
    }

    /// Use an inherited pipe. The descriptors are never closed by the client.
    #[inline]
    pub fn fds(&mut self, read: RawFd, write: RawFd) -> &mut Self {
        self.fds = Some((read, write));
        self
    }

    /// Open the pool's two ends from paths, such as another process's
    /// `/proc/<pid>/fd/N` entries. The client closes them when dropped.
    #[inline]
    pub fn named_pipes<P, Q>(&mut self, read_path: P, write_path: Q) -> &mut Self
    where
        P: Into<PathBuf>,
        Q: Into<PathBuf>,
    {
        self.named_pipes = Some((read_path.into(), write_path.into()));
        self
    }

    #[inline]
    pub fn max_jobs(&mut self, n: u32) -> &mut Self {
        self.max_jobs = Some(n);
        self
    }

    #[inline]
    pub fn max_load(&mut self, n: u32) -> &mut Self {
        self.max_load = Some(n);
        self
    }

    /// Set the longest a single [`JobClient::acquire`] waits for a token
    /// that was announced ready but taken by someone else.
    #[inline]
    pub fn read_timeout(&mut self, d: Duration) -> &mut Self {
        self.read_timeout = d;
        self
    }

    /// Set the pause between retries of an interrupted release.
    #[inline]
    pub fn retry_backoff(&mut self, d: Duration) -> &mut Self {
        self.retry_backoff = d;
        self
    }

    #[inline]
    pub fn strategy(&mut self, strategy: ReadStrategy) -> &mut Self {
        self.strategy = strategy;
        self
    }

    /// Find, validate, and self-test the pool.
    pub fn build(&self) -> Result<JobClient, JobClientError> {
        let flags = match &self.makeflags {
            Some(flags) => makeflags::parse_makeflags(flags),
            None => {
                let env = Env::inherit();
                if !env.makeflags().is_empty() {
                    log_debug!("init: MAKEFLAGS: {}", env.makeflags().to_string_lossy());
                }
                makeflags::parse_makeflags(env.makeflags())
            }
        };
        let limits = AdvisoryLimits {
            max_jobs: self.max_jobs.or(flags.max_jobs),
            max_load: self.max_load.or(flags.max_load),
        };

        let pool = if let Some((read_path, write_path)) = &self.named_pipes {
            log_debug!(
                "init: using named pipes: {}, {}",
                read_path.display(),
                write_path.display()
            );
            PoolHandle::open_named_pipes(read_path, write_path)?
        } else if let Some((read, write)) = self.fds {
            PoolHandle::inherited(read, write)
        } else {
            match flags.auth {
                Some(PoolAuth::Fds { read, write }) => PoolHandle::inherited(read, write),
                Some(PoolAuth::Fifo(path)) => PoolHandle::open_fifo(path)?,
                None => {
                    log_debug!("init failed: no jobserver in MAKEFLAGS");
                    return Err(JobClientError::no_job_server("no jobserver in MAKEFLAGS"));
                }
            }
        };
        log_debug!(
            "init: fdRead = {}, fdWrite = {}, maxJobs = {:?}, maxLoad = {:?}",
            pool.read_fd(),
            pool.write_fd(),
            limits.max_jobs,
            limits.max_load
        );

        pool::validate(&pool, &limits)?;

        let mut client = JobClient {
            pool,
            limits,
            acquirer: Acquirer::new(self.strategy, self.read_timeout),
            retry_backoff: self.retry_backoff,
        };
        client.self_test()?;
        log_debug!("init: test ok");
        Ok(client)
    }
}

impl Default for JobClientBuilder {
    #[inline]
    fn default() -> JobClientBuilder {
        JobClientBuilder::new()
    }
}
