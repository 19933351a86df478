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

use nix::errno::Errno;
use std::error::Error;
use std::fmt::{self, Display, Formatter};

/// The error type for the `jobclient` crate.
#[derive(Debug)]
pub struct JobClientError {
    pub(crate) kind: ErrorKind,
    pub(crate) msg: String,
}

impl JobClientError {
    /// Returns a generic error with the given message.
    #[inline]
    pub fn new(msg: String) -> JobClientError {
        JobClientError {
            kind: ErrorKind::default(),
            msg,
        }
    }

    /// Returns an error reporting that no usable jobserver is present.
    #[inline]
    pub(crate) fn no_job_server<S: Into<String>>(reason: S) -> JobClientError {
        JobClientError {
            kind: ErrorKind::NoJobServer,
            msg: format!("no jobserver: {}", reason.into()),
        }
    }

    /// Returns an error for an unexpected system call failure.
    #[inline]
    pub(crate) fn io<S: Display>(context: S, errno: Errno) -> JobClientError {
        JobClientError {
            kind: ErrorKind::Io(errno),
            msg: format!("{}: {}", context, errno),
        }
    }

    /// Classify a failed system call on a pool descriptor: a descriptor that
    /// no longer refers to anything means the pool is gone.
    pub(crate) fn from_pool_errno<S: Display>(context: S, errno: Errno) -> JobClientError {
        match errno {
            Errno::EBADF => {
                JobClientError::no_job_server(format!("{}: descriptor closed", context))
            }
            e => JobClientError::io(context, e),
        }
    }

    #[inline]
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// Reports whether the caller should simply run without the pool.
    #[inline]
    pub fn is_no_job_server(&self) -> bool {
        self.kind == ErrorKind::NoJobServer
    }
}

impl Display for JobClientError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        Display::fmt(&self.msg, f)
    }
}

impl Error for JobClientError {}

impl From<ErrorKind> for JobClientError {
    fn from(kind: ErrorKind) -> JobClientError {
        JobClientError {
            msg: format!("{}", kind),
            kind,
        }
    }
}

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
#[non_exhaustive]
pub enum ErrorKind {
    Generic,
    /// The pool is absent, closed, or not a usable pipe.
    NoJobServer,
    /// A token value outside of `0..=255`.
    InvalidToken,
    /// An unexpected failure from the operating system.
    Io(Errno),
}

impl ErrorKind {
    /// Find the kind of the first `JobClientError` in an error chain.
    pub fn of(e: &anyhow::Error) -> ErrorKind {
        e.chain()
            .find_map(|e| e.downcast_ref::<JobClientError>())
            .map(|e| e.kind)
            .unwrap_or_default()
    }
}

impl Default for ErrorKind {
    #[inline]
    fn default() -> ErrorKind {
        ErrorKind::Generic
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            ErrorKind::Generic => f.write_str("error"),
            ErrorKind::NoJobServer => f.write_str("no jobserver"),
            ErrorKind::InvalidToken => f.write_str("invalid token"),
            ErrorKind::Io(e) => write!(f, "{}", e),
        }
    }
}
