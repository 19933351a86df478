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

//! A client for the GNU make jobserver.
//!
//! A jobserver is a pipe holding one byte ("token") per job slot of a
//! build. Before starting an additional unit of parallel work, a process
//! reads a token out of the pipe; when the work is done, it writes the
//! token back. Every process in the build tree shares the same pipe, so
//! the number of tokens bounds the parallelism of the whole build.
//!
//! ```no_run
//! use jobclient::JobClient;
//!
//! # fn main() -> Result<(), jobclient::JobClientError> {
//! let mut client = match JobClient::from_env() {
//!     Ok(client) => client,
//!     Err(e) if e.is_no_job_server() => return Ok(()), // run serially
//!     Err(e) => return Err(e),
//! };
//! if let Some(token) = client.acquire()? {
//!     // ... run one more job ...
//!     client.release(token)?;
//! }
//! # Ok(())
//! # }
//! ```

/// Log an error.
///
/// # Example
///
/// ```no_run
/// # use jobclient::log_err;
/// # fn main() {
/// log_err!("{} has failed", "everything");
/// # }
/// ```
#[macro_export]
macro_rules! log_err {
    ($($arg:tt)*) => {{
        let s = format!($($arg)*);
        $crate::logs::meta("error", s.trim_end());
    }}
}

/// Log a warning.
///
/// # Example
///
/// ```no_run
/// # use jobclient::log_warn;
/// # fn main() {
/// log_warn!("{} has failed", "something non-critical");
/// # }
/// ```
#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {{
        let s = format!($($arg)*);
        $crate::logs::meta("warning", s.trim_end());
    }}
}

/// Log a debug message.
///
/// # Example
///
/// ```no_run
/// # use jobclient::log_debug;
/// # fn main() {
/// log_debug!("some details");
/// # }
/// ```
#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {{
        if $crate::logs::debug_level() >= 1 {
            let s = format!($($arg)*);
            $crate::logs::meta("debug", s.trim_end());
        }
    }}
}

/// Log a verbose debug message.
///
/// # Example
///
/// ```no_run
/// # use jobclient::log_debug2;
/// # fn main() {
/// log_debug2!("some verbose details");
/// # }
/// ```
#[macro_export]
macro_rules! log_debug2 {
    ($($arg:tt)*) => {{
        if $crate::logs::debug_level() >= 2 {
            let s = format!($($arg)*);
            $crate::logs::meta("debug", s.trim_end());
        }
    }}
}

mod acquire;
mod env;
mod error;
mod exits;
mod helpers;
mod jobclient;
pub mod logs;
pub mod makeflags;
mod pool;
mod release;
mod token;

pub use acquire::ReadStrategy;
pub use env::Env;
pub use error::{ErrorKind, JobClientError};
pub use exits::*;
pub use jobclient::{JobClient, JobClientBuilder, DEFAULT_READ_TIMEOUT, DEFAULT_RETRY_BACKOFF};
pub use makeflags::{parse_makeflags, PoolAuth, PoolFlags};
pub use token::Token;
