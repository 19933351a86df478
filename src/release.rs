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
use std::thread;
use std::time::Duration;

use super::error::JobClientError;
use super::token::Token;

/// Write `token` with `write`, retrying after `backoff` for as long as the
/// write is interrupted.
///
/// A token that never makes it back shrinks the pool for every process in
/// the tree until the build ends, so there is no retry limit. Any failure
/// other than `EINTR` is returned.
pub(crate) fn write_token<F>(
    mut write: F,
    token: Token,
    backoff: Duration,
) -> Result<(), JobClientError>
where
    F: FnMut(&[u8]) -> nix::Result<usize>,
{
    let buf = [token.value()];
    loop {
        log_debug!("release: write token {} ...", token);
        match write(&buf) {
            Ok(1) => {
                log_debug!("release: write ok");
                return Ok(());
            }
            Ok(n) => {
                debug_assert_eq!(n, 0, "wrote more than one byte");
                log_debug!("release: short write -> retry after {:?}", backoff);
            }
            Err(Errno::EINTR) => {
                log_debug!("release: write interrupted -> retry after {:?}", backoff);
            }
            Err(e) => return Err(JobClientError::from_pool_errno("write token", e)),
        }
        thread::sleep(backoff);
    }
}
