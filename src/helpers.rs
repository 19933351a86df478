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

use libc::c_int;
use nix::errno::Errno;
use nix::fcntl::{self, FcntlArg, FdFlag, OFlag};
use nix::poll::{self, PollFd, PollFlags};
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

pub(crate) fn close_on_exec(fd: RawFd, yes: bool) -> nix::Result<()> {
    let result = fcntl::fcntl(fd, FcntlArg::F_GETFD)?;
    let mut fl = FdFlag::from_bits_truncate(result);
    fl.set(FdFlag::FD_CLOEXEC, yes);
    fcntl::fcntl(fd, FcntlArg::F_SETFD(fl))?;
    Ok(())
}

/// Set or clear `O_NONBLOCK` on the open file description behind `fd`.
///
/// This is visible to every descriptor sharing the description, so only
/// call it on descriptions this process opened itself.
pub(crate) fn set_nonblocking(fd: RawFd, yes: bool) -> nix::Result<()> {
    let result = fcntl::fcntl(fd, FcntlArg::F_GETFL)?;
    let mut fl = OFlag::from_bits_truncate(result);
    fl.set(OFlag::O_NONBLOCK, yes);
    fcntl::fcntl(fd, FcntlArg::F_SETFL(fl))?;
    Ok(())
}

/// Convert a duration to a `poll` timeout, rounding up to whole milliseconds
/// so that a short non-zero wait never turns into a busy poll.
pub(crate) fn poll_timeout_from_duration(d: Duration) -> c_int {
    let mut ms = d.as_millis();
    if Duration::from_millis(ms as u64) < d {
        ms += 1;
    }
    if ms > c_int::MAX as u128 {
        c_int::MAX
    } else {
        ms as c_int
    }
}

/// Wait up to `timeout` for `fd` to become readable.
///
/// Returns `Ok(false)` if the timeout elapsed first. Hang-ups and errors
/// count as readable so that the following `read` reports them. A
/// descriptor that is not open yields `EBADF`. Signal interruptions resume
/// the wait with the remaining time.
pub(crate) fn wait_readable(fd: RawFd, timeout: Duration) -> nix::Result<bool> {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
        match poll::poll(&mut fds, poll_timeout_from_duration(remaining)) {
            Ok(0) => return Ok(false),
            Ok(_) => {
                let revents = fds[0].revents().unwrap_or_else(PollFlags::empty);
                if revents.contains(PollFlags::POLLNVAL) {
                    return Err(Errno::EBADF);
                }
                return Ok(revents.intersects(
                    PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR,
                ));
            }
            Err(Errno::EINTR) => {
                if remaining.is_zero() {
                    return Ok(false);
                }
            }
            Err(e) => return Err(e),
        }
    }
}
