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

//! Taking one token out of the pool without ever blocking for long.
//!
//! The pool's read descriptor is shared with make and every sibling, so it
//! has to stay in blocking mode: GNU make can't cope with a non-blocking
//! jobserver pipe. A zero-timeout `poll` tells us whether a token *was*
//! there, but somebody else may read it before we do, and a plain `read`
//! would then block until the next release, possibly forever.
//!
//! So the actual read happens on a second descriptor, the race guard:
//!
//! - Preferably a private open file description of the same pipe (reopened
//!   through its path), which can be put into non-blocking mode without
//!   anybody else noticing. The read is then `poll` with a deadline
//!   followed by a non-blocking `read`.
//! - Otherwise a `dup` of the read end, read by a worker thread that is
//!   abandoned when the deadline passes. An abandoned worker that still
//!   manages to read a token puts it straight back into the pool.
//!
//! In both cases the shared descriptor is never closed or reconfigured.
//! See <http://make.mad-scientist.net/papers/jobserver-implementation/>.

use libc::{dev_t, ino_t};
use nix::errno::Errno;
use nix::fcntl::{self, OFlag};
use nix::sys::stat::{self, Mode};
use nix::unistd;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use super::error::JobClientError;
use super::helpers;
use super::pool::{self, PoolHandle};
use super::release;
use super::token::Token;

/// How the race guard descriptor is obtained.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReadStrategy {
    /// Reopen the pool non-blocking when possible, otherwise fall back to
    /// [`ReadStrategy::Worker`].
    Auto,
    /// Always read a `dup` of the pool on a disposable worker thread.
    Worker,
}

impl Default for ReadStrategy {
    #[inline]
    fn default() -> ReadStrategy {
        ReadStrategy::Auto
    }
}

/// The result of reading one byte with a deadline.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum ReadOutcome {
    Byte(u8),
    /// Nothing to read (`EAGAIN`): another process won the race.
    Empty,
    /// The deadline passed before a byte arrived.
    TimedOut,
    /// End of file or a descriptor that is no longer open.
    Closed,
    Fault(Errno),
}

/// The descriptor reserved for bounded reads.
#[derive(Debug)]
pub(crate) enum RaceGuard {
    /// A private, non-blocking description of the pool's pipe.
    NonBlocking(RawFd),
    /// A `dup` of the pool's read end, read on a worker thread.
    Dup(RawFd),
}

impl RaceGuard {
    pub(crate) fn open(
        pool: &PoolHandle,
        strategy: ReadStrategy,
    ) -> Result<RaceGuard, JobClientError> {
        if strategy == ReadStrategy::Auto {
            if let Some(path) = pool.reopen_path() {
                match reopen_nonblocking(pool.read_fd(), &path) {
                    Ok(fd) => return Ok(RaceGuard::NonBlocking(fd)),
                    Err(e) => log_debug!(
                        "acquire: cannot reopen {} non-blocking: {}",
                        path.display(),
                        e
                    ),
                }
            }
        }
        let fd = unistd::dup(pool.read_fd())
            .map_err(|e| JobClientError::from_pool_errno("dup", e))?;
        if let Err(e) = helpers::close_on_exec(fd, true) {
            let _ = unistd::close(fd);
            return Err(JobClientError::io("fcntl", e));
        }
        Ok(RaceGuard::Dup(fd))
    }
}

impl Drop for RaceGuard {
    fn drop(&mut self) {
        let fd = match *self {
            RaceGuard::NonBlocking(fd) => fd,
            RaceGuard::Dup(fd) => fd,
        };
        let _ = unistd::close(fd);
    }
}

/// Open `path` as a new non-blocking read description and make sure it is
/// the same pipe as `fd`.
fn reopen_nonblocking(fd: RawFd, path: &Path) -> Result<RawFd, JobClientError> {
    let guard = fcntl::open(
        path,
        OFlag::O_RDONLY | OFlag::O_NONBLOCK | OFlag::O_CLOEXEC,
        Mode::empty(),
    )
    .map_err(|e| JobClientError::io(format!("open {}", path.display()), e))?;
    let same = match (pool::fstat(fd), pool::fstat(guard)) {
        (Ok(a), Ok(b)) => a.st_dev == b.st_dev && a.st_ino == b.st_ino,
        _ => false,
    };
    if !same {
        let _ = unistd::close(guard);
        return Err(JobClientError::new(format!(
            "{} is not the pool's pipe",
            path.display()
        )));
    }
    Ok(guard)
}

/// Takes tokens from one pool. Holds the race guard between attempts.
///
/// Dropping the acquirer tells abandoned workers to give up.
#[derive(Debug)]
pub(crate) struct Acquirer {
    guard: Option<RaceGuard>,
    strategy: ReadStrategy,
    timeout: Duration,
    stop: Arc<AtomicBool>,
}

impl Acquirer {
    pub(crate) fn new(strategy: ReadStrategy, timeout: Duration) -> Acquirer {
        Acquirer {
            guard: None,
            strategy,
            timeout,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Try to take one token from `pool`.
    ///
    /// `Ok(None)` means no token is available right now, either because the
    /// pool is empty or because the deadline passed.
    pub(crate) fn acquire(&mut self, pool: &PoolHandle) -> Result<Option<Token>, JobClientError> {
        let fd = pool.read_fd();
        match helpers::wait_readable(fd, Duration::ZERO) {
            Ok(true) => {}
            Ok(false) => {
                log_debug2!("acquire failed: fd is empty");
                return Ok(None);
            }
            Err(e) => return Err(JobClientError::from_pool_errno(format!("poll {}", fd), e)),
        }

        if self.guard.is_none() {
            self.guard = Some(RaceGuard::open(pool, self.strategy)?);
        }
        log_debug!("acquire: read with timeout {:?} ...", self.timeout);
        let outcome = match self.guard {
            Some(RaceGuard::NonBlocking(guard)) => read_nonblocking(guard, self.timeout),
            Some(RaceGuard::Dup(guard)) => {
                let (outcome, consumed) =
                    read_on_worker(guard, pool.write_fd(), self.timeout, &self.stop);
                if consumed {
                    // The abandoned worker owns the descriptor now. A fresh
                    // one is made on the next attempt.
                    if let Some(guard) = self.guard.take() {
                        std::mem::forget(guard);
                    }
                }
                outcome
            }
            None => unreachable!("race guard opened above"),
        };

        match outcome {
            ReadOutcome::Byte(b) => {
                log_debug!("acquire: read ok. token = {}", b);
                Ok(Some(Token::new(b)))
            }
            ReadOutcome::Empty => {
                log_debug2!("acquire failed: fd is empty 2");
                Ok(None)
            }
            ReadOutcome::TimedOut => {
                log_debug!("acquire: read timeout");
                Ok(None)
            }
            ReadOutcome::Closed => {
                self.guard = None;
                Err(JobClientError::no_job_server(format!(
                    "read {}: pool closed",
                    fd
                )))
            }
            ReadOutcome::Fault(e) => Err(JobClientError::io(format!("read {}", fd), e)),
        }
    }
}

impl Drop for Acquirer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

/// Wait up to `timeout` for `fd` to be readable, then read one byte without
/// blocking. `fd` must be in non-blocking mode.
pub(crate) fn read_nonblocking(fd: RawFd, timeout: Duration) -> ReadOutcome {
    match helpers::wait_readable(fd, timeout) {
        Ok(true) => {}
        Ok(false) => return ReadOutcome::TimedOut,
        Err(Errno::EBADF) => return ReadOutcome::Closed,
        Err(e) => return ReadOutcome::Fault(e),
    }
    read_byte(fd)
}

/// Read one byte from `fd` and classify the result.
pub(crate) fn read_byte(fd: RawFd) -> ReadOutcome {
    let mut buf = [0u8; 1];
    match unistd::read(fd, &mut buf) {
        Ok(1) => ReadOutcome::Byte(buf[0]),
        Ok(_) => ReadOutcome::Closed,
        // Interrupted is as good as empty: try again later.
        Err(Errno::EAGAIN) | Err(Errno::EINTR) => ReadOutcome::Empty,
        Err(Errno::EBADF) => ReadOutcome::Closed,
        Err(e) => ReadOutcome::Fault(e),
    }
}

#[derive(Debug, Default)]
struct WorkerSlot {
    outcome: Option<ReadOutcome>,
    abandoned: bool,
}

/// How long a worker waits in `poll` before checking whether it should stop.
const WORKER_POLL_SLICE: Duration = Duration::from_millis(50);

/// Read one byte of `fd` on a worker thread, waiting at most `timeout` for it.
///
/// Returns the outcome and whether the worker was abandoned. An abandoned
/// worker takes ownership of `fd` and closes it once its read returns, the
/// pool hits end of file, or `stop` is set. A token it reads late goes back
/// to the pool through a short-lived `dup` of `write_fd`, provided that
/// descriptor still names the same pipe.
pub(crate) fn read_on_worker(
    fd: RawFd,
    write_fd: RawFd,
    timeout: Duration,
    stop: &Arc<AtomicBool>,
) -> (ReadOutcome, bool) {
    let write_id = match stat::fstat(write_fd) {
        Ok(st) => (st.st_dev, st.st_ino),
        Err(Errno::EBADF) => return (ReadOutcome::Closed, false),
        Err(e) => return (ReadOutcome::Fault(e), false),
    };
    let slot = Arc::new((Mutex::new(WorkerSlot::default()), Condvar::new()));
    let worker_slot = Arc::clone(&slot);
    let stop = Arc::clone(stop);
    let spawned = thread::Builder::new()
        .name("jobclient-read".into())
        .spawn(move || {
            // A read that loses a race after poll still blocks until the
            // next token or end of file.
            let outcome = loop {
                if stop.load(Ordering::SeqCst) {
                    break None;
                }
                match helpers::wait_readable(fd, WORKER_POLL_SLICE) {
                    Ok(false) => {}
                    Ok(true) => break Some(read_byte(fd)),
                    Err(Errno::EBADF) => break Some(ReadOutcome::Closed),
                    Err(e) => break Some(ReadOutcome::Fault(e)),
                }
            };
            let (lock, cvar) = &*worker_slot;
            let mut state = lock
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if !state.abandoned {
                state.outcome = Some(outcome.unwrap_or(ReadOutcome::TimedOut));
                cvar.notify_one();
                return;
            }
            drop(state);
            if let Some(ReadOutcome::Byte(b)) = outcome {
                return_late_token(write_fd, write_id, Token::new(b));
            }
            let _ = unistd::close(fd);
        });
    if let Err(e) = spawned {
        log_err!("acquire: cannot start read worker: {}", e);
        return (
            ReadOutcome::Fault(Errno::from_i32(e.raw_os_error().unwrap_or(libc::EAGAIN))),
            false,
        );
    }

    let (lock, cvar) = &*slot;
    let deadline = Instant::now() + timeout;
    let mut state = lock
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    loop {
        if let Some(outcome) = state.outcome.take() {
            return (outcome, false);
        }
        let now = Instant::now();
        if now >= deadline {
            state.abandoned = true;
            return (ReadOutcome::TimedOut, true);
        }
        state = match cvar.wait_timeout(state, deadline - now) {
            Ok((state, _)) => state,
            Err(poisoned) => poisoned.into_inner().0,
        };
    }
}

/// Write a token that an abandoned worker read back into the pool.
///
/// `write_fd` may have been closed and its number reused since the worker
/// started, so it is only written to while it still matches `write_id`.
fn return_late_token(write_fd: RawFd, write_id: (dev_t, ino_t), token: Token) {
    let w = match unistd::dup(write_fd) {
        Ok(w) => w,
        Err(e) => {
            log_err!("acquire: late token {} lost: {}", token, e);
            return;
        }
    };
    match stat::fstat(w) {
        Ok(st) if (st.st_dev, st.st_ino) == write_id => {
            let write = |buf: &[u8]| unistd::write(w, buf);
            if let Err(e) = release::write_token(write, token, Duration::from_millis(10)) {
                log_err!("acquire: failed to return late token {}: {}", token, e);
            }
        }
        _ => log_err!("acquire: late token {} lost: pool is gone", token),
    }
    let _ = unistd::close(w);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe() -> (RawFd, RawFd) {
        unistd::pipe().unwrap()
    }

    fn close(fds: (RawFd, RawFd)) {
        unistd::close(fds.0).unwrap();
        unistd::close(fds.1).unwrap();
    }

    fn no_stop() -> Arc<AtomicBool> {
        Arc::new(AtomicBool::new(false))
    }

    /// Count this process's descriptors that refer to pipe `ino`.
    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn pipe_links(ino: ino_t) -> usize {
        let target = format!("pipe:[{}]", ino);
        std::fs::read_dir("/proc/self/fd")
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| std::fs::read_link(entry.path()).ok())
            .filter(|link| link.as_os_str() == target.as_str())
            .count()
    }

    /// Wait for the number of descriptors on pipe `ino` to drop to `want`.
    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn wait_for_pipe_links(ino: ino_t, want: usize) -> usize {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let n = pipe_links(ino);
            if n == want || Instant::now() >= deadline {
                return n;
            }
            thread::sleep(Duration::from_millis(20));
        }
    }

    #[test]
    fn read_byte_classifies() {
        let (r, w) = pipe();
        helpers::set_nonblocking(r, true).unwrap();
        assert_eq!(read_byte(r), ReadOutcome::Empty);
        unistd::write(w, &[200]).unwrap();
        assert_eq!(read_byte(r), ReadOutcome::Byte(200));
        unistd::close(w).unwrap();
        assert_eq!(read_byte(r), ReadOutcome::Closed);
        unistd::close(r).unwrap();
    }

    #[test]
    fn read_nonblocking_times_out() {
        let (r, w) = pipe();
        helpers::set_nonblocking(r, true).unwrap();
        let start = Instant::now();
        assert_eq!(
            read_nonblocking(r, Duration::from_millis(50)),
            ReadOutcome::TimedOut
        );
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(50), "elapsed = {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(2), "elapsed = {:?}", elapsed);
        close((r, w));
    }

    #[test]
    fn worker_reads_byte() {
        let (r, w) = pipe();
        let guard = unistd::dup(r).unwrap();
        unistd::write(w, b"x").unwrap();
        assert_eq!(
            read_on_worker(guard, w, Duration::from_secs(5), &no_stop()),
            (ReadOutcome::Byte(b'x'), false)
        );
        // Not abandoned: the guard is still ours.
        unistd::close(guard).unwrap();
        close((r, w));
    }

    #[test]
    fn abandoned_worker_returns_late_token() {
        let (r, w) = pipe();
        let guard = unistd::dup(r).unwrap();
        let start = Instant::now();
        assert_eq!(
            read_on_worker(guard, w, Duration::from_millis(50), &no_stop()),
            (ReadOutcome::TimedOut, true)
        );
        assert!(start.elapsed() < Duration::from_secs(2));

        // The worker is still blocked in read. Feed it a token and expect it
        // to come back around.
        unistd::write(w, b"y").unwrap();
        thread::sleep(Duration::from_millis(100));
        assert!(helpers::wait_readable(r, Duration::from_secs(5)).unwrap());
        let mut buf = [0u8; 1];
        assert_eq!(unistd::read(r, &mut buf).unwrap(), 1);
        assert_eq!(buf[0], b'y');
        close((r, w));
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[test]
    fn abandoned_worker_lets_go_of_closed_pool() {
        let (r, w) = pipe();
        let ino = stat::fstat(r).unwrap().st_ino;
        let guard = unistd::dup(r).unwrap();
        assert_eq!(
            read_on_worker(guard, w, Duration::from_millis(50), &no_stop()),
            (ReadOutcome::TimedOut, true)
        );
        assert_eq!(pipe_links(ino), 3);

        // The producer goes away. The worker sees end of file and closes its
        // descriptor instead of keeping the pipe alive.
        close((r, w));
        assert_eq!(wait_for_pipe_links(ino, 0), 0);
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[test]
    fn dropping_acquirer_stops_abandoned_worker() {
        let (r, w) = pipe();
        let ino = stat::fstat(r).unwrap().st_ino;
        let acquirer = Acquirer::new(ReadStrategy::Worker, Duration::from_millis(50));
        let guard = unistd::dup(r).unwrap();
        assert_eq!(
            read_on_worker(guard, w, Duration::from_millis(50), &acquirer.stop),
            (ReadOutcome::TimedOut, true)
        );
        assert_eq!(pipe_links(ino), 3);

        // The pool is still open, so only the stop signal can end the worker.
        drop(acquirer);
        assert_eq!(wait_for_pipe_links(ino, 2), 2);
        close((r, w));
    }

    #[test]
    fn late_token_not_written_to_reused_descriptor() {
        let (r, w) = pipe();
        let (other_r, other_w) = pipe();
        let write_id = {
            let st = stat::fstat(other_w).unwrap();
            (st.st_dev, st.st_ino)
        };
        // `w` is not the pipe the token came from.
        return_late_token(w, write_id, Token::default());
        helpers::set_nonblocking(r, true).unwrap();
        assert_eq!(read_byte(r), ReadOutcome::Empty);

        return_late_token(other_w, write_id, Token::default());
        assert_eq!(read_byte(other_r), ReadOutcome::Byte(b'+'));
        close((r, w));
        close((other_r, other_w));
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[test]
    fn auto_reopens_pipe_non_blocking() {
        let (r, w) = pipe();
        let pool = PoolHandle::inherited(r, w);
        let guard = RaceGuard::open(&pool, ReadStrategy::Auto).unwrap();
        let fd = match guard {
            RaceGuard::NonBlocking(fd) => fd,
            RaceGuard::Dup(_) => panic!("expected a non-blocking guard"),
        };
        // The shared description stays blocking.
        let shared =
            OFlag::from_bits_truncate(fcntl::fcntl(r, fcntl::FcntlArg::F_GETFL).unwrap());
        assert!(!shared.contains(OFlag::O_NONBLOCK));
        let private =
            OFlag::from_bits_truncate(fcntl::fcntl(fd, fcntl::FcntlArg::F_GETFL).unwrap());
        assert!(private.contains(OFlag::O_NONBLOCK));
        drop(guard);
        drop(pool);
        close((r, w));
    }

    #[test]
    fn worker_strategy_uses_dup() {
        let (r, w) = pipe();
        let pool = PoolHandle::inherited(r, w);
        let guard = RaceGuard::open(&pool, ReadStrategy::Worker).unwrap();
        assert!(matches!(guard, RaceGuard::Dup(_)));
        drop(guard);
        drop(pool);
        close((r, w));
    }

    #[test]
    fn acquirer_empty_and_obtained() {
        for &strategy in &[ReadStrategy::Auto, ReadStrategy::Worker] {
            let (r, w) = pipe();
            let pool = PoolHandle::inherited(r, w);
            let mut acquirer = Acquirer::new(strategy, Duration::from_millis(100));
            assert_eq!(acquirer.acquire(&pool).unwrap(), None);
            unistd::write(w, b"+").unwrap();
            assert_eq!(acquirer.acquire(&pool).unwrap(), Some(Token::default()));
            assert_eq!(acquirer.acquire(&pool).unwrap(), None);
            drop(acquirer);
            drop(pool);
            close((r, w));
        }
    }
}
