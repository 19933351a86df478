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

//! Locating the token pool and deciding whether it is real.
//!
//! A build tool that runs us without a jobserver may still leave stale
//! descriptors behind under the numbers named in an inherited `MAKEFLAGS`:
//!
//! ```text
//! jobserver on:
//! lr-x------ 1 1000 100 64 Jun 27 14:29 3 -> pipe:[102600042]
//! l-wx------ 1 1000 100 64 Jun 27 14:29 4 -> pipe:[102600042]
//!
//! jobserver off:
//! lr-x------ 1 1000 100 64 Jun 27 14:29 3 -> /proc/2370722/fd
//! ```
//!
//! so every candidate is checked before use.

use libc::{gid_t, mode_t, uid_t};
use nix::errno::Errno;
use nix::fcntl::{self, OFlag};
use nix::sys::stat::{self, FileStat, Mode, SFlag};
use nix::unistd;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};

use super::error::JobClientError;
use super::helpers;

/// The resolved location of the pool.
#[derive(Debug)]
pub(crate) enum PoolHandle {
    /// Two ends of one pipe. Inherited descriptors are shared with the
    /// whole process tree and must never be closed by us; `owned` is set
    /// only when this process opened them itself.
    Pipe {
        read: RawFd,
        write: RawFd,
        owned: bool,
    },
    /// A single read-write descriptor opened from a named pipe.
    Fifo { fd: RawFd, path: PathBuf },
}

impl PoolHandle {
    /// Use an inherited descriptor pair.
    #[inline]
    pub(crate) fn inherited(read: RawFd, write: RawFd) -> PoolHandle {
        PoolHandle::Pipe {
            read,
            write,
            owned: false,
        }
    }

    /// Open a `--jobserver-auth=fifo:PATH` pool.
    pub(crate) fn open_fifo<P: AsRef<Path>>(path: P) -> Result<PoolHandle, JobClientError> {
        let path = path.as_ref();
        // Opening a FIFO read-write never waits for a peer.
        let fd = fcntl::open(path, OFlag::O_RDWR | OFlag::O_CLOEXEC, Mode::empty()).map_err(
            |e| JobClientError::no_job_server(format!("open {}: {}", path.display(), e)),
        )?;
        Ok(PoolHandle::Fifo {
            fd,
            path: path.to_path_buf(),
        })
    }

    /// Open separate read and write ends from two paths, e.g.
    /// `/proc/<pid>/fd/3` and `/proc/<pid>/fd/4` of another process.
    ///
    /// Both are opened non-blocking so that a pipe without a peer fails
    /// instead of hanging, then switched back to blocking mode.
    pub(crate) fn open_named_pipes<P, Q>(
        read_path: P,
        write_path: Q,
    ) -> Result<PoolHandle, JobClientError>
    where
        P: AsRef<Path>,
        Q: AsRef<Path>,
    {
        let read = open_blocking(read_path.as_ref(), OFlag::O_RDONLY)?;
        let write = match open_blocking(write_path.as_ref(), OFlag::O_WRONLY) {
            Ok(fd) => fd,
            Err(e) => {
                let _ = unistd::close(read);
                return Err(e);
            }
        };
        Ok(PoolHandle::Pipe {
            read,
            write,
            owned: true,
        })
    }

    #[inline]
    pub(crate) fn read_fd(&self) -> RawFd {
        match self {
            PoolHandle::Pipe { read, .. } => *read,
            PoolHandle::Fifo { fd, .. } => *fd,
        }
    }

    #[inline]
    pub(crate) fn write_fd(&self) -> RawFd {
        match self {
            PoolHandle::Pipe { write, .. } => *write,
            PoolHandle::Fifo { fd, .. } => *fd,
        }
    }

    /// The filesystem path the read side can be reopened from, if known.
    pub(crate) fn reopen_path(&self) -> Option<PathBuf> {
        match self {
            PoolHandle::Fifo { path, .. } => Some(path.clone()),
            PoolHandle::Pipe { read, .. } => proc_fd_path(*read),
        }
    }
}

impl Drop for PoolHandle {
    fn drop(&mut self) {
        match *self {
            PoolHandle::Pipe {
                read,
                write,
                owned: true,
            } => {
                let _ = unistd::close(read);
                let _ = unistd::close(write);
            }
            PoolHandle::Pipe { owned: false, .. } => {}
            PoolHandle::Fifo { fd, .. } => {
                let _ = unistd::close(fd);
            }
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn proc_fd_path(fd: RawFd) -> Option<PathBuf> {
    Some(PathBuf::from(format!("/proc/self/fd/{}", fd)))
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn proc_fd_path(_fd: RawFd) -> Option<PathBuf> {
    None
}

fn open_blocking(path: &Path, access: OFlag) -> Result<RawFd, JobClientError> {
    let fd = fcntl::open(
        path,
        access | OFlag::O_NONBLOCK | OFlag::O_CLOEXEC,
        Mode::empty(),
    )
    .map_err(|e| JobClientError::no_job_server(format!("open {}: {}", path.display(), e)))?;
    if let Err(e) = helpers::set_nonblocking(fd, false) {
        let _ = unistd::close(fd);
        return Err(JobClientError::io(
            format!("fcntl {}", path.display()),
            e,
        ));
    }
    Ok(fd)
}

/// Advisory limits announced by the pool owner. Not enforced here.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub(crate) struct AdvisoryLimits {
    pub(crate) max_jobs: Option<u32>,
    pub(crate) max_load: Option<u32>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Access {
    Read,
    Write,
}

/// Check that `pool` is a live, accessible pipe pair.
///
/// Every failure is reported as [`ErrorKind::NoJobServer`] except for
/// unexpected `fstat` errors.
///
/// [`ErrorKind::NoJobServer`]: super::error::ErrorKind::NoJobServer
pub(crate) fn validate(pool: &PoolHandle, limits: &AdvisoryLimits) -> Result<(), JobClientError> {
    if limits.max_jobs == Some(1) {
        log_debug!("init failed: maxJobs == 1");
        return Err(JobClientError::no_job_server("maxJobs == 1"));
    }
    check_fd(pool.read_fd(), Access::Read)?;
    check_fd(pool.write_fd(), Access::Write)?;
    Ok(())
}

fn check_fd(fd: RawFd, access: Access) -> Result<(), JobClientError> {
    if fd < 0 {
        return Err(JobClientError::no_job_server(format!(
            "invalid descriptor {}",
            fd
        )));
    }
    log_debug!("init: test fd {} stat", fd);
    let st = fstat(fd)?;

    log_debug!("init: test fd {} pipe", fd);
    if !is_fifo(&st) {
        log_debug!("init failed: fd {} is no pipe", fd);
        return Err(JobClientError::no_job_server(format!(
            "descriptor {} is not a pipe",
            fd
        )));
    }

    log_debug!("init: test fd {} {:?}", fd, access);
    let me = (unistd::geteuid().as_raw(), unistd::getegid().as_raw());
    if !mode_grants(st.st_mode, (st.st_uid, st.st_gid), me, access) {
        log_debug!("init failed: fd {} lacks {:?} access", fd, access);
        return Err(JobClientError::no_job_server(format!(
            "descriptor {} lacks {:?} access",
            fd, access
        )));
    }
    Ok(())
}

pub(crate) fn fstat(fd: RawFd) -> Result<FileStat, JobClientError> {
    stat::fstat(fd).map_err(|e| {
        if e == Errno::EBADF {
            log_debug!("init failed: fd {} stat failed: {}", fd, e);
        }
        JobClientError::from_pool_errno(format!("fstat {}", fd), e)
    })
}

#[inline]
fn is_fifo(st: &FileStat) -> bool {
    SFlag::from_bits_truncate(st.st_mode & SFlag::S_IFMT.bits()) == SFlag::S_IFIFO
}

/// Reports whether permission bits `mode` on an object owned by `owner`
/// allow `access` for the effective user and group in `me`. Any matching
/// class is enough.
fn mode_grants(mode: mode_t, owner: (uid_t, gid_t), me: (uid_t, gid_t), access: Access) -> bool {
    let mode = Mode::from_bits_truncate(mode);
    let (usr, grp, oth) = match access {
        Access::Read => (Mode::S_IRUSR, Mode::S_IRGRP, Mode::S_IROTH),
        Access::Write => (Mode::S_IWUSR, Mode::S_IWGRP, Mode::S_IWOTH),
    };
    (owner.0 == me.0 && mode.contains(usr))
        || (owner.1 == me.1 && mode.contains(grp))
        || mode.contains(oth)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    const NO_LIMITS: AdvisoryLimits = AdvisoryLimits {
        max_jobs: None,
        max_load: None,
    };

    #[test]
    fn accepts_pipe() {
        let (r, w) = unistd::pipe().unwrap();
        let pool = PoolHandle::inherited(r, w);
        validate(&pool, &NO_LIMITS).unwrap();
        drop(pool);
        // Inherited descriptors survive the handle.
        unistd::close(r).unwrap();
        unistd::close(w).unwrap();
    }

    #[test]
    fn rejects_max_jobs_one() {
        let (r, w) = unistd::pipe().unwrap();
        let pool = PoolHandle::inherited(r, w);
        let limits = AdvisoryLimits {
            max_jobs: Some(1),
            max_load: None,
        };
        assert!(validate(&pool, &limits).unwrap_err().is_no_job_server());
        unistd::close(r).unwrap();
        unistd::close(w).unwrap();
    }

    #[test]
    fn rejects_regular_file() {
        let file = tempfile::tempfile().unwrap();
        let fd = file.as_raw_fd();
        let pool = PoolHandle::inherited(fd, fd);
        assert!(validate(&pool, &NO_LIMITS).unwrap_err().is_no_job_server());
    }

    #[test]
    fn rejects_socket() {
        let (a, b) = UnixStream::pair().unwrap();
        let pool = PoolHandle::inherited(a.as_raw_fd(), b.as_raw_fd());
        assert!(validate(&pool, &NO_LIMITS).unwrap_err().is_no_job_server());
    }

    #[test]
    fn rejects_pipe_mixed_with_file() {
        let (r, w) = unistd::pipe().unwrap();
        let file = tempfile::tempfile().unwrap();
        let pool = PoolHandle::inherited(r, file.as_raw_fd());
        assert!(validate(&pool, &NO_LIMITS).unwrap_err().is_no_job_server());
        unistd::close(r).unwrap();
        unistd::close(w).unwrap();
    }

    #[test]
    fn rejects_unopened_descriptor() {
        // Far above any descriptor a test process will have open.
        let pool = PoolHandle::inherited(1 << 20, (1 << 20) + 1);
        assert!(validate(&pool, &NO_LIMITS).unwrap_err().is_no_job_server());
        let pool = PoolHandle::inherited(-1, -1);
        assert!(validate(&pool, &NO_LIMITS).unwrap_err().is_no_job_server());
    }

    #[test]
    fn permission_classes() {
        let me = (1000, 100);
        let bits = |m: Mode| m.bits() as mode_t;
        // Owner.
        assert!(mode_grants(bits(Mode::S_IRUSR), (1000, 5), me, Access::Read));
        assert!(!mode_grants(bits(Mode::S_IRUSR), (1000, 5), me, Access::Write));
        assert!(!mode_grants(bits(Mode::S_IRUSR), (0, 5), me, Access::Read));
        // Group.
        assert!(mode_grants(bits(Mode::S_IWGRP), (0, 100), me, Access::Write));
        assert!(!mode_grants(bits(Mode::S_IWGRP), (0, 5), me, Access::Write));
        // Other.
        assert!(mode_grants(bits(Mode::S_IROTH), (0, 0), me, Access::Read));
        assert!(mode_grants(bits(Mode::S_IWOTH), (0, 0), me, Access::Write));
        // Owner bits don't help a non-owner even when the group matches.
        assert!(!mode_grants(bits(Mode::S_IRWXU), (0, 100), me, Access::Read));
    }

    #[test]
    fn fifo_handle_closes_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fifo");
        unistd::mkfifo(&path, Mode::S_IRUSR | Mode::S_IWUSR).unwrap();
        let pool = PoolHandle::open_fifo(&path).unwrap();
        assert_eq!(pool.read_fd(), pool.write_fd());
        validate(&pool, &NO_LIMITS).unwrap();
        assert_eq!(pool.reopen_path(), Some(path));
    }

    #[test]
    fn open_fifo_missing_path() {
        let dir = tempfile::tempdir().unwrap();
        let err = PoolHandle::open_fifo(dir.path().join("nope")).unwrap_err();
        assert!(err.is_no_job_server());
    }

    #[test]
    fn named_pipes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fifo");
        unistd::mkfifo(&path, Mode::S_IRUSR | Mode::S_IWUSR).unwrap();
        let pool = PoolHandle::open_named_pipes(&path, &path).unwrap();
        assert_ne!(pool.read_fd(), pool.write_fd());
        validate(&pool, &NO_LIMITS).unwrap();
    }
}
