//! Pipe-backed token pool implementing the make jobserver protocol.
//!
//! Tokens are single bytes sitting in a pipe. `acquire` reads one byte and
//! `release` writes one back, so the number of available tokens is a property
//! of the pipe buffer rather than of any in-process counter. The kernel hands
//! each byte to exactly one reader, which is what lets unrelated processes
//! holding the same pipe share one pool without further coordination.
//!
//! ## Safety contracts
//!
//! - Inherited descriptors are duplicated on construction. The pool owns only
//!   its duplicates and never closes the numbers it was given.
//! - `configure_command` clears close-on-exec in the forked child only, via a
//!   `pre_exec` hook that calls nothing but `fcntl`.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::num::NonZeroUsize;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::unistd::{dup, pipe};

use crate::auth::{JobserverAuth, MAKEFLAGS_VARS};
use crate::config::ImplicitSlot;
use crate::error::{PoolError, Result};
use crate::pool::{PoolKind, TokenPool};

/// Byte written for each token. GNU make uses `+`; any byte read is accepted.
pub const TOKEN: u8 = b'+';

#[derive(Debug, Clone, PartialEq, Eq)]
enum Origin {
    Standalone { capacity: usize },
    Inherited,
    Fifo(PathBuf),
}

/// A jobserver token pool over a pipe or named FIFO.
#[derive(Debug)]
pub struct PipeTokenPool {
    read: File,
    write: File,
    origin: Origin,
}

impl PipeTokenPool {
    /// Create a private pool for `parallel_level` jobs.
    ///
    /// The pipe is close-on-exec; use [`TokenPool::configure_command`] to hand
    /// it to a child. With [`ImplicitSlot::Included`] and a level of 1 the pipe
    /// starts empty and only the creator's implicit slot can run work.
    pub fn standalone(parallel_level: NonZeroUsize, implicit: ImplicitSlot) -> Result<Self> {
        let (read, write) = pipe().map_err(|e| PoolError::Create(e.into()))?;
        set_cloexec(read.as_raw_fd(), true).map_err(PoolError::Create)?;
        set_cloexec(write.as_raw_fd(), true).map_err(PoolError::Create)?;

        let tokens = implicit.seed_tokens(parallel_level);
        let pool = Self {
            read: File::from(read),
            write: File::from(write),
            origin: Origin::Standalone { capacity: tokens },
        };

        if tokens > 0 {
            // Nobody reads yet, so a seed larger than the pipe buffer must fail
            // instead of blocking forever.
            let fd = pool.write.as_raw_fd();
            set_nonblocking(fd, true).map_err(PoolError::Create)?;
            (&pool.write)
                .write_all(&vec![TOKEN; tokens])
                .map_err(PoolError::Create)?;
            set_nonblocking(fd, false).map_err(PoolError::Create)?;
        }

        tracing::debug!(
            read_fd = pool.read.as_raw_fd(),
            write_fd = pool.write.as_raw_fd(),
            tokens,
            ?implicit,
            "Created standalone jobserver"
        );
        Ok(pool)
    }

    /// Join a jobserver whose pipe descriptors were inherited.
    ///
    /// No tokens are written: capacity was set by whoever created the pipe.
    ///
    /// # Safety
    ///
    /// `read` and `write` must be the two ends of a jobserver pipe that stay
    /// open for the duration of this call and are not owned by anything else
    /// in this process that may close them concurrently.
    pub unsafe fn from_inherited_fds(read: RawFd, write: RawFd) -> Result<Self> {
        // Safety: forwarded from the caller.
        let (read_dup, write_dup) = unsafe { (dup_inherited(read)?, dup_inherited(write)?) };

        tracing::debug!(
            inherited_read_fd = read,
            inherited_write_fd = write,
            read_fd = read_dup.as_raw_fd(),
            write_fd = write_dup.as_raw_fd(),
            "Joined inherited jobserver"
        );

        Ok(Self {
            read: File::from(read_dup),
            write: File::from(write_dup),
            origin: Origin::Inherited,
        })
    }

    /// Join a jobserver published as a named FIFO (`fifo:PATH`).
    pub fn from_fifo(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let fifo_err = |source| PoolError::Fifo {
            path: path.to_path_buf(),
            source,
        };

        let read = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(fifo_err)?;
        let write = read.try_clone().map_err(fifo_err)?;

        tracing::debug!(path = %path.display(), "Joined jobserver fifo");

        Ok(Self {
            read,
            write,
            origin: Origin::Fifo(path.to_path_buf()),
        })
    }

    /// Tokens seeded at creation; `None` when the pool was joined.
    pub fn capacity(&self) -> Option<usize> {
        match self.origin {
            Origin::Standalone { capacity } => Some(capacity),
            Origin::Inherited | Origin::Fifo(_) => None,
        }
    }

    /// What a child needs to join this pool.
    pub fn auth(&self) -> JobserverAuth {
        match &self.origin {
            Origin::Fifo(path) => JobserverAuth::Fifo(path.clone()),
            Origin::Standalone { .. } | Origin::Inherited => JobserverAuth::Pipe {
                read: self.read.as_raw_fd(),
                write: self.write.as_raw_fd(),
            },
        }
    }

    /// Wait until the read end has data. Only reached for non-blocking
    /// descriptors handed down by a parent.
    fn wait_readable(&self) -> io::Result<()> {
        let mut fds = [PollFd::new(self.read.as_fd(), PollFlags::POLLIN)];
        loop {
            match poll(&mut fds, PollTimeout::NONE) {
                Ok(_) => return Ok(()),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl TokenPool for PipeTokenPool {
    fn acquire(&self) -> Result<()> {
        let mut buf = [0u8; 1];
        loop {
            match (&self.read).read(&mut buf) {
                Ok(0) => return Err(PoolError::Closed),
                Ok(_) => {
                    tracing::trace!(fd = self.read.as_raw_fd(), "Acquired jobserver token");
                    return Ok(());
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.wait_readable().map_err(PoolError::Acquire)?;
                }
                Err(e) => return Err(PoolError::Acquire(e)),
            }
        }
    }

    fn release(&self) -> Result<()> {
        (&self.write)
            .write_all(&[TOKEN])
            .map_err(PoolError::Release)?;
        tracing::trace!(fd = self.write.as_raw_fd(), "Released jobserver token");
        Ok(())
    }

    fn kind(&self) -> PoolKind {
        match self.origin {
            Origin::Standalone { .. } => PoolKind::Private,
            Origin::Inherited | Origin::Fifo(_) => PoolKind::Shared,
        }
    }

    fn configure_command(&self, cmd: &mut Command) {
        let auth = self.auth();
        for var in MAKEFLAGS_VARS {
            cmd.env_remove(var);
        }
        cmd.env("MAKEFLAGS", auth.to_makeflags());

        if let JobserverAuth::Pipe { read, write } = auth {
            // Safety: the hook runs between fork and exec and only calls fcntl,
            // which is async-signal-safe. It changes the child's descriptor
            // table, never ours.
            unsafe {
                cmd.pre_exec(move || {
                    set_cloexec(read, false)?;
                    set_cloexec(write, false)
                });
            }
        }
    }
}

/// Whether `fd` names an open descriptor in this process.
pub fn fd_is_open(fd: RawFd) -> bool {
    // Safety: F_GETFD only inspects the descriptor table.
    fd >= 0 && unsafe { libc::fcntl(fd, libc::F_GETFD) } != -1
}

/// # Safety
///
/// `fd` must stay open for the duration of the call.
unsafe fn dup_inherited(fd: RawFd) -> Result<OwnedFd> {
    if !fd_is_open(fd) {
        return Err(PoolError::InvalidDescriptor {
            fd,
            source: io::Error::from_raw_os_error(libc::EBADF),
        });
    }

    // Safety: checked open above; the caller keeps it open while we dup.
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    let owned = dup(borrowed).map_err(|e| PoolError::InvalidDescriptor {
        fd,
        source: e.into(),
    })?;
    set_cloexec(owned.as_raw_fd(), true)
        .map_err(|source| PoolError::InvalidDescriptor { fd, source })?;
    Ok(owned)
}

fn set_nonblocking(fd: RawFd, nonblocking: bool) -> io::Result<()> {
    // Safety: F_GETFL/F_SETFL only touch the status flags of `fd`.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags == -1 {
        return Err(io::Error::last_os_error());
    }

    let flags = if nonblocking {
        flags | libc::O_NONBLOCK
    } else {
        flags & !libc::O_NONBLOCK
    };
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn set_cloexec(fd: RawFd, cloexec: bool) -> io::Result<()> {
    // Safety: F_GETFD/F_SETFD only touch the flags of `fd`.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags == -1 {
        return Err(io::Error::last_os_error());
    }

    let flags = if cloexec {
        flags | libc::FD_CLOEXEC
    } else {
        flags & !libc::FD_CLOEXEC
    };
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::TokenPoolExt;
    use std::sync::mpsc;
    use std::time::Duration;

    fn level(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).unwrap()
    }

    /// True when a token is sitting in the pipe right now.
    fn has_token(pool: &PipeTokenPool) -> bool {
        let mut fds = [PollFd::new(pool.read.as_fd(), PollFlags::POLLIN)];
        poll(&mut fds, PollTimeout::ZERO).unwrap() > 0
    }

    #[test]
    fn standalone_seeds_parallel_level_tokens() {
        let pool = PipeTokenPool::standalone(level(3), ImplicitSlot::Excluded).unwrap();
        assert_eq!(pool.capacity(), Some(3));
        assert_eq!(pool.kind(), PoolKind::Private);

        let held: Vec<_> = (0..3).map(|_| pool.token().unwrap()).collect();
        assert!(!has_token(&pool));

        drop(held);
        assert!(has_token(&pool));
    }

    #[test]
    fn implicit_slot_included_seeds_one_fewer() {
        let pool = PipeTokenPool::standalone(level(3), ImplicitSlot::Included).unwrap();
        assert_eq!(pool.capacity(), Some(2));

        let _a = pool.token().unwrap();
        let _b = pool.token().unwrap();
        assert!(!has_token(&pool));
    }

    #[test]
    fn implicit_slot_included_level_one_starts_empty() {
        let pool = PipeTokenPool::standalone(level(1), ImplicitSlot::Included).unwrap();
        assert_eq!(pool.capacity(), Some(0));
        assert!(!has_token(&pool));
    }

    #[test]
    fn seed_larger_than_pipe_buffer_is_an_error() {
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            let result = PipeTokenPool::standalone(level(1 << 20), ImplicitSlot::Excluded);
            let _ = tx.send(result.map(|_| ()));
        });

        let err = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap_err();
        assert!(
            matches!(&err, PoolError::Create(e) if e.kind() == io::ErrorKind::WouldBlock),
            "{err:?}"
        );
    }

    #[test]
    fn seeded_write_end_is_left_blocking() {
        let pool = PipeTokenPool::standalone(level(2), ImplicitSlot::Excluded).unwrap();
        let flags = unsafe { libc::fcntl(pool.write.as_raw_fd(), libc::F_GETFL) };
        assert_eq!(flags & libc::O_NONBLOCK, 0);
    }

    #[test]
    fn read_end_at_eof_is_closed() {
        let pool = PipeTokenPool {
            read: File::open("/dev/null").unwrap(),
            write: OpenOptions::new().write(true).open("/dev/null").unwrap(),
            origin: Origin::Inherited,
        };
        assert!(matches!(pool.acquire(), Err(PoolError::Closed)));
    }

    #[test]
    fn write_failure_is_passed_through_as_release_error() {
        let pool = PipeTokenPool {
            read: File::open("/dev/null").unwrap(),
            // Read-only, so every write fails with EBADF.
            write: File::open("/dev/null").unwrap(),
            origin: Origin::Inherited,
        };

        let err = pool.release().unwrap_err();
        insta::assert_snapshot!(err.to_string(), @"failed to return token to jobserver");
        match err {
            PoolError::Release(source) => assert_eq!(source.raw_os_error(), Some(libc::EBADF)),
            other => panic!("expected a release error, got {other:?}"),
        }
    }

    #[test]
    fn standalone_pipe_is_close_on_exec() {
        let pool = PipeTokenPool::standalone(level(1), ImplicitSlot::Excluded).unwrap();
        let flags = unsafe { libc::fcntl(pool.read.as_raw_fd(), libc::F_GETFD) };
        assert_ne!(flags & libc::FD_CLOEXEC, 0);
    }

    #[test]
    fn pools_over_the_same_pipe_share_tokens() {
        let a = PipeTokenPool::standalone(level(1), ImplicitSlot::Excluded).unwrap();
        let JobserverAuth::Pipe { read, write } = a.auth() else {
            panic!("standalone pool exports a pipe");
        };
        let b = unsafe { PipeTokenPool::from_inherited_fds(read, write) }.unwrap();
        assert_eq!(b.kind(), PoolKind::Shared);
        assert_eq!(b.capacity(), None);

        a.acquire().unwrap();
        assert!(!has_token(&b));

        a.release().unwrap();
        assert!(has_token(&b));
        b.acquire().unwrap();
        assert!(!has_token(&a));
        b.release().unwrap();
    }

    #[test]
    fn inherited_pool_owns_duplicates() {
        let a = PipeTokenPool::standalone(level(1), ImplicitSlot::Excluded).unwrap();
        let JobserverAuth::Pipe { read, write } = a.auth() else {
            panic!("standalone pool exports a pipe");
        };
        let b = unsafe { PipeTokenPool::from_inherited_fds(read, write) }.unwrap();
        assert_ne!(b.auth(), a.auth());

        drop(b);
        assert!(fd_is_open(read));
        assert!(fd_is_open(write));
        a.with_token(|| ()).unwrap();
    }

    #[test]
    fn inherited_invalid_descriptor_is_rejected() {
        let err = unsafe { PipeTokenPool::from_inherited_fds(-1, 1) }.unwrap_err();
        assert!(matches!(err, PoolError::InvalidDescriptor { fd: -1, .. }));

        let unused = 1 << 20;
        let err = unsafe { PipeTokenPool::from_inherited_fds(unused, unused + 1) }.unwrap_err();
        assert!(matches!(err, PoolError::InvalidDescriptor { fd, .. } if fd == unused));
    }

    #[test]
    fn nonblocking_inherited_read_end_still_blocks_for_a_token() {
        let (read, write) = pipe().unwrap();
        unsafe {
            let flags = libc::fcntl(read.as_raw_fd(), libc::F_GETFL);
            libc::fcntl(read.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK);
        }

        let pool =
            unsafe { PipeTokenPool::from_inherited_fds(read.as_raw_fd(), write.as_raw_fd()) }
                .unwrap();
        let pool = std::sync::Arc::new(pool);

        let (tx, rx) = mpsc::channel();
        let waiter = {
            let pool = std::sync::Arc::clone(&pool);
            std::thread::spawn(move || {
                let result = pool.acquire();
                tx.send(result.is_ok()).unwrap();
            })
        };

        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        pool.release().unwrap();
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        waiter.join().unwrap();
    }

    #[test]
    fn fifo_pool_round_trips_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobserver.fifo");
        nix::unistd::mkfifo(&path, nix::sys::stat::Mode::S_IRUSR | nix::sys::stat::Mode::S_IWUSR)
            .unwrap();

        let pool = PipeTokenPool::from_fifo(&path).unwrap();
        assert_eq!(pool.kind(), PoolKind::Shared);
        assert_eq!(pool.auth(), JobserverAuth::Fifo(path.clone()));

        pool.release().unwrap();
        assert!(has_token(&pool));
        pool.acquire().unwrap();
        assert!(!has_token(&pool));
    }

    #[test]
    fn missing_fifo_is_reported_with_path() {
        let err = PipeTokenPool::from_fifo("/nonexistent/jobpool.fifo").unwrap_err();
        insta::assert_snapshot!(err.to_string(), @"failed to open jobserver fifo /nonexistent/jobpool.fifo");
    }

    #[test]
    fn configure_command_advertises_the_pool() {
        let pool = PipeTokenPool::standalone(level(1), ImplicitSlot::Excluded).unwrap();
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("printf %s \"$MAKEFLAGS\"");
        cmd.env("CARGO_MAKEFLAGS", "--jobserver-auth=98,99");
        pool.configure_command(&mut cmd);

        let output = cmd.output().unwrap();
        assert!(output.status.success());
        assert_eq!(
            String::from_utf8(output.stdout).unwrap(),
            pool.auth().to_makeflags()
        );
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn child_process_returns_token_through_inherited_pipe() {
        let pool = PipeTokenPool::standalone(level(1), ImplicitSlot::Excluded).unwrap();
        pool.acquire().unwrap();
        assert!(!has_token(&pool));

        let JobserverAuth::Pipe { write, .. } = pool.auth() else {
            panic!("standalone pool exports a pipe");
        };
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(format!("printf + > /dev/fd/{write}"));
        pool.configure_command(&mut cmd);

        let status = cmd.status().unwrap();
        assert!(status.success());
        assert!(has_token(&pool));
        pool.acquire().unwrap();
    }
}
