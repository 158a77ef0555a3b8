//! The active limiter: a pool plus the parallelism it was configured for.
//!
//! A [`JobServer`] is created once when the process decides how it will run
//! and then handed to whatever spawns concurrent work. The decision mirrors
//! make's handling of `-j` in a sub-make:
//! - parent jobserver advertised, no `-j`: join it.
//! - parent jobserver advertised, `-j1`: run serially, ignore the parent.
//! - parent jobserver advertised, `-jN` with N > 1: warn, start a private pool.
//! - no parent, `-jN` with N > 1: start a private pool.
//! - otherwise: unconstrained, level 1.

use std::fmt;
use std::num::NonZeroUsize;
use std::process::Command;
use std::sync::Arc;
use std::thread::available_parallelism;

use crate::auth::JobserverAuth;
use crate::config::{ImplicitSlot, JobServerConfig};
use crate::error::Result;
use crate::null::NullTokenPool;
use crate::pool::TokenPool;

#[cfg(unix)]
use crate::pipe::{PipeTokenPool, fd_is_open};

/// How this process bounds its concurrency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Null pool; only the caller's own bookkeeping limits work.
    Unconstrained,
    /// Private pipe created by this process.
    Standalone,
    /// Participant in a parent's jobserver.
    Inherited,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unconstrained => write!(f, "unconstrained"),
            Self::Standalone => write!(f, "standalone"),
            Self::Inherited => write!(f, "inherited"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobServer {
    pool: Arc<dyn TokenPool>,
    parallel_level: NonZeroUsize,
    implicit_slots: usize,
    mode: Mode,
}

impl Default for JobServer {
    fn default() -> Self {
        Self::null()
    }
}

impl JobServer {
    /// No limiting, parallel level 1.
    pub fn null() -> Self {
        Self {
            pool: Arc::new(NullTokenPool),
            parallel_level: NonZeroUsize::MIN,
            implicit_slots: 1,
            mode: Mode::Unconstrained,
        }
    }

    /// A private pool bounding work at `parallel_level` jobs.
    #[cfg(unix)]
    pub fn standalone(parallel_level: NonZeroUsize, implicit: ImplicitSlot) -> Result<Self> {
        let pool = PipeTokenPool::standalone(parallel_level, implicit)?;
        Ok(Self {
            pool: Arc::new(pool),
            parallel_level,
            implicit_slots: implicit.free_slots(),
            mode: Mode::Standalone,
        })
    }

    /// Join a parent's jobserver.
    ///
    /// Every participant keeps the implicit slot granted by the protocol.
    ///
    /// # Safety
    ///
    /// For [`JobserverAuth::Pipe`], see [`PipeTokenPool::from_inherited_fds`].
    #[cfg(unix)]
    pub unsafe fn inherited(auth: &JobserverAuth, parallel_level: NonZeroUsize) -> Result<Self> {
        let pool = match auth {
            JobserverAuth::Pipe { read, write } => {
                // Safety: forwarded from the caller.
                unsafe { PipeTokenPool::from_inherited_fds(*read, *write)? }
            }
            JobserverAuth::Fifo(path) => PipeTokenPool::from_fifo(path)?,
        };
        Ok(Self {
            pool: Arc::new(pool),
            parallel_level,
            implicit_slots: 1,
            mode: Mode::Inherited,
        })
    }

    #[cfg(not(unix))]
    unsafe fn inherited(auth: &JobserverAuth, _parallel_level: NonZeroUsize) -> Result<Self> {
        tracing::warn!(%auth, "Jobserver pipes unsupported on this platform; not limiting");
        Ok(Self::null())
    }

    /// Decide the run mode from `config` and build the matching server.
    ///
    /// # Safety
    ///
    /// A pipe auth in `config` must name descriptors inherited from the
    /// parent that nothing else in this process owns.
    pub unsafe fn from_config(config: &JobServerConfig) -> Result<Self> {
        let inherited = config
            .auth
            .as_ref()
            .filter(|_| config.inherit)
            .filter(|auth| usable(auth));

        match (inherited, config.jobs) {
            (Some(auth), None) => {
                let level = available_parallelism().unwrap_or(NonZeroUsize::MIN);
                // Safety: forwarded from the caller.
                let server = unsafe { Self::inherited(auth, level)? };
                tracing::debug!(%auth, parallel_level = level.get(), "Using inherited jobserver");
                Ok(server)
            }
            (Some(_), Some(jobs)) if jobs.get() == 1 => {
                tracing::debug!("-j1 requested; running serially despite parent jobserver");
                Ok(Self::null())
            }
            (Some(_), Some(jobs)) => {
                tracing::warn!(
                    jobs = jobs.get(),
                    "-j{jobs} forced in sub-process; starting new jobserver"
                );
                Self::private(jobs, config.implicit_slot)
            }
            (None, Some(jobs)) if jobs.get() > 1 => Self::private(jobs, config.implicit_slot),
            (None, _) => Ok(Self::null()),
        }
    }

    #[cfg(unix)]
    fn private(jobs: NonZeroUsize, implicit: ImplicitSlot) -> Result<Self> {
        Self::standalone(jobs, implicit)
    }

    #[cfg(not(unix))]
    fn private(jobs: NonZeroUsize, _implicit: ImplicitSlot) -> Result<Self> {
        tracing::warn!(
            jobs = jobs.get(),
            "Jobserver pipes unsupported on this platform; not limiting"
        );
        Ok(Self::null())
    }

    pub fn pool(&self) -> Arc<dyn TokenPool> {
        Arc::clone(&self.pool)
    }

    pub fn parallel_level(&self) -> NonZeroUsize {
        self.parallel_level
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Jobs this process may run without holding a token.
    ///
    /// For an unconstrained server this is the whole parallel level, since
    /// the null pool itself never limits anything.
    pub fn implicit_slots(&self) -> usize {
        match self.mode {
            Mode::Unconstrained => self.parallel_level.get(),
            Mode::Standalone | Mode::Inherited => self.implicit_slots,
        }
    }

    /// Let a child process join this server's pool.
    pub fn configure_command(&self, cmd: &mut Command) {
        self.pool.configure_command(cmd);
    }
}

/// Whether an advertised jobserver can actually be reached. A parent that
/// closed the descriptors (e.g. a make rule without `+`) leaves stale numbers.
fn usable(auth: &JobserverAuth) -> bool {
    let ok = match auth {
        #[cfg(unix)]
        JobserverAuth::Pipe { read, write } => fd_is_open(*read) && fd_is_open(*write),
        #[cfg(not(unix))]
        JobserverAuth::Pipe { .. } => false,
        JobserverAuth::Fifo(path) => path.exists(),
    };
    if !ok {
        tracing::warn!(%auth, "Broken jobserver auth from parent process; ignoring it");
    }
    ok
}
