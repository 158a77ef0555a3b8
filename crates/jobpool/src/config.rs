//! Run-mode configuration for a [`JobServer`](crate::JobServer).

use std::env;
use std::num::NonZeroUsize;

use crate::auth::{self, AuthError, JobserverAuth};

/// Environment variable holding the requested job count.
pub const JOBS_ENV: &str = "JOBPOOL_JOBS";

/// Whether the creating process's own slot counts toward the limit.
///
/// In the make protocol every process may run one job without holding a
/// token. A standalone pool can either ignore that slot (every job acquires,
/// so `N` tokens bound `N` jobs) or honour it (`N - 1` tokens plus the
/// implicit slot bound `N` jobs).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ImplicitSlot {
    /// Seed `N` tokens; every job must acquire.
    #[default]
    Excluded,
    /// Seed `N - 1` tokens; the creator runs one job without a token.
    Included,
}

impl ImplicitSlot {
    /// Tokens to write into a fresh pipe for `parallel_level` jobs.
    pub fn seed_tokens(self, parallel_level: NonZeroUsize) -> usize {
        match self {
            Self::Excluded => parallel_level.get(),
            Self::Included => parallel_level.get() - 1,
        }
    }

    /// Jobs the creator may run without acquiring.
    pub fn free_slots(self) -> usize {
        match self {
            Self::Excluded => 0,
            Self::Included => 1,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid job count '{value}': expected a positive integer")]
    InvalidJobs { value: String },

    #[error(transparent)]
    Auth(#[from] AuthError),
}

/// Inputs to the run-mode decision in [`JobServer::from_config`](crate::JobServer::from_config).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobServerConfig {
    /// Requested parallelism (`-jN`). `None` defers to an inherited jobserver.
    pub jobs: Option<NonZeroUsize>,
    pub implicit_slot: ImplicitSlot,
    /// Join a parent's jobserver when one is advertised.
    pub inherit: bool,
    /// Jobserver advertised by the parent, if any.
    pub auth: Option<JobserverAuth>,
}

impl Default for JobServerConfig {
    fn default() -> Self {
        Self {
            jobs: None,
            implicit_slot: ImplicitSlot::default(),
            inherit: true,
            auth: None,
        }
    }
}

impl JobServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read `JOBPOOL_JOBS` and the make flags variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let jobs = match env::var(JOBS_ENV) {
            Ok(value) if !value.trim().is_empty() => Some(parse_jobs(&value)?),
            _ => None,
        };

        Ok(Self {
            jobs,
            auth: auth::from_env()?,
            ..Self::default()
        })
    }

    pub fn with_jobs(mut self, jobs: NonZeroUsize) -> Self {
        self.jobs = Some(jobs);
        self
    }

    pub fn with_implicit_slot(mut self, implicit_slot: ImplicitSlot) -> Self {
        self.implicit_slot = implicit_slot;
        self
    }

    pub fn with_inherit(mut self, inherit: bool) -> Self {
        self.inherit = inherit;
        self
    }

    pub fn with_auth(mut self, auth: JobserverAuth) -> Self {
        self.auth = Some(auth);
        self
    }
}

/// Parse a job count such as the value of `-j` or `JOBPOOL_JOBS`.
pub fn parse_jobs(value: &str) -> Result<NonZeroUsize, ConfigError> {
    value
        .trim()
        .parse::<NonZeroUsize>()
        .map_err(|_| ConfigError::InvalidJobs {
            value: value.to_string(),
        })
}
