//! Process-wide access to the active [`JobServer`].
//!
//! Prefer passing a [`JobServer`] explicitly. The registry exists for code
//! that cannot be threaded through, and follows one rule: it is written at
//! most once, early, before concurrent work starts. Until then [`current`]
//! reports the default null server (level 1). Reading the default does not
//! block a later [`install`].

use std::num::NonZeroUsize;
use std::sync::{Arc, LazyLock, OnceLock};

use crate::config::{ConfigError, JobServerConfig};
use crate::error::PoolError;
use crate::pool::TokenPool;
use crate::server::JobServer;

static INSTALLED: OnceLock<JobServer> = OnceLock::new();
static DEFAULT: LazyLock<JobServer> = LazyLock::new(JobServer::null);

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("a jobserver is already installed for this process")]
    AlreadyInstalled,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// Make `server` the process-wide jobserver. Only the first call succeeds.
pub fn install(server: JobServer) -> Result<&'static JobServer, RegistryError> {
    let mode = server.mode();
    INSTALLED
        .set(server)
        .map_err(|_| RegistryError::AlreadyInstalled)?;
    tracing::debug!(%mode, "Installed process jobserver");
    Ok(current())
}

/// The installed server, or the default null server.
pub fn current() -> &'static JobServer {
    INSTALLED.get().unwrap_or_else(|| &*DEFAULT)
}

pub fn is_installed() -> bool {
    INSTALLED.get().is_some()
}

pub fn active_pool() -> Arc<dyn TokenPool> {
    current().pool()
}

pub fn parallel_level() -> NonZeroUsize {
    current().parallel_level()
}

/// Decide the run mode from `config` and install the result.
///
/// # Safety
///
/// See [`JobServer::from_config`].
pub unsafe fn init(config: &JobServerConfig) -> Result<&'static JobServer, RegistryError> {
    if is_installed() {
        return Err(RegistryError::AlreadyInstalled);
    }
    // Safety: forwarded from the caller.
    let server = unsafe { JobServer::from_config(config)? };
    install(server)
}

/// [`init`] with configuration read from the environment.
///
/// # Safety
///
/// Descriptors advertised in the make flags variables must be inherited from
/// the parent and not owned by anything else in this process.
pub unsafe fn init_from_env() -> Result<&'static JobServer, RegistryError> {
    let config = JobServerConfig::from_env()?;
    // Safety: forwarded from the caller.
    unsafe { init(&config) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolKind;
    use crate::server::Mode;

    // The registry is process-global, so this is the only unit test that
    // installs anything.
    #[test]
    fn default_then_single_install() {
        assert!(!is_installed());
        assert_eq!(current().mode(), Mode::Unconstrained);
        assert_eq!(parallel_level().get(), 1);
        assert_eq!(active_pool().kind(), PoolKind::Null);

        let config = JobServerConfig::new().with_inherit(false);
        let server = unsafe { init(&config) }.unwrap();
        assert_eq!(server.mode(), Mode::Unconstrained);
        assert!(is_installed());

        let err = install(JobServer::null()).unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyInstalled));
        insta::assert_snapshot!(err.to_string(), @"a jobserver is already installed for this process");

        let err = unsafe { init(&config) }.unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyInstalled));
    }
}
