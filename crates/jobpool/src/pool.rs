//! Token pool capability and scoped acquisition.
//!
//! A [`TokenPool`] hands out tokens: one token is permission to run one job.
//! The raw protocol is `acquire` followed by exactly one `release`. The guards
//! here pair the two for callers:
//! - [`Token`] borrows the pool and releases on drop (normal return, `?`, or panic).
//! - [`OwnedToken`] holds an `Arc` of the pool so it can move into spawned work.
//! - [`TokenPoolExt::with_token`] runs a closure while holding a token.
//!
//! Pools do not detect an unpaired `release`. Use the guards whenever possible.

use std::fmt;
use std::process::Command;
use std::sync::Arc;

use crate::error::{PoolError, Result};

/// Which flavour of pool is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    /// Never limits; acquire and release are no-ops.
    Null,
    /// A pipe created by this process.
    Private,
    /// Endpoints inherited from a parent jobserver.
    Shared,
}

impl fmt::Display for PoolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Private => write!(f, "private"),
            Self::Shared => write!(f, "shared"),
        }
    }
}

/// The acquire/release contract shared by every pool.
pub trait TokenPool: Send + Sync + fmt::Debug {
    /// Block until a token is available and take it.
    ///
    /// The caller must call [`release`](Self::release) exactly once afterwards.
    fn acquire(&self) -> Result<()>;

    /// Return one token to the pool.
    fn release(&self) -> Result<()>;

    fn kind(&self) -> PoolKind;

    /// Let a child process join this pool. No-op unless the pool is shareable.
    fn configure_command(&self, _cmd: &mut Command) {}
}

/// Scoped acquisition for any pool, sized or `dyn`.
pub trait TokenPoolExt: TokenPool {
    /// Acquire a token that is released when the guard drops.
    fn token(&self) -> Result<Token<'_, Self>> {
        self.acquire()?;
        Ok(Token {
            pool: self,
            held: true,
        })
    }

    /// Run `work` while holding a token.
    ///
    /// The token is released exactly once after `work` finishes. If `work`
    /// panics the token is released during unwinding and the panic continues.
    /// Whatever `work` returns, including its own errors, is passed through
    /// untouched.
    fn with_token<T, F>(&self, work: F) -> Result<T>
    where
        F: FnOnce() -> T,
    {
        let token = self.token()?;
        let out = work();
        token.release()?;
        Ok(out)
    }
}

impl<P: TokenPool + ?Sized> TokenPoolExt for P {}

/// A token borrowed from a pool.
#[must_use = "dropping a Token immediately returns it to the pool"]
pub struct Token<'a, P: TokenPool + ?Sized> {
    pool: &'a P,
    held: bool,
}

impl<P: TokenPool + ?Sized> Token<'_, P> {
    /// Return the token now, surfacing a write failure instead of logging it.
    pub fn release(mut self) -> Result<()> {
        self.held = false;
        self.pool.release()
    }
}

impl<P: TokenPool + ?Sized> fmt::Debug for Token<'_, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("pool", &self.pool)
            .field("held", &self.held)
            .finish()
    }
}

impl<P: TokenPool + ?Sized> Drop for Token<'_, P> {
    fn drop(&mut self) {
        if self.held
            && let Err(e) = self.pool.release()
        {
            tracing::error!(error = %e, "Failed to return jobserver token on drop");
        }
    }
}

/// A token that keeps its pool alive, for handing to threads and tasks.
#[must_use = "dropping an OwnedToken immediately returns it to the pool"]
#[derive(Debug)]
pub struct OwnedToken {
    pool: Arc<dyn TokenPool>,
    held: bool,
}

impl OwnedToken {
    pub fn pool(&self) -> &Arc<dyn TokenPool> {
        &self.pool
    }

    /// Return the token now, surfacing a write failure instead of logging it.
    pub fn release(mut self) -> Result<()> {
        self.held = false;
        self.pool.release()
    }
}

impl Drop for OwnedToken {
    fn drop(&mut self) {
        if self.held
            && let Err(e) = self.pool.release()
        {
            tracing::error!(error = %e, kind = %self.pool.kind(), "Failed to return jobserver token on drop");
        }
    }
}

/// Blocking acquire returning a `'static` guard.
pub fn acquire_owned(pool: Arc<dyn TokenPool>) -> Result<OwnedToken> {
    pool.acquire()?;
    Ok(OwnedToken { pool, held: true })
}

/// Acquire without blocking an async runtime worker.
///
/// The blocking read runs on tokio's blocking pool. Dropping the returned
/// future does not abort a read already in progress; if it later succeeds the
/// token is released straight back to the pool.
pub async fn acquire_async(pool: Arc<dyn TokenPool>) -> Result<OwnedToken> {
    if pool.kind() == PoolKind::Null {
        return acquire_owned(pool);
    }

    tokio::task::spawn_blocking(move || acquire_owned(pool))
        .await
        .map_err(|e| PoolError::Acquire(std::io::Error::other(e)))?
}
