//! jobpool: make-compatible jobserver token pools.
//!
//! Independently spawned processes bound their combined parallelism by
//! sharing a pipe of tokens. Pick a run mode once with [`JobServer`], hand it
//! to whatever spawns work, and bracket each job with a token.

pub mod auth;
pub mod config;
mod error;
mod null;
#[cfg(unix)]
mod pipe;
pub mod pool;
pub mod registry;
mod server;

pub use auth::JobserverAuth;
pub use config::{ImplicitSlot, JobServerConfig};
pub use error::{PoolError, Result};
pub use null::NullTokenPool;
#[cfg(unix)]
pub use pipe::{PipeTokenPool, TOKEN};
pub use pool::{OwnedToken, PoolKind, Token, TokenPool, TokenPoolExt, acquire_async, acquire_owned};
pub use server::{JobServer, Mode};
