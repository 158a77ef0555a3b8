use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failures surfaced by token pools.
///
/// I/O errors from the underlying channel are carried untranslated as the
/// error source.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("failed to create jobserver pipe")]
    Create(#[source] io::Error),

    #[error("failed to read token from jobserver")]
    Acquire(#[source] io::Error),

    #[error("failed to return token to jobserver")]
    Release(#[source] io::Error),

    /// Every write end of the channel is gone; no token can ever arrive.
    #[error("jobserver channel closed")]
    Closed,

    #[error("invalid jobserver descriptor {fd}")]
    InvalidDescriptor {
        fd: i32,
        #[source]
        source: io::Error,
    },

    #[error("failed to open jobserver fifo {}", path.display())]
    Fifo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

pub type Result<T> = std::result::Result<T, PoolError>;
