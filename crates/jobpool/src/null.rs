//! A pool that never limits concurrency.

use crate::error::Result;
use crate::pool::{PoolKind, TokenPool};

/// Acquire and release are no-ops, so scoped work runs immediately.
///
/// Lets callers use the limiter uniformly when no bound is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullTokenPool;

impl TokenPool for NullTokenPool {
    fn acquire(&self) -> Result<()> {
        Ok(())
    }

    fn release(&self) -> Result<()> {
        Ok(())
    }

    fn kind(&self) -> PoolKind {
        PoolKind::Null
    }
}
