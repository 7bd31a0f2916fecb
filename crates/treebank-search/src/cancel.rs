//! Cancellation for long-running searches.
//!
//! Cancellation is cooperative: a search only looks at its
//! [`CancellationCheck`] at checkpoint boundaries, never in the middle of an
//! engine call.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

/// Asked at every checkpoint whether the running search should stop.
#[async_trait]
pub trait CancellationCheck: Send + Sync {
    async fn should_stop(&self) -> bool;
}

/// A cancellation token shared between a search task and its owner.
///
/// Clones observe the same flag.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the token cancelled. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl CancellationCheck for CancellationToken {
    async fn should_stop(&self) -> bool {
        self.is_cancelled()
    }
}

/// A check that never stops the search.
///
/// Useful for tests or callers driving a ShardResult directly.
#[derive(Clone, Copy, Debug, Default)]
pub struct NeverCancel;

#[async_trait]
impl CancellationCheck for NeverCancel {
    async fn should_stop(&self) -> bool {
        false
    }
}
