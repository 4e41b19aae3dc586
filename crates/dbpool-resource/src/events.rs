//! Pool lifecycle events

use serde::{Deserialize, Serialize};

/// What happened to a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolEventKind {
    Acquired,
    CheckedOut,
    CheckedIn,
    Removed,
}

/// A resource lifecycle event with the pool counts right after it
#[derive(Debug, Clone)]
pub struct PoolEvent<R> {
    pub kind: PoolEventKind,
    pub resource: R,
    pub pool_size: usize,
    pub available: usize,
    pub excluded: usize,
}

/// Receives pool events
///
/// Listeners are called from whichever task caused the event and never
/// while the pool's bookkeeping lock is held, so they may call back into
/// the pool. They should return quickly.
pub trait PoolEventListener<R>: Send + Sync {
    fn on_event(&self, event: &PoolEvent<R>);
}
