//! Per-ShardResult exclusive leases.
//!
//! A ShardResult's search holds its lease for the whole run so two queries
//! sharing the ShardResult never append to the same cache file at once.
//! Eviction takes the same lease with [`LeaseTable::try_acquire`] and skips
//! ShardResults that are busy.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::types::ShardResultId;

#[derive(Debug, Default)]
pub struct LeaseTable {
    locks: Mutex<HashMap<ShardResultId, Arc<AsyncMutex<()>>>>,
}

/// Held while a ShardResult is being searched or deleted.
#[derive(Debug)]
pub struct Lease {
    id: ShardResultId,
    _guard: OwnedMutexGuard<()>,
}

impl Lease {
    pub fn id(&self) -> ShardResultId {
        self.id
    }
}

impl LeaseTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, id: ShardResultId) -> Arc<AsyncMutex<()>> {
        // Fast path: lease already registered.
        let mut locks = self.locks.lock();
        if let Some(lock) = locks.get(&id) {
            return Arc::clone(lock);
        }
        // Drop entries nobody holds or waits on.
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        Arc::clone(locks.entry(id).or_default())
    }

    /// Waits until the lease for `id` is free.
    pub async fn acquire(&self, id: ShardResultId) -> Lease {
        let lock = self.lock_for(id);
        Lease {
            id,
            _guard: lock.lock_owned().await,
        }
    }

    /// Takes the lease only when nobody holds it.
    pub fn try_acquire(&self, id: ShardResultId) -> Option<Lease> {
        let lock = self.lock_for(id);
        let guard = lock.try_lock_owned().ok()?;
        Some(Lease { id, _guard: guard })
    }

    #[cfg(test)]
    pub(crate) fn is_held(&self, id: ShardResultId) -> bool {
        self.locks
            .lock()
            .get(&id)
            .is_some_and(|lock| lock.try_lock().is_err())
    }
}
