//! In-flight lock set.
//!
//! Holds the ids that have been picked for dispatch but whose outcome has not
//! been recorded yet. Memory only: after a restart it is empty, and any item
//! that was in flight is simply pending again because its record never made
//! it to the store.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::model::ItemId;

#[derive(Debug, Default)]
pub struct LockSet {
    ids: Mutex<HashSet<ItemId>>,
}

impl LockSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<ItemId>> {
        self.ids.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Check-and-set. `None` if `id` is already in flight.
    pub fn try_lock(self: &Arc<Self>, id: &ItemId) -> Option<InFlight> {
        if self.lock().insert(id.clone()) {
            Some(InFlight {
                set: Arc::clone(self),
                id: id.clone(),
            })
        } else {
            None
        }
    }

    pub fn contains(&self, id: &ItemId) -> bool {
        self.lock().contains(id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn remove(&self, id: &ItemId) {
        self.lock().remove(id);
    }
}

/// Membership in the lock set. The id is removed when this is dropped.
#[derive(Debug)]
pub struct InFlight {
    set: Arc<LockSet>,
    id: ItemId,
}

impl InFlight {
    pub fn id(&self) -> &ItemId {
        &self.id
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.set.remove(&self.id);
    }
}
