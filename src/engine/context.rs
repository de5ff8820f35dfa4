//! Shared state for one scheduler run.

use std::sync::Arc;

use crate::event::EventBus;
use crate::lockset::LockSet;
use crate::pool::ResourcePool;
use crate::store::DedupStore;

/// Everything the discovery loop and dispatch tasks share.
///
/// Built once at startup and cloned into each task; all fields are
/// reference counted.
#[derive(Clone)]
pub struct SchedulerContext {
    pub store: Arc<DedupStore>,
    pub pool: Arc<ResourcePool>,
    pub locks: Arc<LockSet>,
    pub events: Arc<EventBus>,
}

impl SchedulerContext {
    pub fn new(store: DedupStore, pool: ResourcePool) -> Self {
        Self {
            store: Arc::new(store),
            pool: Arc::new(pool),
            locks: Arc::new(LockSet::new()),
            events: Arc::new(EventBus::new()),
        }
    }
}
