//! Resource pool: one slot per analysis credential.
//!
//! Each credential is rate limited upstream on its own, so a slot must rest
//! for `min_delay` between dispatches and may be put into a longer cooldown
//! after the backend throttles it. Among slots that are ready, the one that
//! has rested longest is handed out, which spreads load evenly.
//!
//! Slot state is only touched under the pool mutex, and only through
//! [`ResourcePool::acquire`] and the lease it returns.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::secrets::Credential;
use crate::error::{Error, Result};
use crate::telemetry::metrics;

/// Index of a slot within its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(pub usize);

impl std::fmt::Display for SlotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "slot-{}", self.0)
    }
}

#[derive(Debug)]
struct WorkerSlot {
    id: SlotId,
    credential: Arc<Credential>,
    busy: bool,
    /// Rate-limit clock. Set at acquire time, never at release.
    last_dispatched_at: Option<Instant>,
    cooldown_until: Option<Instant>,
    uses: u64,
}

impl WorkerSlot {
    /// Earliest instant this slot may be handed out again, ignoring `busy`.
    fn ready_at(&self, min_delay: Duration) -> Option<Instant> {
        let rested = self.last_dispatched_at.map(|t| t + min_delay);
        match (rested, self.cooldown_until) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }

    fn eligible(&self, now: Instant, min_delay: Duration) -> bool {
        !self.busy && self.ready_at(min_delay).is_none_or(|t| now >= t)
    }
}

/// Per-slot usage, for fairness checks and the stats command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotUsage {
    pub slot: SlotId,
    pub credential: String,
    pub uses: u64,
    pub busy: bool,
}

/// Fixed set of credential slots.
#[derive(Debug)]
pub struct ResourcePool {
    slots: Mutex<Vec<WorkerSlot>>,
    min_delay: Duration,
    released: Notify,
}

impl ResourcePool {
    /// Build a pool with one slot per credential.
    pub fn new(credentials: Vec<Credential>, min_delay: Duration) -> Result<Self> {
        if credentials.is_empty() {
            return Err(Error::Config(
                "resource pool needs at least one credential".to_string(),
            ));
        }
        let slots = credentials
            .into_iter()
            .enumerate()
            .map(|(i, credential)| WorkerSlot {
                id: SlotId(i),
                credential: Arc::new(credential),
                busy: false,
                last_dispatched_at: None,
                cooldown_until: None,
                uses: 0,
            })
            .collect();
        Ok(Self {
            slots: Mutex::new(slots),
            min_delay,
            released: Notify::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Vec<WorkerSlot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of slots; also the dispatch concurrency bound.
    pub fn size(&self) -> usize {
        self.lock().len()
    }

    pub fn min_delay(&self) -> Duration {
        self.min_delay
    }

    /// Wait for a slot that is free, rested, and out of cooldown.
    ///
    /// Picks the eligible slot with the oldest `last_dispatched_at`
    /// (never-used slots first, then lowest index). Returns
    /// [`Error::Cancelled`] if `cancel` fires first.
    pub async fn acquire(self: &Arc<Self>, cancel: &CancellationToken) -> Result<SlotLease> {
        let started = Instant::now();
        loop {
            // Registered before inspecting state so a release in between
            // still wakes us.
            let released = self.released.notified();

            let wake_at = {
                let mut slots = self.lock();
                let now = Instant::now();
                let pick = slots
                    .iter()
                    .filter(|s| s.eligible(now, self.min_delay))
                    .min_by_key(|s| (s.last_dispatched_at, s.id))
                    .map(|s| s.id.0);

                if let Some(i) = pick {
                    let slot = &mut slots[i];
                    slot.busy = true;
                    slot.last_dispatched_at = Some(now);
                    slot.uses += 1;
                    let waited = now.duration_since(started);
                    metrics::slot_wait_ms().record(waited.as_secs_f64() * 1000.0, &[]);
                    debug!(slot = %slot.id, credential = %slot.credential.name, waited_ms = waited.as_millis() as u64, "slot acquired");
                    return Ok(SlotLease {
                        pool: Arc::clone(self),
                        slot: slot.id,
                        credential: Arc::clone(&slot.credential),
                        released: false,
                    });
                }

                slots
                    .iter()
                    .filter(|s| !s.busy)
                    .filter_map(|s| s.ready_at(self.min_delay))
                    .min()
            };

            let resting = async {
                match wake_at {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = released => {}
                _ = resting => {}
            }
        }
    }

    /// Mark a slot free. Leaves its rate-limit clock alone.
    pub fn release(&self, slot: SlotId) {
        {
            let mut slots = self.lock();
            if let Some(s) = slots.get_mut(slot.0) {
                s.busy = false;
            }
        }
        self.released.notify_waiters();
    }

    /// Keep a slot ineligible for at least `duration` from now.
    pub fn cool_down(&self, slot: SlotId, duration: Duration) {
        let mut slots = self.lock();
        if let Some(s) = slots.get_mut(slot.0) {
            let until = Instant::now() + duration;
            s.cooldown_until = Some(s.cooldown_until.map_or(until, |c| c.max(until)));
            debug!(slot = %s.id, credential = %s.credential.name, cooldown_ms = duration.as_millis() as u64, "slot cooling down");
        }
    }

    pub fn usage(&self) -> Vec<SlotUsage> {
        self.lock()
            .iter()
            .map(|s| SlotUsage {
                slot: s.id,
                credential: s.credential.name.clone(),
                uses: s.uses,
                busy: s.busy,
            })
            .collect()
    }

    /// Slots currently held by a dispatch.
    pub fn busy(&self) -> usize {
        self.lock().iter().filter(|s| s.busy).count()
    }
}

/// Exclusive hold on one slot. Dropping it releases the slot.
#[derive(Debug)]
pub struct SlotLease {
    pool: Arc<ResourcePool>,
    slot: SlotId,
    credential: Arc<Credential>,
    released: bool,
}

impl SlotLease {
    pub fn slot(&self) -> SlotId {
        self.slot
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    /// Put this slot into an extended cooldown before it is released.
    pub fn cool_down(&self, duration: Duration) {
        self.pool.cool_down(self.slot, duration);
    }

    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if !self.released {
            self.released = true;
            self.pool.release(self.slot);
        }
    }
}

impl Drop for SlotLease {
    fn drop(&mut self) {
        self.release_inner();
    }
}
