//! Discovery: turn the source's candidate list into a dispatchable batch.

use std::collections::HashSet;

use tracing::debug;

use crate::backend::DiscoverySource;
use crate::error::Result;
use crate::lockset::LockSet;
use crate::model::WorkItem;
use crate::store::DedupStore;

/// Candidates that are neither terminal in the store nor in flight, in the
/// source's order. Repeated ids keep their first occurrence.
///
/// The store is refreshed once up front, so records written by another
/// process since the last tick are honoured.
pub async fn discover(
    source: &dyn DiscoverySource,
    store: &DedupStore,
    locks: &LockSet,
) -> Result<Vec<WorkItem>> {
    let candidates = source.list_candidates().await?;
    store.refresh().await?;
    let records = store.view();

    let total = candidates.len();
    let mut seen = HashSet::with_capacity(total);
    let mut batch = Vec::new();
    let (mut terminal, mut in_flight) = (0usize, 0usize);

    for item in candidates {
        if item.id.is_empty() || !seen.insert(item.id.clone()) {
            continue;
        }
        if records.get(&item.id).is_some_and(|r| r.is_terminal()) {
            terminal += 1;
            continue;
        }
        if locks.contains(&item.id) {
            in_flight += 1;
            continue;
        }
        batch.push(item);
    }

    debug!(
        candidates = total,
        terminal,
        in_flight,
        pending = batch.len(),
        "discovery pass"
    );
    Ok(batch)
}
