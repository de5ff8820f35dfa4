//! Dispatch span helpers.
//!
//! One span per dispatched item, covering slot grant through the store write.

use tracing::Span;
use uuid::Uuid;

use crate::model::ItemId;
use crate::pool::SlotId;

/// Start a span for one dispatch of `id` on `slot`.
///
/// The `item.status` field is declared empty and filled in once the outcome
/// is known.
pub fn start_dispatch_span(id: &ItemId, slot: SlotId, dispatch_id: &Uuid) -> Span {
    tracing::info_span!(
        "dispatch.execute",
        "item.id" = %id,
        "slot.id" = slot.0,
        "dispatch.id" = %dispatch_id,
        "item.status" = tracing::field::Empty,
    )
}

/// Record a lifecycle transition on the given span.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.record("item.status", to);
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "state_transition");
    });
}
