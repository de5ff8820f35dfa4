//! Dispatcher: launches one task per admitted item.
//!
//! A task owns its item's in-flight lock for its whole life. It waits for a
//! worker slot, runs the analyzer with that slot's credential, and records
//! the outcome. The store write happens before the slot is released, and the
//! slot is released before the lock; both releases also happen on every early
//! return and on panic, since they are guard drops.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures_util::FutureExt as _;
use opentelemetry::KeyValue;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, warn};
use uuid::Uuid;

use super::context::SchedulerContext;
use super::control::SchedulerConfig;
use crate::backend::{AnalyzeError, Analyzer, DiscoverySource};
use crate::event::EventKind;
use crate::lockset::InFlight;
use crate::model::{ErrorClass, ItemId, OutcomeRecord, Status, Verdict, WorkItem};
use crate::pool::SlotLease;
use crate::store::WriteOutcome;
use crate::telemetry::metrics;
use crate::telemetry::work::{record_state_transition, start_dispatch_span};

#[derive(Clone)]
pub struct Dispatcher {
    ctx: SchedulerContext,
    analyzer: Arc<dyn Analyzer>,
    source: Arc<dyn DiscoverySource>,
    config: SchedulerConfig,
}

impl Dispatcher {
    pub fn new(
        ctx: SchedulerContext,
        analyzer: Arc<dyn Analyzer>,
        source: Arc<dyn DiscoverySource>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            ctx,
            analyzer,
            source,
            config,
        }
    }

    /// Launch tasks for the head of `batch` into `tasks`.
    ///
    /// At most `pool size - in flight` items are launched, spaced by the
    /// launch stagger. Items whose lock is already taken are passed over
    /// without using up capacity. Returns how many were launched.
    pub async fn dispatch(
        &self,
        batch: Vec<WorkItem>,
        tasks: &mut JoinSet<()>,
        cancel: &CancellationToken,
    ) -> usize {
        let capacity = self.ctx.pool.size().saturating_sub(self.ctx.locks.len());
        let mut launched = 0;

        for item in batch {
            if launched >= capacity || cancel.is_cancelled() {
                break;
            }
            let Some(lock) = self.ctx.locks.try_lock(&item.id) else {
                debug!(id = %item.id, "already in flight");
                continue;
            };

            if launched > 0 && !self.config.launch_stagger.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.config.launch_stagger) => {}
                }
            }

            let this = self.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move { this.execute(item, lock, cancel).await });
            launched += 1;
        }

        launched
    }

    /// Run one item from slot acquisition to recorded outcome.
    pub async fn execute(&self, item: WorkItem, lock: InFlight, cancel: CancellationToken) {
        let lease = match self.ctx.pool.acquire(&cancel).await {
            Ok(lease) => lease,
            Err(e) => {
                debug!(id = %item.id, error = %e, "no slot granted; item stays pending");
                return;
            }
        };

        let dispatch_id = Uuid::new_v4();
        let span = start_dispatch_span(&item.id, lease.slot(), &dispatch_id);
        self.run_on_slot(item, lease, dispatch_id, &span)
            .instrument(span.clone())
            .await;
        drop(lock);
    }

    async fn run_on_slot(
        &self,
        item: WorkItem,
        lease: SlotLease,
        dispatch_id: Uuid,
        span: &tracing::Span,
    ) {
        // Another process may have finished it while we waited for a slot.
        match self.ctx.store.is_terminal(&item.id).await {
            Ok(false) => {}
            Ok(true) => {
                info!(id = %item.id, "already recorded, not dispatching");
                return;
            }
            Err(e) => {
                error!(id = %item.id, error = %e, "store check failed, not dispatching");
                return;
            }
        }

        let slot = lease.slot();
        record_state_transition(span, "locked", "dispatched");
        metrics::items_dispatched().add(1, &[KeyValue::new("slot", slot.to_string())]);
        self.ctx.events.publish(EventKind::ItemDispatched {
            id: item.id.clone(),
            slot: slot.0,
            dispatch_id,
        });

        let started = Instant::now();
        let result = AssertUnwindSafe(self.analyzer.analyze(&item, lease.credential()))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Err(AnalyzeError::Transient(format!(
                    "analyzer panicked: {}",
                    panic_message(panic.as_ref())
                )))
            });
        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;

        let record = self.outcome_record(&item.id, result);
        metrics::analyze_duration_ms().record(
            duration_ms,
            &[KeyValue::new("status", record.status.to_string())],
        );

        match record.error_class {
            Some(ErrorClass::RateLimited) => {
                warn!(id = %item.id, slot = %slot, "rate limited, cooling slot down");
                metrics::rate_limited().add(1, &[KeyValue::new("slot", slot.to_string())]);
                lease.cool_down(self.config.rate_limit_cooldown);
            }
            Some(ErrorClass::Transient) => lease.cool_down(self.config.transient_cooldown),
            _ => {}
        }

        self.record(&item, record, span).await;
        lease.release();
    }

    /// Map an analyzer result onto the record to persist.
    fn outcome_record(
        &self,
        id: &ItemId,
        result: std::result::Result<Verdict, AnalyzeError>,
    ) -> OutcomeRecord {
        let err = match result {
            Ok(Verdict {
                skip_reason: Some(reason),
                ..
            }) => return OutcomeRecord::skipped(id.clone(), reason),
            Ok(verdict) => return OutcomeRecord::succeeded(id.clone(), verdict.findings),
            Err(err) => err,
        };

        let prior = self
            .ctx
            .store
            .get(id)
            .filter(|r| r.status == Status::Failed)
            .map_or(0, |r| r.attempts);

        match err.class() {
            ErrorClass::RateLimited => {
                OutcomeRecord::failed(id.clone(), ErrorClass::RateLimited, err.message(), prior, true)
            }
            ErrorClass::Transient => {
                let attempts = prior + 1;
                let retryable = attempts < self.config.max_attempts;
                if !retryable {
                    warn!(id = %id, attempts, "giving up after repeated transient failures");
                }
                OutcomeRecord::failed(
                    id.clone(),
                    ErrorClass::Transient,
                    err.message(),
                    attempts,
                    retryable,
                )
            }
            ErrorClass::Permanent => OutcomeRecord::failed(
                id.clone(),
                ErrorClass::Permanent,
                err.message(),
                prior + 1,
                false,
            ),
        }
    }

    async fn record(&self, item: &WorkItem, record: OutcomeRecord, span: &tracing::Span) {
        let status = record.status;
        let mut labels = vec![KeyValue::new("status", status.to_string())];
        if let Some(class) = record.error_class {
            labels.push(KeyValue::new("error_class", class.to_string()));
        }

        match self.ctx.store.write(record.clone()).await {
            Ok(WriteOutcome::Written) => {
                record_state_transition(span, "dispatched", &status.to_string());
                metrics::outcomes().add(1, &labels);
                info!(
                    id = %item.id,
                    status = %status,
                    findings = record.findings.len(),
                    retryable = record.retryable,
                    "outcome recorded"
                );
                self.ctx.events.publish(EventKind::ItemCompleted {
                    id: record.id,
                    status,
                    retryable: record.retryable,
                    findings: record.findings,
                    error_class: record.error_class,
                });

                if matches!(status, Status::Succeeded | Status::Skipped) {
                    if let Err(e) = self.source.cleanup(item).await {
                        warn!(id = %item.id, error = %e, "payload cleanup failed");
                    }
                }
            }
            Ok(WriteOutcome::Rejected { existing }) => {
                self.ctx.events.publish(EventKind::RecordRejected {
                    id: item.id.clone(),
                    existing,
                });
            }
            Err(e) => {
                error!(id = %item.id, error = %e, "outcome not persisted; item stays pending");
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
