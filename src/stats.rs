//! Statistics over the outcome store.
//!
//! Buckets partition the records: every record lands in exactly one of
//! succeeded, skipped, failed (terminal failures only) and pending (which
//! includes retryable failures). Rates are fractions of the total and are
//! zero for an empty store.

use std::fmt;

use serde::Serialize;

use crate::error::Result;
use crate::model::{OutcomeRecord, Status};
use crate::store::DedupStore;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub total: usize,
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub pending: usize,
    /// Retryable failures, also counted in `pending`.
    pub retrying: usize,
    /// Succeeded records with at least one finding.
    pub with_findings: usize,
    /// Findings across all records.
    pub findings: usize,
    pub success_rate: f64,
    pub failure_rate: f64,
}

impl StatsSnapshot {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a OutcomeRecord>) -> Self {
        let mut stats = Self::default();
        for record in records {
            stats.total += 1;
            stats.findings += record.findings.len();
            match record.status {
                Status::Succeeded => {
                    stats.succeeded += 1;
                    if !record.findings.is_empty() {
                        stats.with_findings += 1;
                    }
                }
                Status::Skipped => stats.skipped += 1,
                Status::Failed if record.retryable => {
                    stats.pending += 1;
                    stats.retrying += 1;
                }
                Status::Failed => stats.failed += 1,
                Status::Pending => stats.pending += 1,
            }
        }
        if stats.total > 0 {
            stats.success_rate = stats.succeeded as f64 / stats.total as f64;
            stats.failure_rate = stats.failed as f64 / stats.total as f64;
        }
        stats
    }
}

/// Snapshot the store as it is on disk right now.
pub async fn snapshot(store: &DedupStore) -> Result<StatsSnapshot> {
    store.refresh().await?;
    Ok(StatsSnapshot::from_records(store.view().iter()))
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "total       {}", self.total)?;
        writeln!(
            f,
            "succeeded   {} ({:.1}%, {} with findings)",
            self.succeeded,
            self.success_rate * 100.0,
            self.with_findings
        )?;
        writeln!(f, "skipped     {}", self.skipped)?;
        writeln!(f, "failed      {} ({:.1}%)", self.failed, self.failure_rate * 100.0)?;
        writeln!(f, "pending     {} ({} retrying)", self.pending, self.retrying)?;
        write!(f, "findings    {}", self.findings)
    }
}
