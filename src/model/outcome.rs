//! Outcome records: the durable result of analyzing one item.
//!
//! A record is the only state that survives a restart. Everything else
//! (slot bookkeeping, the in-flight lock set) is rebuilt from nothing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::work::ItemId;

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Recorded status of an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Known but not yet analyzed. Absence of a record means the same thing.
    Pending,
    /// Analysis returned a verdict (with or without findings). Terminal.
    Succeeded,
    /// Analysis failed. Terminal only when the record is non-retryable.
    Failed,
    /// Deliberately not analyzed. Terminal.
    Skipped,
}

impl Status {
    /// Can a record in `self` be replaced by one in `to`?
    pub fn can_transition_to(self, to: Status) -> bool {
        use Status::*;
        matches!(
            (self, to),
            (Pending, Succeeded)
                | (Pending, Failed)
                | (Pending, Skipped)
                | (Failed, Succeeded)   // retry succeeded
                | (Failed, Failed)      // retry failed again
                | (Failed, Skipped)
        )
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Status::Pending => "pending",
            Status::Succeeded => "succeeded",
            Status::Failed => "failed",
            Status::Skipped => "skipped",
        };
        f.pad(s)
    }
}

impl std::str::FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Status::Pending),
            "succeeded" => Ok(Status::Succeeded),
            "failed" => Ok(Status::Failed),
            "skipped" => Ok(Status::Skipped),
            other => Err(format!("unknown status: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Error class
// ---------------------------------------------------------------------------

/// How a failed analysis should be treated by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// The credential was throttled upstream. Not the item's fault.
    RateLimited,
    /// Network or timeout trouble. Counted toward the retry cap.
    Transient,
    /// The item cannot be analyzed. Never retried.
    Permanent,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorClass::RateLimited => "rate_limited",
            ErrorClass::Transient => "transient",
            ErrorClass::Permanent => "permanent",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Findings and verdicts
// ---------------------------------------------------------------------------

/// A single issue reported by an analysis backend. Opaque to the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Finding {
    pub title: String,
    pub category: String,
    #[serde(default)]
    pub affected_location: String,
    #[serde(default)]
    pub narrative: String,
}

/// What an analysis backend returns on success.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Verdict {
    #[serde(default)]
    pub findings: Vec<Finding>,
    /// Set when the backend declined the item (e.g. no verified source).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
}

impl Verdict {
    pub fn with_findings(findings: Vec<Finding>) -> Self {
        Self {
            findings,
            skip_reason: None,
        }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            findings: Vec::new(),
            skip_reason: Some(reason.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Outcome record
// ---------------------------------------------------------------------------

/// The durable result for one item id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutcomeRecord {
    pub id: ItemId,
    pub status: Status,
    #[serde(default)]
    pub findings: Vec<Finding>,
    pub recorded_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_class: Option<ErrorClass>,
    /// Only meaningful for `Failed`.
    #[serde(default = "default_retryable")]
    pub retryable: bool,
    /// Counted failures so far (transient and permanent, not rate limits).
    #[serde(default)]
    pub attempts: u32,
}

fn default_retryable() -> bool {
    true
}

impl OutcomeRecord {
    pub fn succeeded(id: ItemId, findings: Vec<Finding>) -> Self {
        Self {
            id,
            status: Status::Succeeded,
            findings,
            recorded_at: Utc::now(),
            failure_reason: None,
            error_class: None,
            retryable: false,
            attempts: 0,
        }
    }

    pub fn skipped(id: ItemId, reason: impl Into<String>) -> Self {
        Self {
            id,
            status: Status::Skipped,
            findings: Vec::new(),
            recorded_at: Utc::now(),
            failure_reason: Some(reason.into()),
            error_class: None,
            retryable: false,
            attempts: 0,
        }
    }

    pub fn failed(
        id: ItemId,
        class: ErrorClass,
        reason: impl Into<String>,
        attempts: u32,
        retryable: bool,
    ) -> Self {
        Self {
            id,
            status: Status::Failed,
            findings: Vec::new(),
            recorded_at: Utc::now(),
            failure_reason: Some(reason.into()),
            error_class: Some(class),
            retryable,
            attempts,
        }
    }

    /// Legacy stores only listed ids that had been audited.
    pub fn legacy(id: ItemId, recorded_at: DateTime<Utc>) -> Self {
        Self {
            recorded_at,
            ..Self::succeeded(id, Vec::new())
        }
    }

    /// Will this record never change again?
    pub fn is_terminal(&self) -> bool {
        match self.status {
            Status::Succeeded | Status::Skipped => true,
            Status::Failed => !self.retryable,
            Status::Pending => false,
        }
    }

    /// Failed, but eligible for another dispatch.
    pub fn is_retryable_failure(&self) -> bool {
        self.status == Status::Failed && self.retryable
    }

    pub fn finding_categories(&self) -> Vec<String> {
        self.findings.iter().map(|f| f.category.clone()).collect()
    }
}
