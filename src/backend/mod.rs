//! Seams to the scheduler's collaborators.
//!
//! The scheduler never looks inside an analysis or a payload. It talks to a
//! [`DiscoverySource`] that lists candidate items and to an [`Analyzer`]
//! that turns one item into a [`Verdict`]. Reference implementations for
//! both live in the submodules.

pub mod command;
pub mod directory;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::secrets::Credential;
use crate::error::Result;
use crate::model::{ErrorClass, Verdict, WorkItem};

pub use command::CommandAnalyzer;
pub use directory::DirectorySource;

/// A failed analysis, already classified by the backend adapter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AnalyzeError {
    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("permanent failure: {0}")]
    Permanent(String),
}

impl AnalyzeError {
    pub fn class(&self) -> ErrorClass {
        match self {
            AnalyzeError::RateLimited(_) => ErrorClass::RateLimited,
            AnalyzeError::Transient(_) => ErrorClass::Transient,
            AnalyzeError::Permanent(_) => ErrorClass::Permanent,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            AnalyzeError::RateLimited(m) | AnalyzeError::Transient(m) | AnalyzeError::Permanent(m) => m,
        }
    }
}

/// The opaque analysis capability.
///
/// Called with the credential of the slot the dispatcher acquired; the
/// implementation must use that credential and no other.
#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(
        &self,
        item: &WorkItem,
        credential: &Credential,
    ) -> std::result::Result<Verdict, AnalyzeError>;
}

/// Where candidate items come from.
#[async_trait]
pub trait DiscoverySource: Send + Sync {
    /// Every item currently known, in discovery order. Must not be mutated by
    /// the caller.
    async fn list_candidates(&self) -> Result<Vec<WorkItem>>;

    /// Called once an item's record is terminal and durable. Default: nothing.
    async fn cleanup(&self, _item: &WorkItem) -> Result<()> {
        Ok(())
    }
}
