//! Core data model.
//!
//! A work item is an address that needs reviewing. An outcome record is what
//! the scheduler remembers about it once a dispatch has finished.

pub mod outcome;
pub mod work;

pub use outcome::{ErrorClass, Finding, OutcomeRecord, Status, Verdict};
pub use work::{ItemId, PayloadRef, WorkItem};
