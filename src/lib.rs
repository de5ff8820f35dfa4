//! # auditq
//!
//! Concurrent audit scheduler. Discovers pending work items, spreads them
//! across a pool of rate-limited analysis credentials, and records every
//! outcome in a crash-safe JSON store so no item is ever audited twice.

pub mod alert;
pub mod backend;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod lockset;
pub mod model;
pub mod pool;
pub mod stats;
pub mod store;
pub mod telemetry;
