//! Work items: the addresses the discovery source hands to the scheduler.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Normalized item identifier.
///
/// Contract addresses arrive with arbitrary checksum casing and stray
/// whitespace; two ids that differ only in those respects are the same item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct ItemId(String);

impl ItemId {
    pub fn new(raw: impl AsRef<str>) -> Self {
        Self(raw.as_ref().trim().to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<String> for ItemId {
    fn from(raw: String) -> Self {
        Self::new(raw)
    }
}

impl From<&str> for ItemId {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl From<ItemId> for String {
    fn from(id: ItemId) -> Self {
        id.0
    }
}

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(&self.0)
    }
}

/// Opaque locator for an item's payload. The scheduler never reads it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum PayloadRef {
    Path(PathBuf),
    Handle(String),
}

impl std::fmt::Display for PayloadRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PayloadRef::Path(p) => write!(f, "{}", p.display()),
            PayloadRef::Handle(h) => f.write_str(h),
        }
    }
}

/// A unit of work awaiting analysis. Immutable once discovered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: ItemId,
    pub payload: PayloadRef,
}

impl WorkItem {
    pub fn new(id: impl Into<ItemId>, payload: PayloadRef) -> Self {
        Self {
            id: id.into(),
            payload,
        }
    }

    /// Item whose payload is a file on disk.
    pub fn at_path(id: impl Into<ItemId>, path: impl Into<PathBuf>) -> Self {
        Self::new(id, PayloadRef::Path(path.into()))
    }
}
