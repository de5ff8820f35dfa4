//! Directory-backed discovery source.
//!
//! The listener that watches the chain drops one payload file per contract
//! into a directory (`0xabc….sol`). Each file is a candidate; its stem is the
//! item id. Oldest files come first.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::DiscoverySource;
use crate::error::Result;
use crate::model::{ItemId, PayloadRef, WorkItem};

pub struct DirectorySource {
    dir: PathBuf,
}

impl DirectorySource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn is_candidate_name(name: &str) -> bool {
    !name.starts_with('.') && !name.ends_with(".tmp") && !name.ends_with(".part")
}

#[async_trait]
impl DiscoverySource for DirectorySource {
    async fn list_candidates(&self) -> Result<Vec<WorkItem>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(dir = %self.dir.display(), "source directory missing, nothing to discover");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        let mut found: Vec<(SystemTime, String, WorkItem)> = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let meta = match entry.metadata().await {
                Ok(meta) if meta.is_file() => meta,
                Ok(_) => continue,
                // Removed between listing and stat.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_owned) else {
                warn!(path = %path.display(), "skipping non-utf8 file name");
                continue;
            };
            if !is_candidate_name(&name) {
                continue;
            }
            let stem = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default();
            let id = ItemId::new(stem);
            if id.is_empty() {
                continue;
            }
            let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            found.push((modified, name, WorkItem::new(id, PayloadRef::Path(path))));
        }

        found.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));
        Ok(found.into_iter().map(|(_, _, item)| item).collect())
    }

    async fn cleanup(&self, item: &WorkItem) -> Result<()> {
        let PayloadRef::Path(path) = &item.payload else {
            return Ok(());
        };
        match tokio::fs::remove_file(path).await {
            Ok(()) => {
                debug!(id = %item.id, path = %path.display(), "payload removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
