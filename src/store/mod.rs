//! Dedup store: the durable record of which items have been processed.
//!
//! Single source of truth for "has this item been handled". Records live in
//! JSON files (see [`format`]); an in-memory index mirrors them for cheap
//! lookups. The index is copy-on-write and reloads happen outside the writer
//! lock, so readers (statistics, discovery) never hold a lock that a writer
//! waits on.
//!
//! All writes go through one async mutex around read-merge-rewrite of the
//! target file. Other processes may write the same files; whenever the index
//! can't answer "terminal" by itself, the files are re-checked on disk.

pub(crate) mod format;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::SystemTime;

use chrono::Utc;
use opentelemetry::KeyValue;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::model::{ItemId, OutcomeRecord, Status};
use crate::telemetry::metrics;
use format::ShardLayout;

/// Start a new shard once the active file grows past this.
pub const DEFAULT_SHARD_MAX_BYTES: u64 = 8 * 1024 * 1024;

const REFRESH_ATTEMPTS: usize = 3;

/// What happened to a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The record is on disk.
    Written,
    /// A terminal record already exists; nothing was changed.
    Rejected { existing: Status },
}

#[derive(Debug, Clone)]
struct Entry {
    record: OutcomeRecord,
    shard: usize,
}

/// Size and mtime of one backing file, used to notice external writes.
#[derive(Debug, Clone, PartialEq, Eq)]
struct FileStamp {
    len: u64,
    modified: Option<SystemTime>,
}

#[derive(Debug, Clone, Default)]
struct Index {
    entries: HashMap<ItemId, Entry>,
    stamps: BTreeMap<usize, FileStamp>,
    /// Files that failed to parse. Never rewritten.
    corrupt: BTreeSet<usize>,
}

/// Read-only view of the store at one instant.
#[derive(Debug, Clone)]
pub struct RecordsView(Arc<Index>);

impl RecordsView {
    pub fn iter(&self) -> impl Iterator<Item = &OutcomeRecord> {
        self.0.entries.values().map(|e| &e.record)
    }

    pub fn get(&self, id: &ItemId) -> Option<&OutcomeRecord> {
        self.0.entries.get(id).map(|e| &e.record)
    }

    pub fn len(&self) -> usize {
        self.0.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.entries.is_empty()
    }
}

/// The dedup store.
pub struct DedupStore {
    layout: ShardLayout,
    shard_max_bytes: u64,
    index: RwLock<Arc<Index>>,
    writer: Mutex<()>,
}

impl DedupStore {
    /// Open a store rooted at `primary`, loading every shard.
    ///
    /// Missing files are an empty store. Malformed records are skipped.
    pub async fn open(primary: impl Into<PathBuf>, shard_max_bytes: u64) -> Result<Self> {
        let layout = ShardLayout::new(primary.into());
        let index = load_index(&layout).await?;
        info!(
            path = %layout.primary().display(),
            records = index.entries.len(),
            shards = index.stamps.len(),
            "dedup store loaded"
        );
        Ok(Self {
            layout,
            shard_max_bytes: shard_max_bytes.max(1),
            index: RwLock::new(Arc::new(index)),
            writer: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        self.layout.primary()
    }

    fn current(&self) -> Arc<Index> {
        Arc::clone(&self.index.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn replace(&self, index: Index) {
        *self.index.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(index);
    }

    /// Snapshot of every record currently indexed.
    pub fn view(&self) -> RecordsView {
        RecordsView(self.current())
    }

    /// Indexed record for `id`, if any. Does not touch disk.
    pub fn get(&self, id: &ItemId) -> Option<OutcomeRecord> {
        self.current().entries.get(id).map(|e| e.record.clone())
    }

    /// Is `id` finished for good?
    ///
    /// A positive answer from the index is final. A negative one is checked
    /// again against disk when the files changed since the index was built,
    /// which catches records written by another instance.
    pub async fn is_terminal(&self, id: &ItemId) -> Result<bool> {
        if self.indexed_terminal(id) {
            return Ok(true);
        }
        if self.refresh().await? {
            return Ok(self.indexed_terminal(id));
        }
        Ok(false)
    }

    fn indexed_terminal(&self, id: &ItemId) -> bool {
        self.current()
            .entries
            .get(id)
            .is_some_and(|e| e.record.is_terminal())
    }

    /// Reload from disk if any backing file changed. Returns whether the
    /// index changed.
    ///
    /// Never takes the writer lock. The files are parsed on the side and
    /// swapped in only if no local write replaced the index meanwhile;
    /// otherwise the check starts over against the newer index.
    pub async fn refresh(&self) -> Result<bool> {
        let mut changed = false;
        for _ in 0..REFRESH_ATTEMPTS {
            let base = self.current();
            let on_disk = stamp_all(&self.layout).await?;
            if on_disk == base.stamps {
                return Ok(changed);
            }
            debug!(path = %self.layout.primary().display(), "store changed on disk, reloading");
            let index = load_index(&self.layout).await?;

            let mut guard = self.index.write().unwrap_or_else(PoisonError::into_inner);
            if Arc::ptr_eq(&guard, &base) {
                *guard = Arc::new(index);
                return Ok(true);
            }
            changed = true;
        }
        debug!(path = %self.layout.primary().display(), "writes kept landing during reload");
        Ok(changed)
    }

    async fn refresh_locked(&self) -> Result<bool> {
        let on_disk = stamp_all(&self.layout).await?;
        if on_disk == self.current().stamps {
            return Ok(false);
        }
        debug!(path = %self.layout.primary().display(), "store changed on disk, reloading");
        let index = load_index(&self.layout).await?;
        self.replace(index);
        Ok(true)
    }

    /// Record an outcome.
    ///
    /// Upserts, except that an existing terminal record is never replaced:
    /// such writes are logged and reported as [`WriteOutcome::Rejected`].
    /// I/O failures are retried once before being returned.
    pub async fn write(&self, record: OutcomeRecord) -> Result<WriteOutcome> {
        let _guard = self.writer.lock().await;
        self.refresh_locked().await?;

        let mut shard = {
            let index = self.current();
            match index.entries.get(&record.id) {
                Some(existing) => {
                    if let Some(outcome) = reject(&existing.record, &record) {
                        return Ok(outcome);
                    }
                    if index.corrupt.contains(&existing.shard) {
                        self.active_shard(&index)
                    } else {
                        existing.shard
                    }
                }
                None => self.active_shard(&index),
            }
        };

        // Merge into the file as it is on disk right now, not as indexed.
        let mut file_records = loop {
            match self.read_shard(shard).await? {
                Some(records) => break records,
                None => {
                    self.mark_corrupt(shard);
                    shard = self.active_shard(&self.current());
                }
            }
        };
        if let Some(on_disk) = file_records.get(&record.id) {
            if let Some(outcome) = reject(on_disk, &record) {
                return Ok(outcome);
            }
        }

        let id = record.id.clone();
        file_records.insert(id.clone(), record.clone());
        let bytes = format::encode(&file_records)?;
        let path = self.layout.path(shard);

        if let Err(first) = write_atomic(&path, &bytes).await {
            warn!(path = %path.display(), error = %first, "store write failed, retrying once");
            metrics::store_write_retries().add(1, &[KeyValue::new("result", "retry")]);
            if let Err(second) = write_atomic(&path, &bytes).await {
                error!(path = %path.display(), error = %second, "store write failed after retry");
                metrics::store_write_retries().add(1, &[KeyValue::new("result", "gave_up")]);
                return Err(Error::StoreIo {
                    path,
                    source: second,
                });
            }
        }

        // The record is durable at this point; a failed stat only means the
        // next check reloads from disk.
        let stamp = stamp_file(&path).await.unwrap_or_else(|e| {
            warn!(path = %path.display(), error = %e, "could not stat store file after write");
            None
        });
        let mut guard = self.index.write().unwrap_or_else(PoisonError::into_inner);
        let index = Arc::make_mut(&mut guard);
        match stamp {
            Some(stamp) => index.stamps.insert(shard, stamp),
            None => index.stamps.remove(&shard),
        };
        index.entries.insert(id, Entry { record, shard });
        Ok(WriteOutcome::Written)
    }

    /// Where new ids go: the highest shard, unless it is full or unreadable.
    fn active_shard(&self, index: &Index) -> usize {
        let highest = index
            .stamps
            .keys()
            .chain(index.corrupt.iter())
            .copied()
            .max()
            .unwrap_or(0);
        let full = index
            .stamps
            .get(&highest)
            .is_some_and(|s| s.len >= self.shard_max_bytes);
        if index.corrupt.contains(&highest) || full {
            highest + 1
        } else {
            highest
        }
    }

    /// Current contents of one shard. `None` when the file is not valid JSON.
    async fn read_shard(&self, shard: usize) -> Result<Option<BTreeMap<ItemId, OutcomeRecord>>> {
        let path = self.layout.path(shard);
        let Some(bytes) = read_optional(&path).await? else {
            return Ok(Some(BTreeMap::new()));
        };
        match format::decode(&path, &bytes, Utc::now()) {
            Ok(decoded) => Ok(Some(
                decoded
                    .records
                    .into_iter()
                    .map(|r| (r.id.clone(), r))
                    .collect(),
            )),
            Err(e) => {
                error!(path = %path.display(), error = %e, "store file is not valid json; leaving it untouched");
                Ok(None)
            }
        }
    }

    fn mark_corrupt(&self, shard: usize) {
        let mut guard = self.index.write().unwrap_or_else(PoisonError::into_inner);
        Arc::make_mut(&mut guard).corrupt.insert(shard);
    }
}

/// `Some(Rejected)` when `incoming` may not replace `existing`.
fn reject(existing: &OutcomeRecord, incoming: &OutcomeRecord) -> Option<WriteOutcome> {
    if existing.is_terminal() || !existing.status.can_transition_to(incoming.status) {
        warn!(
            id = %incoming.id,
            existing = %existing.status,
            incoming = %incoming.status,
            "refusing to overwrite terminal record"
        );
        metrics::store_rejected_writes().add(1, &[]);
        return Some(WriteOutcome::Rejected {
            existing: existing.status,
        });
    }
    None
}

// ---------------------------------------------------------------------------
// File helpers
// ---------------------------------------------------------------------------

async fn load_index(layout: &ShardLayout) -> Result<Index> {
    let mut index = Index::default();
    for shard in layout.discover().await.map_err(|source| Error::StoreIo {
        path: layout.primary().to_path_buf(),
        source,
    })? {
        let path = layout.path(shard);
        // Stamp before reading: a write landing in between shows up as a
        // changed stamp on the next check instead of going unnoticed.
        let Some(stamp) = stamp_file(&path).await? else {
            continue;
        };
        let Some(bytes) = read_optional(&path).await? else {
            continue;
        };
        index.stamps.insert(shard, stamp);

        let decoded = match format::decode(&path, &bytes, Utc::now()) {
            Ok(decoded) => decoded,
            Err(e) => {
                error!(path = %path.display(), error = %e, "store file is not valid json; skipping it");
                index.corrupt.insert(shard);
                continue;
            }
        };
        if decoded.dropped > 0 {
            warn!(path = %path.display(), dropped = decoded.dropped, "malformed records skipped during load");
        }
        for record in decoded.records {
            let replace = index
                .entries
                .get(&record.id)
                .is_none_or(|current| format::supersedes(&record, &current.record));
            if replace {
                index.entries.insert(record.id.clone(), Entry { record, shard });
            }
        }
    }
    Ok(index)
}

async fn stamp_all(layout: &ShardLayout) -> Result<BTreeMap<usize, FileStamp>> {
    let mut stamps = BTreeMap::new();
    let shards = layout.discover().await.map_err(|source| Error::StoreIo {
        path: layout.primary().to_path_buf(),
        source,
    })?;
    for shard in shards {
        if let Some(stamp) = stamp_file(&layout.path(shard)).await? {
            stamps.insert(shard, stamp);
        }
    }
    Ok(stamps)
}

async fn stamp_file(path: &Path) -> Result<Option<FileStamp>> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => Ok(Some(FileStamp {
            len: meta.len(),
            modified: meta.modified().ok(),
        })),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(Error::StoreIo {
            path: path.to_path_buf(),
            source,
        }),
    }
}

async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(Error::StoreIo {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Write to a sibling temp file, fsync, then rename over the target.
async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(&tmp, path).await
}
