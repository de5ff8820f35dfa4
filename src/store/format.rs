//! On-disk layout of the dedup store.
//!
//! One primary JSON file plus numbered overflow shards next to it:
//! `audited.json`, `audited.1.json`, `audited.2.json`, ... Every file is a
//! JSON object keyed by normalized item id. Very old stores are a bare array
//! of ids, which decode as successful audits with no findings.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::model::{ItemId, OutcomeRecord};

/// Shapes a store file can take.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StoreFile {
    Records(serde_json::Map<String, Value>),
    Legacy(Vec<Value>),
}

/// Records decoded from one file, plus how many entries had to be dropped.
#[derive(Debug, Default)]
pub(crate) struct Decoded {
    pub records: Vec<OutcomeRecord>,
    pub dropped: usize,
}

/// Decode one store file.
///
/// Fails only when the file as a whole is not a recognizable store. Entries
/// that don't parse are dropped and counted.
pub(crate) fn decode(
    path: &Path,
    bytes: &[u8],
    legacy_time: DateTime<Utc>,
) -> Result<Decoded, serde_json::Error> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(Decoded::default());
    }

    let mut decoded = Decoded::default();
    match serde_json::from_slice::<StoreFile>(bytes)? {
        StoreFile::Records(map) => {
            for (key, mut value) in map {
                let id = ItemId::new(&key);
                if let Value::Object(ref mut obj) = value {
                    obj.entry("id").or_insert_with(|| Value::String(key.clone()));
                }
                match serde_json::from_value::<OutcomeRecord>(value) {
                    Ok(mut record) if !id.is_empty() => {
                        // The key is authoritative.
                        record.id = id;
                        decoded.records.push(record);
                    }
                    Ok(_) => decoded.dropped += 1,
                    Err(e) => {
                        warn!(path = %path.display(), key = %key, error = %e, "skipping malformed record");
                        decoded.dropped += 1;
                    }
                }
            }
        }
        StoreFile::Legacy(ids) => {
            for value in ids {
                match value.as_str().map(ItemId::new) {
                    Some(id) if !id.is_empty() => {
                        decoded.records.push(OutcomeRecord::legacy(id, legacy_time));
                    }
                    _ => {
                        warn!(path = %path.display(), entry = %value, "skipping malformed legacy entry");
                        decoded.dropped += 1;
                    }
                }
            }
        }
    }
    Ok(decoded)
}

/// Serialize one file's records. Keys are sorted so rewrites diff cleanly.
pub(crate) fn encode(records: &BTreeMap<ItemId, OutcomeRecord>) -> serde_json::Result<Vec<u8>> {
    let keyed: BTreeMap<&str, &OutcomeRecord> =
        records.iter().map(|(id, r)| (id.as_str(), r)).collect();
    serde_json::to_vec_pretty(&keyed)
}

/// Should `candidate` replace `current` when the same id shows up twice?
///
/// Terminal beats non-terminal; otherwise the most recent wins.
pub(crate) fn supersedes(candidate: &OutcomeRecord, current: &OutcomeRecord) -> bool {
    match (candidate.is_terminal(), current.is_terminal()) {
        (true, false) => true,
        (false, true) => false,
        _ => candidate.recorded_at > current.recorded_at,
    }
}

/// Naming scheme for the primary file and its shards.
#[derive(Debug, Clone)]
pub(crate) struct ShardLayout {
    primary: PathBuf,
    stem: String,
    extension: Option<String>,
}

impl ShardLayout {
    pub fn new(primary: PathBuf) -> Self {
        let stem = primary
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "audited".to_string());
        let extension = primary
            .extension()
            .map(|s| s.to_string_lossy().into_owned());
        Self {
            primary,
            stem,
            extension,
        }
    }

    pub fn primary(&self) -> &Path {
        &self.primary
    }

    fn dir(&self) -> PathBuf {
        match self.primary.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    /// Path of shard `n`. Shard 0 is the primary file.
    pub fn path(&self, n: usize) -> PathBuf {
        if n == 0 {
            return self.primary.clone();
        }
        let name = match &self.extension {
            Some(ext) => format!("{}.{n}.{ext}", self.stem),
            None => format!("{}.{n}", self.stem),
        };
        self.dir().join(name)
    }

    /// Parse a directory entry name back into a shard number.
    pub fn shard_number(&self, file_name: &str) -> Option<usize> {
        let rest = file_name.strip_prefix(&self.stem)?.strip_prefix('.')?;
        let digits = match &self.extension {
            Some(ext) => rest.strip_suffix(ext.as_str())?.strip_suffix('.')?,
            None => rest,
        };
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok().filter(|n| *n > 0)
    }

    /// All shard numbers present on disk, ascending. The primary (0) is
    /// always included whether or not it exists yet.
    pub async fn discover(&self) -> std::io::Result<Vec<usize>> {
        let mut shards = vec![0];
        let mut entries = match tokio::fs::read_dir(self.dir()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(shards),
            Err(e) => return Err(e),
        };
        while let Some(entry) = entries.next_entry().await? {
            if let Some(n) = entry.file_name().to_str().and_then(|n| self.shard_number(n)) {
                shards.push(n);
            }
        }
        shards.sort_unstable();
        shards.dedup();
        Ok(shards)
    }
}
