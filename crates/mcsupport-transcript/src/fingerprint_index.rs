//! `(original name, byte size)` -> per-uploader record ids, used to spot re-uploads.
//!
//! The index is a hint, not an authority: callers must confirm the record's
//! artifact still exists before reusing an entry.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use mcsupport_core::write_text_atomic;
use serde::{Deserialize, Serialize};

use crate::transcript_contract::FileDescriptor;

pub const FINGERPRINT_INDEX_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FingerprintKey {
    pub original_name: String,
    pub byte_size: u64,
}

impl FingerprintKey {
    pub fn new(original_name: &str, byte_size: u64) -> Self {
        Self {
            original_name: original_name.trim().to_string(),
            byte_size,
        }
    }

    pub fn for_file(file: &FileDescriptor) -> Self {
        Self::new(&file.name, file.byte_size)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FingerprintEntry {
    pub record_id: String,
    pub uploader_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FingerprintSnapshotRow {
    original_name: String,
    byte_size: u64,
    record_id: String,
    uploader_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FingerprintSnapshot {
    schema_version: u32,
    #[serde(default)]
    entries: Vec<FingerprintSnapshotRow>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
/// Each fingerprint keeps at most one entry per uploader, oldest first.
pub struct FingerprintIndex {
    entries: BTreeMap<FingerprintKey, Vec<FingerprintEntry>>,
}

impl FingerprintIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `(fingerprint, uploader)` entries.
    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries_for(&self, key: &FingerprintKey) -> &[FingerprintEntry] {
        self.entries.get(key).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn entry_for_uploader(
        &self,
        key: &FingerprintKey,
        uploader_id: &str,
    ) -> Option<&FingerprintEntry> {
        self.entries_for(key)
            .iter()
            .find(|entry| entry.uploader_id == uploader_id)
    }

    /// Records `entry`, replacing whatever the same uploader had under `key`.
    pub fn insert(
        &mut self,
        key: FingerprintKey,
        entry: FingerprintEntry,
    ) -> Option<FingerprintEntry> {
        let entries = self.entries.entry(key).or_default();
        match entries
            .iter_mut()
            .find(|existing| existing.uploader_id == entry.uploader_id)
        {
            Some(existing) => Some(std::mem::replace(existing, entry)),
            None => {
                entries.push(entry);
                None
            }
        }
    }

    /// Removes the entry under `key` pointing at `record_id`, if any.
    pub fn remove_if_record(&mut self, key: &FingerprintKey, record_id: &str) -> bool {
        let Some(entries) = self.entries.get_mut(key) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|entry| entry.record_id != record_id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            self.entries.remove(key);
        }
        removed
    }

    pub fn contains_record(&self, record_id: &str) -> bool {
        self.entries
            .values()
            .flatten()
            .any(|entry| entry.record_id == record_id)
    }

    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let snapshot = serde_json::from_str::<FingerprintSnapshot>(&raw)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        if snapshot.schema_version != FINGERPRINT_INDEX_SCHEMA_VERSION {
            bail!(
                "unsupported fingerprint index schema_version {} (expected {})",
                snapshot.schema_version,
                FINGERPRINT_INDEX_SCHEMA_VERSION
            );
        }
        let mut index = Self::default();
        for row in snapshot.entries {
            index.insert(
                FingerprintKey::new(&row.original_name, row.byte_size),
                FingerprintEntry {
                    record_id: row.record_id,
                    uploader_id: row.uploader_id,
                },
            );
        }
        Ok(index)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let snapshot = FingerprintSnapshot {
            schema_version: FINGERPRINT_INDEX_SCHEMA_VERSION,
            entries: self
                .entries
                .iter()
                .flat_map(|(key, entries)| entries.iter().map(move |entry| (key, entry)))
                .map(|(key, entry)| FingerprintSnapshotRow {
                    original_name: key.original_name.clone(),
                    byte_size: key.byte_size,
                    record_id: entry.record_id.clone(),
                    uploader_id: entry.uploader_id.clone(),
                })
                .collect(),
        };
        let mut payload =
            serde_json::to_string_pretty(&snapshot).context("failed to encode fingerprint index")?;
        payload.push('\n');
        write_text_atomic(path, &payload)
            .with_context(|| format!("failed to write {}", path.display()))
    }
}
