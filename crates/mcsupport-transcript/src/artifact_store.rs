//! On-disk persistence for transcript records and their artifacts.
//!
//! Layout under the store root:
//! - `records/<record_id>.json`: the structured transcript record
//! - `artifacts/<record_id>`: the downloaded diagnostic file
//! - `images/<qualifier>-<name>`: images referenced from message content,
//!   disambiguated like record ids so an image is never overwritten
//!
//! Record ids are derived from the uploaded file name and disambiguated with a
//! `(n)` suffix, so the store is addressable by name.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use mcsupport_core::{write_bytes_atomic, write_text_atomic};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const TRANSCRIPT_RECORD_SCHEMA_VERSION: u32 = 1;
pub const FINGERPRINT_INDEX_FILE_NAME: &str = "fingerprints.json";
pub const TRANSCRIPT_EVENTS_LOG_FILE_NAME: &str = "transcript-events.jsonl";

const RECORDS_DIR_NAME: &str = "records";
const ARTIFACTS_DIR_NAME: &str = "artifacts";
const IMAGES_DIR_NAME: &str = "images";
const RECORD_FILE_EXTENSION: &str = "json";
const MAX_RECORD_ID_SUFFIX: usize = 10_000;

/// Result type for artifact store operations.
pub type StoreResult<T> = Result<T, ArtifactStoreError>;

/// Errors returned by [`ArtifactStore`].
#[derive(Debug, Error)]
pub enum ArtifactStoreError {
    #[error("transcript record '{0}' not found")]
    RecordNotFound(String),
    #[error("invalid transcript record id '{0}'")]
    InvalidRecordId(String),
    #[error("no free record id for '{0}'")]
    RecordIdExhausted(String),
    #[error("unsupported transcript record schema_version {found} (expected {expected})")]
    UnsupportedSchema { found: u32, expected: u32 },
    #[error("failed to write {path}: {message}")]
    Write { path: PathBuf, message: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// One attributed chat message inside a transcript.
pub struct MessageEntry {
    pub content: String,
    pub author_id: String,
    #[serde(default)]
    pub timestamp_unix_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// Persisted, append-only log of one file report.
pub struct TranscriptRecord {
    pub schema_version: u32,
    pub record_id: String,
    pub uploader_id: String,
    pub room_id: String,
    pub original_name: String,
    pub byte_size: u64,
    pub created_unix_ms: u64,
    #[serde(default)]
    pub artifact_sha256: Option<String>,
    #[serde(default)]
    pub artifact_bytes: Option<u64>,
    #[serde(default)]
    pub messages: Vec<MessageEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Inputs for [`ArtifactStore::create_record`].
pub struct NewTranscriptRecord<'a> {
    pub original_name: &'a str,
    pub byte_size: u64,
    pub uploader_id: &'a str,
    pub room_id: &'a str,
    pub created_unix_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// Digest of a persisted artifact.
pub struct ArtifactDigest {
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
/// Summary used by audit tooling and the `--inspect` command.
pub struct TranscriptStoreInspectReport {
    pub root: PathBuf,
    pub records: usize,
    pub invalid_records: usize,
    pub messages: usize,
    pub records_missing_artifact: Vec<String>,
    pub images: usize,
}

#[derive(Debug, Clone)]
/// Name-addressed store for transcript records, artifacts, and images.
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn open(root: &Path) -> StoreResult<Self> {
        let store = Self {
            root: root.to_path_buf(),
        };
        for dir in [store.records_dir(), store.artifacts_dir(), store.images_dir()] {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn records_dir(&self) -> PathBuf {
        self.root.join(RECORDS_DIR_NAME)
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.root.join(ARTIFACTS_DIR_NAME)
    }

    pub fn images_dir(&self) -> PathBuf {
        self.root.join(IMAGES_DIR_NAME)
    }

    pub fn fingerprint_index_path(&self) -> PathBuf {
        self.root.join(FINGERPRINT_INDEX_FILE_NAME)
    }

    pub fn events_log_path(&self) -> PathBuf {
        self.root.join(TRANSCRIPT_EVENTS_LOG_FILE_NAME)
    }

    pub fn record_path(&self, record_id: &str) -> StoreResult<PathBuf> {
        validate_record_id(record_id)?;
        Ok(self
            .records_dir()
            .join(format!("{record_id}.{RECORD_FILE_EXTENSION}")))
    }

    pub fn artifact_path(&self, record_id: &str) -> StoreResult<PathBuf> {
        validate_record_id(record_id)?;
        Ok(self.artifacts_dir().join(record_id))
    }

    /// Allocates a record id from the file name and persists an empty record under it.
    ///
    /// The record file is created with `create_new`, so two concurrent
    /// registrations of the same name can never claim the same id.
    pub fn create_record(&self, new: &NewTranscriptRecord<'_>) -> StoreResult<TranscriptRecord> {
        let base = sanitize_file_name(new.original_name);
        for suffix in 0..MAX_RECORD_ID_SUFFIX {
            let candidate = disambiguated_record_id(&base, suffix);
            let path = self.record_path(&candidate)?;
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(_) => {
                    let record = TranscriptRecord {
                        schema_version: TRANSCRIPT_RECORD_SCHEMA_VERSION,
                        record_id: candidate,
                        uploader_id: new.uploader_id.to_string(),
                        room_id: new.room_id.to_string(),
                        original_name: new.original_name.to_string(),
                        byte_size: new.byte_size,
                        created_unix_ms: new.created_unix_ms,
                        artifact_sha256: None,
                        artifact_bytes: None,
                        messages: Vec::new(),
                    };
                    if let Err(error) = self.save_record(&record) {
                        let _ = std::fs::remove_file(&path);
                        return Err(error);
                    }
                    return Ok(record);
                }
                Err(error) if error.kind() == ErrorKind::AlreadyExists => continue,
                Err(error) => return Err(error.into()),
            }
        }
        Err(ArtifactStoreError::RecordIdExhausted(base))
    }

    pub fn load_record(&self, record_id: &str) -> StoreResult<TranscriptRecord> {
        let path = self.record_path(record_id)?;
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(error) if error.kind() == ErrorKind::NotFound => {
                return Err(ArtifactStoreError::RecordNotFound(record_id.to_string()))
            }
            Err(error) => return Err(error.into()),
        };
        let record = serde_json::from_str::<TranscriptRecord>(&raw)?;
        if record.schema_version != TRANSCRIPT_RECORD_SCHEMA_VERSION {
            return Err(ArtifactStoreError::UnsupportedSchema {
                found: record.schema_version,
                expected: TRANSCRIPT_RECORD_SCHEMA_VERSION,
            });
        }
        Ok(record)
    }

    pub fn record_exists(&self, record_id: &str) -> bool {
        self.record_path(record_id)
            .map(|path| path.is_file())
            .unwrap_or(false)
    }

    /// Appends entries in order and returns the record's new message count.
    pub fn append_messages(&self, record_id: &str, entries: &[MessageEntry]) -> StoreResult<usize> {
        let mut record = self.load_record(record_id)?;
        record.messages.extend_from_slice(entries);
        self.save_record(&record)?;
        Ok(record.messages.len())
    }

    /// Persists the downloaded artifact and stamps its digest onto the record.
    pub fn write_artifact(&self, record_id: &str, bytes: &[u8]) -> StoreResult<ArtifactDigest> {
        let mut record = self.load_record(record_id)?;
        let path = self.artifact_path(record_id)?;
        write_bytes_atomic(&path, bytes).map_err(|error| write_error(&path, error))?;
        let digest = ArtifactDigest {
            sha256: sha256_hex(bytes),
            bytes: bytes.len() as u64,
        };
        record.artifact_sha256 = Some(digest.sha256.clone());
        record.artifact_bytes = Some(digest.bytes);
        self.save_record(&record)?;
        Ok(digest)
    }

    pub fn artifact_exists(&self, record_id: &str) -> bool {
        self.artifact_path(record_id)
            .map(|path| path.is_file())
            .unwrap_or(false)
    }

    /// Stores an image under a fresh `<qualifier>-<name>` (or `<name>(n)`)
    /// and returns the stored name.
    pub fn write_image(&self, qualifier: &str, image_name: &str, bytes: &[u8]) -> StoreResult<String> {
        let base = format!(
            "{}-{}",
            sanitize_file_name(qualifier),
            sanitize_file_name(image_name)
        );
        for suffix in 0..MAX_RECORD_ID_SUFFIX {
            let stored_name = disambiguated_record_id(&base, suffix);
            let path = self.images_dir().join(&stored_name);
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(_) => {
                    if let Err(error) = write_bytes_atomic(&path, bytes) {
                        let _ = std::fs::remove_file(&path);
                        return Err(write_error(&path, error));
                    }
                    return Ok(stored_name);
                }
                Err(error) if error.kind() == ErrorKind::AlreadyExists => continue,
                Err(error) => return Err(error.into()),
            }
        }
        Err(ArtifactStoreError::RecordIdExhausted(base))
    }

    /// Removes a record and its artifact. Missing files are not an error.
    pub fn delete_record(&self, record_id: &str) -> StoreResult<()> {
        for path in [self.record_path(record_id)?, self.artifact_path(record_id)?] {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(error) if error.kind() == ErrorKind::NotFound => {}
                Err(error) => return Err(error.into()),
            }
        }
        Ok(())
    }

    pub fn list_record_ids(&self) -> StoreResult<Vec<String>> {
        let mut record_ids = Vec::new();
        for entry in std::fs::read_dir(self.records_dir())? {
            let path = entry?.path();
            if path.extension().and_then(|value| value.to_str()) != Some(RECORD_FILE_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|value| value.to_str()) {
                record_ids.push(stem.to_string());
            }
        }
        record_ids.sort();
        Ok(record_ids)
    }

    pub fn inspect(&self) -> StoreResult<TranscriptStoreInspectReport> {
        let mut report = TranscriptStoreInspectReport {
            root: self.root.clone(),
            ..TranscriptStoreInspectReport::default()
        };
        for record_id in self.list_record_ids()? {
            match self.load_record(&record_id) {
                Ok(record) => {
                    report.records = report.records.saturating_add(1);
                    report.messages = report.messages.saturating_add(record.messages.len());
                    if !self.artifact_exists(&record_id) {
                        report.records_missing_artifact.push(record_id);
                    }
                }
                Err(_) => report.invalid_records = report.invalid_records.saturating_add(1),
            }
        }
        report.images = std::fs::read_dir(self.images_dir())?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_file())
            .count();
        Ok(report)
    }

    fn save_record(&self, record: &TranscriptRecord) -> StoreResult<()> {
        let path = self.record_path(&record.record_id)?;
        let mut payload = serde_json::to_string_pretty(record)?;
        payload.push('\n');
        write_text_atomic(&path, &payload).map_err(|error| write_error(&path, error))
    }
}

fn write_error(path: &Path, error: anyhow::Error) -> ArtifactStoreError {
    ArtifactStoreError::Write {
        path: path.to_path_buf(),
        message: format!("{error:#}"),
    }
}

fn validate_record_id(record_id: &str) -> StoreResult<()> {
    let invalid = record_id.trim().is_empty()
        || record_id.chars().all(|ch| ch == '.')
        || record_id.contains(['/', '\\'])
        || record_id != record_id.trim();
    if invalid {
        return Err(ArtifactStoreError::InvalidRecordId(record_id.to_string()));
    }
    Ok(())
}

/// `report.zip` -> `report.zip`, `report(1).zip`, `report(2).zip`, ...
fn disambiguated_record_id(base: &str, suffix: usize) -> String {
    if suffix == 0 {
        return base.to_string();
    }
    match base.rsplit_once('.') {
        Some((stem, extension)) if !stem.is_empty() => format!("{stem}({suffix}).{extension}"),
        _ => format!("{base}({suffix})"),
    }
}

/// Keeps letters and digits from any script; separators, controls and other
/// punctuation become `_`.
fn sanitize_file_name(raw: &str) -> String {
    let sanitized = raw
        .trim()
        .chars()
        .map(|ch| {
            if ch.is_alphanumeric() || matches!(ch, '-' | '_' | '.' | '(' | ')') {
                ch
            } else {
                '_'
            }
        })
        .collect::<String>();
    let trimmed = sanitized.trim_matches(|ch| ch == '_' || ch == '.');
    if trimmed.is_empty() {
        "upload".to_string()
    } else {
        trimmed.to_string()
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|byte| format!("{byte:02x}")).collect()
}
