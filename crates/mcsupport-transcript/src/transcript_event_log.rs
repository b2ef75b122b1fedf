//! Append-only NDJSON audit trail of correlation decisions.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use mcsupport_core::{append_line_with_rotation, LogRotationPolicy};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptEventKind {
    Upload,
    Message,
    Sweep,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptEventRecord {
    pub timestamp_unix_ms: u64,
    pub kind: TranscriptEventKind,
    pub reason_code: String,
    #[serde(default)]
    pub room_id: String,
    #[serde(default)]
    pub participant_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(default)]
    pub record_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TranscriptEventLog {
    path: PathBuf,
    policy: LogRotationPolicy,
}

impl TranscriptEventLog {
    pub fn new(path: &Path, policy: LogRotationPolicy) -> Self {
        Self {
            path: path.to_path_buf(),
            policy,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, record: &TranscriptEventRecord) -> Result<()> {
        let line = serde_json::to_string(record).context("failed to encode transcript event")?;
        append_line_with_rotation(&self.path, &line, self.policy)
    }

    pub fn load(&self) -> Result<Vec<TranscriptEventRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        raw.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str::<TranscriptEventRecord>(line)
                    .with_context(|| format!("failed to parse {}", self.path.display()))
            })
            .collect()
    }
}
