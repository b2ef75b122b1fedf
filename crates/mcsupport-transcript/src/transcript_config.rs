use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::transcript_contract::FileDescriptor;

pub const TRANSCRIPT_CONFIG_SCHEMA_VERSION: u32 = 1;
pub const TRANSCRIPT_CONFIG_FILE_NAME: &str = "transcript-config.json";
pub const RECORDED_ROOMS_WILDCARD: &str = "*";

const DEFAULT_MAX_FILE_BYTES: u64 = 16 * 1024 * 1024;
const DEFAULT_CONVERSATION_WINDOW_SECS: u64 = 600;
const DEFAULT_RECENCY_WINDOW_SECS: u64 = 120;
const DEFAULT_ALLOWED_EXTENSIONS: &[&str] = &["zip", "log", "txt", "gz"];

const UPLOAD_REASON_ROOM_NOT_RECORDED: &str = "upload_room_not_recorded";
const UPLOAD_REASON_EMPTY_NAME: &str = "upload_empty_name";
const UPLOAD_REASON_OVERSIZED: &str = "upload_oversized";
const UPLOAD_REASON_DISALLOWED_EXTENSION: &str = "upload_disallowed_extension";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
/// What happens when a different uploader re-posts an already indexed artifact.
pub enum FingerprintSharing {
    /// Open a fresh record for the new uploader.
    #[default]
    ForkPerUploader,
    /// Reuse the existing record, merging both uploaders' conversations.
    Shared,
}

impl FingerprintSharing {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ForkPerUploader => "fork_per_uploader",
            Self::Shared => "shared",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// Tunables for upload validation, session windows, and room/role scoping.
pub struct TranscriptConfig {
    #[serde(default = "transcript_config_schema_version")]
    pub schema_version: u32,
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
    #[serde(default = "default_allowed_extensions")]
    pub allowed_extensions: Vec<String>,
    #[serde(default = "default_conversation_window_secs")]
    pub conversation_window_secs: u64,
    #[serde(default = "default_recency_window_secs")]
    pub recency_window_secs: u64,
    #[serde(default)]
    pub privileged_reply_window_secs: Option<u64>,
    #[serde(default = "default_recorded_rooms")]
    pub recorded_rooms: Vec<String>,
    #[serde(default)]
    pub privileged_participants: Vec<String>,
    #[serde(default)]
    pub fingerprint_sharing: FingerprintSharing,
}

fn transcript_config_schema_version() -> u32 {
    TRANSCRIPT_CONFIG_SCHEMA_VERSION
}

fn default_max_file_bytes() -> u64 {
    DEFAULT_MAX_FILE_BYTES
}

fn default_allowed_extensions() -> Vec<String> {
    DEFAULT_ALLOWED_EXTENSIONS
        .iter()
        .map(|extension| extension.to_string())
        .collect()
}

fn default_conversation_window_secs() -> u64 {
    DEFAULT_CONVERSATION_WINDOW_SECS
}

fn default_recency_window_secs() -> u64 {
    DEFAULT_RECENCY_WINDOW_SECS
}

fn default_recorded_rooms() -> Vec<String> {
    vec![RECORDED_ROOMS_WILDCARD.to_string()]
}

impl Default for TranscriptConfig {
    fn default() -> Self {
        Self {
            schema_version: TRANSCRIPT_CONFIG_SCHEMA_VERSION,
            max_file_bytes: DEFAULT_MAX_FILE_BYTES,
            allowed_extensions: default_allowed_extensions(),
            conversation_window_secs: DEFAULT_CONVERSATION_WINDOW_SECS,
            recency_window_secs: DEFAULT_RECENCY_WINDOW_SECS,
            privileged_reply_window_secs: None,
            recorded_rooms: default_recorded_rooms(),
            privileged_participants: Vec::new(),
            fingerprint_sharing: FingerprintSharing::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Why an upload was dropped before any record was created.
pub enum UploadRejection {
    RoomNotRecorded,
    EmptyName,
    Oversized { byte_size: u64, max_file_bytes: u64 },
    DisallowedExtension { extension: Option<String> },
}

impl UploadRejection {
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::RoomNotRecorded => UPLOAD_REASON_ROOM_NOT_RECORDED,
            Self::EmptyName => UPLOAD_REASON_EMPTY_NAME,
            Self::Oversized { .. } => UPLOAD_REASON_OVERSIZED,
            Self::DisallowedExtension { .. } => UPLOAD_REASON_DISALLOWED_EXTENSION,
        }
    }
}

impl TranscriptConfig {
    pub fn conversation_window_ms(&self) -> u64 {
        self.conversation_window_secs.saturating_mul(1_000)
    }

    pub fn recency_window_ms(&self) -> u64 {
        self.recency_window_secs.saturating_mul(1_000)
    }

    pub fn privileged_reply_window_ms(&self) -> Option<u64> {
        self.privileged_reply_window_secs
            .map(|secs| secs.saturating_mul(1_000))
    }

    pub fn is_room_recorded(&self, room_id: &str) -> bool {
        let room_id = room_id.trim();
        self.recorded_rooms
            .iter()
            .any(|room| room == RECORDED_ROOMS_WILDCARD || room.trim() == room_id)
    }

    pub fn is_extension_allowed(&self, file_name: &str) -> bool {
        let Some(extension) = file_extension(file_name) else {
            return false;
        };
        self.allowed_extensions
            .iter()
            .any(|allowed| allowed.trim().trim_start_matches('.').eq_ignore_ascii_case(&extension))
    }

    pub fn check_upload(
        &self,
        room_id: &str,
        file: &FileDescriptor,
    ) -> std::result::Result<(), UploadRejection> {
        if !self.is_room_recorded(room_id) {
            return Err(UploadRejection::RoomNotRecorded);
        }
        if file.name.trim().is_empty() {
            return Err(UploadRejection::EmptyName);
        }
        if file.byte_size > self.max_file_bytes {
            return Err(UploadRejection::Oversized {
                byte_size: file.byte_size,
                max_file_bytes: self.max_file_bytes,
            });
        }
        if !self.is_extension_allowed(&file.name) {
            return Err(UploadRejection::DisallowedExtension {
                extension: file_extension(&file.name),
            });
        }
        Ok(())
    }
}

fn file_extension(file_name: &str) -> Option<String> {
    let (stem, extension) = file_name.trim().rsplit_once('.')?;
    if stem.is_empty() || extension.trim().is_empty() {
        return None;
    }
    Some(extension.trim().to_ascii_lowercase())
}

pub fn transcript_config_path_for_state_dir(state_dir: &Path) -> PathBuf {
    state_dir.join(TRANSCRIPT_CONFIG_FILE_NAME)
}

pub fn load_transcript_config_file(path: &Path) -> Result<TranscriptConfig> {
    if !path.exists() {
        return Ok(TranscriptConfig::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read transcript config {}", path.display()))?;
    let parsed = serde_json::from_str::<TranscriptConfig>(&raw)
        .with_context(|| format!("failed to parse transcript config {}", path.display()))?;
    validate_transcript_config(&parsed)
        .with_context(|| format!("invalid transcript config {}", path.display()))?;
    Ok(parsed)
}

pub fn validate_transcript_config(config: &TranscriptConfig) -> Result<()> {
    if config.schema_version != TRANSCRIPT_CONFIG_SCHEMA_VERSION {
        bail!(
            "unsupported transcript config schema_version {} (expected {})",
            config.schema_version,
            TRANSCRIPT_CONFIG_SCHEMA_VERSION
        );
    }
    if config.max_file_bytes == 0 {
        bail!("max_file_bytes must be greater than 0");
    }
    if config.conversation_window_secs == 0 || config.recency_window_secs == 0 {
        bail!("conversation and recency windows must be greater than 0");
    }
    if config.recency_window_secs > config.conversation_window_secs {
        bail!(
            "recency_window_secs ({}) must not exceed conversation_window_secs ({})",
            config.recency_window_secs,
            config.conversation_window_secs
        );
    }
    if config.privileged_reply_window_secs == Some(0) {
        bail!("privileged_reply_window_secs must be greater than 0 when set");
    }
    if config
        .allowed_extensions
        .iter()
        .all(|extension| extension.trim().trim_start_matches('.').is_empty())
    {
        bail!("allowed_extensions must include at least one extension");
    }
    if config.recorded_rooms.iter().any(|room| room.trim().is_empty()) {
        bail!("recorded_rooms must not contain empty room ids");
    }
    Ok(())
}
