//! Inbound event contract for the transcript correlator.
//!
//! Defines the upload and message events the host bot feeds in, plus the
//! NDJSON ingress envelope used for replays. Validation mirrors what the host
//! transport guarantees so the engine only sees well-formed events.

use std::io::BufRead;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

pub const TRANSCRIPT_INGRESS_SCHEMA_VERSION: u32 = 1;

fn transcript_ingress_schema_version() -> u32 {
    TRANSCRIPT_INGRESS_SCHEMA_VERSION
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// File attached to an upload event.
pub struct FileDescriptor {
    pub name: String,
    pub byte_size: u64,
    pub fetch_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
/// One ordered piece of a chat message.
pub enum MessageSegment {
    Text {
        text: String,
    },
    Mention {
        participant_id: String,
    },
    Quote {
        author_id: String,
        #[serde(default)]
        message_id: String,
    },
    Image {
        name: String,
        fetch_url: String,
    },
}

impl MessageSegment {
    pub fn text(text: &str) -> Self {
        Self::Text {
            text: text.to_string(),
        }
    }

    pub fn mention(participant_id: &str) -> Self {
        Self::Mention {
            participant_id: participant_id.to_string(),
        }
    }

    pub fn quote(author_id: &str) -> Self {
        Self::Quote {
            author_id: author_id.to_string(),
            message_id: String::new(),
        }
    }

    pub fn image(name: &str, fetch_url: &str) -> Self {
        Self::Image {
            name: name.to_string(),
            fetch_url: fetch_url.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// Chat message as seen by the correlator.
pub struct MessageEvent {
    pub event_id: String,
    pub room_id: String,
    pub sender_id: String,
    #[serde(default)]
    pub segments: Vec<MessageSegment>,
}

impl MessageEvent {
    /// First mention wins; a quoted-reply author is only used when nobody is mentioned.
    pub fn explicit_target(&self) -> Option<&str> {
        let mention = self.segments.iter().find_map(|segment| match segment {
            MessageSegment::Mention { participant_id } if !participant_id.trim().is_empty() => {
                Some(participant_id.trim())
            }
            _ => None,
        });
        mention.or_else(|| {
            self.segments.iter().find_map(|segment| match segment {
                MessageSegment::Quote { author_id, .. } if !author_id.trim().is_empty() => {
                    Some(author_id.trim())
                }
                _ => None,
            })
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// NDJSON upload line.
pub struct UploadEnvelope {
    #[serde(default = "transcript_ingress_schema_version")]
    pub schema_version: u32,
    pub timestamp_ms: u64,
    pub room_id: String,
    pub uploader_id: String,
    pub file: FileDescriptor,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// NDJSON message line.
pub struct MessageEnvelope {
    #[serde(default = "transcript_ingress_schema_version")]
    pub schema_version: u32,
    pub timestamp_ms: u64,
    pub event: MessageEvent,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
/// One line of a transcript ingress file.
pub enum TranscriptIngressEvent {
    Upload(UploadEnvelope),
    Message(MessageEnvelope),
}

impl TranscriptIngressEvent {
    pub fn timestamp_ms(&self) -> u64 {
        match self {
            Self::Upload(upload) => upload.timestamp_ms,
            Self::Message(message) => message.timestamp_ms,
        }
    }

    pub fn room_id(&self) -> &str {
        match self {
            Self::Upload(upload) => &upload.room_id,
            Self::Message(message) => &message.event.room_id,
        }
    }

    fn schema_version(&self) -> u32 {
        match self {
            Self::Upload(upload) => upload.schema_version,
            Self::Message(message) => message.schema_version,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
/// Events loaded from an ingress file, with the count of lines that failed to parse.
pub struct TranscriptIngressLoadReport {
    pub events: Vec<TranscriptIngressEvent>,
    pub invalid_lines: usize,
}

pub fn parse_transcript_ingress_line(raw: &str) -> Result<TranscriptIngressEvent> {
    let event = serde_json::from_str::<TranscriptIngressEvent>(raw.trim())
        .context("failed to parse transcript ingress event")?;
    validate_transcript_ingress_event(&event)?;
    Ok(event)
}

pub fn load_transcript_ingress_events(path: &Path) -> Result<TranscriptIngressLoadReport> {
    let file =
        std::fs::File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let reader = std::io::BufReader::new(file);

    let mut report = TranscriptIngressLoadReport::default();
    for (index, line_result) in reader.lines().enumerate() {
        let line = line_result.with_context(|| format!("failed reading {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        match parse_transcript_ingress_line(&line) {
            Ok(event) => report.events.push(event),
            Err(error) => {
                tracing::warn!(
                    path = %path.display(),
                    line = index + 1,
                    error = %format!("{error:#}"),
                    "skipping invalid transcript ingress line"
                );
                report.invalid_lines = report.invalid_lines.saturating_add(1);
            }
        }
    }
    Ok(report)
}

pub fn validate_transcript_ingress_event(event: &TranscriptIngressEvent) -> Result<()> {
    if event.schema_version() != TRANSCRIPT_INGRESS_SCHEMA_VERSION {
        bail!(
            "ingress event has unsupported schema_version {} (expected {})",
            event.schema_version(),
            TRANSCRIPT_INGRESS_SCHEMA_VERSION
        );
    }
    if event.timestamp_ms() == 0 {
        bail!("ingress event has zero timestamp_ms");
    }
    match event {
        TranscriptIngressEvent::Upload(upload) => {
            if upload.room_id.trim().is_empty() {
                bail!("upload event has empty room_id");
            }
            if upload.uploader_id.trim().is_empty() {
                bail!("upload event has empty uploader_id");
            }
            validate_file_descriptor(&upload.file)
        }
        TranscriptIngressEvent::Message(message) => validate_message_event(&message.event),
    }
}

pub fn validate_message_event(event: &MessageEvent) -> Result<()> {
    if event.event_id.trim().is_empty() {
        bail!("message event has empty event_id");
    }
    if event.room_id.trim().is_empty() {
        bail!("message event has empty room_id");
    }
    if event.sender_id.trim().is_empty() {
        bail!("message event has empty sender_id");
    }
    if event.segments.is_empty() {
        bail!("message event must include at least one segment");
    }
    for segment in &event.segments {
        match segment {
            MessageSegment::Mention { participant_id } if participant_id.trim().is_empty() => {
                bail!("message event has mention with empty participant_id");
            }
            MessageSegment::Image { name, fetch_url } => {
                if name.trim().is_empty() {
                    bail!("message event has image with empty name");
                }
                validate_fetch_url(fetch_url, "image")?;
            }
            _ => {}
        }
    }
    Ok(())
}

fn validate_file_descriptor(file: &FileDescriptor) -> Result<()> {
    if file.name.trim().is_empty() {
        bail!("upload event has file with empty name");
    }
    validate_fetch_url(&file.fetch_url, "file")
}

fn validate_fetch_url(url: &str, label: &str) -> Result<()> {
    let url = url.trim();
    if !(url.starts_with("https://")
        || url.starts_with("http://localhost")
        || url.starts_with("http://127.0.0.1"))
    {
        bail!("{label} has invalid fetch_url '{url}'");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{
        load_transcript_ingress_events, parse_transcript_ingress_line, MessageEvent,
        MessageSegment, TranscriptIngressEvent,
    };

    fn message(segments: Vec<MessageSegment>) -> MessageEvent {
        MessageEvent {
            event_id: "m-1".to_string(),
            room_id: "help-1".to_string(),
            sender_id: "helper-1".to_string(),
            segments,
        }
    }

    #[test]
    fn unit_explicit_target_prefers_mention_over_quote() {
        let event = message(vec![
            MessageSegment::quote("user-quoted"),
            MessageSegment::text("try reinstalling java"),
            MessageSegment::mention("user-mentioned"),
        ]);
        assert_eq!(event.explicit_target(), Some("user-mentioned"));

        let quote_only = message(vec![
            MessageSegment::quote("user-quoted"),
            MessageSegment::text("same here"),
        ]);
        assert_eq!(quote_only.explicit_target(), Some("user-quoted"));

        let plain = message(vec![MessageSegment::text("anyone?")]);
        assert_eq!(plain.explicit_target(), None);
    }

    #[test]
    fn unit_parse_ingress_line_accepts_message_envelope() {
        let raw = r#"{"type":"message","timestamp_ms":5,"event":{"event_id":"m-9","room_id":"help-1","sender_id":"user-1","segments":[{"kind":"text","text":"it crashed"},{"kind":"mention","participant_id":"helper-1"}]}}"#;
        let event = parse_transcript_ingress_line(raw).expect("parse message");
        let TranscriptIngressEvent::Message(envelope) = event else {
            panic!("expected message envelope");
        };
        assert_eq!(envelope.event.segments.len(), 2);
        assert_eq!(envelope.event.explicit_target(), Some("helper-1"));
    }

    #[test]
    fn regression_parse_ingress_line_rejects_insecure_fetch_url() {
        let raw = r#"{"type":"upload","timestamp_ms":5,"room_id":"help-1","uploader_id":"user-1","file":{"name":"crash.zip","byte_size":3,"fetch_url":"ftp://files/crash.zip"}}"#;
        let error = parse_transcript_ingress_line(raw).expect_err("ftp url should fail");
        assert!(format!("{error:#}").contains("invalid fetch_url"));
    }

    #[test]
    fn regression_parse_ingress_line_rejects_zero_timestamp_and_empty_segments() {
        let zero = r#"{"type":"upload","timestamp_ms":0,"room_id":"help-1","uploader_id":"user-1","file":{"name":"crash.zip","byte_size":3,"fetch_url":"https://cdn/crash.zip"}}"#;
        assert!(parse_transcript_ingress_line(zero).is_err());

        let empty = r#"{"type":"message","timestamp_ms":5,"event":{"event_id":"m-1","room_id":"help-1","sender_id":"user-1","segments":[]}}"#;
        let error = parse_transcript_ingress_line(empty).expect_err("empty segments");
        assert!(error.to_string().contains("at least one segment"));
    }

    #[test]
    fn functional_ingress_loader_counts_invalid_lines_and_keeps_order() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("ingress.ndjson");
        let lines = [
            r#"{"type":"upload","timestamp_ms":1000,"room_id":"help-1","uploader_id":"user-1","file":{"name":"crash.zip","byte_size":3,"fetch_url":"https://cdn/crash.zip"}}"#,
            "not json",
            "",
            r#"{"type":"message","timestamp_ms":2000,"event":{"event_id":"m-1","room_id":"help-1","sender_id":"user-1","segments":[{"kind":"text","text":"log attached"}]}}"#,
        ];
        std::fs::write(&path, lines.join("\n")).expect("write ingress");

        let report = load_transcript_ingress_events(&path).expect("load");
        assert_eq!(report.invalid_lines, 1);
        assert_eq!(report.events.len(), 2);
        assert_eq!(report.events[0].timestamp_ms(), 1000);
        assert_eq!(report.events[1].timestamp_ms(), 2000);
    }
}
