//! Conversation-correlation engine for launcher support rooms.
//!
//! Uploaded diagnostic files open a transcript record; chat messages in the
//! same room are attributed to the open record(s) they belong to and appended
//! to them. Provides the artifact store, fingerprint index, session table,
//! pending attribution cache, the engine that orchestrates them, and the
//! replay/sweeper runtime used by the `mcsupport` binary.
//!
//! ```rust
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use mcsupport_transcript::parse_transcript_ingress_line;
//!
//! let raw = r#"{
//!   "type": "upload",
//!   "timestamp_ms": 1700000000000,
//!   "room_id": "help-1",
//!   "uploader_id": "user-1",
//!   "file": { "name": "crash.zip", "byte_size": 2048, "fetch_url": "https://cdn.example/crash.zip" }
//! }"#;
//!
//! let event = parse_transcript_ingress_line(raw)?;
//! assert_eq!(event.room_id(), "help-1");
//! assert_eq!(event.timestamp_ms(), 1_700_000_000_000);
//! # Ok(())
//! # }
//! ```

pub mod artifact_fetcher;
pub mod artifact_store;
pub mod correlation_engine;
pub mod fingerprint_index;
pub mod participant_roles;
pub mod pending_cache;
pub mod session_table;
pub mod transcript_config;
pub mod transcript_contract;
pub mod transcript_event_log;
pub mod transcript_runtime;

pub use artifact_fetcher::*;
pub use artifact_store::*;
pub use correlation_engine::*;
pub use fingerprint_index::*;
pub use participant_roles::*;
pub use pending_cache::*;
pub use session_table::*;
pub use transcript_config::*;
pub use transcript_contract::*;
pub use transcript_event_log::*;
pub use transcript_runtime::*;
