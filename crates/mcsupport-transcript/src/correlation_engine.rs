//! Correlation engine: decides which transcript record(s) each room event belongs to.
//!
//! In-memory state (fingerprints, sessions, pending messages) lives behind a
//! single `std::sync::Mutex`. Handlers take the lock only in synchronous
//! sections and release it before awaiting a download; anything read after a
//! download is re-validated against the current state.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use mcsupport_core::Clock;
use serde::{Deserialize, Serialize};

use crate::artifact_fetcher::ArtifactFetcher;
use crate::artifact_store::{ArtifactStore, MessageEntry, NewTranscriptRecord};
use crate::fingerprint_index::{FingerprintEntry, FingerprintIndex, FingerprintKey};
use crate::participant_roles::PrivilegeOracle;
use crate::pending_cache::{PendingCache, PendingEntry};
use crate::session_table::{Session, SessionEviction, SessionKey, SessionTable};
use crate::transcript_config::{FingerprintSharing, TranscriptConfig, UploadRejection};
use crate::transcript_contract::{
    validate_message_event, FileDescriptor, MessageEvent, MessageSegment,
};
use crate::transcript_event_log::{TranscriptEventKind, TranscriptEventLog, TranscriptEventRecord};

pub const AMBIGUOUS_ATTRIBUTION_MARKER: &str = "[ambiguous] ";
const PENDING_IMAGE_QUALIFIER_PREFIX: &str = "pending";

pub const UPLOAD_REASON_RECORD_CREATED: &str = "upload_record_created";
pub const UPLOAD_REASON_FINGERPRINT_REUSED: &str = "upload_fingerprint_reused";
pub const UPLOAD_REASON_FETCH_ROLLED_BACK: &str = "upload_fetch_rolled_back";
pub const UPLOAD_REASON_RECORD_PERSIST_FAILED: &str = "upload_record_persist_failed";
pub const MESSAGE_REASON_ATTRIBUTED_SINGLE: &str = "message_attributed_single";
pub const MESSAGE_REASON_ATTRIBUTED_BROADCAST: &str = "message_attributed_broadcast";
pub const MESSAGE_REASON_DEFERRED_PENDING: &str = "message_deferred_pending";
pub const MESSAGE_REASON_UNATTRIBUTED: &str = "message_unattributed";
pub const MESSAGE_REASON_ROOM_NOT_RECORDED: &str = "message_room_not_recorded";
pub const MESSAGE_REASON_INVALID: &str = "message_invalid";
pub const MESSAGE_REASON_EMPTY_CONTENT: &str = "message_empty_content";
pub const PENDING_REASON_LINKED: &str = "pending_linked";
pub const PENDING_REASON_DISCARDED_STALE: &str = "pending_discarded_stale";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "record_ids", rename_all = "snake_case")]
/// Where a message went.
pub enum Attribution {
    None,
    Single(String),
    Broadcast(Vec<String>),
    /// No target yet; the message is parked in the pending cache.
    Deferred,
}

impl Attribution {
    pub fn record_ids(&self) -> Vec<String> {
        match self {
            Self::None | Self::Deferred => Vec::new(),
            Self::Single(record_id) => vec![record_id.clone()],
            Self::Broadcast(record_ids) => record_ids.clone(),
        }
    }

    pub fn is_attributed(&self) -> bool {
        matches!(self, Self::Single(_) | Self::Broadcast(_))
    }

    fn reason_code(&self) -> &'static str {
        match self {
            Self::None => MESSAGE_REASON_UNATTRIBUTED,
            Self::Single(_) => MESSAGE_REASON_ATTRIBUTED_SINGLE,
            Self::Broadcast(_) => MESSAGE_REASON_ATTRIBUTED_BROADCAST,
            Self::Deferred => MESSAGE_REASON_DEFERRED_PENDING,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Result of [`CorrelationEngine::register_upload`].
pub enum UploadOutcome {
    Created { record_id: String },
    Reused { record_id: String },
    Rejected(UploadRejection),
    RolledBack { record_id: String, error: String },
    PersistenceFailed { error: String },
}

impl UploadOutcome {
    /// The record the upload now belongs to, if it survived.
    pub fn record_id(&self) -> Option<&str> {
        match self {
            Self::Created { record_id } | Self::Reused { record_id } => Some(record_id),
            Self::Rejected(_) | Self::RolledBack { .. } | Self::PersistenceFailed { .. } => None,
        }
    }

    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Created { .. } => UPLOAD_REASON_RECORD_CREATED,
            Self::Reused { .. } => UPLOAD_REASON_FINGERPRINT_REUSED,
            Self::Rejected(rejection) => rejection.reason_code(),
            Self::RolledBack { .. } => UPLOAD_REASON_FETCH_ROLLED_BACK,
            Self::PersistenceFailed { .. } => UPLOAD_REASON_RECORD_PERSIST_FAILED,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
/// What a sweep retired.
pub struct SweepReport {
    pub evicted: Vec<SessionEviction>,
    pub discarded_pending: Vec<PendingEntry>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.evicted.is_empty() && self.discarded_pending.is_empty()
    }
}

#[derive(Debug)]
struct CorrelationState {
    fingerprints: FingerprintIndex,
    sessions: SessionTable,
    pending: PendingCache,
}

/// A record reserved by `register_upload` while its artifact downloads.
struct ReservedUpload<'a> {
    now_ms: u64,
    room_id: &'a str,
    uploader_id: &'a str,
    fingerprint: FingerprintKey,
    session_key: SessionKey,
    record_id: String,
    linked: Vec<PendingEntry>,
}

enum Resolution {
    Unattributed,
    Targets(Vec<(SessionKey, String)>),
    Deferred,
}

pub struct CorrelationEngine {
    config: TranscriptConfig,
    store: ArtifactStore,
    fetcher: Arc<dyn ArtifactFetcher>,
    privileges: Arc<dyn PrivilegeOracle>,
    clock: Arc<dyn Clock>,
    event_log: Option<TranscriptEventLog>,
    state: Mutex<CorrelationState>,
}

impl CorrelationEngine {
    /// Builds an engine over `store`, restoring the persisted fingerprint index.
    ///
    /// An unreadable index snapshot is logged and replaced by an empty one;
    /// re-uploads then simply create fresh records.
    pub fn new(
        config: TranscriptConfig,
        store: ArtifactStore,
        fetcher: Arc<dyn ArtifactFetcher>,
        privileges: Arc<dyn PrivilegeOracle>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let index_path = store.fingerprint_index_path();
        let fingerprints = match FingerprintIndex::load(&index_path) {
            Ok(index) => index,
            Err(error) => {
                tracing::warn!(
                    path = %index_path.display(),
                    error = %format!("{error:#}"),
                    "discarding unreadable fingerprint index"
                );
                FingerprintIndex::new()
            }
        };
        let sessions = SessionTable::new(
            config.conversation_window_ms(),
            config.privileged_reply_window_ms(),
        );
        Self {
            config,
            store,
            fetcher,
            privileges,
            clock,
            event_log: None,
            state: Mutex::new(CorrelationState {
                fingerprints,
                sessions,
                pending: PendingCache::new(),
            }),
        }
    }

    pub fn with_event_log(mut self, event_log: TranscriptEventLog) -> Self {
        self.event_log = Some(event_log);
        self
    }

    pub fn config(&self) -> &TranscriptConfig {
        &self.config
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn now_unix_ms(&self) -> u64 {
        self.clock.now_unix_ms()
    }

    pub fn session_for(&self, room_id: &str, participant_id: &str) -> Option<Session> {
        self.lock_state()
            .sessions
            .get(&SessionKey::new(room_id, participant_id))
            .cloned()
    }

    pub fn session_count(&self) -> usize {
        self.lock_state().sessions.len()
    }

    pub fn fingerprint_count(&self) -> usize {
        self.lock_state().fingerprints.len()
    }

    /// Record ids indexed under a fingerprint, oldest uploader first.
    pub fn fingerprint_records(&self, original_name: &str, byte_size: u64) -> Vec<String> {
        self.lock_state()
            .fingerprints
            .entries_for(&FingerprintKey::new(original_name, byte_size))
            .iter()
            .map(|entry| entry.record_id.clone())
            .collect()
    }

    pub fn pending_len(&self) -> usize {
        self.lock_state().pending.len()
    }

    pub fn pending_entry(&self, message_key: &str) -> Option<PendingEntry> {
        self.lock_state().pending.get(message_key).cloned()
    }

    /// Registers an uploaded diagnostic file and opens (or reuses) its record.
    pub async fn register_upload(
        &self,
        room_id: &str,
        uploader_id: &str,
        file: &FileDescriptor,
    ) -> UploadOutcome {
        let now_ms = self.clock.now_unix_ms();
        self.sweep_at(now_ms);

        let room_id = room_id.trim();
        let uploader_id = uploader_id.trim();
        if let Err(rejection) = self.config.check_upload(room_id, file) {
            tracing::debug!(
                room_id,
                uploader_id,
                file = %file.name,
                reason_code = rejection.reason_code(),
                "upload ignored"
            );
            let outcome = UploadOutcome::Rejected(rejection);
            self.record_upload_event(now_ms, room_id, uploader_id, &outcome, None);
            return outcome;
        }

        let fingerprint = FingerprintKey::for_file(file);
        let session_key = SessionKey::new(room_id, uploader_id);

        let reserved = {
            let mut state = self.lock_state();
            let mut reusable = None;
            for candidate in self.reuse_candidates(&state.fingerprints, &fingerprint, uploader_id) {
                if self.store.artifact_exists(&candidate.record_id)
                    && self.store.record_exists(&candidate.record_id)
                {
                    reusable = Some(candidate);
                    break;
                }
                tracing::debug!(
                    record_id = %candidate.record_id,
                    file = %fingerprint.original_name,
                    "dropping stale fingerprint without backing artifact"
                );
                state
                    .fingerprints
                    .remove_if_record(&fingerprint, &candidate.record_id);
            }
            if let Some(existing) = reusable {
                state
                    .sessions
                    .open(session_key, &existing.record_id, now_ms);
                let linked = self.take_linkable(
                    &mut state,
                    room_id,
                    std::slice::from_ref(&existing.record_id),
                    now_ms,
                );
                drop(state);
                self.flush_pending(&linked);
                tracing::debug!(
                    room_id,
                    uploader_id,
                    record_id = %existing.record_id,
                    reason_code = UPLOAD_REASON_FINGERPRINT_REUSED,
                    "upload matched known fingerprint"
                );
                let outcome = UploadOutcome::Reused {
                    record_id: existing.record_id,
                };
                self.record_upload_event(now_ms, room_id, uploader_id, &outcome, None);
                return outcome;
            }

            let record = match self.store.create_record(&NewTranscriptRecord {
                original_name: file.name.trim(),
                byte_size: file.byte_size,
                uploader_id,
                room_id,
                created_unix_ms: now_ms,
            }) {
                Ok(record) => record,
                Err(error) => {
                    drop(state);
                    tracing::warn!(
                        room_id,
                        uploader_id,
                        file = %file.name,
                        error = %error,
                        "failed to persist transcript record"
                    );
                    let outcome = UploadOutcome::PersistenceFailed {
                        error: error.to_string(),
                    };
                    self.record_upload_event(now_ms, room_id, uploader_id, &outcome, None);
                    return outcome;
                }
            };
            state.fingerprints.insert(
                fingerprint.clone(),
                FingerprintEntry {
                    record_id: record.record_id.clone(),
                    uploader_id: uploader_id.to_string(),
                },
            );
            if let Some(previous) =
                state
                    .sessions
                    .open(session_key.clone(), &record.record_id, now_ms)
            {
                tracing::debug!(
                    room_id,
                    uploader_id,
                    previous_record_id = %previous.record_id,
                    "new upload superseded open session"
                );
            }
            let linked = self.take_linkable(
                &mut state,
                room_id,
                std::slice::from_ref(&record.record_id),
                now_ms,
            );
            self.save_fingerprints(&state.fingerprints);
            ReservedUpload {
                now_ms,
                room_id,
                uploader_id,
                fingerprint,
                session_key,
                record_id: record.record_id,
                linked,
            }
        };
        self.flush_pending(&reserved.linked);

        let persisted = match self.fetcher.fetch_bytes(&file.fetch_url).await {
            Ok(bytes) => self
                .store
                .write_artifact(&reserved.record_id, &bytes)
                .map_err(|error| error.to_string()),
            Err(error) => Err(error.to_string()),
        };
        match persisted {
            Ok(digest) => {
                tracing::debug!(
                    room_id,
                    uploader_id,
                    record_id = %reserved.record_id,
                    bytes = digest.bytes,
                    reason_code = UPLOAD_REASON_RECORD_CREATED,
                    "transcript record created"
                );
                let outcome = UploadOutcome::Created {
                    record_id: reserved.record_id,
                };
                self.record_upload_event(now_ms, room_id, uploader_id, &outcome, None);
                outcome
            }
            Err(error) => self.roll_back_upload(reserved, error),
        }
    }

    /// Resolves where `event` would be attributed right now without touching any state.
    pub fn attribute(&self, event: &MessageEvent) -> Attribution {
        let now_ms = self.clock.now_unix_ms();
        let state = self.lock_state();
        let privileged = self.privileges.is_privileged(&event.sender_id);
        attribution_for(self.resolve(&state, event, privileged, now_ms))
    }

    /// Attributes a chat message, refreshes the sessions it lands in, and
    /// appends its rendered content to the matching record(s).
    pub async fn handle_message(&self, event: &MessageEvent) -> Attribution {
        let now_ms = self.clock.now_unix_ms();
        self.sweep_at(now_ms);

        if let Err(error) = validate_message_event(event) {
            tracing::debug!(
                event_id = %event.event_id,
                error = %format!("{error:#}"),
                reason_code = MESSAGE_REASON_INVALID,
                "message ignored"
            );
            self.record_message_event(now_ms, event, MESSAGE_REASON_INVALID, &[]);
            return Attribution::None;
        }
        let room_id = event.room_id.trim();
        if !self.config.is_room_recorded(room_id) {
            tracing::debug!(
                room_id,
                event_id = %event.event_id,
                reason_code = MESSAGE_REASON_ROOM_NOT_RECORDED,
                "message ignored"
            );
            self.record_message_event(now_ms, event, MESSAGE_REASON_ROOM_NOT_RECORDED, &[]);
            return Attribution::None;
        }

        let sender_id = event.sender_id.trim();
        let privileged = self.privileges.is_privileged(sender_id);
        let (attribution, linked) = {
            let mut state = self.lock_state();
            match self.resolve(&state, event, privileged, now_ms) {
                Resolution::Targets(targets) => {
                    // A broadcast retires reply timers; only a direct answer starts one.
                    let direct = targets.len() == 1;
                    for (key, _) in &targets {
                        if privileged && direct && key.participant_id != sender_id {
                            state.sessions.record_privileged_activity(key, now_ms);
                        } else {
                            state.sessions.record_owner_activity(key, now_ms);
                        }
                    }
                    let record_ids = targets
                        .into_iter()
                        .map(|(_, record_id)| record_id)
                        .collect::<Vec<_>>();
                    let linked = self.take_linkable(&mut state, room_id, &record_ids, now_ms);
                    (attribution_for_records(record_ids), linked)
                }
                resolution => (attribution_for(resolution), Vec::new()),
            }
        };
        self.flush_pending(&linked);

        let record_ids = attribution.record_ids();
        let qualifier = match (&attribution, record_ids.first()) {
            (Attribution::Deferred, _) => {
                format!("{PENDING_IMAGE_QUALIFIER_PREFIX}-{}", event.event_id.trim())
            }
            (_, Some(record_id)) => format!("{record_id}-{}", event.event_id.trim()),
            (_, None) => {
                tracing::debug!(
                    room_id,
                    sender_id,
                    event_id = %event.event_id,
                    reason_code = MESSAGE_REASON_UNATTRIBUTED,
                    "message not attributed"
                );
                self.record_message_event(now_ms, event, MESSAGE_REASON_UNATTRIBUTED, &[]);
                return Attribution::None;
            }
        };

        let content = self.render_content(event, &qualifier).await;
        if content.is_empty() {
            tracing::debug!(
                room_id,
                sender_id,
                event_id = %event.event_id,
                reason_code = MESSAGE_REASON_EMPTY_CONTENT,
                "attributed message had no content to record"
            );
            self.record_message_event(now_ms, event, MESSAGE_REASON_EMPTY_CONTENT, &record_ids);
            return match attribution {
                Attribution::Deferred => Attribution::None,
                other => other,
            };
        }

        let content = match &attribution {
            Attribution::Broadcast(_) => format!("{AMBIGUOUS_ATTRIBUTION_MARKER}{content}"),
            _ => content,
        };
        let entry = MessageEntry {
            content,
            author_id: sender_id.to_string(),
            timestamp_unix_ms: now_ms,
        };

        if attribution == Attribution::Deferred {
            self.park_pending(event, entry, now_ms);
        } else {
            for record_id in &record_ids {
                self.append_entries(record_id, std::slice::from_ref(&entry));
            }
        }
        tracing::debug!(
            room_id,
            sender_id,
            event_id = %event.event_id,
            records = record_ids.len(),
            reason_code = attribution.reason_code(),
            "message attributed"
        );
        self.record_message_event(now_ms, event, attribution.reason_code(), &record_ids);
        attribution
    }

    /// Fires due eviction timers and discards pending messages past the recency window.
    pub fn sweep(&self) -> SweepReport {
        self.sweep_at(self.clock.now_unix_ms())
    }

    fn sweep_at(&self, now_ms: u64) -> SweepReport {
        let report = {
            let mut state = self.lock_state();
            SweepReport {
                evicted: state.sessions.expire_due(now_ms),
                discarded_pending: state
                    .pending
                    .discard_stale(now_ms, self.config.recency_window_ms()),
            }
        };
        for eviction in &report.evicted {
            tracing::debug!(
                room_id = %eviction.key.room_id,
                participant_id = %eviction.key.participant_id,
                record_id = %eviction.record_id,
                reason_code = eviction.reason.as_str(),
                "session evicted"
            );
            self.record_event(TranscriptEventRecord {
                timestamp_unix_ms: now_ms,
                kind: TranscriptEventKind::Sweep,
                reason_code: eviction.reason.as_str().to_string(),
                room_id: eviction.key.room_id.clone(),
                participant_id: eviction.key.participant_id.clone(),
                event_id: None,
                record_ids: vec![eviction.record_id.clone()],
                detail: None,
            });
        }
        for entry in &report.discarded_pending {
            tracing::debug!(
                room_id = %entry.room_id,
                message_key = %entry.message_key,
                reason_code = PENDING_REASON_DISCARDED_STALE,
                "pending message discarded"
            );
            self.record_event(TranscriptEventRecord {
                timestamp_unix_ms: now_ms,
                kind: TranscriptEventKind::Sweep,
                reason_code: PENDING_REASON_DISCARDED_STALE.to_string(),
                room_id: entry.room_id.clone(),
                participant_id: entry.message.author_id.clone(),
                event_id: Some(entry.message_key.clone()),
                record_ids: Vec::new(),
                detail: None,
            });
        }
        report
    }

    fn resolve(
        &self,
        state: &CorrelationState,
        event: &MessageEvent,
        privileged: bool,
        now_ms: u64,
    ) -> Resolution {
        let room_id = event.room_id.trim();
        let sender_id = event.sender_id.trim();
        let conversation_window_ms = self.config.conversation_window_ms();
        let live_session = |participant_id: &str| {
            let key = SessionKey::new(room_id, participant_id);
            state
                .sessions
                .get(&key)
                .filter(|session| session.is_within(now_ms, conversation_window_ms))
                .map(|session| (key.clone(), session.record_id.clone()))
        };

        match (privileged, event.explicit_target()) {
            (true, Some(target)) => match live_session(target) {
                Some(target) => Resolution::Targets(vec![target]),
                None => Resolution::Unattributed,
            },
            (true, None) => {
                let active = state.sessions.active_in_room(
                    room_id,
                    now_ms,
                    self.config.recency_window_ms(),
                );
                if active.is_empty() {
                    Resolution::Deferred
                } else {
                    Resolution::Targets(active)
                }
            }
            (false, Some(target)) if target != sender_id => Resolution::Unattributed,
            (false, _) => match live_session(sender_id) {
                Some(own) => Resolution::Targets(vec![own]),
                None => Resolution::Unattributed,
            },
        }
    }

    /// Entries an upload may reuse, the uploader's own first.
    fn reuse_candidates(
        &self,
        fingerprints: &FingerprintIndex,
        key: &FingerprintKey,
        uploader_id: &str,
    ) -> Vec<FingerprintEntry> {
        let entries = fingerprints.entries_for(key);
        let own = entries
            .iter()
            .filter(|entry| entry.uploader_id == uploader_id);
        match self.config.fingerprint_sharing {
            FingerprintSharing::ForkPerUploader => own.cloned().collect(),
            FingerprintSharing::Shared => own
                .chain(
                    entries
                        .iter()
                        .filter(|entry| entry.uploader_id != uploader_id),
                )
                .cloned()
                .collect(),
        }
    }

    fn take_linkable(
        &self,
        state: &mut CorrelationState,
        room_id: &str,
        record_ids: &[String],
        now_ms: u64,
    ) -> Vec<PendingEntry> {
        state
            .pending
            .take_linkable(room_id, record_ids, now_ms, self.config.recency_window_ms())
    }

    fn flush_pending(&self, linked: &[PendingEntry]) {
        for entry in linked {
            for record_id in &entry.candidate_record_ids {
                self.append_entries(record_id, std::slice::from_ref(&entry.message));
            }
            tracing::debug!(
                room_id = %entry.room_id,
                message_key = %entry.message_key,
                records = entry.candidate_record_ids.len(),
                reason_code = PENDING_REASON_LINKED,
                "pending message linked"
            );
            self.record_event(TranscriptEventRecord {
                timestamp_unix_ms: entry.timestamp_ms,
                kind: TranscriptEventKind::Message,
                reason_code: PENDING_REASON_LINKED.to_string(),
                room_id: entry.room_id.clone(),
                participant_id: entry.message.author_id.clone(),
                event_id: Some(entry.message_key.clone()),
                record_ids: entry.candidate_record_ids.clone(),
                detail: None,
            });
        }
    }

    /// Parks a message that had no target; links it right away if a session
    /// in the room became active while its images were downloading.
    fn park_pending(&self, event: &MessageEvent, entry: MessageEntry, arrived_ms: u64) {
        let room_id = event.room_id.trim();
        let message_key = event.event_id.trim();
        let linked = {
            let mut state = self.lock_state();
            if !state
                .pending
                .insert(message_key, room_id, entry, arrived_ms)
            {
                tracing::debug!(room_id, message_key, "pending message already cached");
                return;
            }
            let now_ms = self.clock.now_unix_ms();
            let active = state.sessions.active_in_room(
                room_id,
                now_ms,
                self.config.recency_window_ms(),
            );
            if active.is_empty() {
                return;
            }
            let record_ids = active
                .into_iter()
                .map(|(_, record_id)| record_id)
                .collect::<Vec<_>>();
            self.take_linkable(&mut state, room_id, &record_ids, now_ms)
        };
        self.flush_pending(&linked);
    }

    async fn render_content(&self, event: &MessageEvent, qualifier: &str) -> String {
        let mut parts = Vec::with_capacity(event.segments.len());
        for segment in &event.segments {
            match segment {
                MessageSegment::Text { text } => {
                    let text = text.trim();
                    if !text.is_empty() {
                        parts.push(text.to_string());
                    }
                }
                MessageSegment::Mention { .. } | MessageSegment::Quote { .. } => {}
                MessageSegment::Image { name, fetch_url } => {
                    parts.push(self.render_image(qualifier, name, fetch_url).await);
                }
            }
        }
        parts.join(" ")
    }

    async fn render_image(&self, qualifier: &str, name: &str, fetch_url: &str) -> String {
        let unavailable = || format!("[image-unavailable:{}]", name.trim());
        let bytes = match self.fetcher.fetch_bytes(fetch_url).await {
            Ok(bytes) => bytes,
            Err(error) => {
                tracing::warn!(image = name, error = %error, "image download failed");
                return unavailable();
            }
        };
        match self.store.write_image(qualifier, name, &bytes) {
            Ok(stored_name) => format!("[image:{stored_name}]"),
            Err(error) => {
                tracing::warn!(image = name, error = %error, "failed to store image");
                unavailable()
            }
        }
    }

    fn append_entries(&self, record_id: &str, entries: &[MessageEntry]) {
        if let Err(error) = self.store.append_messages(record_id, entries) {
            tracing::warn!(
                record_id,
                error = %error,
                "failed to append to transcript record"
            );
        }
    }

    /// Undoes a reservation whose artifact never arrived. Pending messages it
    /// had linked go back to the cache so a later session can still claim them.
    fn roll_back_upload(&self, upload: ReservedUpload<'_>, error: String) -> UploadOutcome {
        let ReservedUpload {
            now_ms,
            room_id,
            uploader_id,
            fingerprint,
            session_key,
            record_id,
            linked,
        } = upload;
        let restored = linked.len();
        {
            let mut state = self.lock_state();
            state.fingerprints.remove_if_record(&fingerprint, &record_id);
            state.sessions.remove_if_record(&session_key, &record_id);
            state.pending.restore(linked);
            self.save_fingerprints(&state.fingerprints);
        }
        if let Err(delete_error) = self.store.delete_record(&record_id) {
            tracing::warn!(
                record_id = %record_id,
                error = %delete_error,
                "failed to delete rolled back record"
            );
        }
        tracing::warn!(
            room_id,
            uploader_id,
            record_id = %record_id,
            error = %error,
            restored_pending = restored,
            reason_code = UPLOAD_REASON_FETCH_ROLLED_BACK,
            "artifact download failed; upload rolled back"
        );
        let detail = Some(error.clone());
        let outcome = UploadOutcome::RolledBack { record_id, error };
        self.record_upload_event(now_ms, room_id, uploader_id, &outcome, detail);
        outcome
    }

    fn save_fingerprints(&self, fingerprints: &FingerprintIndex) {
        let path = self.store.fingerprint_index_path();
        if let Err(error) = fingerprints.save(&path) {
            tracing::warn!(
                path = %path.display(),
                error = %format!("{error:#}"),
                "failed to persist fingerprint index"
            );
        }
    }

    fn record_upload_event(
        &self,
        now_ms: u64,
        room_id: &str,
        uploader_id: &str,
        outcome: &UploadOutcome,
        detail: Option<String>,
    ) {
        let record_ids = match outcome {
            UploadOutcome::RolledBack { record_id, .. } => vec![record_id.clone()],
            other => other.record_id().map(str::to_string).into_iter().collect(),
        };
        self.record_event(TranscriptEventRecord {
            timestamp_unix_ms: now_ms,
            kind: TranscriptEventKind::Upload,
            reason_code: outcome.reason_code().to_string(),
            room_id: room_id.to_string(),
            participant_id: uploader_id.to_string(),
            event_id: None,
            record_ids,
            detail,
        });
    }

    fn record_message_event(
        &self,
        now_ms: u64,
        event: &MessageEvent,
        reason_code: &str,
        record_ids: &[String],
    ) {
        self.record_event(TranscriptEventRecord {
            timestamp_unix_ms: now_ms,
            kind: TranscriptEventKind::Message,
            reason_code: reason_code.to_string(),
            room_id: event.room_id.trim().to_string(),
            participant_id: event.sender_id.trim().to_string(),
            event_id: Some(event.event_id.trim().to_string()),
            record_ids: record_ids.to_vec(),
            detail: None,
        });
    }

    fn record_event(&self, record: TranscriptEventRecord) {
        let Some(event_log) = &self.event_log else {
            return;
        };
        if let Err(error) = event_log.append(&record) {
            tracing::warn!(
                path = %event_log.path().display(),
                error = %format!("{error:#}"),
                "failed to append transcript event"
            );
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, CorrelationState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn attribution_for(resolution: Resolution) -> Attribution {
    match resolution {
        Resolution::Unattributed => Attribution::None,
        Resolution::Deferred => Attribution::Deferred,
        Resolution::Targets(targets) => attribution_for_records(
            targets
                .into_iter()
                .map(|(_, record_id)| record_id)
                .collect(),
        ),
    }
}

fn attribution_for_records(mut record_ids: Vec<String>) -> Attribution {
    match record_ids.len() {
        0 => Attribution::None,
        1 => Attribution::Single(record_ids.remove(0)),
        _ => Attribution::Broadcast(record_ids),
    }
}
