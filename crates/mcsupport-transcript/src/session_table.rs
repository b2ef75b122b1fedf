//! Live binding of `(room, participant)` to the record they currently have open.
//!
//! Each session owns up to two eviction timers, kept in one deadline-ordered
//! queue. Every mutator that reschedules a timer first removes the queue entry
//! it replaces, so a stale deadline can never evict a refreshed session.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub room_id: String,
    pub participant_id: String,
}

impl SessionKey {
    pub fn new(room_id: &str, participant_id: &str) -> Self {
        Self {
            room_id: room_id.trim().to_string(),
            participant_id: participant_id.trim().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub record_id: String,
    pub last_activity_ms: u64,
    conversation_deadline_ms: u64,
    privileged_reply_deadline_ms: Option<u64>,
}

impl Session {
    pub fn conversation_deadline_ms(&self) -> u64 {
        self.conversation_deadline_ms
    }

    pub fn privileged_reply_deadline_ms(&self) -> Option<u64> {
        self.privileged_reply_deadline_ms
    }

    pub fn is_within(&self, now_ms: u64, window_ms: u64) -> bool {
        now_ms.saturating_sub(self.last_activity_ms) < window_ms
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionReason {
    ConversationWindowElapsed,
    PrivilegedReplyElapsed,
    Superseded,
}

impl EvictionReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConversationWindowElapsed => "session_evicted_conversation_window",
            Self::PrivilegedReplyElapsed => "session_evicted_privileged_reply",
            Self::Superseded => "session_superseded",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionEviction {
    pub key: SessionKey,
    pub record_id: String,
    pub reason: EvictionReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
enum TimerKind {
    ConversationWindow,
    PrivilegedReply,
}

impl TimerKind {
    fn eviction_reason(self) -> EvictionReason {
        match self {
            Self::ConversationWindow => EvictionReason::ConversationWindowElapsed,
            Self::PrivilegedReply => EvictionReason::PrivilegedReplyElapsed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct TimerEntry {
    deadline_ms: u64,
    key: SessionKey,
    kind: TimerKind,
}

#[derive(Debug, Clone)]
pub struct SessionTable {
    sessions: BTreeMap<SessionKey, Session>,
    timers: BTreeSet<TimerEntry>,
    conversation_window_ms: u64,
    privileged_reply_window_ms: Option<u64>,
}

impl SessionTable {
    pub fn new(conversation_window_ms: u64, privileged_reply_window_ms: Option<u64>) -> Self {
        Self {
            sessions: BTreeMap::new(),
            timers: BTreeSet::new(),
            conversation_window_ms: conversation_window_ms.max(1),
            privileged_reply_window_ms: privileged_reply_window_ms.map(|window| window.max(1)),
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn get(&self, key: &SessionKey) -> Option<&Session> {
        self.sessions.get(key)
    }

    pub fn pending_timers(&self) -> usize {
        self.timers.len()
    }

    pub fn next_deadline_ms(&self) -> Option<u64> {
        self.timers.first().map(|timer| timer.deadline_ms)
    }

    /// Binds `key` to `record_id`, returning the session it supersedes (if any).
    pub fn open(&mut self, key: SessionKey, record_id: &str, now_ms: u64) -> Option<Session> {
        let previous = self.remove(&key);
        let conversation_deadline_ms = now_ms.saturating_add(self.conversation_window_ms);
        self.timers.insert(TimerEntry {
            deadline_ms: conversation_deadline_ms,
            key: key.clone(),
            kind: TimerKind::ConversationWindow,
        });
        self.sessions.insert(
            key,
            Session {
                record_id: record_id.to_string(),
                last_activity_ms: now_ms,
                conversation_deadline_ms,
                privileged_reply_deadline_ms: None,
            },
        );
        previous
    }

    /// The owner spoke, or a helper broadcast reached the session: refresh and
    /// stop any privileged-reply countdown.
    pub fn record_owner_activity(&mut self, key: &SessionKey, now_ms: u64) -> bool {
        if !self.refresh(key, now_ms) {
            return false;
        }
        self.cancel_privileged_reply(key);
        true
    }

    /// A helper answered this session directly: refresh and restart the
    /// privileged-reply countdown when that timer is configured.
    pub fn record_privileged_activity(&mut self, key: &SessionKey, now_ms: u64) -> bool {
        if !self.refresh(key, now_ms) {
            return false;
        }
        self.cancel_privileged_reply(key);
        let Some(window_ms) = self.privileged_reply_window_ms else {
            return true;
        };
        let deadline_ms = now_ms.saturating_add(window_ms);
        if let Some(session) = self.sessions.get_mut(key) {
            session.privileged_reply_deadline_ms = Some(deadline_ms);
            self.timers.insert(TimerEntry {
                deadline_ms,
                key: key.clone(),
                kind: TimerKind::PrivilegedReply,
            });
        }
        true
    }

    pub fn remove(&mut self, key: &SessionKey) -> Option<Session> {
        let session = self.sessions.remove(key)?;
        self.timers.remove(&TimerEntry {
            deadline_ms: session.conversation_deadline_ms,
            key: key.clone(),
            kind: TimerKind::ConversationWindow,
        });
        if let Some(deadline_ms) = session.privileged_reply_deadline_ms {
            self.timers.remove(&TimerEntry {
                deadline_ms,
                key: key.clone(),
                kind: TimerKind::PrivilegedReply,
            });
        }
        Some(session)
    }

    /// Removes the session only while it still points at `record_id`.
    pub fn remove_if_record(&mut self, key: &SessionKey, record_id: &str) -> bool {
        if self
            .sessions
            .get(key)
            .is_some_and(|session| session.record_id == record_id)
        {
            self.remove(key);
            return true;
        }
        false
    }

    /// Sessions in `room_id` whose last activity is within `window_ms`, ordered by participant.
    pub fn active_in_room(
        &self,
        room_id: &str,
        now_ms: u64,
        window_ms: u64,
    ) -> Vec<(SessionKey, String)> {
        self.sessions
            .iter()
            .filter(|(key, session)| key.room_id == room_id && session.is_within(now_ms, window_ms))
            .map(|(key, session)| (key.clone(), session.record_id.clone()))
            .collect()
    }

    /// Fires every timer due at `now_ms` and returns the sessions it retired.
    pub fn expire_due(&mut self, now_ms: u64) -> Vec<SessionEviction> {
        let mut evictions = Vec::new();
        while let Some(timer) = self.timers.first().cloned() {
            if timer.deadline_ms > now_ms {
                break;
            }
            self.timers.remove(&timer);
            let still_scheduled = self.sessions.get(&timer.key).is_some_and(|session| {
                match timer.kind {
                    TimerKind::ConversationWindow => {
                        session.conversation_deadline_ms == timer.deadline_ms
                    }
                    TimerKind::PrivilegedReply => {
                        session.privileged_reply_deadline_ms == Some(timer.deadline_ms)
                    }
                }
            });
            if !still_scheduled {
                continue;
            }
            if let Some(session) = self.remove(&timer.key) {
                evictions.push(SessionEviction {
                    key: timer.key,
                    record_id: session.record_id,
                    reason: timer.kind.eviction_reason(),
                });
            }
        }
        evictions
    }

    fn refresh(&mut self, key: &SessionKey, now_ms: u64) -> bool {
        let Some(session) = self.sessions.get_mut(key) else {
            return false;
        };
        self.timers.remove(&TimerEntry {
            deadline_ms: session.conversation_deadline_ms,
            key: key.clone(),
            kind: TimerKind::ConversationWindow,
        });
        session.last_activity_ms = now_ms;
        session.conversation_deadline_ms = now_ms.saturating_add(self.conversation_window_ms);
        self.timers.insert(TimerEntry {
            deadline_ms: session.conversation_deadline_ms,
            key: key.clone(),
            kind: TimerKind::ConversationWindow,
        });
        true
    }

    fn cancel_privileged_reply(&mut self, key: &SessionKey) {
        let Some(session) = self.sessions.get_mut(key) else {
            return;
        };
        if let Some(deadline_ms) = session.privileged_reply_deadline_ms.take() {
            self.timers.remove(&TimerEntry {
                deadline_ms,
                key: key.clone(),
                kind: TimerKind::PrivilegedReply,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{EvictionReason, SessionKey, SessionTable};

    const WINDOW_MS: u64 = 600_000;

    fn key(participant: &str) -> SessionKey {
        SessionKey::new("help-1", participant)
    }

    #[test]
    fn unit_open_supersedes_previous_session_and_its_timer() {
        let mut table = SessionTable::new(WINDOW_MS, None);
        assert!(table.open(key("user-1"), "crash.zip", 0).is_none());
        let previous = table
            .open(key("user-1"), "latest.log", 1_000)
            .expect("previous session");
        assert_eq!(previous.record_id, "crash.zip");
        assert_eq!(table.len(), 1);
        assert_eq!(table.pending_timers(), 1);
        assert_eq!(table.next_deadline_ms(), Some(601_000));
    }

    #[test]
    fn functional_refresh_reschedules_instead_of_duplicating_timer() {
        let mut table = SessionTable::new(WINDOW_MS, None);
        table.open(key("user-1"), "crash.zip", 0);
        assert!(table.record_owner_activity(&key("user-1"), 30_000));
        assert_eq!(table.pending_timers(), 1);

        assert!(table.expire_due(600_000).is_empty());
        let evicted = table.expire_due(630_000);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].reason, EvictionReason::ConversationWindowElapsed);
        assert!(table.is_empty());
        assert_eq!(table.pending_timers(), 0);
    }

    #[test]
    fn functional_privileged_reply_timer_retires_session_unless_owner_answers() {
        let mut table = SessionTable::new(WINDOW_MS, Some(60_000));
        table.open(key("user-1"), "crash.zip", 0);
        table.open(key("user-2"), "latest.log", 0);

        assert!(table.record_privileged_activity(&key("user-1"), 10_000));
        assert!(table.record_privileged_activity(&key("user-2"), 10_000));
        assert!(table.record_owner_activity(&key("user-2"), 20_000));

        let evicted = table.expire_due(70_000);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].key, key("user-1"));
        assert_eq!(evicted[0].reason, EvictionReason::PrivilegedReplyElapsed);
        assert!(table.get(&key("user-2")).is_some());
    }

    #[test]
    fn unit_active_in_room_filters_by_room_and_window() {
        let mut table = SessionTable::new(WINDOW_MS, None);
        table.open(key("user-1"), "a.zip", 0);
        table.open(key("user-2"), "b.zip", 100_000);
        table.open(SessionKey::new("other-room", "user-3"), "c.zip", 100_000);

        let active = table.active_in_room("help-1", 150_000, 120_000);
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].1, "b.zip");
    }

    #[test]
    fn regression_remove_if_record_ignores_superseded_binding() {
        let mut table = SessionTable::new(WINDOW_MS, None);
        table.open(key("user-1"), "crash.zip", 0);
        table.open(key("user-1"), "crash(1).zip", 5);
        assert!(!table.remove_if_record(&key("user-1"), "crash.zip"));
        assert!(table.remove_if_record(&key("user-1"), "crash(1).zip"));
        assert_eq!(table.pending_timers(), 0);
    }
}
