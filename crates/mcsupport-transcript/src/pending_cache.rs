//! Holding area for helper messages that had nowhere to go when they arrived.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::artifact_store::MessageEntry;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingEntry {
    pub message_key: String,
    pub room_id: String,
    pub message: MessageEntry,
    pub timestamp_ms: u64,
    #[serde(default)]
    pub candidate_record_ids: Vec<String>,
}

impl PendingEntry {
    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.timestamp_ms)
    }
}

#[derive(Debug, Clone, Default)]
/// Arrival-ordered pending entries keyed by message id.
pub struct PendingCache {
    entries: VecDeque<PendingEntry>,
}

impl PendingCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains_key(&self, message_key: &str) -> bool {
        self.entries
            .iter()
            .any(|entry| entry.message_key == message_key)
    }

    pub fn get(&self, message_key: &str) -> Option<&PendingEntry> {
        self.entries
            .iter()
            .find(|entry| entry.message_key == message_key)
    }

    /// Parks a message. Returns false when the key is already cached.
    pub fn insert(
        &mut self,
        message_key: &str,
        room_id: &str,
        message: MessageEntry,
        timestamp_ms: u64,
    ) -> bool {
        if self.contains_key(message_key) {
            return false;
        }
        self.entries.push_back(PendingEntry {
            message_key: message_key.to_string(),
            room_id: room_id.to_string(),
            message,
            timestamp_ms,
            candidate_record_ids: Vec::new(),
        });
        true
    }

    /// Links every still-fresh entry in `room_id` to `record_ids` and hands
    /// them back in arrival order, removing them from the cache.
    pub fn take_linkable(
        &mut self,
        room_id: &str,
        record_ids: &[String],
        now_ms: u64,
        recency_window_ms: u64,
    ) -> Vec<PendingEntry> {
        if record_ids.is_empty() {
            return Vec::new();
        }
        let mut linked = Vec::new();
        let mut kept = VecDeque::with_capacity(self.entries.len());
        for mut entry in self.entries.drain(..) {
            if entry.room_id == room_id
                && entry.candidate_record_ids.is_empty()
                && entry.age_ms(now_ms) < recency_window_ms
            {
                entry.candidate_record_ids = record_ids.to_vec();
                linked.push(entry);
            } else {
                kept.push_back(entry);
            }
        }
        self.entries = kept;
        linked
    }

    /// Puts previously taken entries back unlinked, in arrival order.
    /// Keys cached again in the meantime are left as they are.
    pub fn restore(&mut self, entries: Vec<PendingEntry>) {
        for mut entry in entries {
            if self.contains_key(&entry.message_key) {
                continue;
            }
            entry.candidate_record_ids.clear();
            let position = self
                .entries
                .iter()
                .position(|cached| cached.timestamp_ms > entry.timestamp_ms)
                .unwrap_or(self.entries.len());
            self.entries.insert(position, entry);
        }
    }

    /// Drops entries that aged past the recency window without being linked.
    pub fn discard_stale(&mut self, now_ms: u64, recency_window_ms: u64) -> Vec<PendingEntry> {
        let mut discarded = Vec::new();
        self.entries.retain(|entry| {
            if entry.age_ms(now_ms) >= recency_window_ms {
                discarded.push(entry.clone());
                false
            } else {
                true
            }
        });
        discarded
    }
}

#[cfg(test)]
mod tests {
    use super::PendingCache;
    use crate::artifact_store::MessageEntry;

    fn message(content: &str) -> MessageEntry {
        MessageEntry {
            content: content.to_string(),
            author_id: "helper-1".to_string(),
            timestamp_unix_ms: 0,
        }
    }

    #[test]
    fn unit_insert_rejects_duplicate_message_keys() {
        let mut cache = PendingCache::new();
        assert!(cache.insert("m-1", "help-1", message("first"), 0));
        assert!(!cache.insert("m-1", "help-1", message("again"), 5));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("m-1").map(|entry| entry.message.content.as_str()), Some("first"));
    }

    #[test]
    fn functional_take_linkable_preserves_arrival_order_and_scopes_by_room() {
        let mut cache = PendingCache::new();
        cache.insert("m-1", "help-1", message("one"), 1_000);
        cache.insert("m-2", "other", message("elsewhere"), 2_000);
        cache.insert("m-3", "help-1", message("two"), 3_000);

        let linked = cache.take_linkable("help-1", &["crash.zip".to_string()], 10_000, 120_000);
        let contents = linked
            .iter()
            .map(|entry| entry.message.content.as_str())
            .collect::<Vec<_>>();
        assert_eq!(contents, vec!["one", "two"]);
        assert!(linked
            .iter()
            .all(|entry| entry.candidate_record_ids == vec!["crash.zip".to_string()]));
        assert_eq!(cache.len(), 1);
        assert!(cache.contains_key("m-2"));
    }

    #[test]
    fn regression_restored_entries_are_unlinked_and_back_in_arrival_order() {
        let mut cache = PendingCache::new();
        cache.insert("m-1", "help-1", message("one"), 1_000);
        cache.insert("m-2", "help-1", message("two"), 2_000);
        let linked = cache.take_linkable("help-1", &["crash.zip".to_string()], 3_000, 120_000);
        assert!(cache.is_empty());
        cache.insert("m-3", "help-1", message("three"), 4_000);

        cache.restore(linked);
        let order = cache
            .entries
            .iter()
            .map(|entry| entry.message_key.as_str())
            .collect::<Vec<_>>();
        assert_eq!(order, vec!["m-1", "m-2", "m-3"]);
        assert!(cache
            .entries
            .iter()
            .all(|entry| entry.candidate_record_ids.is_empty()));

        let relinked = cache.take_linkable("help-1", &["latest.log".to_string()], 5_000, 120_000);
        assert_eq!(relinked.len(), 3);
    }

    #[test]
    fn regression_stale_entries_are_neither_linked_nor_kept() {
        let mut cache = PendingCache::new();
        cache.insert("m-old", "help-1", message("old"), 0);
        cache.insert("m-new", "help-1", message("new"), 100_000);

        assert!(cache
            .take_linkable("help-1", &["crash.zip".to_string()], 120_000, 120_000)
            .iter()
            .all(|entry| entry.message_key == "m-new"));
        assert_eq!(cache.len(), 1);

        let discarded = cache.discard_stale(120_000, 120_000);
        assert_eq!(discarded.len(), 1);
        assert_eq!(discarded[0].message_key, "m-old");
        assert!(cache.is_empty());
    }
}
