//! Privileged (helper) role lookup.

use std::collections::HashSet;

use crate::transcript_config::TranscriptConfig;

/// Answers whether a participant may attribute messages across other users' reports.
pub trait PrivilegeOracle: Send + Sync {
    fn is_privileged(&self, participant_id: &str) -> bool;
}

#[derive(Debug, Clone, Default)]
/// Fixed helper roster, usually sourced from `privileged_participants`.
pub struct StaticPrivilegedRoster {
    participants: HashSet<String>,
}

impl StaticPrivilegedRoster {
    pub fn new<I, S>(participants: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            participants: participants
                .into_iter()
                .map(|participant| participant.as_ref().trim().to_string())
                .filter(|participant| !participant.is_empty())
                .collect(),
        }
    }

    pub fn from_config(config: &TranscriptConfig) -> Self {
        Self::new(&config.privileged_participants)
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }
}

impl PrivilegeOracle for StaticPrivilegedRoster {
    fn is_privileged(&self, participant_id: &str) -> bool {
        self.participants.contains(participant_id.trim())
    }
}

#[cfg(test)]
mod tests {
    use super::{PrivilegeOracle, StaticPrivilegedRoster};
    use crate::transcript_config::TranscriptConfig;

    #[test]
    fn unit_roster_trims_and_ignores_blank_entries() {
        let config = TranscriptConfig {
            privileged_participants: vec![" helper-1 ".to_string(), "".to_string()],
            ..TranscriptConfig::default()
        };
        let roster = StaticPrivilegedRoster::from_config(&config);
        assert_eq!(roster.len(), 1);
        assert!(roster.is_privileged("helper-1"));
        assert!(!roster.is_privileged("user-1"));
    }
}
