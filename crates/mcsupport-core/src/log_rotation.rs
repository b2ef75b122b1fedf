//! Size-capped NDJSON appender for the transcript event log.
//!
//! When the next line would push the active file past `max_bytes`, the active
//! file becomes `<name>.1`, older backups shift up by one, and anything beyond
//! `max_files - 1` backups is deleted.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

const EVENT_LOG_MAX_BYTES_ENV: &str = "MCSUPPORT_EVENT_LOG_MAX_BYTES";
const EVENT_LOG_MAX_FILES_ENV: &str = "MCSUPPORT_EVENT_LOG_MAX_FILES";
const DEFAULT_EVENT_LOG_MAX_BYTES: u64 = 8 * 1024 * 1024;
const DEFAULT_EVENT_LOG_MAX_FILES: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogRotationPolicy {
    /// Size ceiling of the active file. Zero disables rotation.
    pub max_bytes: u64,
    /// Active file plus backups. Zero disables rotation.
    pub max_files: usize,
}

impl Default for LogRotationPolicy {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_EVENT_LOG_MAX_BYTES,
            max_files: DEFAULT_EVENT_LOG_MAX_FILES,
        }
    }
}

impl LogRotationPolicy {
    /// Defaults overridden by `MCSUPPORT_EVENT_LOG_MAX_BYTES` and
    /// `MCSUPPORT_EVENT_LOG_MAX_FILES`; unparsable or zero values are ignored.
    pub fn from_env() -> Self {
        Self {
            max_bytes: positive_env(EVENT_LOG_MAX_BYTES_ENV).unwrap_or(DEFAULT_EVENT_LOG_MAX_BYTES),
            max_files: positive_env(EVENT_LOG_MAX_FILES_ENV)
                .and_then(|value| usize::try_from(value).ok())
                .unwrap_or(DEFAULT_EVENT_LOG_MAX_FILES),
        }
    }

    pub fn is_enabled(self) -> bool {
        self.max_bytes > 0 && self.max_files > 0
    }

    fn retained_backups(self) -> usize {
        self.max_files.saturating_sub(1)
    }
}

fn positive_env(name: &str) -> Option<u64> {
    std::env::var(name)
        .ok()
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
}

/// Appends `line` plus a newline to `path`, rotating first when it would overflow.
pub fn append_line_with_rotation(path: &Path, line: &str, policy: LogRotationPolicy) -> Result<()> {
    if let Some(parent) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    if policy.is_enabled() {
        let current_bytes = match std::fs::metadata(path) {
            Ok(metadata) => metadata.len(),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => 0,
            Err(error) => {
                return Err(error).with_context(|| format!("failed to stat {}", path.display()))
            }
        };
        let incoming_bytes = u64::try_from(line.len().saturating_add(1)).unwrap_or(u64::MAX);
        if current_bytes > 0 && current_bytes.saturating_add(incoming_bytes) > policy.max_bytes {
            shift_backups(path, policy.retained_backups())?;
        }
    }

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    writeln!(file, "{line}").with_context(|| format!("failed to append {}", path.display()))?;
    file.flush()
        .with_context(|| format!("failed to flush {}", path.display()))
}

fn backup_path(path: &Path, generation: usize) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(".{generation}"));
    PathBuf::from(name)
}

fn remove_if_present(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(error) => Err(error).with_context(|| format!("failed to remove {}", path.display())),
    }
}

fn shift_backups(path: &Path, retained_backups: usize) -> Result<()> {
    if retained_backups == 0 {
        return remove_if_present(path);
    }
    remove_if_present(&backup_path(path, retained_backups))?;
    for generation in (1..retained_backups).rev() {
        let source = backup_path(path, generation);
        if source.exists() {
            let destination = backup_path(path, generation + 1);
            std::fs::rename(&source, &destination).with_context(|| {
                format!("failed to shift {} to {}", source.display(), destination.display())
            })?;
        }
    }
    let first_backup = backup_path(path, 1);
    std::fs::rename(path, &first_backup).with_context(|| {
        format!("failed to rotate {} to {}", path.display(), first_backup.display())
    })
}

#[cfg(test)]
mod tests {
    use super::{append_line_with_rotation, backup_path, LogRotationPolicy};

    #[test]
    fn functional_full_log_is_moved_to_first_backup() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("transcript-events.jsonl");
        let policy = LogRotationPolicy {
            max_bytes: 32,
            max_files: 3,
        };

        append_line_with_rotation(&path, r#"{"kind":"upload","n":1}"#, policy).expect("first");
        append_line_with_rotation(&path, r#"{"kind":"message","n":2}"#, policy).expect("second");

        let backup = std::fs::read_to_string(backup_path(&path, 1)).expect("backup");
        let active = std::fs::read_to_string(&path).expect("active");
        assert!(backup.contains("\"n\":1"));
        assert!(active.contains("\"n\":2"));
        assert!(!active.contains("\"n\":1"));
    }

    #[test]
    fn regression_backups_beyond_max_files_are_pruned() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("transcript-events.jsonl");
        let policy = LogRotationPolicy {
            max_bytes: 10,
            max_files: 3,
        };

        for n in 1..=5 {
            append_line_with_rotation(&path, &format!(r#"{{"n":{n}}}"#), policy).expect("append");
        }

        assert!(std::fs::read_to_string(&path).expect("active").contains("\"n\":5"));
        assert!(std::fs::read_to_string(backup_path(&path, 1))
            .expect("backup 1")
            .contains("\"n\":4"));
        assert!(std::fs::read_to_string(backup_path(&path, 2))
            .expect("backup 2")
            .contains("\"n\":3"));
        assert!(!backup_path(&path, 3).exists());
    }

    #[test]
    fn unit_disabled_policy_never_rotates() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("events.jsonl");
        let policy = LogRotationPolicy {
            max_bytes: 0,
            max_files: 3,
        };
        for n in 0..4 {
            append_line_with_rotation(&path, &format!("line-{n}"), policy).expect("append");
        }
        assert_eq!(
            std::fs::read_to_string(&path).expect("active").lines().count(),
            4
        );
        assert!(!backup_path(&path, 1).exists());
    }

    #[test]
    fn unit_policy_from_env_ignores_invalid_values() {
        std::env::set_var("MCSUPPORT_EVENT_LOG_MAX_BYTES", "4096");
        std::env::set_var("MCSUPPORT_EVENT_LOG_MAX_FILES", "0");
        let parsed = LogRotationPolicy::from_env();
        assert_eq!(parsed.max_bytes, 4096);
        assert_eq!(parsed.max_files, LogRotationPolicy::default().max_files);
        std::env::remove_var("MCSUPPORT_EVENT_LOG_MAX_BYTES");
        std::env::remove_var("MCSUPPORT_EVENT_LOG_MAX_FILES");
    }
}
