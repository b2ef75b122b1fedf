//! Foundational low-level utilities shared across mcsupport crates.
//!
//! Provides atomic file-write helpers, the rotating NDJSON appender used by
//! event logs, and the wall-clock abstraction the correlation engine is driven
//! by. `ManualClock` lets tests and replays step time deterministically.

pub mod atomic_io;
pub mod clock;
pub mod log_rotation;

pub use atomic_io::{write_bytes_atomic, write_text_atomic};
pub use clock::{current_unix_timestamp_ms, Clock, ManualClock, SystemClock};
pub use log_rotation::{append_line_with_rotation, LogRotationPolicy};

#[cfg(test)]
mod tests {
    use std::fs::read_to_string;

    use super::*;

    #[test]
    fn unit_write_text_atomic_creates_parent_dirs() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let path = tempdir.path().join("nested").join("sample.txt");
        write_text_atomic(&path, "hello world").expect("write");
        let contents = read_to_string(&path).expect("read");
        assert_eq!(contents, "hello world");
    }

    #[test]
    fn regression_write_bytes_atomic_replaces_existing_file() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let path = tempdir.path().join("artifact.bin");
        write_bytes_atomic(&path, &[1, 2, 3]).expect("first write");
        write_bytes_atomic(&path, &[9]).expect("second write");
        assert_eq!(std::fs::read(&path).expect("read"), vec![9]);
    }
}
