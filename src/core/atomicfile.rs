//! Atomic file writes and daily idempotency stamps.
//!
//! Writers never leave partial content behind: payloads go to a temp file in
//! the same directory, get fsynced, then rename over the target. Stamp files
//! hold a single UTC ISO-8601 line and are compared by UTC calendar day.

use crate::core::error::TbotError;
use chrono::{DateTime, Utc};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;

/// Write bytes atomically: temp file in the same directory, fsync, rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), TbotError> {
    let parent = path
        .parent()
        .ok_or_else(|| TbotError::Validation(format!("no parent dir for {}", path.display())))?;
    fs::create_dir_all(parent)?;
    let tmp = path.with_file_name(format!(
        ".{}.tmp.{}",
        path.file_name().unwrap_or_default().to_string_lossy(),
        std::process::id()
    ));
    {
        let mut f = File::create(&tmp)?;
        f.write_all(bytes)?;
        f.flush()?;
        f.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Atomic write of a pretty-printed JSON document.
pub fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> Result<(), TbotError> {
    let body = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &body)
}

/// Atomic single-line text write (content is normalized to one trailing `\n`).
pub fn write_line_atomic(path: &Path, line: &str) -> Result<(), TbotError> {
    let payload = format!("{}\n", line.trim_end_matches('\n'));
    write_atomic(path, payload.as_bytes())
}

/// Append one line to a log file (creates parents as needed).
pub fn append_line(path: &Path, line: &str) -> Result<(), TbotError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut f = OpenOptions::new().create(true).append(true).open(path)?;
    // One write call per record so concurrent readers never see torn lines.
    f.write_all(format!("{}\n", line.trim_end_matches('\n')).as_bytes())?;
    Ok(())
}

// --- Daily idempotency stamps ---

/// Write a UTC timestamp stamp atomically.
pub fn write_stamp(path: &Path, when: DateTime<Utc>) -> Result<(), TbotError> {
    write_line_atomic(path, &crate::core::time::iso_z(when))
}

/// Read a stamp file back as an aware UTC timestamp, if present and parsable.
pub fn read_stamp(path: &Path) -> Option<DateTime<Utc>> {
    let raw = fs::read_to_string(path).ok()?;
    crate::core::time::parse_to_utc(raw.lines().next()?.trim())
}

/// True when the stamp exists and falls on the same UTC calendar day as `now`.
pub fn stamp_is_today(path: &Path, now: DateTime<Utc>) -> bool {
    match read_stamp(path) {
        Some(ts) => crate::core::time::same_utc_day(ts, now),
        None => false,
    }
}
