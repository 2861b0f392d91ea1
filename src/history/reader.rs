//! Loading conversation logs from disk.
//!
//! Each `<session>.jsonl` file holds one record per line. Parsing is
//! line-granular: a malformed line is logged and skipped, and a file that
//! cannot be read is logged and left out without affecting its siblings.

use super::paths::session_file;
use super::reconcile::compare_timestamps;
use super::types::{ConversationLog, LogRecord, NO_PREVIEW};
use super::HistoryError;
use crate::util::truncate_chars;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Parse every `*.jsonl` log in `dir`.
pub fn read_all(dir: &Path, preview_chars: usize) -> Result<Vec<ConversationLog>, HistoryError> {
    let metadata = fs::metadata(dir).map_err(|e| HistoryError::from_io(dir, e))?;
    if !metadata.is_dir() {
        return Err(HistoryError::NotFound(dir.display().to_string()));
    }

    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .map_err(|e| HistoryError::from_io(dir, e))?
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry.path()),
            Err(e) => {
                tracing::warn!("Skipping unreadable entry in {}: {e}", dir.display());
                None
            }
        })
        .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "jsonl"))
        .collect();
    files.sort();

    let mut logs = Vec::with_capacity(files.len());
    for path in files {
        match parse_file(&path, preview_chars) {
            Ok(Some(log)) => logs.push(log),
            Ok(None) => tracing::debug!("No records in {}", path.display()),
            Err(e) => tracing::warn!("Failed to read history file {}: {e}", path.display()),
        }
    }
    Ok(logs)
}

/// Parse the log of one session in `dir`.
pub fn read_one(
    dir: &Path,
    session_id: &str,
    preview_chars: usize,
) -> Result<ConversationLog, HistoryError> {
    let path = session_file(dir, session_id)?;
    match parse_file(&path, preview_chars) {
        Ok(Some(log)) => Ok(log),
        Ok(None) => Err(HistoryError::NotFound(format!(
            "conversation {session_id} has no records"
        ))),
        Err(e) => Err(HistoryError::from_io(&path, e)),
    }
}

/// `Ok(None)` when the file holds no valid record.
fn parse_file(path: &Path, preview_chars: usize) -> io::Result<Option<ConversationLog>> {
    let bytes = fs::read(path)?;
    let content = String::from_utf8_lossy(&bytes);

    let mut records = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<LogRecord>(line) {
            Ok(record) => records.push(record),
            Err(e) => tracing::warn!(
                "Skipping malformed line {} in {}: {e}",
                idx + 1,
                path.display()
            ),
        }
    }
    if records.is_empty() {
        return Ok(None);
    }

    let session_id = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(Some(summarize(session_id, path.to_path_buf(), records, preview_chars)))
}

fn summarize(
    session_id: String,
    file_path: PathBuf,
    records: Vec<LogRecord>,
    preview_chars: usize,
) -> ConversationLog {
    let mut message_ids = HashSet::new();
    let mut start_time: Option<&str> = None;
    let mut last_time: Option<&str> = None;
    let mut preview: Option<String> = None;

    for record in &records {
        if let Some(id) = record.assistant_message_id() {
            message_ids.insert(id.to_string());
        }
        if let Some(ts) = record.timestamp.as_deref() {
            if start_time.map_or(true, |s| {
                compare_timestamps(Some(ts), Some(s)) == Ordering::Less
            }) {
                start_time = Some(ts);
            }
            if last_time.map_or(true, |l| {
                compare_timestamps(Some(ts), Some(l)) == Ordering::Greater
            }) {
                last_time = Some(ts);
            }
        }
        if let Some(text) = record.assistant_text() {
            preview = Some(truncate_chars(&text, preview_chars));
        }
    }

    let start_time = start_time.map(str::to_string);
    let last_time = last_time.map(str::to_string);
    ConversationLog {
        session_id,
        file_path,
        message_count: records.len(),
        message_ids,
        start_time,
        last_time,
        last_message_preview: preview.unwrap_or_else(|| NO_PREVIEW.to_string()),
        records,
    }
}
