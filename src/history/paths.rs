//! Identifier safety and the project path encoding used for log directories.

use super::HistoryError;
use std::path::{Path, PathBuf};

const MAX_SESSION_ID_LEN: usize = 255;

fn is_dangerous(c: char) -> bool {
    matches!(c, '<' | '>' | ':' | '"' | '|' | '?' | '*' | '/' | '\\') || c.is_control()
}

/// Reject names that could escape the projects directory.
pub fn validate_encoded_project_name(name: &str) -> Result<(), HistoryError> {
    if name.is_empty() {
        return Err(HistoryError::InvalidInput(
            "encoded project name is required".into(),
        ));
    }
    if name.chars().any(is_dangerous) || name == "." || name == ".." {
        return Err(HistoryError::InvalidInput(format!(
            "invalid encoded project name: {name}"
        )));
    }
    Ok(())
}

pub fn validate_session_id(session_id: &str) -> Result<(), HistoryError> {
    if session_id.is_empty() {
        return Err(HistoryError::InvalidInput("session id is required".into()));
    }
    if session_id.chars().any(is_dangerous)
        || session_id.chars().count() > MAX_SESSION_ID_LEN
        || session_id.starts_with('.')
    {
        return Err(HistoryError::InvalidInput(format!(
            "invalid session id format: {session_id}"
        )));
    }
    Ok(())
}

/// Directory name the agent uses for a project path.
///
/// A single trailing `/` is dropped, then every `/ \ : . _` becomes `-`.
///
/// ```
/// use chatrelay::history::encode_project_path;
///
/// assert_eq!(encode_project_path("/Users/me/my_app/"), "-Users-me-my-app");
/// ```
pub fn encode_project_path(path: &str) -> String {
    let trimmed = path.strip_suffix('/').unwrap_or(path);
    trimmed
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '.' | '_' => '-',
            other => other,
        })
        .collect()
}

/// `<projects_dir>/<encoded>` after validating `encoded`.
pub fn project_dir(projects_dir: &Path, encoded: &str) -> Result<PathBuf, HistoryError> {
    validate_encoded_project_name(encoded)?;
    Ok(projects_dir.join(encoded))
}

/// `<dir>/<session_id>.jsonl` after validating `session_id`.
pub fn session_file(dir: &Path, session_id: &str) -> Result<PathBuf, HistoryError> {
    validate_session_id(session_id)?;
    Ok(dir.join(format!("{session_id}.jsonl")))
}
