//! Conversation history recovery.
//!
//! Reads the agent's per-project JSONL logs, reconciles repeated messages and
//! collapses logs that are subsets of a longer log into one conversation.

pub mod grouping;
pub mod paths;
pub mod projects;
pub mod reader;
pub mod reconcile;
pub mod types;

pub use grouping::group_conversations;
pub use paths::{encode_project_path, validate_encoded_project_name, validate_session_id};
pub use projects::list_projects;
pub use reader::{read_all, read_one};
pub use reconcile::{conversation_metadata, reconstruct, restore_timestamps, sort_by_timestamp};
pub use types::{
    ConversationHistory, ConversationLog, ConversationMetadata, ConversationSummary, LogRecord,
    Project,
};

use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl HistoryError {
    /// Classify a filesystem error by kind.
    pub fn from_io(path: &Path, source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::NotFound => Self::NotFound(path.display().to_string()),
            _ => Self::Io {
                path: path.to_path_buf(),
                source,
            },
        }
    }
}

/// Grouped summaries of every conversation under one project directory.
pub fn list_conversations(
    projects_dir: &Path,
    encoded_project: &str,
    preview_chars: usize,
) -> Result<Vec<ConversationSummary>, HistoryError> {
    let dir = paths::project_dir(projects_dir, encoded_project)?;
    let logs = read_all(&dir, preview_chars)?;
    tracing::debug!("Found {} conversation logs in {}", logs.len(), dir.display());
    let summaries = group_conversations(&logs);
    tracing::debug!("{} unique conversations after grouping", summaries.len());
    Ok(summaries)
}

/// One conversation, reconciled for display.
pub fn load_conversation(
    projects_dir: &Path,
    encoded_project: &str,
    session_id: &str,
    preview_chars: usize,
) -> Result<ConversationHistory, HistoryError> {
    let dir = paths::project_dir(projects_dir, encoded_project)?;
    let log = read_one(&dir, session_id, preview_chars)?;
    Ok(reconstruct(log))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_are_classified_by_kind() {
        let missing = HistoryError::from_io(
            Path::new("/nope"),
            io::Error::new(io::ErrorKind::NotFound, "gone"),
        );
        assert!(matches!(missing, HistoryError::NotFound(_)));

        let denied = HistoryError::from_io(
            Path::new("/secret"),
            io::Error::new(io::ErrorKind::PermissionDenied, "No such file or directory"),
        );
        assert!(matches!(denied, HistoryError::Io { .. }));
    }
}
