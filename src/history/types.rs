use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::path::PathBuf;

pub const NO_PREVIEW: &str = "No preview available";

/// One line of a persisted conversation log.
///
/// Only the fields the history subsystem reads are typed; everything else
/// is carried in `extra` and written back verbatim. Any JSON object parses:
/// a typed field holding an unexpected kind of value stays in `extra`
/// instead of failing the whole line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(from = "Map<String, Value>")]
pub struct LogRecord {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<RecordMessage>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(from = "Map<String, Value>")]
pub struct RecordMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Stable id shared by every copy of the same logical message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<MessageContent>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl From<Map<String, Value>> for LogRecord {
    fn from(mut extra: Map<String, Value>) -> Self {
        let kind = take_string(&mut extra, "type");
        let timestamp = take_string(&mut extra, "timestamp");
        let message = match extra.remove("message") {
            Some(Value::Object(fields)) => Some(RecordMessage::from(fields)),
            Some(other) => {
                extra.insert("message".into(), other);
                None
            }
            None => None,
        };
        Self {
            kind,
            timestamp,
            message,
            extra,
        }
    }
}

impl From<Map<String, Value>> for RecordMessage {
    fn from(mut extra: Map<String, Value>) -> Self {
        let role = take_string(&mut extra, "role");
        let id = take_string(&mut extra, "id");
        let content = extra.remove("content").map(MessageContent::from);
        Self {
            role,
            id,
            content,
            extra,
        }
    }
}

/// Remove `key` only when it holds a string.
fn take_string(map: &mut Map<String, Value>, key: &str) -> Option<String> {
    if !map.get(key).is_some_and(Value::is_string) {
        return None;
    }
    match map.remove(key) {
        Some(Value::String(s)) => Some(s),
        _ => None,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Segments(Vec<Value>),
    Other(Value),
}

impl From<Value> for MessageContent {
    fn from(value: Value) -> Self {
        match value {
            Value::String(text) => Self::Text(text),
            Value::Array(segments) => Self::Segments(segments),
            other => Self::Other(other),
        }
    }
}

impl LogRecord {
    fn assistant_message(&self) -> Option<&RecordMessage> {
        self.message
            .as_ref()
            .filter(|m| m.role.as_deref() == Some("assistant"))
    }

    /// Id used for deduplication: set on assistant-role messages only.
    pub fn assistant_message_id(&self) -> Option<&str> {
        self.assistant_message()?.id.as_deref()
    }

    /// Id used for timestamp reconciliation: assistant-type records only.
    pub fn reconcilable_id(&self) -> Option<&str> {
        if self.kind.as_deref() != Some("assistant") {
            return None;
        }
        self.message.as_ref()?.id.as_deref()
    }

    /// First text of an assistant message, if it has any.
    pub fn assistant_text(&self) -> Option<String> {
        match self.assistant_message()?.content.as_ref()? {
            MessageContent::Text(text) => Some(text.clone()),
            MessageContent::Segments(segments) => segments
                .iter()
                .filter_map(Value::as_object)
                .find_map(|segment| segment.get("text"))
                .map(|text| match text {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                }),
            MessageContent::Other(_) => None,
        }
    }
}

/// One parsed log file.
#[derive(Debug, Clone)]
pub struct ConversationLog {
    pub session_id: String,
    pub file_path: PathBuf,
    pub records: Vec<LogRecord>,
    pub message_ids: HashSet<String>,
    pub start_time: Option<String>,
    pub last_time: Option<String>,
    pub message_count: usize,
    pub last_message_preview: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub session_id: String,
    pub start_time: String,
    pub last_time: String,
    pub message_count: usize,
    pub last_message_preview: String,
}

impl From<&ConversationLog> for ConversationSummary {
    fn from(log: &ConversationLog) -> Self {
        Self {
            session_id: log.session_id.clone(),
            start_time: log.start_time.clone().unwrap_or_default(),
            last_time: log.last_time.clone().unwrap_or_default(),
            message_count: log.message_count,
            last_message_preview: log.last_message_preview.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConversationMetadata {
    pub start_time: String,
    pub end_time: String,
    pub message_count: usize,
}

/// A single conversation, reconciled and in chronological order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConversationHistory {
    pub session_id: String,
    pub messages: Vec<LogRecord>,
    pub metadata: ConversationMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub path: String,
    pub encoded_name: String,
}
