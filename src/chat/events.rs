//! Wire records of the chat stream and the question payloads they carry.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One line of the NDJSON chat stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Opaque passthrough of one agent event.
    #[serde(rename = "claude_json")]
    Data { data: serde_json::Value },
    /// The agent is blocked on a question until it is answered.
    #[serde(rename = "ask_user_question", rename_all = "camelCase")]
    Question {
        question_id: String,
        request_id: String,
        questions: Vec<Question>,
    },
    /// Keep-alive; `ts` is unix time in milliseconds.
    Heartbeat { ts: i64 },
    Error { error: String },
    Done,
}

impl StreamEvent {
    pub fn heartbeat_now() -> Self {
        Self::Heartbeat {
            ts: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            error: message.into(),
        }
    }

    pub fn is_heartbeat(&self) -> bool {
        matches!(self, Self::Heartbeat { .. })
    }

    /// Serialize as a single NDJSON line, newline included.
    pub fn to_ndjson(&self) -> String {
        let mut line = serde_json::to_string(self).unwrap_or_else(|e| {
            format!(r#"{{"type":"error","error":"failed to encode stream record: {e}"}}"#)
        });
        line.push('\n');
        line
    }
}

/// A multiple-choice question put to the caller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Question {
    /// The question to ask
    pub question: String,
    /// Short label for the question
    pub header: String,
    pub options: Vec<QuestionOption>,
    #[serde(default)]
    pub multi_select: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuestionOption {
    pub label: String,
    #[serde(default)]
    pub description: String,
}

pub const MIN_QUESTIONS: usize = 1;
pub const MAX_QUESTIONS: usize = 4;
pub const MIN_OPTIONS: usize = 2;
pub const MAX_OPTIONS: usize = 4;

/// Check the shape of a question batch: 1–4 questions of 2–4 options each.
pub fn validate_questions(questions: &[Question]) -> Result<(), String> {
    if !(MIN_QUESTIONS..=MAX_QUESTIONS).contains(&questions.len()) {
        return Err(format!(
            "expected {MIN_QUESTIONS}-{MAX_QUESTIONS} questions, got {}",
            questions.len()
        ));
    }
    for q in questions {
        if q.question.trim().is_empty() {
            return Err("question text must not be empty".into());
        }
        if !(MIN_OPTIONS..=MAX_OPTIONS).contains(&q.options.len()) {
            return Err(format!(
                "question '{}' must have {MIN_OPTIONS}-{MAX_OPTIONS} options, got {}",
                q.question,
                q.options.len()
            ));
        }
    }
    Ok(())
}

/// The caller's reply to one question batch, keyed by question text.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(transparent)]
pub struct Answer {
    pub answers: BTreeMap<String, AnswerValue>,
}

/// Selected option label(s) or free text.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum AnswerValue {
    Text(String),
    Choices(Vec<String>),
}

impl Answer {
    pub fn single(question: impl Into<String>, value: AnswerValue) -> Self {
        let mut answers = BTreeMap::new();
        answers.insert(question.into(), value);
        Self { answers }
    }
}
