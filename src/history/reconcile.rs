//! Timestamp reconciliation for conversations whose assistant messages were
//! written more than once (resume and fork copy earlier turns forward).

use super::types::{ConversationHistory, ConversationLog, ConversationMetadata, LogRecord};
use chrono::{DateTime, SecondsFormat, Utc};
use std::cmp::Ordering;
use std::collections::HashMap;

/// Total order over optional timestamps.
///
/// Missing values sort first, then values that do not parse as RFC 3339
/// (lexically), then real instants.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum TimestampKey<'a> {
    Missing,
    Unparsed(&'a str),
    At(DateTime<Utc>),
}

impl<'a> TimestampKey<'a> {
    pub fn of(timestamp: Option<&'a str>) -> Self {
        match timestamp {
            None => Self::Missing,
            Some(raw) => match DateTime::parse_from_rfc3339(raw) {
                Ok(at) => Self::At(at.with_timezone(&Utc)),
                Err(_) => Self::Unparsed(raw),
            },
        }
    }
}

pub fn compare_timestamps(a: Option<&str>, b: Option<&str>) -> Ordering {
    TimestampKey::of(a).cmp(&TimestampKey::of(b))
}

/// Give every copy of an assistant message the earliest timestamp seen for it.
pub fn restore_timestamps(mut records: Vec<LogRecord>) -> Vec<LogRecord> {
    let mut earliest: HashMap<String, String> = HashMap::new();
    for record in &records {
        let (Some(id), Some(ts)) = (record.reconcilable_id(), record.timestamp.as_deref()) else {
            continue;
        };
        let is_earlier = earliest.get(id).map_or(true, |seen| {
            compare_timestamps(Some(ts), Some(seen.as_str())) == Ordering::Less
        });
        if is_earlier {
            earliest.insert(id.to_string(), ts.to_string());
        }
    }

    for record in &mut records {
        let restored = record
            .reconcilable_id()
            .and_then(|id| earliest.get(id))
            .cloned();
        if let Some(ts) = restored {
            record.timestamp = Some(ts);
        }
    }
    records
}

/// Stable ascending sort by timestamp.
pub fn sort_by_timestamp(mut records: Vec<LogRecord>) -> Vec<LogRecord> {
    records.sort_by(|a, b| compare_timestamps(a.timestamp.as_deref(), b.timestamp.as_deref()));
    records
}

/// Start, end and count of an already sorted sequence.
///
/// Start and end are the first and last timestamps present; with none at
/// all both are the current time.
pub fn conversation_metadata(sorted: &[LogRecord]) -> ConversationMetadata {
    let mut stamps = sorted.iter().filter_map(|r| r.timestamp.as_deref());
    let first = stamps.next();
    let last = stamps.last().or(first);

    match (first, last) {
        (Some(start), Some(end)) => ConversationMetadata {
            start_time: start.to_string(),
            end_time: end.to_string(),
            message_count: sorted.len(),
        },
        _ => {
            let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
            ConversationMetadata {
                start_time: now.clone(),
                end_time: now,
                message_count: sorted.len(),
            }
        }
    }
}

/// Restore, sort, then summarize one log.
pub fn reconstruct(log: ConversationLog) -> ConversationHistory {
    let messages = sort_by_timestamp(restore_timestamps(log.records));
    let metadata = conversation_metadata(&messages);
    ConversationHistory {
        session_id: log.session_id,
        messages,
        metadata,
    }
}
