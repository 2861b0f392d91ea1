use super::reconcile::TimestampKey;
use super::types::{ConversationLog, ConversationSummary};

/// Collapse logs that are continuations of one another.
///
/// Resuming a conversation writes a new log that repeats every assistant
/// message of the old one, so a log whose assistant-id set is contained in
/// another's is a stale prefix and is dropped. Larger sets are considered
/// first, which guarantees the superset is the one kept. Survivors are
/// summarized newest first. Ties fall back to the session id, so the result
/// does not depend on the order the logs were read in.
pub fn group_conversations(logs: &[ConversationLog]) -> Vec<ConversationSummary> {
    let mut by_size: Vec<&ConversationLog> = logs.iter().collect();
    by_size.sort_by(|a, b| {
        b.message_ids
            .len()
            .cmp(&a.message_ids.len())
            .then_with(|| a.session_id.cmp(&b.session_id))
    });

    let mut accepted: Vec<&ConversationLog> = Vec::new();
    for log in by_size {
        let covered = accepted
            .iter()
            .any(|kept| log.message_ids.is_subset(&kept.message_ids));
        if !covered {
            accepted.push(log);
        }
    }

    let mut summaries: Vec<ConversationSummary> =
        accepted.into_iter().map(ConversationSummary::from).collect();
    summaries.sort_by(|a, b| {
        start_key(b)
            .cmp(&start_key(a))
            .then_with(|| a.session_id.cmp(&b.session_id))
    });
    summaries
}

fn start_key(summary: &ConversationSummary) -> TimestampKey<'_> {
    TimestampKey::of(Some(summary.start_time.as_str()).filter(|s| !s.is_empty()))
}
