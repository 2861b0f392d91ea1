//! Questions the agent has put to the caller, awaiting an answer.
//!
//! Each open request owns a map of question id to a one-shot answer slot.
//! The asking flow suspends on the receiver; the answer endpoint resolves the
//! sender. Clearing a request drops its senders, so every waiter observes
//! cancellation instead of hanging or receiving a made-up answer.
//!
//! Opening a request yields a [`QuestionScope`]. Asking and clearing go
//! through the scope, so a finished request that reused an id can never touch
//! the questions of the request that holds the id now.

use super::events::{validate_questions, Answer, Question};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum QuestionError {
    #[error("request {0} is not active")]
    RequestNotActive(String),
    #[error("invalid questions: {0}")]
    InvalidQuestions(String),
    #[error("question {0} was cancelled before it was answered")]
    Cancelled(String),
    #[error("question {0} timed out waiting for an answer")]
    TimedOut(String),
}

/// One opening of a request id, returned by [`QuestionBroker::open`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuestionScope {
    request_id: String,
    epoch: u64,
}

impl QuestionScope {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }
}

/// An allocated question slot. Pass it to [`QuestionBroker::await_answer`].
#[derive(Debug)]
pub struct PendingQuestion {
    request_id: String,
    epoch: u64,
    question_id: String,
    rx: oneshot::Receiver<Answer>,
}

impl PendingQuestion {
    pub fn question_id(&self) -> &str {
        &self.question_id
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }
}

#[derive(Debug)]
struct OpenRequest {
    epoch: u64,
    slots: HashMap<String, oneshot::Sender<Answer>>,
}

#[derive(Debug, Default)]
pub struct QuestionBroker {
    pending: Mutex<HashMap<String, OpenRequest>>,
    counter: AtomicU64,
    epochs: AtomicU64,
}

impl QuestionBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking questions for `request_id`.
    ///
    /// A leftover map from an earlier request with the same id is replaced;
    /// its waiters observe cancellation.
    pub fn open(&self, request_id: &str) -> QuestionScope {
        let epoch = self.epochs.fetch_add(1, Ordering::Relaxed);
        let stale = self.pending.lock().insert(
            request_id.to_string(),
            OpenRequest {
                epoch,
                slots: HashMap::new(),
            },
        );
        if let Some(stale) = stale {
            tracing::debug!(
                "Request id {request_id} reopened; dropping {} stale question(s)",
                stale.slots.len()
            );
        }
        QuestionScope {
            request_id: request_id.to_string(),
            epoch,
        }
    }

    /// Allocate a slot for `questions` and return it with a fresh id.
    pub fn ask(
        &self,
        scope: &QuestionScope,
        questions: &[Question],
    ) -> Result<PendingQuestion, QuestionError> {
        validate_questions(questions).map_err(QuestionError::InvalidQuestions)?;

        let mut pending = self.pending.lock();
        let open = pending
            .get_mut(&scope.request_id)
            .filter(|open| open.epoch == scope.epoch)
            .ok_or_else(|| QuestionError::RequestNotActive(scope.request_id.clone()))?;

        let question_id = format!("q_{}", self.counter.fetch_add(1, Ordering::Relaxed) + 1);
        let (tx, rx) = oneshot::channel();
        open.slots.insert(question_id.clone(), tx);

        Ok(PendingQuestion {
            request_id: scope.request_id.clone(),
            epoch: scope.epoch,
            question_id,
            rx,
        })
    }

    /// Suspend until the question is resolved, cleared, or `timeout` elapses.
    ///
    /// With no timeout the wait is unbounded; only `resolve` or `clear` ends it.
    pub async fn await_answer(
        &self,
        pending: PendingQuestion,
        timeout: Option<Duration>,
    ) -> Result<Answer, QuestionError> {
        let PendingQuestion {
            request_id,
            epoch,
            question_id,
            rx,
        } = pending;

        let outcome = match timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(received) => received,
                Err(_) => {
                    self.discard(&request_id, epoch, &question_id);
                    return Err(QuestionError::TimedOut(question_id));
                }
            },
            None => rx.await,
        };

        outcome.map_err(|_| QuestionError::Cancelled(question_id))
    }

    /// Deliver `answer` to the waiter of `(request_id, question_id)`.
    ///
    /// Returns `false` when there is no such pending question: unknown,
    /// already answered, or its request has finished.
    pub fn resolve(&self, request_id: &str, question_id: &str, answer: Answer) -> bool {
        let sender = self
            .pending
            .lock()
            .get_mut(request_id)
            .and_then(|open| open.slots.remove(question_id));

        match sender {
            Some(tx) => {
                if tx.send(answer).is_err() {
                    tracing::debug!("Waiter for {question_id} is gone; answer dropped");
                }
                true
            }
            None => false,
        }
    }

    /// Drop every pending question of `scope` without answering it.
    ///
    /// Does nothing when the id has since been reopened.
    pub fn clear(&self, scope: &QuestionScope) {
        let mut pending = self.pending.lock();
        if !pending
            .get(&scope.request_id)
            .is_some_and(|open| open.epoch == scope.epoch)
        {
            return;
        }
        if let Some(open) = pending.remove(&scope.request_id) {
            if !open.slots.is_empty() {
                tracing::debug!(
                    "Discarding {} unanswered question(s) for request {}",
                    open.slots.len(),
                    scope.request_id
                );
            }
        }
    }

    pub fn pending_ids(&self, request_id: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .pending
            .lock()
            .get(request_id)
            .map(|open| open.slots.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    pub fn pending_count(&self, request_id: &str) -> usize {
        self.pending
            .lock()
            .get(request_id)
            .map_or(0, |open| open.slots.len())
    }

    pub fn is_open(&self, request_id: &str) -> bool {
        self.pending.lock().contains_key(request_id)
    }

    fn discard(&self, request_id: &str, epoch: u64, question_id: &str) {
        if let Some(open) = self
            .pending
            .lock()
            .get_mut(request_id)
            .filter(|open| open.epoch == epoch)
        {
            open.slots.remove(question_id);
        }
    }
}
