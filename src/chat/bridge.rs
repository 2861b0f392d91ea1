//! Drives one chat request from start to terminal record.
//!
//! Agent events, injected questions and heartbeats all go through a single
//! [`Emitter`], so the consumer sees them in emission order and nothing is
//! written after the terminal `done` or `error` record.

use super::broker::{QuestionBroker, QuestionError, QuestionScope};
use super::events::{Answer, Question, StreamEvent};
use super::registry::{RegistryError, RequestHandle, RequestRegistry};
use crate::agent::{is_result_event, Agent, AgentInvocation, AgentRun, QuestionAsker};
use crate::config::AgentConfig;
use crate::util::truncate_with_ellipsis;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

pub const CANCELLED_MESSAGE: &str = "Request cancelled";

const STREAM_BUFFER: usize = 64;

/// Body of a chat request.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub message: String,
    pub request_id: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub allowed_tools: Option<Vec<String>>,
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
    #[serde(default)]
    pub permission_mode: Option<String>,
}

/// Per-request defaults, taken from `[agent]` config.
#[derive(Debug, Clone)]
pub struct BridgeSettings {
    pub heartbeat_interval: Duration,
    pub question_timeout: Option<Duration>,
    pub permission_mode: String,
    pub allowed_tools: Vec<String>,
    pub disallowed_tools: Vec<String>,
    pub append_system_prompt: String,
}

impl BridgeSettings {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            heartbeat_interval: config.heartbeat_interval(),
            question_timeout: config.question_timeout(),
            permission_mode: config.permission_mode.clone(),
            allowed_tools: config.allowed_tools.clone(),
            disallowed_tools: config.disallowed_tools.clone(),
            append_system_prompt: config.append_system_prompt.clone(),
        }
    }
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self::from_config(&AgentConfig::default())
    }
}

pub struct SessionBridge {
    registry: Arc<RequestRegistry>,
    broker: Arc<QuestionBroker>,
    agent: Arc<dyn Agent>,
    settings: BridgeSettings,
}

impl SessionBridge {
    pub fn new(agent: Arc<dyn Agent>, settings: BridgeSettings) -> Self {
        Self {
            registry: Arc::new(RequestRegistry::new()),
            broker: Arc::new(QuestionBroker::new()),
            agent,
            settings,
        }
    }

    pub fn registry(&self) -> &Arc<RequestRegistry> {
        &self.registry
    }

    pub fn broker(&self) -> &Arc<QuestionBroker> {
        &self.broker
    }

    /// Register the request and start streaming it.
    ///
    /// Registration happens before this returns, so an abort issued right
    /// after finds the request. The receiver yields records until a terminal
    /// one, then ends.
    pub fn open(&self, request: ChatRequest) -> Result<mpsc::Receiver<StreamEvent>, RegistryError> {
        let handle = self.registry.register(&request.request_id)?;
        let scope = self.broker.open(&request.request_id);

        tracing::info!(
            "Chat request {}: {}",
            request.request_id,
            truncate_with_ellipsis(&request.message, 80)
        );

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let emitter = Emitter::new(tx, handle.token().clone());
        let stream_done = CancellationToken::new();

        let teardown = Teardown {
            registry: self.registry.clone(),
            broker: self.broker.clone(),
            handle: handle.clone(),
            scope: scope.clone(),
            stream_done: stream_done.clone(),
        };

        let asker: Arc<dyn QuestionAsker> = Arc::new(BridgeAsker {
            scope,
            broker: self.broker.clone(),
            emitter: emitter.clone(),
            token: handle.token().clone(),
            timeout: self.settings.question_timeout,
        });

        tokio::spawn(heartbeat_loop(
            emitter.clone(),
            self.settings.heartbeat_interval,
            handle.token().clone(),
            stream_done,
        ));

        let invocation = self.invocation(&request);
        let agent = self.agent.clone();
        tokio::spawn(async move {
            let _teardown = teardown;
            drive(agent.as_ref(), invocation, asker, &emitter, &handle).await;
        });

        Ok(rx)
    }

    /// Cancel an active request. Returns whether one was found.
    pub fn abort(&self, request_id: &str) -> bool {
        let found = self.registry.cancel(request_id);
        if found {
            tracing::info!("Aborted request {request_id}");
        } else {
            tracing::debug!(
                "Abort for unknown request {request_id}; active: {:?}",
                self.registry.active_ids()
            );
        }
        found
    }

    /// Deliver an answer. Returns whether a matching question was waiting.
    pub fn answer(&self, request_id: &str, question_id: &str, answer: Answer) -> bool {
        self.broker.resolve(request_id, question_id, answer)
    }

    pub fn active_requests(&self) -> usize {
        self.registry.len()
    }

    fn invocation(&self, request: &ChatRequest) -> AgentInvocation {
        let settings = &self.settings;
        AgentInvocation {
            prompt: request.message.clone(),
            session_id: request.session_id.clone().filter(|s| !s.is_empty()),
            working_directory: request.working_directory.clone(),
            permission_mode: request
                .permission_mode
                .clone()
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| settings.permission_mode.clone()),
            allowed_tools: request
                .allowed_tools
                .clone()
                .filter(|tools| !tools.is_empty())
                .unwrap_or_else(|| settings.allowed_tools.clone()),
            disallowed_tools: settings.disallowed_tools.clone(),
            append_system_prompt: Some(settings.append_system_prompt.clone()),
        }
    }
}

async fn drive(
    agent: &dyn Agent,
    invocation: AgentInvocation,
    asker: Arc<dyn QuestionAsker>,
    emitter: &Emitter,
    handle: &RequestHandle,
) {
    let request_id = handle.id();
    let token = handle.token();

    let started = tokio::select! {
        biased;
        () = token.cancelled() => {
            emitter.finish_cancelled();
            return;
        }
        started = agent.start(invocation, asker) => started,
    };
    let mut run: Box<dyn AgentRun> = match started {
        Ok(run) => run,
        Err(e) => {
            tracing::error!("Failed to start {} for request {request_id}: {e:#}", agent.name());
            emitter.finish(StreamEvent::error(e.to_string())).await;
            return;
        }
    };

    let mut closing = false;
    loop {
        let next = tokio::select! {
            biased;
            () = token.cancelled() => {
                run.abort().await;
                emitter.finish_cancelled();
                return;
            }
            next = run.next_event() => next,
        };

        match next {
            Some(Ok(event)) => {
                let is_result = is_result_event(&event);
                match emitter.emit(StreamEvent::Data { data: event }).await {
                    Ok(()) => {}
                    Err(Halt::Cancelled) => {
                        run.abort().await;
                        emitter.finish_cancelled();
                        return;
                    }
                    Err(Halt::Closed) => {
                        tracing::debug!("Consumer of request {request_id} went away");
                        token.cancel();
                        run.abort().await;
                        emitter.close();
                        return;
                    }
                }
                if is_result && !closing {
                    closing = true;
                    run.close_input().await;
                }
            }
            Some(Err(e)) => {
                tracing::error!("Agent run failed for request {request_id}: {e:#}");
                emitter.finish(StreamEvent::error(e.to_string())).await;
                return;
            }
            None => break,
        }
    }

    tracing::debug!("Request {request_id} completed");
    emitter.finish(StreamEvent::Done).await;
}

async fn heartbeat_loop(
    emitter: Emitter,
    interval: Duration,
    request_token: CancellationToken,
    stream_done: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            () = stream_done.cancelled() => return,
            _ = ticker.tick() => {}
        }
        match emitter.heartbeat(interval) {
            Beat::Sent | Beat::Skipped => {}
            Beat::Closed => return,
            Beat::Disconnected => {
                request_token.cancel();
                return;
            }
        }
    }
}

/// Runs on every exit path of the request task, panics included.
struct Teardown {
    registry: Arc<RequestRegistry>,
    broker: Arc<QuestionBroker>,
    handle: RequestHandle,
    scope: QuestionScope,
    stream_done: CancellationToken,
}

impl Drop for Teardown {
    fn drop(&mut self) {
        self.stream_done.cancel();
        self.registry.unregister(&self.handle);
        self.broker.clear(&self.scope);
    }
}

struct BridgeAsker {
    scope: QuestionScope,
    broker: Arc<QuestionBroker>,
    emitter: Emitter,
    token: CancellationToken,
    timeout: Option<Duration>,
}

#[async_trait]
impl QuestionAsker for BridgeAsker {
    async fn ask(&self, questions: Vec<Question>) -> Result<Answer, QuestionError> {
        let request_id = self.scope.request_id();
        if self.token.is_cancelled() {
            return Err(QuestionError::RequestNotActive(request_id.to_string()));
        }
        let pending = self.broker.ask(&self.scope, &questions)?;
        let question_id = pending.question_id().to_string();
        tracing::debug!("Question {question_id} for request {request_id} is waiting for an answer");

        let record = StreamEvent::Question {
            question_id: question_id.clone(),
            request_id: request_id.to_string(),
            questions,
        };
        if let Err(halt) = self.emitter.emit(record).await {
            if halt == Halt::Closed {
                self.token.cancel();
            }
            return Err(QuestionError::Cancelled(question_id));
        }

        tokio::select! {
            biased;
            () = self.token.cancelled() => Err(QuestionError::Cancelled(question_id)),
            answer = self.broker.await_answer(pending, self.timeout) => answer,
        }
    }
}

/// Why a record could not be emitted.
#[derive(Debug, PartialEq, Eq)]
enum Halt {
    /// The request was cancelled while waiting for channel capacity.
    Cancelled,
    /// The stream already ended, or the consumer dropped it.
    Closed,
}

#[derive(Debug, PartialEq, Eq)]
enum Beat {
    Sent,
    Skipped,
    /// The stream already ended with a terminal record.
    Closed,
    /// The consumer dropped the receiver.
    Disconnected,
}

/// The single write side of a request's stream.
///
/// Waiting for channel capacity happens outside the state lock and races the
/// request's cancellation token, so a consumer that stops reading cannot hold
/// up an abort. Records are committed under the lock, which is what keeps
/// anything from following the terminal record.
#[derive(Clone)]
struct Emitter {
    inner: Arc<Mutex<EmitterState>>,
    token: CancellationToken,
}

struct EmitterState {
    tx: Option<mpsc::Sender<StreamEvent>>,
    last_emit: Instant,
    disconnected: bool,
}

impl Emitter {
    fn new(tx: mpsc::Sender<StreamEvent>, token: CancellationToken) -> Self {
        Self {
            inner: Arc::new(Mutex::new(EmitterState {
                tx: Some(tx),
                last_emit: Instant::now(),
                disconnected: false,
            })),
            token,
        }
    }

    fn sender(&self) -> Option<mpsc::Sender<StreamEvent>> {
        self.inner.lock().tx.clone()
    }

    /// Send a non-terminal record once the consumer has room for it.
    async fn emit(&self, event: StreamEvent) -> Result<(), Halt> {
        let tx = self.sender().ok_or(Halt::Closed)?;
        let reserved = tokio::select! {
            biased;
            () = self.token.cancelled() => return Err(Halt::Cancelled),
            reserved = tx.reserve() => reserved,
        };

        let mut state = self.inner.lock();
        let Ok(permit) = reserved else {
            state.tx = None;
            state.disconnected = true;
            return Err(Halt::Closed);
        };
        if state.tx.is_none() {
            return Err(Halt::Closed);
        }
        permit.send(event);
        state.last_emit = Instant::now();
        Ok(())
    }

    /// Send the terminal record and close the stream.
    ///
    /// Cancellation while waiting for capacity turns this into
    /// [`Emitter::finish_cancelled`].
    async fn finish(&self, event: StreamEvent) {
        let Some(tx) = self.sender() else {
            return;
        };
        let reserved = tokio::select! {
            biased;
            () = self.token.cancelled() => {
                self.finish_cancelled();
                return;
            }
            reserved = tx.reserve() => reserved,
        };

        let mut state = self.inner.lock();
        if state.tx.take().is_some() {
            if let Ok(permit) = reserved {
                permit.send(event);
            }
        }
    }

    /// Close the stream with the cancellation record if there is room for it.
    fn finish_cancelled(&self) {
        if let Some(tx) = self.inner.lock().tx.take() {
            if tx.try_send(StreamEvent::error(CANCELLED_MESSAGE)).is_err() {
                tracing::debug!("No room for the cancellation record; closing without it");
            }
        }
    }

    /// Close the stream without a terminal record.
    fn close(&self) {
        self.inner.lock().tx = None;
    }

    fn heartbeat(&self, interval: Duration) -> Beat {
        let mut state = self.inner.lock();
        let Some(tx) = state.tx.as_ref() else {
            return if state.disconnected {
                Beat::Disconnected
            } else {
                Beat::Closed
            };
        };
        if state.last_emit.elapsed() < interval {
            return Beat::Skipped;
        }
        match tx.try_send(StreamEvent::heartbeat_now()) {
            Ok(()) => {
                state.last_emit = Instant::now();
                Beat::Sent
            }
            // A backed-up consumer has records to read already.
            Err(TrySendError::Full(_)) => Beat::Skipped,
            Err(TrySendError::Closed(_)) => {
                state.tx = None;
                state.disconnected = true;
                Beat::Disconnected
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn emitter(capacity: usize) -> (Emitter, mpsc::Receiver<StreamEvent>, CancellationToken) {
        let (tx, rx) = mpsc::channel(capacity);
        let token = CancellationToken::new();
        (Emitter::new(tx, token.clone()), rx, token)
    }

    #[tokio::test]
    async fn finish_closes_the_stream_once() {
        let (emitter, mut rx, _token) = emitter(8);
        assert_eq!(emitter.emit(StreamEvent::Data { data: json!(1) }).await, Ok(()));
        emitter.finish(StreamEvent::Done).await;
        emitter.finish(StreamEvent::error("late")).await;
        assert_eq!(
            emitter.emit(StreamEvent::Data { data: json!(2) }).await,
            Err(Halt::Closed)
        );

        assert!(matches!(rx.recv().await, Some(StreamEvent::Data { .. })));
        assert_eq!(rx.recv().await, Some(StreamEvent::Done));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn emit_on_a_full_channel_yields_to_cancellation() {
        let (emitter, mut rx, token) = emitter(1);
        assert_eq!(emitter.emit(StreamEvent::Data { data: json!(1) }).await, Ok(()));

        let blocked = tokio::spawn({
            let emitter = emitter.clone();
            async move { emitter.emit(StreamEvent::Data { data: json!(2) }).await }
        });
        tokio::task::yield_now().await;
        token.cancel();
        let outcome = tokio::time::timeout(Duration::from_secs(5), blocked)
            .await
            .expect("emit stayed blocked after cancellation")
            .unwrap();
        assert_eq!(outcome, Err(Halt::Cancelled));

        // Nothing else fits, so the stream just closes.
        emitter.finish_cancelled();
        assert!(matches!(rx.recv().await, Some(StreamEvent::Data { .. })));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn finish_cancelled_sends_the_cancel_record_when_there_is_room() {
        let (emitter, mut rx, token) = emitter(4);
        token.cancel();
        emitter.finish(StreamEvent::Done).await;
        assert_eq!(rx.recv().await, Some(StreamEvent::error(CANCELLED_MESSAGE)));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn emit_to_a_dropped_consumer_is_closed() {
        let (emitter, rx, _token) = emitter(4);
        drop(rx);
        assert_eq!(
            emitter.emit(StreamEvent::Data { data: json!(1) }).await,
            Err(Halt::Closed)
        );
        assert_eq!(emitter.heartbeat(Duration::ZERO), Beat::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_skips_after_recent_emit() {
        let (emitter, mut rx, _token) = emitter(8);
        let interval = Duration::from_secs(10);

        assert_eq!(emitter.emit(StreamEvent::Data { data: json!(1) }).await, Ok(()));
        assert_eq!(emitter.heartbeat(interval), Beat::Skipped);

        tokio::time::advance(interval).await;
        assert_eq!(emitter.heartbeat(interval), Beat::Sent);

        assert!(matches!(rx.recv().await, Some(StreamEvent::Data { .. })));
        assert!(rx.recv().await.unwrap().is_heartbeat());
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_on_a_full_channel_is_skipped() {
        let (emitter, _rx, _token) = emitter(1);
        let interval = Duration::from_secs(1);
        tokio::time::advance(interval).await;
        assert_eq!(emitter.heartbeat(interval), Beat::Sent);
        tokio::time::advance(interval).await;
        assert_eq!(emitter.heartbeat(interval), Beat::Skipped);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_reports_closed_and_disconnected() {
        let interval = Duration::from_secs(1);

        let (finished, _rx, _token) = emitter(8);
        finished.close();
        assert_eq!(finished.heartbeat(interval), Beat::Closed);

        let (dropped, rx, _token) = emitter(8);
        drop(rx);
        tokio::time::advance(interval).await;
        assert_eq!(dropped.heartbeat(interval), Beat::Disconnected);
        assert_eq!(dropped.heartbeat(interval), Beat::Disconnected);
    }

    #[test]
    fn chat_request_parses_camel_case_body() {
        let req: ChatRequest = serde_json::from_value(json!({
            "message": "hi",
            "requestId": "r1",
            "sessionId": "s1",
            "allowedTools": ["Read"],
            "workingDirectory": "/tmp/project",
            "permissionMode": "plan"
        }))
        .unwrap();
        assert_eq!(req.request_id, "r1");
        assert_eq!(req.session_id.as_deref(), Some("s1"));
        assert_eq!(req.working_directory, Some(PathBuf::from("/tmp/project")));

        let missing: Result<ChatRequest, _> = serde_json::from_value(json!({"message": "hi"}));
        assert!(missing.is_err());
    }

    struct NeverAgent;

    #[async_trait]
    impl Agent for NeverAgent {
        fn name(&self) -> &str {
            "never"
        }

        async fn start(
            &self,
            _invocation: AgentInvocation,
            _asker: Arc<dyn QuestionAsker>,
        ) -> anyhow::Result<Box<dyn AgentRun>> {
            anyhow::bail!("not used")
        }
    }

    #[test]
    fn invocation_prefers_request_options() {
        let bridge = SessionBridge::new(Arc::new(NeverAgent), BridgeSettings::default());
        let request = ChatRequest {
            message: "hi".into(),
            request_id: "r1".into(),
            session_id: Some(String::new()),
            allowed_tools: Some(vec!["Read".into()]),
            working_directory: None,
            permission_mode: Some("plan".into()),
        };
        let inv = bridge.invocation(&request);
        assert_eq!(inv.permission_mode, "plan");
        assert_eq!(inv.allowed_tools, vec!["Read".to_string()]);
        assert!(inv.session_id.is_none());
        assert_eq!(inv.disallowed_tools, vec!["AskUserQuestion".to_string()]);

        let defaults = bridge.invocation(&ChatRequest {
            allowed_tools: Some(Vec::new()),
            permission_mode: None,
            ..request
        });
        assert_eq!(defaults.permission_mode, "bypassPermissions");
        assert!(defaults.allowed_tools.contains(&"Bash".to_string()));
    }

    #[tokio::test]
    async fn start_failure_yields_single_error() {
        let bridge = SessionBridge::new(Arc::new(NeverAgent), BridgeSettings::default());
        let mut rx = bridge
            .open(ChatRequest {
                message: "hi".into(),
                request_id: "r1".into(),
                session_id: None,
                allowed_tools: None,
                working_directory: None,
                permission_mode: None,
            })
            .unwrap();

        assert_eq!(rx.recv().await, Some(StreamEvent::error("not used")));
        assert_eq!(rx.recv().await, None);
    }
}
