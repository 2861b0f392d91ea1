//! Integration tests for the session bridge.
//!
//! A scripted agent stands in for the CLI so the request lifecycle
//! (streaming, questions, cancellation, heartbeats, teardown) can be driven
//! deterministically through the public API.

use anyhow::Result;
use async_trait::async_trait;
use chatrelay::agent::{Agent, AgentInvocation, AgentRun, QuestionAsker};
use chatrelay::chat::{
    Answer, AnswerValue, BridgeSettings, ChatRequest, Question, QuestionOption, RegistryError,
    SessionBridge, StreamEvent, CANCELLED_MESSAGE,
};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

// ─────────────────────────────────────────────────────────────────────────────
// Scripted agent
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone)]
enum Step {
    Emit(Value),
    Ask(Vec<Question>),
    Fail(&'static str),
    Hang,
    /// Emit forever, never ending the run.
    Flood,
    /// Wait until the test opens `Flags::gate`.
    Gate,
}

#[derive(Default)]
struct Flags {
    closed: AtomicUsize,
    aborted: AtomicBool,
    gate: Notify,
}

/// Plays one script per `start`. The last script repeats once the others
/// are used up.
struct ScriptedAgent {
    runs: Mutex<VecDeque<Vec<Step>>>,
    flags: Arc<Flags>,
}

impl ScriptedAgent {
    fn new(steps: Vec<Step>) -> (Arc<Self>, Arc<Flags>) {
        Self::with_runs(vec![steps])
    }

    fn with_runs(runs: Vec<Vec<Step>>) -> (Arc<Self>, Arc<Flags>) {
        let flags = Arc::new(Flags::default());
        (
            Arc::new(Self {
                runs: Mutex::new(runs.into()),
                flags: flags.clone(),
            }),
            flags,
        )
    }

    fn next_script(&self) -> Vec<Step> {
        let mut runs = self.runs.lock().unwrap();
        if runs.len() > 1 {
            runs.pop_front().unwrap_or_default()
        } else {
            runs.front().cloned().unwrap_or_default()
        }
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn start(
        &self,
        _invocation: AgentInvocation,
        asker: Arc<dyn QuestionAsker>,
    ) -> Result<Box<dyn AgentRun>> {
        Ok(Box::new(ScriptedRun {
            steps: self.next_script().into(),
            asker,
            flags: self.flags.clone(),
            emitted: 0,
        }))
    }
}

struct ScriptedRun {
    steps: VecDeque<Step>,
    asker: Arc<dyn QuestionAsker>,
    flags: Arc<Flags>,
    emitted: usize,
}

#[async_trait]
impl AgentRun for ScriptedRun {
    async fn next_event(&mut self) -> Option<Result<Value>> {
        loop {
            match self.steps.pop_front()? {
                Step::Gate => self.flags.gate.notified().await,
                step => return self.play(step).await,
            }
        }
    }

    async fn close_input(&mut self) {
        self.flags.closed.fetch_add(1, Ordering::SeqCst);
    }

    async fn abort(&mut self) {
        self.flags.aborted.store(true, Ordering::SeqCst);
    }
}

impl ScriptedRun {
    async fn play(&mut self, step: Step) -> Option<Result<Value>> {
        match step {
            Step::Emit(event) => Some(Ok(event)),
            // Mirrors the CLI driver: a failed ask becomes a tool error the
            // agent sees, not a failed run.
            Step::Ask(questions) => Some(Ok(match self.asker.ask(questions).await {
                Ok(answer) => json!({"type": "tool_result", "answers": answer}),
                Err(e) => json!({"type": "tool_error", "error": e.to_string()}),
            })),
            Step::Fail(message) => {
                self.steps.clear();
                Some(Err(anyhow::anyhow!(message)))
            }
            Step::Hang => std::future::pending().await,
            Step::Flood => {
                self.steps.push_front(Step::Flood);
                self.emitted += 1;
                Some(Ok(json!({"type": "assistant", "seq": self.emitted})))
            }
            Step::Gate => None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn bridge(agent: Arc<ScriptedAgent>) -> SessionBridge {
    SessionBridge::new(
        agent,
        BridgeSettings {
            heartbeat_interval: Duration::from_secs(10),
            ..BridgeSettings::default()
        },
    )
}

fn request(id: &str) -> ChatRequest {
    serde_json::from_value(json!({"message": "do the thing", "requestId": id}))
        .expect("valid chat request")
}

fn color_question() -> Vec<Question> {
    vec![Question {
        question: "Which color?".into(),
        header: "Color".into(),
        options: vec![
            QuestionOption {
                label: "Red".into(),
                description: String::new(),
            },
            QuestionOption {
                label: "Blue".into(),
                description: "calm".into(),
            },
        ],
        multi_select: false,
    }]
}

/// Next non-heartbeat record, or `None` once the stream has ended.
async fn next_record(rx: &mut mpsc::Receiver<StreamEvent>) -> Option<StreamEvent> {
    loop {
        match rx.recv().await {
            Some(event) if event.is_heartbeat() => continue,
            other => return other,
        }
    }
}

/// Teardown runs just after the terminal record; wait for it.
async fn wait_idle(bridge: &SessionBridge) {
    tokio::time::timeout(Duration::from_secs(60), async {
        while bridge.active_requests() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("request was never torn down");
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn events_stream_through_then_done() {
    let (agent, flags) = ScriptedAgent::new(vec![
        Step::Emit(json!({"type": "system", "session_id": "s1"})),
        Step::Emit(json!({"type": "assistant", "message": {"content": "hi"}})),
        Step::Emit(json!({"type": "result", "subtype": "success"})),
    ]);
    let bridge = bridge(agent);
    let mut rx = bridge.open(request("r1")).unwrap();
    assert_eq!(bridge.active_requests(), 1);

    let mut kinds = Vec::new();
    while let Some(record) = next_record(&mut rx).await {
        match record {
            StreamEvent::Data { data } => kinds.push(data["type"].as_str().unwrap().to_string()),
            StreamEvent::Done => kinds.push("done".into()),
            other => panic!("unexpected record {other:?}"),
        }
    }
    assert_eq!(kinds, vec!["system", "assistant", "result", "done"]);
    assert_eq!(flags.closed.load(Ordering::SeqCst), 1);

    wait_idle(&bridge).await;
    assert!(!bridge.abort("r1"));
}

#[tokio::test]
async fn question_is_answered_and_the_agent_resumes() {
    let (agent, _flags) = ScriptedAgent::new(vec![
        Step::Emit(json!({"type": "assistant"})),
        Step::Ask(color_question()),
        Step::Emit(json!({"type": "result"})),
    ]);
    let bridge = bridge(agent);
    let mut rx = bridge.open(request("r1")).unwrap();

    let question_id = loop {
        match next_record(&mut rx).await.expect("stream ended early") {
            StreamEvent::Question {
                question_id,
                request_id,
                questions,
            } => {
                assert_eq!(request_id, "r1");
                assert_eq!(questions, color_question());
                break question_id;
            }
            StreamEvent::Data { .. } => {}
            other => panic!("unexpected record {other:?}"),
        }
    };
    assert!(question_id.starts_with("q_"));

    let answer = Answer::single("Which color?", AnswerValue::Text("Blue".into()));
    assert!(!bridge.answer("r1", "q_unknown", answer.clone()));
    assert!(bridge.answer("r1", &question_id, answer));

    match next_record(&mut rx).await {
        Some(StreamEvent::Data { data }) => {
            assert_eq!(data["type"], "tool_result");
            assert_eq!(data["answers"]["Which color?"], "Blue");
        }
        other => panic!("expected tool result, got {other:?}"),
    }
    assert!(matches!(next_record(&mut rx).await, Some(StreamEvent::Data { .. })));
    assert_eq!(next_record(&mut rx).await, Some(StreamEvent::Done));
    assert_eq!(next_record(&mut rx).await, None);

    wait_idle(&bridge).await;
    let late = Answer::single("Which color?", AnswerValue::Text("Red".into()));
    assert!(!bridge.answer("r1", &question_id, late));
}

#[tokio::test]
async fn abort_while_waiting_for_an_answer() {
    let (agent, flags) = ScriptedAgent::new(vec![Step::Ask(color_question()), Step::Hang]);
    let bridge = bridge(agent);
    let mut rx = bridge.open(request("r1")).unwrap();

    let question_id = match next_record(&mut rx).await {
        Some(StreamEvent::Question { question_id, .. }) => question_id,
        other => panic!("expected question, got {other:?}"),
    };

    assert!(bridge.abort("r1"));
    assert_eq!(
        next_record(&mut rx).await,
        Some(StreamEvent::error(CANCELLED_MESSAGE))
    );
    assert_eq!(next_record(&mut rx).await, None);

    wait_idle(&bridge).await;
    assert!(flags.aborted.load(Ordering::SeqCst));
    assert!(!bridge.abort("r1"));
    let answer = Answer::single("Which color?", AnswerValue::Text("Red".into()));
    assert!(!bridge.answer("r1", &question_id, answer));
}

#[tokio::test]
async fn duplicate_request_id_is_rejected_while_active() {
    let (agent, _flags) = ScriptedAgent::new(vec![Step::Hang]);
    let bridge = bridge(agent);
    let mut rx = bridge.open(request("r1")).unwrap();

    match bridge.open(request("r1")) {
        Err(RegistryError::AlreadyActive(id)) => assert_eq!(id, "r1"),
        Err(e) => panic!("unexpected error {e}"),
        Ok(_) => panic!("duplicate request id was accepted"),
    }
    let mut other = bridge.open(request("r2")).unwrap();
    assert_eq!(bridge.active_requests(), 2);

    assert!(bridge.abort("r1"));
    assert!(bridge.abort("r2"));
    while next_record(&mut rx).await.is_some() {}
    while next_record(&mut other).await.is_some() {}
    wait_idle(&bridge).await;

    let mut again = bridge.open(request("r1")).unwrap();
    assert!(bridge.abort("r1"));
    assert_eq!(
        next_record(&mut again).await,
        Some(StreamEvent::error(CANCELLED_MESSAGE))
    );
}

#[tokio::test]
async fn agent_failure_ends_with_one_error() {
    let (agent, flags) = ScriptedAgent::new(vec![
        Step::Emit(json!({"type": "system"})),
        Step::Fail("Claude CLI failed (exit status: 1)"),
    ]);
    let bridge = bridge(agent);
    let mut rx = bridge.open(request("r1")).unwrap();

    assert!(matches!(next_record(&mut rx).await, Some(StreamEvent::Data { .. })));
    assert_eq!(
        next_record(&mut rx).await,
        Some(StreamEvent::error("Claude CLI failed (exit status: 1)"))
    );
    assert_eq!(next_record(&mut rx).await, None);
    assert_eq!(flags.closed.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn invalid_questions_are_reported_to_the_agent() {
    let mut bad = color_question();
    bad[0].options.truncate(1);
    let (agent, _flags) = ScriptedAgent::new(vec![Step::Ask(bad), Step::Emit(json!({"type": "result"}))]);
    let bridge = bridge(agent);
    let mut rx = bridge.open(request("r1")).unwrap();

    match next_record(&mut rx).await {
        Some(StreamEvent::Data { data }) => {
            assert_eq!(data["type"], "tool_error");
            assert!(data["error"].as_str().unwrap().contains("options"));
        }
        other => panic!("expected tool error, got {other:?}"),
    }
    assert!(matches!(next_record(&mut rx).await, Some(StreamEvent::Data { .. })));
    assert_eq!(next_record(&mut rx).await, Some(StreamEvent::Done));
}

#[tokio::test(start_paused = true)]
async fn heartbeats_flow_while_the_agent_is_silent() {
    let (agent, _flags) = ScriptedAgent::new(vec![Step::Hang]);
    let bridge = bridge(agent);
    let mut rx = bridge.open(request("r1")).unwrap();

    for _ in 0..2 {
        let beat = rx.recv().await.expect("stream ended");
        assert!(beat.is_heartbeat(), "expected heartbeat, got {beat:?}");
    }

    assert!(bridge.abort("r1"));
    assert_eq!(
        next_record(&mut rx).await,
        Some(StreamEvent::error(CANCELLED_MESSAGE))
    );
}

#[tokio::test(start_paused = true)]
async fn dropped_consumer_cancels_the_request() {
    let (agent, flags) = ScriptedAgent::new(vec![Step::Hang]);
    let bridge = bridge(agent);
    let rx = bridge.open(request("r1")).unwrap();
    drop(rx);

    wait_idle(&bridge).await;
    assert!(flags.aborted.load(Ordering::SeqCst));
}

#[tokio::test]
async fn reopened_request_keeps_its_questions_after_the_old_run_ends() {
    let (agent, flags) = ScriptedAgent::with_runs(vec![
        vec![Step::Emit(json!({"type": "system"})), Step::Hang],
        vec![Step::Gate, Step::Ask(color_question()), Step::Emit(json!({"type": "result"}))],
    ]);
    let bridge = bridge(agent);

    let mut first = bridge.open(request("r1")).unwrap();
    assert!(matches!(next_record(&mut first).await, Some(StreamEvent::Data { .. })));
    assert!(bridge.abort("r1"));
    let mut second = bridge.open(request("r1")).unwrap();

    // The old run's teardown has finished once its stream is closed.
    while next_record(&mut first).await.is_some() {}
    flags.gate.notify_one();

    let question_id = match next_record(&mut second).await {
        Some(StreamEvent::Question {
            question_id,
            request_id,
            ..
        }) => {
            assert_eq!(request_id, "r1");
            question_id
        }
        other => panic!("expected question, got {other:?}"),
    };
    let answer = Answer::single("Which color?", AnswerValue::Text("Red".into()));
    assert!(bridge.answer("r1", &question_id, answer));

    match next_record(&mut second).await {
        Some(StreamEvent::Data { data }) => assert_eq!(data["type"], "tool_result"),
        other => panic!("expected tool result, got {other:?}"),
    }
    assert!(matches!(next_record(&mut second).await, Some(StreamEvent::Data { .. })));
    assert_eq!(next_record(&mut second).await, Some(StreamEvent::Done));
}

#[tokio::test(start_paused = true)]
async fn abort_goes_through_when_the_consumer_stops_reading() {
    let (agent, flags) = ScriptedAgent::new(vec![Step::Flood]);
    let bridge = bridge(agent);
    let mut rx = bridge.open(request("r1")).unwrap();

    // Let the agent fill the stream while nobody reads it.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(bridge.abort("r1"));
    wait_idle(&bridge).await;
    assert!(flags.aborted.load(Ordering::SeqCst));

    let mut buffered = 0;
    while let Some(record) = rx.recv().await {
        match record {
            StreamEvent::Data { .. } => buffered += 1,
            StreamEvent::Error { .. } => {}
            other => panic!("unexpected record {other:?}"),
        }
    }
    assert!(buffered > 0);
}

#[tokio::test(start_paused = true)]
async fn question_behind_a_full_stream_does_not_block_abort() {
    // Enough events to leave no room for the question record.
    let mut steps: Vec<Step> = (0..64)
        .map(|n| Step::Emit(json!({"type": "assistant", "n": n})))
        .collect();
    steps.push(Step::Ask(color_question()));
    steps.push(Step::Hang);
    let (agent, flags) = ScriptedAgent::new(steps);
    let bridge = bridge(agent);
    let _rx = bridge.open(request("r1")).unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(bridge.abort("r1"));
    wait_idle(&bridge).await;
    assert!(flags.aborted.load(Ordering::SeqCst));
    assert_eq!(bridge.broker().pending_count("r1"), 0);
}
