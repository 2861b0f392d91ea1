use super::{Agent, AgentInvocation, AgentRun, QuestionAsker, ASK_USER_SERVER, ASK_USER_TOOL};
use crate::chat::events::{Answer, Question};
use crate::config::AgentConfig;
use anyhow::Context;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

const STDERR_TAIL_LINES: usize = 20;
const EVENT_BUFFER: usize = 64;
const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

const ASK_USER_DESCRIPTION: &str = "Ask the user a question with multiple-choice options. \
Use this when you need clarification, want the user to choose between approaches, or need \
input to proceed. Each question can have 2-4 options. The user can also provide free-text \
input via an 'Other' option that is always available.";

type SharedStdin = Arc<Mutex<Option<ChildStdin>>>;

/// Drives the `claude` CLI in bidirectional `stream-json` mode.
///
/// The question tool is served in-process: the CLI forwards MCP traffic for
/// the `sdk` server as `control_request` lines on stdout and expects the
/// JSON-RPC reply as a `control_response` line on stdin.
pub struct ClaudeCliAgent {
    cli_path: PathBuf,
}

impl ClaudeCliAgent {
    pub fn new(cli_path: impl Into<PathBuf>) -> Self {
        Self {
            cli_path: cli_path.into(),
        }
    }

    /// Use the configured executable, or find `claude` on PATH.
    pub fn from_config(config: &AgentConfig) -> anyhow::Result<Self> {
        let cli_path = match &config.cli_path {
            Some(path) => path.clone(),
            None => which::which("claude")
                .context("Claude CLI not found on PATH; set agent.cli_path or --claude-path")?,
        };
        Ok(Self::new(cli_path))
    }

    pub fn cli_path(&self) -> &Path {
        &self.cli_path
    }

    fn mcp_config() -> String {
        json!({
            "mcpServers": {
                ASK_USER_SERVER: { "type": "sdk", "name": ASK_USER_SERVER }
            }
        })
        .to_string()
    }

    fn build_args(invocation: &AgentInvocation) -> Vec<String> {
        let mut args: Vec<String> = [
            "--output-format",
            "stream-json",
            "--input-format",
            "stream-json",
            "--verbose",
        ]
        .iter()
        .map(|s| (*s).to_string())
        .collect();

        args.push("--permission-mode".into());
        args.push(invocation.permission_mode.clone());
        args.push("--mcp-config".into());
        args.push(Self::mcp_config());

        if !invocation.allowed_tools.is_empty() {
            args.push("--allowedTools".into());
            args.push(invocation.allowed_tools.join(","));
        }
        if !invocation.disallowed_tools.is_empty() {
            args.push("--disallowedTools".into());
            args.push(invocation.disallowed_tools.join(","));
        }
        if let Some(prompt) = invocation
            .append_system_prompt
            .as_deref()
            .filter(|p| !p.trim().is_empty())
        {
            args.push("--append-system-prompt".into());
            args.push(prompt.to_string());
        }
        if let Some(session_id) = invocation.session_id.as_deref().filter(|s| !s.is_empty()) {
            args.push("--resume".into());
            args.push(session_id.to_string());
        }

        args
    }

    fn user_message(prompt: &str) -> Value {
        json!({
            "type": "user",
            "message": { "role": "user", "content": prompt },
            "parent_tool_use_id": null,
            "session_id": ""
        })
    }

    fn initialize_request() -> Value {
        json!({
            "type": "control_request",
            "request_id": "req_init",
            "request": { "subtype": "initialize", "hooks": null }
        })
    }
}

#[async_trait]
impl Agent for ClaudeCliAgent {
    fn name(&self) -> &str {
        "claude-cli"
    }

    async fn start(
        &self,
        invocation: AgentInvocation,
        asker: Arc<dyn QuestionAsker>,
    ) -> anyhow::Result<Box<dyn AgentRun>> {
        let mut cmd = Command::new(&self.cli_path);
        cmd.args(Self::build_args(&invocation))
            .env("CLAUDECODE", "")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &invocation.working_directory {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().with_context(|| {
            format!("Failed to spawn Claude CLI at {}", self.cli_path.display())
        })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow::anyhow!("Claude CLI missing stdin pipe"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("Claude CLI missing stdout pipe"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow::anyhow!("Claude CLI missing stderr pipe"))?;

        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                tracing::error!("Claude CLI stderr: {line}");
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            Vec::from(tail).join("\n")
        });

        let stdin: SharedStdin = Arc::new(Mutex::new(Some(stdin)));
        let (tx, events) = mpsc::channel(EVENT_BUFFER);
        let stdout_task = tokio::spawn(pump_stdout(stdout, tx, stdin.clone(), asker));

        let run = ClaudeCliRun {
            child,
            stdin,
            events,
            stdout_task,
            stderr_task: Some(stderr_task),
            finished: false,
        };

        write_line(&run.stdin, &Self::initialize_request()).await?;
        write_line(&run.stdin, &Self::user_message(&invocation.prompt)).await?;
        tracing::debug!(
            "Started Claude CLI (resume: {:?}, cwd: {:?})",
            invocation.session_id,
            invocation.working_directory
        );

        Ok(Box::new(run))
    }
}

struct ClaudeCliRun {
    child: Child,
    stdin: SharedStdin,
    events: mpsc::Receiver<Value>,
    stdout_task: JoinHandle<()>,
    stderr_task: Option<JoinHandle<String>>,
    finished: bool,
}

impl ClaudeCliRun {
    /// Reap the process once stdout has closed. `Some` when it failed.
    async fn exit_failure(&mut self) -> Option<anyhow::Error> {
        self.stdin.lock().await.take();
        let status = match self.child.wait().await {
            Ok(status) => status,
            Err(e) => return Some(anyhow::anyhow!("Failed to wait for Claude CLI: {e}")),
        };
        let stderr = match self.stderr_task.take() {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };
        if status.success() {
            None
        } else {
            Some(anyhow::anyhow!(
                "Claude CLI failed (status: {}). stderr: {}",
                status,
                stderr.trim()
            ))
        }
    }
}

#[async_trait]
impl AgentRun for ClaudeCliRun {
    async fn next_event(&mut self) -> Option<anyhow::Result<Value>> {
        if self.finished {
            return None;
        }
        if let Some(event) = self.events.recv().await {
            return Some(Ok(event));
        }
        self.finished = true;
        self.exit_failure().await.map(Err)
    }

    async fn close_input(&mut self) {
        // Dropping the pipe sends EOF.
        self.stdin.lock().await.take();
    }

    async fn abort(&mut self) {
        self.finished = true;
        self.stdin.lock().await.take();
        self.stdout_task.abort();
        if let Err(e) = self.child.start_kill() {
            tracing::debug!("Claude CLI kill skipped: {e}");
        }
        if let Err(e) = self.child.wait().await {
            tracing::warn!("Failed to reap Claude CLI: {e}");
        }
    }
}

impl Drop for ClaudeCliRun {
    fn drop(&mut self) {
        self.stdout_task.abort();
    }
}

async fn pump_stdout(
    stdout: ChildStdout,
    events: mpsc::Sender<Value>,
    stdin: SharedStdin,
    asker: Arc<dyn QuestionAsker>,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!("Failed to read Claude CLI stdout: {e}");
                break;
            }
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let value: Value = match serde_json::from_str(trimmed) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!("Skipping non-JSON line from Claude CLI: {e}");
                continue;
            }
        };

        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        match kind.as_str() {
            "control_request" => {
                // Answered off the read loop: a question may block for a long time.
                let stdin = stdin.clone();
                let asker = asker.clone();
                tokio::spawn(async move {
                    let response = handle_control_request(&value, asker.as_ref()).await;
                    if let Err(e) = write_line(&stdin, &response).await {
                        tracing::debug!("Dropped control response: {e}");
                    }
                });
            }
            "control_response" | "control_cancel_request" => {
                tracing::debug!("Ignoring {kind} from Claude CLI");
            }
            _ => {
                if events.send(value).await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn write_line(stdin: &SharedStdin, value: &Value) -> anyhow::Result<()> {
    let mut guard = stdin.lock().await;
    let pipe = guard.as_mut().context("Claude CLI stdin is closed")?;
    let mut line = value.to_string();
    line.push('\n');
    pipe.write_all(line.as_bytes())
        .await
        .context("Failed to write to Claude CLI stdin")?;
    pipe.flush().await?;
    Ok(())
}

async fn handle_control_request(request: &Value, asker: &dyn QuestionAsker) -> Value {
    let request_id = request
        .get("request_id")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let body = request.get("request").unwrap_or(&Value::Null);
    let subtype = body.get("subtype").and_then(Value::as_str).unwrap_or("");

    if subtype != "mcp_message" {
        return control_error(request_id, &format!("Unsupported control request: {subtype}"));
    }
    let server = body.get("server_name").and_then(Value::as_str).unwrap_or("");
    if server != ASK_USER_SERVER {
        return control_error(request_id, &format!("Unknown MCP server: {server}"));
    }

    let message = body.get("message").unwrap_or(&Value::Null);
    let mcp_response = handle_mcp_message(message, asker).await;
    json!({
        "type": "control_response",
        "response": {
            "subtype": "success",
            "request_id": request_id,
            "response": { "mcp_response": mcp_response }
        }
    })
}

fn control_error(request_id: &str, error: &str) -> Value {
    json!({
        "type": "control_response",
        "response": {
            "subtype": "error",
            "request_id": request_id,
            "error": error
        }
    })
}

async fn handle_mcp_message(message: &Value, asker: &dyn QuestionAsker) -> Value {
    let id = message.get("id").cloned().unwrap_or(Value::Null);
    let method = message.get("method").and_then(Value::as_str).unwrap_or("");

    match method {
        "initialize" => jsonrpc_result(
            id,
            json!({
                "protocolVersion": MCP_PROTOCOL_VERSION,
                "capabilities": { "tools": {} },
                "serverInfo": { "name": ASK_USER_SERVER, "version": env!("CARGO_PKG_VERSION") }
            }),
        ),
        "tools/list" => jsonrpc_result(id, json!({ "tools": [ask_user_tool_definition()] })),
        "tools/call" => {
            let params = message.get("params").unwrap_or(&Value::Null);
            let name = params.get("name").and_then(Value::as_str).unwrap_or("");
            if name != ASK_USER_TOOL {
                return jsonrpc_error(id, -32601, &format!("Tool '{name}' not found"));
            }
            let questions = match parse_questions(params.get("arguments")) {
                Ok(questions) => questions,
                Err(e) => return jsonrpc_result(id, tool_error(&e)),
            };
            match asker.ask(questions).await {
                Ok(answer) => jsonrpc_result(id, tool_answer(&answer)),
                Err(e) => jsonrpc_result(id, tool_error(&e.to_string())),
            }
        }
        m if m.starts_with("notifications/") => jsonrpc_result(id, json!({})),
        other => jsonrpc_error(id, -32601, &format!("Method '{other}' not found")),
    }
}

fn jsonrpc_result(id: Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

fn jsonrpc_error(id: Value, code: i64, message: &str) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "error": { "code": code, "message": message } })
}

fn parse_questions(arguments: Option<&Value>) -> Result<Vec<Question>, String> {
    let raw = arguments
        .and_then(|args| args.get("questions"))
        .ok_or_else(|| "missing 'questions' argument".to_string())?;
    serde_json::from_value(raw.clone()).map_err(|e| format!("invalid 'questions' argument: {e}"))
}

fn tool_answer(answer: &Answer) -> Value {
    let text = serde_json::to_string(answer).unwrap_or_else(|_| "{}".to_string());
    json!({ "content": [{ "type": "text", "text": text }] })
}

fn tool_error(message: &str) -> Value {
    json!({ "content": [{ "type": "text", "text": message }], "isError": true })
}

fn ask_user_tool_definition() -> Value {
    json!({
        "name": ASK_USER_TOOL,
        "description": ASK_USER_DESCRIPTION,
        "inputSchema": {
            "type": "object",
            "properties": {
                "questions": {
                    "type": "array",
                    "minItems": 1,
                    "maxItems": 4,
                    "items": {
                        "type": "object",
                        "properties": {
                            "question": { "type": "string", "description": "The question to ask" },
                            "header": {
                                "type": "string",
                                "description": "Short label for the question (max 12 chars)"
                            },
                            "options": {
                                "type": "array",
                                "minItems": 2,
                                "maxItems": 4,
                                "items": {
                                    "type": "object",
                                    "properties": {
                                        "label": {
                                            "type": "string",
                                            "description": "Display text for this option (1-5 words)"
                                        },
                                        "description": {
                                            "type": "string",
                                            "description": "Explanation of what this option means"
                                        }
                                    },
                                    "required": ["label", "description"]
                                }
                            },
                            "multiSelect": {
                                "type": "boolean",
                                "description": "Whether multiple options can be selected"
                            }
                        },
                        "required": ["question", "header", "options", "multiSelect"]
                    }
                }
            },
            "required": ["questions"]
        }
    })
}
