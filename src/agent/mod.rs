//! The agent seam: something that takes a prompt and yields a stream of
//! JSON events, optionally pausing to ask the caller structured questions.

pub mod claude_cli;

pub use claude_cli::ClaudeCliAgent;

use crate::chat::broker::QuestionError;
use crate::chat::events::{Answer, Question};
use async_trait::async_trait;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;

/// Name of the in-process MCP server exposing the question tool.
pub const ASK_USER_SERVER: &str = "ask-user-webui";
/// Tool name as registered on [`ASK_USER_SERVER`].
pub const ASK_USER_TOOL: &str = "AskUserQuestion";
/// Tool name as the agent sees it.
pub const ASK_USER_QUALIFIED_TOOL: &str = "mcp__ask-user-webui__AskUserQuestion";

/// Everything needed to start one agent run.
#[derive(Debug, Clone, Default)]
pub struct AgentInvocation {
    pub prompt: String,
    /// Resume this prior session instead of starting fresh.
    pub session_id: Option<String>,
    pub working_directory: Option<PathBuf>,
    pub permission_mode: String,
    pub allowed_tools: Vec<String>,
    pub disallowed_tools: Vec<String>,
    pub append_system_prompt: Option<String>,
}

/// Capability handed to an agent so it can block on caller input.
#[async_trait]
pub trait QuestionAsker: Send + Sync {
    async fn ask(&self, questions: Vec<Question>) -> Result<Answer, QuestionError>;
}

#[async_trait]
pub trait Agent: Send + Sync {
    fn name(&self) -> &str;

    async fn start(
        &self,
        invocation: AgentInvocation,
        asker: Arc<dyn QuestionAsker>,
    ) -> anyhow::Result<Box<dyn AgentRun>>;
}

/// A running agent invocation.
#[async_trait]
pub trait AgentRun: Send {
    /// Next event in arrival order.
    ///
    /// `None` once the event stream has ended cleanly. A failed run yields a
    /// single `Err` and then `None`.
    async fn next_event(&mut self) -> Option<anyhow::Result<Value>>;

    /// Tell the agent no further input is coming, letting it exit.
    async fn close_input(&mut self);

    /// Stop the run immediately. Idempotent.
    async fn abort(&mut self);
}

/// Whether `event` is the agent's terminal `result` event.
pub fn is_result_event(event: &Value) -> bool {
    event.get("type").and_then(Value::as_str) == Some("result")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn qualified_tool_name_matches_parts() {
        assert_eq!(
            ASK_USER_QUALIFIED_TOOL,
            format!("mcp__{ASK_USER_SERVER}__{ASK_USER_TOOL}")
        );
    }

    #[test]
    fn result_event_detection() {
        assert!(is_result_event(&json!({"type": "result", "subtype": "success"})));
        assert!(!is_result_event(&json!({"type": "assistant"})));
        assert!(!is_result_event(&json!("result")));
    }
}
